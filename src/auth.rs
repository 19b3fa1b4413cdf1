use log::info;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use sqlx::{FromRow, SqlitePool};
use crate::db::DbPool;
use crate::isotime::IsoDateTime;
use crate::util::{generate_random_string, sqlx_to_custom_error};
use crate::{Session, SessionId, SharedAppState};

pub const SESSION_COOKIE: &str = "rollcall_session_id";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserInfo {
    pub id: i64,
    pub email: String,
    pub name: String,
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: String,
    password_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SignInOutcome {
    pub success: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignInOutcome {
    fn rejected(error: &str) -> Self {
        Self { success: false, user: None, error: Some(error.to_string()) }
    }
}

// a client that has not asked yet is in its own "loading" state, the server always knows
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AuthStatus {
    Authenticated { user: UserInfo },
    Unauthenticated,
}

pub fn user_info(session_id: &SessionId, state: &State<SharedAppState>) -> Result<UserInfo, String> {
    state.read().map_err(|e| e.to_string())?
        .sessions.get(session_id).map(|s| s.user.clone()).ok_or("Session expired".to_string())
}

pub fn session_user(session_id: &SessionId, state: &State<SharedAppState>) -> Result<UserInfo, Custom<String>> {
    user_info(session_id, state).map_err(|e| Custom(Status::Unauthorized, e))
}

#[post("/api/sign-in", data = "<rq>")]
async fn post_sign_in(rq: Json<SignInRequest>, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<SignInOutcome>, Custom<String>> {
    let rq = rq.into_inner();
    let user: Option<UserRow> = sqlx::query_as("SELECT id, email, name, password_hash FROM users WHERE email=?")
        .bind(&rq.email)
        .fetch_optional(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    let Some(user) = user else {
        return Ok(Json(SignInOutcome::rejected("Invalid email or password")));
    };
    if !bcrypt::verify(&rq.password, &user.password_hash).unwrap_or(false) {
        return Ok(Json(SignInOutcome::rejected("Invalid email or password")));
    }
    let user_info = UserInfo { id: user.id, email: user.email, name: user.name };
    let session_id = generate_random_string(32);
    info!("User signed in: {}", user_info.email);
    state.write().expect("not poisoned")
        .sessions.insert(SessionId(session_id.clone()), Session { user: user_info.clone() });
    cookies.add_private(
        Cookie::build((SESSION_COOKIE, session_id))
            .same_site(SameSite::Lax)
            .build()
    );
    Ok(Json(SignInOutcome { success: true, user: Some(user_info), error: None }))
}

#[post("/api/sign-out")]
async fn post_sign_out(session_id: SessionId, cookies: &CookieJar<'_>, state: &State<SharedAppState>) -> Json<SignInOutcome> {
    state.write().expect("not poisoned").sessions.remove(&session_id);
    cookies.remove_private(SESSION_COOKIE);
    Json(SignInOutcome { success: true, user: None, error: None })
}

#[get("/api/session")]
async fn get_session(session_id: Option<SessionId>, state: &State<SharedAppState>) -> Json<AuthStatus> {
    let status = match session_id.and_then(|sid| user_info(&sid, state).ok()) {
        Some(user) => AuthStatus::Authenticated { user },
        None => AuthStatus::Unauthenticated,
    };
    Json(status)
}

pub(crate) async fn ensure_user(email: &str, name: &str, password: &str, pool: &SqlitePool) -> anyhow::Result<()> {
    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE email=?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }
    // low cost, demo-only credentials
    let password_hash = bcrypt::hash(password, 6)?;
    sqlx::query("INSERT INTO users (email, name, password_hash, created) VALUES (?, ?, ?, ?)")
        .bind(email)
        .bind(name)
        .bind(password_hash)
        .bind(IsoDateTime::now())
        .execute(pool)
        .await?;
    info!("Created user {email}");
    Ok(())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_sign_in,
            post_sign_out,
            get_session,
        ])
}
