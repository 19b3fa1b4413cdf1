use std::io::Cursor;
use anyhow::anyhow;
use base64::engine::general_purpose;
use base64::Engine;
use chrono::NaiveDate;
use image::ImageFormat;
use itertools::Itertools;
use log::{error, info};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::sync::broadcast::error::RecvError;
use rocket::{Build, Rocket, State};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{FromRow, Sqlite, SqlitePool};
use crate::auth::{ensure_user, session_user};
use crate::changes::{add_change, ChangeData, DataType};
use crate::db::DbPool;
use crate::isotime::IsoDateTime;
use crate::student::{upsert_student, StudentRecord};
use crate::util::{anyhow_to_custom_error, generate_random_string, sqlx_to_anyhow, sqlx_to_custom_error};
use crate::{EventApiToken, SessionId, SharedAppState};

pub type EventId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct EventRecord {
    pub id: EventId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(skip)]
    api_token: EventApiToken,
    pub created_at: IsoDateTime,
    pub updated_at: IsoDateTime,
}

impl EventRecord {
    pub fn new(owner: &str) -> Self {
        let now = IsoDateTime::now();
        Self {
            id: 0,
            title: String::new(),
            description: String::new(),
            location: String::new(),
            date: chrono::Local::now().date_naive(),
            start_time: String::new(),
            end_time: String::new(),
            is_done: false,
            is_featured: false,
            owner: owner.to_string(),
            api_token: EventApiToken(generate_random_string(10)),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedEvent {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub is_featured: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreatedEvent {
    pub event_id: EventId,
    pub api_token: EventApiToken,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct EventChange {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_featured: Option<bool>,
}

impl EventChange {
    pub fn changed_fields(&self) -> Vec<&'static str> {
        macro_rules! changed_fields {
            ($($fld_name:ident), +) => {{
                let mut ret = vec![];
                $(
                    if self.$fld_name.is_some() { ret.push(stringify!($fld_name)); }
                )*
                ret
            }}
        }
        changed_fields!(title, description, location, date, start_time, end_time, is_done, is_featured)
    }
}

pub async fn load_event(event_id: EventId, db: &State<DbPool>) -> Result<EventRecord, Custom<String>> {
    let event: Option<EventRecord> = sqlx::query_as("SELECT * FROM events WHERE id=?")
        .bind(event_id)
        .fetch_optional(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    event.ok_or(Custom(Status::NotFound, format!("Event id={event_id} not found")))
}

pub async fn load_event_for_api_token(api_token: &EventApiToken, db: &State<DbPool>) -> Result<EventRecord, Custom<String>> {
    let event: EventRecord = sqlx::query_as("SELECT * FROM events WHERE api_token=?")
        .bind(&api_token.0)
        .fetch_one(&db.0)
        .await
        .map_err(|e| Custom(Status::Unauthorized, e.to_string()))?;
    Ok(event)
}

async fn save_event(event: &EventRecord, db: &State<DbPool>) -> Result<EventId, anyhow::Error> {
    let now = IsoDateTime::now();
    let id = if event.id > 0 {
        sqlx::query("UPDATE events SET title=?, description=?, location=?, date=?, start_time=?, end_time=?, is_done=?, is_featured=?, updated_at=? WHERE id=?")
            .bind(&event.title)
            .bind(&event.description)
            .bind(&event.location)
            .bind(event.date)
            .bind(&event.start_time)
            .bind(&event.end_time)
            .bind(event.is_done)
            .bind(event.is_featured)
            .bind(now)
            .bind(event.id)
            .execute(&db.0)
            .await.map_err(sqlx_to_anyhow)?;
        event.id
    } else {
        let id: (i64, ) = sqlx::query_as("INSERT INTO events(title, description, location, date, start_time, end_time, is_done, is_featured, owner, api_token, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
            .bind(&event.title)
            .bind(&event.description)
            .bind(&event.location)
            .bind(event.date)
            .bind(&event.start_time)
            .bind(&event.end_time)
            .bind(event.is_done)
            .bind(event.is_featured)
            .bind(&event.owner)
            .bind(&event.api_token.0)
            .bind(event.created_at)
            .bind(now)
            .fetch_one(&db.0)
            .await.map_err(sqlx_to_anyhow)?;
        info!("Event created, id: {}", id.0);
        id.0
    };
    Ok(id)
}

async fn apply_event_change(event_id: EventId, change: &EventChange, pool: &SqlitePool) -> anyhow::Result<()> {
    let changed_fields = change.changed_fields();
    if changed_fields.is_empty() {
        return Ok(());
    }
    let placeholders = changed_fields.iter().map(|&fld_name| format!("{fld_name}=?")).join(",");
    let qs = format!("UPDATE events SET {placeholders}, updated_at=? WHERE id=?");
    let mut q = sqlx::query(&qs);
    fn bind_field<'a>(q: Query<'a, Sqlite, SqliteArguments<'a>>, field_name: &'a str, change: &'a EventChange) -> anyhow::Result<Query<'a, Sqlite, SqliteArguments<'a>>> {
        let q = if field_name == "title" { q.bind(change.title.as_ref()) }
        else if field_name == "description" { q.bind(change.description.as_ref()) }
        else if field_name == "location" { q.bind(change.location.as_ref()) }
        else if field_name == "date" { q.bind(change.date) }
        else if field_name == "start_time" { q.bind(change.start_time.as_ref()) }
        else if field_name == "end_time" { q.bind(change.end_time.as_ref()) }
        else if field_name == "is_done" { q.bind(change.is_done) }
        else if field_name == "is_featured" { q.bind(change.is_featured) }
        else {
            return Err(anyhow!("Dont know how to bind field {field_name}"))
        };
        Ok(q)
    }
    for field_name in changed_fields {
        q = bind_field(q, field_name, change)?;
    }
    let q = q.bind(IsoDateTime::now()).bind(event_id);
    q.execute(pool).await.map_err(sqlx_to_anyhow)?;
    Ok(())
}

async fn event_drop(event_id: EventId, pool: &SqlitePool) -> anyhow::Result<()> {
    let mut txn = pool.begin().await?;
    for tbl in &["attendance", "changes"] {
        sqlx::query(&format!("DELETE FROM {tbl} WHERE event_id=?"))
            .bind(event_id)
            .execute(&mut *txn).await?;
    }
    sqlx::query("DELETE FROM events WHERE id=?")
        .bind(event_id)
        .execute(&mut *txn).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn load_events(pool: &SqlitePool) -> anyhow::Result<Vec<EventRecord>> {
    sqlx::query_as("SELECT * FROM events ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await.map_err(sqlx_to_anyhow)
}

pub async fn load_upcoming_events(pool: &SqlitePool) -> anyhow::Result<Vec<EventRecord>> {
    sqlx::query_as("SELECT * FROM events WHERE is_done=0 ORDER BY created_at DESC, id DESC")
        .fetch_all(pool)
        .await.map_err(sqlx_to_anyhow)
}

pub const HOME_UPCOMING_LIMIT: usize = 3;

pub async fn load_home_upcoming_events(pool: &SqlitePool, limit: usize) -> anyhow::Result<Vec<EventRecord>> {
    let events: Vec<EventRecord> = sqlx::query_as("SELECT * FROM events WHERE is_done=0")
        .fetch_all(pool)
        .await.map_err(sqlx_to_anyhow)?;
    let mut events = events.into_iter().filter(|e| !e.is_featured).collect::<Vec<_>>();
    events.sort_by_key(|e| e.date);
    events.truncate(limit);
    Ok(events)
}

pub async fn load_featured_event(pool: &SqlitePool) -> anyhow::Result<Option<EventRecord>> {
    let events: Vec<EventRecord> = sqlx::query_as("SELECT * FROM events WHERE is_featured=1 AND is_done=0 ORDER BY id")
        .fetch_all(pool)
        .await.map_err(sqlx_to_anyhow)?;
    Ok(events.into_iter().next())
}

#[post("/api/event", data = "<posted_event>")]
async fn post_create_event(posted_event: Json<PostedEvent>, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<CreatedEvent>, Custom<String>> {
    let user = session_user(&session_id, state)?;
    let posted = posted_event.into_inner();
    let mut event = EventRecord::new(&user.email);
    event.title = posted.title;
    event.description = posted.description;
    event.location = posted.location;
    event.date = posted.date;
    event.start_time = posted.start_time;
    event.end_time = posted.end_time;
    event.is_featured = posted.is_featured;
    let event_id = save_event(&event, db).await.map_err(anyhow_to_custom_error)?;
    let created = load_event(event_id, db).await?;
    add_change(event_id, "www", DataType::EventCreated, &ChangeData::Event(created.clone()), Some(user.email.as_str()), db, state)
        .await.map_err(anyhow_to_custom_error)?;
    state.read().expect("not poisoned").notify_catalog(event_id);
    Ok(Json(CreatedEvent { event_id, api_token: created.api_token }))
}

#[get("/api/event")]
async fn get_events(db: &State<DbPool>) -> Result<Json<Vec<EventRecord>>, Custom<String>> {
    let events = load_events(&db.0).await.map_err(anyhow_to_custom_error)?;
    Ok(Json(events))
}

#[get("/api/event/upcoming")]
async fn get_upcoming_events(db: &State<DbPool>) -> Result<Json<Vec<EventRecord>>, Custom<String>> {
    let events = load_upcoming_events(&db.0).await.map_err(anyhow_to_custom_error)?;
    Ok(Json(events))
}

#[get("/api/event/featured")]
async fn get_featured_event(db: &State<DbPool>) -> Result<Json<Option<EventRecord>>, Custom<String>> {
    let event = load_featured_event(&db.0).await.map_err(anyhow_to_custom_error)?;
    Ok(Json(event))
}

#[get("/api/event/home-upcoming?<limit>")]
async fn get_home_upcoming_events(limit: Option<usize>, db: &State<DbPool>) -> Result<Json<Vec<EventRecord>>, Custom<String>> {
    let events = load_home_upcoming_events(&db.0, limit.unwrap_or(HOME_UPCOMING_LIMIT))
        .await.map_err(anyhow_to_custom_error)?;
    Ok(Json(events))
}

#[get("/api/event/search?<q>")]
async fn get_search_events(q: &str, db: &State<DbPool>) -> Result<Json<Vec<EventRecord>>, Custom<String>> {
    let needle = q.to_lowercase();
    let events = load_events(&db.0).await.map_err(anyhow_to_custom_error)?;
    let events = events.into_iter()
        .filter(|e| e.title.to_lowercase().contains(&needle)
            || e.location.to_lowercase().contains(&needle)
            || e.description.to_lowercase().contains(&needle))
        .collect::<Vec<_>>();
    Ok(Json(events))
}

#[get("/api/event/<event_id>")]
async fn get_event(event_id: EventId, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let event = load_event(event_id, db).await?;
    Ok(Json(event))
}

#[post("/api/event/<event_id>", data = "<change>")]
async fn post_update_event(event_id: EventId, change: Json<EventChange>, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let user = session_user(&session_id, state)?;
    load_event(event_id, db).await?;
    apply_event_change(event_id, &change.into_inner(), &db.0).await.map_err(anyhow_to_custom_error)?;
    let reloaded = load_event(event_id, db).await?;
    add_change(event_id, "www", DataType::EventUpdated, &ChangeData::Event(reloaded.clone()), Some(user.email.as_str()), db, state)
        .await.map_err(anyhow_to_custom_error)?;
    state.read().expect("not poisoned").notify_catalog(event_id);
    Ok(Json(reloaded))
}

#[post("/api/event/<event_id>/done")]
async fn post_event_done(event_id: EventId, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let change = EventChange { is_done: Some(true), ..Default::default() };
    post_done_flag(event_id, change, session_id, state, db).await
}

#[post("/api/event/<event_id>/upcoming")]
async fn post_event_upcoming(event_id: EventId, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let change = EventChange { is_done: Some(false), ..Default::default() };
    post_done_flag(event_id, change, session_id, state, db).await
}

async fn post_done_flag(event_id: EventId, change: EventChange, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let user = session_user(&session_id, state)?;
    load_event(event_id, db).await?;
    apply_event_change(event_id, &change, &db.0).await.map_err(anyhow_to_custom_error)?;
    let reloaded = load_event(event_id, db).await?;
    add_change(event_id, "www", DataType::EventUpdated, &ChangeData::Event(reloaded.clone()), Some(user.email.as_str()), db, state)
        .await.map_err(anyhow_to_custom_error)?;
    state.read().expect("not poisoned").notify_catalog(event_id);
    Ok(Json(reloaded))
}

#[delete("/api/event/<event_id>")]
async fn delete_event(event_id: EventId, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<(), Custom<String>> {
    let user = session_user(&session_id, state)?;
    let event = load_event(event_id, db).await?;
    if event.owner != user.email {
        return Err(Custom(Status::Unauthorized, String::from("Event owner email mismatch!")));
    }
    event_drop(event_id, &db.0).await.map_err(anyhow_to_custom_error)?;
    state.read().expect("not poisoned").notify_catalog(event_id);
    Ok(())
}

#[get("/api/event/current")]
async fn get_api_event_current(api_token: EventApiToken, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let event = load_event_for_api_token(&api_token, db).await?;
    Ok(Json(event))
}

#[post("/api/event/current", data = "<change>")]
async fn post_api_event_current(api_token: EventApiToken, change: Json<EventChange>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<EventRecord>, Custom<String>> {
    let event = load_event_for_api_token(&api_token, db).await?;
    apply_event_change(event.id, &change.into_inner(), &db.0).await.map_err(anyhow_to_custom_error)?;
    let reloaded = load_event(event.id, db).await?;
    add_change(event.id, "scanner", DataType::EventUpdated, &ChangeData::Event(reloaded.clone()), None, db, state)
        .await.map_err(anyhow_to_custom_error)?;
    state.read().expect("not poisoned").notify_catalog(event.id);
    Ok(Json(reloaded))
}

fn render_token_qr(api_token: &EventApiToken) -> anyhow::Result<String> {
    let code = qrcode::QrCode::new(api_token.0.as_bytes())?;
    let image = code.render::<image::LumaA<u8>>().build();
    let mut buffer: Vec<u8> = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(&buffer)))
}

#[get("/api/event/<event_id>/qr")]
async fn get_event_qr(event_id: EventId, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<String>, Custom<String>> {
    session_user(&session_id, state)?;
    let event = load_event(event_id, db).await?;
    let data_uri = render_token_qr(&event.api_token).map_err(anyhow_to_custom_error)?;
    Ok(Json(data_uri))
}

#[derive(FromFormField, Copy, Clone, Debug)]
pub enum EventsFilter {
    All,
    Upcoming,
    Featured,
    Home,
}

async fn load_filtered_events(pool: &SqlitePool, filter: EventsFilter) -> anyhow::Result<Vec<EventRecord>> {
    match filter {
        EventsFilter::All => load_events(pool).await,
        EventsFilter::Upcoming => load_upcoming_events(pool).await,
        // zero-or-one element, the consumer takes the first
        EventsFilter::Featured => Ok(load_featured_event(pool).await?.into_iter().collect()),
        EventsFilter::Home => load_home_upcoming_events(pool, HOME_UPCOMING_LIMIT).await,
    }
}

#[get("/api/event/sse?<filter>")]
async fn events_sse(filter: Option<EventsFilter>, state: &State<SharedAppState>, db: &State<DbPool>) -> EventStream![] {
    let filter = filter.unwrap_or(EventsFilter::All);
    let pool = db.0.clone();
    let mut catalog_rx = state.read().expect("not poisoned").subscribe_catalog();
    EventStream! {
        loop {
            // a full snapshot on every change, read failures degrade to empty
            let snapshot = match load_filtered_events(&pool, filter).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Events snapshot error: {e}");
                    Vec::new()
                }
            };
            match serde_json::to_string(&snapshot) {
                Ok(json) => yield Event::data(json),
                Err(e) => {
                    error!("Serde error: {e}");
                    break;
                }
            }
            match catalog_rx.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
}

pub const DEMO_API_TOKEN: &str = "vatomalusemak";
pub const DEMO_USER_EMAIL: &str = "organizer@example.edu";
pub const DEMO_USER_PASSWORD: &str = "changeit";

#[get("/api/event/create-demo")]
async fn get_event_create_demo(state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<CreatedEvent>, Custom<String>> {
    ensure_user(DEMO_USER_EMAIL, "Demo Organizer", DEMO_USER_PASSWORD, &db.0)
        .await.map_err(anyhow_to_custom_error)?;
    let mut event = EventRecord::new(DEMO_USER_EMAIL);
    event.title = String::from("Orientation Day");
    event.description = String::from("Welcome assembly for incoming students");
    event.location = String::from("Main Gymnasium");
    event.start_time = String::from("09:00");
    event.end_time = String::from("17:00");
    event.is_featured = true;
    event.api_token = EventApiToken(String::from(DEMO_API_TOKEN));
    let event_id = save_event(&event, db).await.map_err(anyhow_to_custom_error)?;
    for (student_id, first_name, last_name, email, major, course, year, section) in [
        ("S-1001", "Ana", "Reyes", "ana.reyes@example.edu", "Computer Science", "BSCS", "3", "A"),
        ("S-1002", "Ben", "Cruz", "ben.cruz@example.edu", "Information Technology", "BSIT", "2", "B"),
        ("S-1003", "Carla", "Lim", "carla.lim@example.edu", "Computer Engineering", "BSCpE", "4", "A"),
    ] {
        let student = StudentRecord {
            id: 0,
            student_id: student_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            major: major.to_string(),
            course: course.to_string(),
            year: year.to_string(),
            section: section.to_string(),
        };
        upsert_student(&student, &db.0).await.map_err(sqlx_to_custom_error)?;
    }
    state.read().expect("not poisoned").notify_catalog(event_id);
    Ok(Json(CreatedEvent { event_id, api_token: EventApiToken(String::from(DEMO_API_TOKEN)) }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_event_create_demo,
            post_create_event,
            get_events,
            get_upcoming_events,
            get_featured_event,
            get_home_upcoming_events,
            get_search_events,
            get_event,
            post_update_event,
            post_event_done,
            post_event_upcoming,
            delete_event,
            get_api_event_current,
            post_api_event_current,
            get_event_qr,
            events_sse,
        ])
}
