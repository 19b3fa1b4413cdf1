#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::RwLock;
use rocket::http::{CookieJar, Status};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::sync::broadcast;
use rocket::request;
use crate::auth::{SESSION_COOKIE, UserInfo};
use crate::changes::ChangesRecord;
use crate::db::DbPoolFairing;
use crate::event::EventId;

#[cfg(test)]
mod tests;
mod attendance;
mod auth;
mod changes;
mod db;
mod event;
mod isotime;
mod student;
mod util;

pub struct Session {
    pub user: UserInfo,
}

#[derive(Eq, Hash, PartialEq)]
pub struct SessionId(pub String);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for SessionId {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<SessionId, ()> {
        let cookies = request
            .guard::<&CookieJar<'_>>()
            .await
            .expect("request cookies");
        if let Some(cookie) = cookies.get_private(SESSION_COOKIE) {
            return request::Outcome::Success(SessionId(cookie.value().to_string()));
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct EventApiToken(pub String);
crate::impl_sqlx_text_type_encode_decode!(EventApiToken);

pub const API_TOKEN_HEADER: &str = "rollcall-api-token";

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for EventApiToken {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<EventApiToken, ()> {
        if let Some(api_token) = request.headers().get_one(API_TOKEN_HEADER) {
            return request::Outcome::Success(EventApiToken(api_token.to_string()));
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

pub struct AppState {
    sessions: HashMap<SessionId, Session>,
    change_sender: broadcast::Sender<(EventId, ChangesRecord)>,
    catalog_sender: broadcast::Sender<EventId>,
}

impl AppState {
    fn new() -> Self {
        let (change_sender, _receiver) = broadcast::channel(16);
        let (catalog_sender, _receiver) = broadcast::channel(16);
        Self {
            sessions: Default::default(),
            change_sender,
            catalog_sender,
        }
    }
    pub fn notify_change(&self, chng: (EventId, ChangesRecord)) {
        // nobody listening is fine
        let _ = self.change_sender.send(chng);
    }
    pub fn notify_catalog(&self, event_id: EventId) {
        let _ = self.catalog_sender.send(event_id);
    }
    pub fn subscribe_changes(&self) -> broadcast::Receiver<(EventId, ChangesRecord)> {
        self.change_sender.subscribe()
    }
    pub fn subscribe_catalog(&self) -> broadcast::Receiver<EventId> {
        self.catalog_sender.subscribe()
    }
}

pub type SharedAppState = RwLock<AppState>;

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[get("/")]
fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(DbPoolFairing())
        .mount("/", routes![index]);
    let rocket = auth::extend(rocket);
    let rocket = event::extend(rocket);
    let rocket = student::extend(rocket);
    let rocket = attendance::extend(rocket);
    let rocket = changes::extend(rocket);

    rocket.manage(SharedAppState::new(AppState::new()))
}
