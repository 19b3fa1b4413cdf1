use std::fmt::{Display, Formatter};
use std::str::FromStr;
use log::error;
use rocket::response::status::Custom;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::sync::broadcast::error::RecvError;
use rocket::{Build, Rocket, State};
use sqlx::{query_as, FromRow, QueryBuilder};
use crate::attendance::AttendanceRecord;
use crate::db::DbPool;
use crate::event::{EventId, EventRecord};
use crate::isotime::IsoDateTime;
use crate::util::{sqlx_to_anyhow, sqlx_to_custom_error};
use crate::{impl_sqlx_json_text_type_encode_decode, impl_sqlx_text_enum_type_encode_decode, SharedAppState};

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
pub enum DataType {
    EventCreated,
    EventUpdated,
    CheckIn,
    CheckOut,
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::EventCreated => write!(f, "EventCreated"),
            DataType::EventUpdated => write!(f, "EventUpdated"),
            DataType::CheckIn => write!(f, "CheckIn"),
            DataType::CheckOut => write!(f, "CheckOut"),
        }
    }
}

impl FromStr for DataType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            stringify!(EventCreated) => Ok(Self::EventCreated),
            stringify!(EventUpdated) => Ok(Self::EventUpdated),
            stringify!(CheckIn) => Ok(Self::CheckIn),
            stringify!(CheckOut) => Ok(Self::CheckOut),
            _ => Err(format!("Unknown data type: {s}")),
        }
    }
}

impl_sqlx_text_enum_type_encode_decode!(DataType);

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum ChangeData {
    Null,
    Event(EventRecord),
    Attendance(AttendanceRecord),
}

impl_sqlx_json_text_type_encode_decode!(ChangeData);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ChangesRecord {
    pub id: i64,
    pub event_id: EventId,
    pub source: String,
    pub data_type: DataType,
    pub data: ChangeData,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created: IsoDateTime,
}

pub async fn add_change(event_id: EventId, source: &str, data_type: DataType, data: &ChangeData, user_id: Option<&str>, db: &State<DbPool>, state: &State<SharedAppState>) -> anyhow::Result<i64> {
    let id: (i64, ) = query_as("INSERT INTO changes
                (event_id, source, data_type, data, user_id, created)
                VALUES (?, ?, ?, ?, ?, ?)  RETURNING id")
        .bind(event_id)
        .bind(source)
        .bind(data_type)
        .bind(data)
        .bind(user_id)
        .bind(IsoDateTime::now().trimmed_to_sec())
        .fetch_one(&db.0)
        .await.map_err(sqlx_to_anyhow)?;
    let change: ChangesRecord = query_as("SELECT * FROM changes WHERE id=?")
        .bind(id.0)
        .fetch_one(&db.0)
        .await.map_err(sqlx_to_anyhow)?;
    state.read().expect("not poisoned").notify_change((event_id, change));
    Ok(id.0)
}

#[get("/api/event/<event_id>/changes?<from_id>&<data_type>")]
async fn api_get_changes(event_id: EventId, from_id: Option<i64>, data_type: Option<&str>, db: &State<DbPool>) -> Result<Json<Vec<ChangesRecord>>, Custom<String>> {
    let mut query_builder = QueryBuilder::new("SELECT * FROM changes WHERE event_id=");
    query_builder.push_bind(event_id);
    query_builder.push(" AND id>=");
    query_builder.push_bind(from_id.unwrap_or(0));
    if let Some(data_type) = data_type {
        query_builder.push(" AND data_type=");
        query_builder.push_bind(data_type);
    }
    query_builder.push(" ORDER BY id");

    let query = query_builder.build_query_as::<ChangesRecord>();
    let records: Vec<_> = query.fetch_all(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(records.into())
}

#[get("/api/event/<event_id>/changes/sse")]
async fn changes_sse(event_id: EventId, state: &State<SharedAppState>) -> EventStream![] {
    let mut chng_receiver = state.read().expect("not poisoned").subscribe_changes();
    EventStream! {
        loop {
            let (chng_event_id, change) = match chng_receiver.recv().await {
                Ok(chng) => chng,
                Err(RecvError::Lagged(n)) => {
                    error!("Change feed lagged by {n} messages");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event_id == chng_event_id {
                match serde_json::to_string(&change) {
                    Ok(json) => {
                        yield Event::data(json);
                    }
                    Err(e) => {
                        error!("Serde error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            api_get_changes,
            changes_sse,
        ])
}
