use log::error;
use rocket::response::status::Custom;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::time::{interval, Duration};
use rocket::{Build, Rocket, State};
use sqlx::{FromRow, SqlitePool};
use crate::auth::session_user;
use crate::changes::{add_change, ChangeData, DataType};
use crate::db::DbPool;
use crate::event::{load_event, load_event_for_api_token, EventId, EventRecord};
use crate::isotime::IsoDateTime;
use crate::student::{find_student, StudentRecord};
use crate::util::{anyhow_to_custom_error, sqlx_to_anyhow, sqlx_to_custom_error};
use crate::{EventApiToken, SessionId, SharedAppState};

pub type AttendanceId = i64;

/// One check-in/check-out session of a student at an event. Records are
/// history, not a single row per student; the open session is the one
/// without a check_out_time.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub event_id: EventId,
    pub student_id: String,
    #[serde(default)]
    pub student_name: String,
    #[serde(default)]
    pub student_email: String,
    #[serde(default)]
    pub student_major: String,
    #[serde(default)]
    pub student_course: String,
    #[serde(default)]
    pub student_year: String,
    #[serde(default)]
    pub student_section: String,
    pub check_in_time: IsoDateTime,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_time: Option<IsoDateTime>,
    pub created_at: IsoDateTime,
    pub updated_at: IsoDateTime,
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    Login,
    Logout,
    Toggle,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScanRequest {
    pub student_id: String,
    #[serde(default)]
    pub action: Option<ScanAction>,
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
pub enum RejectReason {
    StudentNotFound,
    AlreadyLoggedIn,
    AlreadyLoggedOut,
    NoActiveSession,
}

impl RejectReason {
    fn error_text(&self) -> &'static str {
        match self {
            RejectReason::StudentNotFound => "Student not found in database",
            RejectReason::AlreadyLoggedIn => "Student is already logged in",
            RejectReason::AlreadyLoggedOut | RejectReason::NoActiveSession => "Student is already logged out",
        }
    }
    fn message_text(&self, student_id: &str) -> String {
        match self {
            RejectReason::StudentNotFound => format!("Student ID {student_id} is not registered"),
            RejectReason::AlreadyLoggedIn => "Student is already logged in to this event".to_string(),
            RejectReason::AlreadyLoggedOut | RejectReason::NoActiveSession => "Student is already logged out from this event".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScanOutcome {
    pub success: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_id: Option<AttendanceId>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<StudentRecord>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
}

impl ScanOutcome {
    fn rejected(reason: RejectReason, student_id: &str, student: Option<StudentRecord>, previous_status: Option<&str>) -> Self {
        Self {
            success: false,
            action: None,
            attendance_id: None,
            reason: Some(reason),
            error: Some(reason.error_text().to_string()),
            message: reason.message_text(student_id),
            student,
            previous_status: previous_status.map(|s| s.to_string()),
        }
    }
    fn accepted(action: &str, record: &AttendanceRecord, student: StudentRecord, previous_status: &str, message: String) -> Self {
        Self {
            success: true,
            action: Some(action.to_string()),
            attendance_id: Some(record.id),
            reason: None,
            error: None,
            message,
            student: Some(student),
            previous_status: Some(previous_status.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StatusSummary {
    pub is_checked_in: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_record: Option<AttendanceRecord>,
}

// Pure read. Records come back unordered and are sorted here, newest
// check-in first, the autoincrement id breaks timestamp ties.
pub async fn resolve_status(student_id: &str, event_id: EventId, pool: &SqlitePool) -> anyhow::Result<StatusSummary> {
    let mut records: Vec<AttendanceRecord> = sqlx::query_as("SELECT * FROM attendance WHERE event_id=? AND student_id=?")
        .bind(event_id)
        .bind(student_id)
        .fetch_all(pool)
        .await.map_err(sqlx_to_anyhow)?;
    records.sort_by(|a, b| (b.check_in_time, b.id).cmp(&(a.check_in_time, a.id)));
    let latest_record = records.into_iter().next();
    let is_checked_in = latest_record.as_ref().map(|r| r.check_out_time.is_none()).unwrap_or(false);
    Ok(StatusSummary { is_checked_in, latest_record })
}

// The write itself carries the guard, a racing scan makes the insert
// a no-op instead of a duplicate session.
async fn check_in_student(student: &StudentRecord, event_id: EventId, pool: &SqlitePool) -> anyhow::Result<Option<AttendanceRecord>> {
    let now = IsoDateTime::now();
    let id: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO attendance (event_id, student_id, student_name, student_email, student_major, student_course, student_year, student_section, check_in_time, check_out_time, created_at, updated_at)
         SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?
         WHERE NOT EXISTS (SELECT 1 FROM attendance WHERE event_id=? AND student_id=? AND check_out_time IS NULL)
         RETURNING id")
        .bind(event_id)
        .bind(&student.student_id)
        .bind(student.full_name())
        .bind(&student.email)
        .bind(&student.major)
        .bind(&student.course)
        .bind(&student.year)
        .bind(&student.section)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(event_id)
        .bind(&student.student_id)
        .fetch_optional(pool)
        .await.map_err(sqlx_to_anyhow)?;
    let Some(id) = id else { return Ok(None) };
    let record = sqlx::query_as("SELECT * FROM attendance WHERE id=?")
        .bind(id.0)
        .fetch_one(pool)
        .await.map_err(sqlx_to_anyhow)?;
    Ok(Some(record))
}

// closes the newest open session, if any
async fn check_out_student(student_id: &str, event_id: EventId, pool: &SqlitePool) -> anyhow::Result<Option<AttendanceRecord>> {
    let now = IsoDateTime::now();
    let id: Option<(i64,)> = sqlx::query_as(
        "UPDATE attendance SET check_out_time=?, updated_at=?
         WHERE id=(SELECT id FROM attendance WHERE event_id=? AND student_id=? AND check_out_time IS NULL
                   ORDER BY check_in_time DESC, id DESC LIMIT 1)
         RETURNING id")
        .bind(now)
        .bind(now)
        .bind(event_id)
        .bind(student_id)
        .fetch_optional(pool)
        .await.map_err(sqlx_to_anyhow)?;
    let Some(id) = id else { return Ok(None) };
    let record = sqlx::query_as("SELECT * FROM attendance WHERE id=?")
        .bind(id.0)
        .fetch_one(pool)
        .await.map_err(sqlx_to_anyhow)?;
    Ok(Some(record))
}

pub async fn process_attendance(student_id: &str, event: &EventRecord, action: ScanAction, source: &str, user_id: Option<&str>, db: &State<DbPool>, state: &State<SharedAppState>) -> Result<ScanOutcome, Custom<String>> {
    let pool = &db.0;
    let Some(student) = find_student(student_id, pool).await.map_err(sqlx_to_custom_error)? else {
        return Ok(ScanOutcome::rejected(RejectReason::StudentNotFound, student_id, None, None));
    };
    let status = resolve_status(student_id, event.id, pool).await.map_err(anyhow_to_custom_error)?;
    let do_login = match action {
        ScanAction::Login => true,
        ScanAction::Logout => false,
        ScanAction::Toggle => !status.is_checked_in,
    };
    if do_login {
        if status.is_checked_in {
            return Ok(ScanOutcome::rejected(RejectReason::AlreadyLoggedIn, student_id, Some(student), Some("checked-in")));
        }
        match check_in_student(&student, event.id, pool).await.map_err(anyhow_to_custom_error)? {
            Some(record) => {
                add_change(event.id, source, DataType::CheckIn, &ChangeData::Attendance(record.clone()), user_id, db, state)
                    .await.map_err(anyhow_to_custom_error)?;
                let message = format!("{} checked in successfully", student.full_name());
                Ok(ScanOutcome::accepted("check-in", &record, student, "checked-out", message))
            }
            // lost the race to a concurrent scan
            None => Ok(ScanOutcome::rejected(RejectReason::AlreadyLoggedIn, student_id, Some(student), Some("checked-in"))),
        }
    } else {
        if !status.is_checked_in {
            let reason = if status.latest_record.is_none() {
                RejectReason::NoActiveSession
            } else {
                RejectReason::AlreadyLoggedOut
            };
            return Ok(ScanOutcome::rejected(reason, student_id, Some(student), Some("checked-out")));
        }
        match check_out_student(student_id, event.id, pool).await.map_err(anyhow_to_custom_error)? {
            Some(record) => {
                add_change(event.id, source, DataType::CheckOut, &ChangeData::Attendance(record.clone()), user_id, db, state)
                    .await.map_err(anyhow_to_custom_error)?;
                let message = format!("{} checked out successfully", student.full_name());
                Ok(ScanOutcome::accepted("check-out", &record, student, "checked-in", message))
            }
            None => Ok(ScanOutcome::rejected(RejectReason::AlreadyLoggedOut, student_id, Some(student), Some("checked-out"))),
        }
    }
}

#[post("/api/event/<event_id>/attendance/scan", data = "<scan>")]
async fn post_scan(event_id: EventId, scan: Json<ScanRequest>, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<ScanOutcome>, Custom<String>> {
    let user = session_user(&session_id, state)?;
    let event = load_event(event_id, db).await?;
    let scan = scan.into_inner();
    let action = scan.action.unwrap_or(ScanAction::Toggle);
    let outcome = process_attendance(&scan.student_id, &event, action, "www", Some(user.email.as_str()), db, state).await?;
    Ok(Json(outcome))
}

#[post("/api/event/current/attendance/scan", data = "<scan>")]
async fn post_scan_current(scan: Json<ScanRequest>, api_token: EventApiToken, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<ScanOutcome>, Custom<String>> {
    let event = load_event_for_api_token(&api_token, db).await?;
    let scan = scan.into_inner();
    let action = scan.action.unwrap_or(ScanAction::Toggle);
    let outcome = process_attendance(&scan.student_id, &event, action, "scanner", None, db, state).await?;
    Ok(Json(outcome))
}

#[get("/api/event/<event_id>/attendance")]
async fn get_event_attendance(event_id: EventId, db: &State<DbPool>) -> Result<Json<Vec<AttendanceRecord>>, Custom<String>> {
    load_event(event_id, db).await?;
    let records: Vec<AttendanceRecord> = sqlx::query_as("SELECT * FROM attendance WHERE event_id=? ORDER BY check_in_time DESC, id DESC")
        .bind(event_id)
        .fetch_all(&db.0)
        .await.map_err(sqlx_to_custom_error)?;
    Ok(Json(records))
}

#[get("/api/event/<event_id>/attendance/status/<student_id>")]
async fn get_attendance_status(event_id: EventId, student_id: &str, db: &State<DbPool>) -> Result<Json<StatusSummary>, Custom<String>> {
    load_event(event_id, db).await?;
    let status = resolve_status(student_id, event_id, &db.0).await.map_err(anyhow_to_custom_error)?;
    Ok(Json(status))
}

#[get("/api/student/<student_id>/attendance")]
async fn get_student_attendance(student_id: &str, db: &State<DbPool>) -> Result<Json<Vec<AttendanceRecord>>, Custom<String>> {
    let records: Vec<AttendanceRecord> = sqlx::query_as("SELECT * FROM attendance WHERE student_id=? ORDER BY check_in_time DESC, id DESC")
        .bind(student_id)
        .fetch_all(&db.0)
        .await.map_err(sqlx_to_custom_error)?;
    Ok(Json(records))
}

#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug)]
pub struct AttendanceCounts {
    pub login_count: i64,
    pub logout_count: i64,
}

async fn load_counts(event_id: EventId, pool: &SqlitePool) -> Result<AttendanceCounts, sqlx::Error> {
    let row: (i64, i64) = sqlx::query_as("SELECT COUNT(*), COUNT(check_out_time) FROM attendance WHERE event_id=?")
        .bind(event_id)
        .fetch_one(pool)
        .await?;
    Ok(AttendanceCounts { login_count: row.0, logout_count: row.1 })
}

#[get("/api/event/<event_id>/attendance/counts")]
async fn get_attendance_counts(event_id: EventId, db: &State<DbPool>) -> Result<Json<AttendanceCounts>, Custom<String>> {
    load_event(event_id, db).await?;
    let counts = load_counts(event_id, &db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Json(counts))
}

// dashboard count refresh, one periodic task per open stream, dropped with the connection
#[get("/api/event/<event_id>/attendance/counts/sse")]
async fn counts_sse(event_id: EventId, db: &State<DbPool>) -> EventStream![] {
    let pool = db.0.clone();
    EventStream! {
        let mut timer = interval(Duration::from_secs(5));
        loop {
            timer.tick().await;
            let counts = match load_counts(event_id, &pool).await {
                Ok(counts) => counts,
                Err(e) => {
                    error!("Count refresh error: {e}");
                    AttendanceCounts::default()
                }
            };
            match serde_json::to_string(&counts) {
                Ok(json) => yield Event::data(json),
                Err(e) => {
                    error!("Serde error: {e}");
                    break;
                }
            }
        }
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_scan,
            post_scan_current,
            get_event_attendance,
            get_attendance_status,
            get_student_attendance,
            get_attendance_counts,
            counts_sse,
        ])
}
