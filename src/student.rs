use log::info;
use rocket::data::ToByteUnit;
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Data, Rocket, State};
use sqlx::FromRow;
use crate::auth::session_user;
use crate::db::DbPool;
use crate::util::{sqlx_to_custom_error, unzip_data};
use crate::{SessionId, SharedAppState};

/// Directory entry owned by the external enrollment system. `student_id`
/// carries the badge/QR payload scanned at the door.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct StudentRecord {
    pub id: i64,
    pub student_id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub major: String,
    #[serde(default)]
    pub course: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub section: String,
}

impl StudentRecord {
    pub fn full_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            "Unknown Student".to_string()
        } else {
            full.to_string()
        }
    }
}

pub async fn find_student(student_id: &str, pool: &sqlx::SqlitePool) -> Result<Option<StudentRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM students WHERE student_id=?")
        .bind(student_id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn upsert_student<'e, E>(student: &StudentRecord, executor: E) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("INSERT OR REPLACE INTO students (student_id, first_name, last_name, email, major, course, year, section) VALUES (?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(&student.student_id)
        .bind(&student.first_name)
        .bind(&student.last_name)
        .bind(&student.email)
        .bind(&student.major)
        .bind(&student.course)
        .bind(&student.year)
        .bind(&student.section)
        .execute(executor)
        .await?;
    Ok(())
}

#[get("/api/student/<student_id>")]
async fn get_student(student_id: &str, db: &State<DbPool>) -> Result<Json<StudentRecord>, Custom<String>> {
    let student = find_student(student_id, &db.0).await.map_err(sqlx_to_custom_error)?;
    student.map(Json).ok_or(Custom(Status::NotFound, format!("Student {student_id} not found")))
}

#[derive(Deserialize)]
struct StudentImportRow {
    student_id: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    major: String,
    #[serde(default)]
    course: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    section: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ImportSummary {
    pub imported: usize,
}

#[post("/api/student/import", data = "<data>")]
async fn post_import_students(data: Data<'_>, content_type: &ContentType, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Json<ImportSummary>, Custom<String>> {
    session_user(&session_id, state)?;
    let data = data.open(10.mebibytes()).into_bytes().await
        .map_err(|e| Custom(Status::PayloadTooLarge, e.to_string()))?
        .into_inner();
    let data = if content_type == &ContentType::ZIP {
        unzip_data(&data).map_err(|e| Custom(Status::UnprocessableEntity, e))?
    } else {
        data
    };
    let mut reader = csv::Reader::from_reader(data.as_slice());
    let mut txn = db.0.begin().await.map_err(sqlx_to_custom_error)?;
    let mut imported = 0usize;
    for row in reader.deserialize::<StudentImportRow>() {
        let row = row.map_err(|e| Custom(Status::UnprocessableEntity, e.to_string()))?;
        let student = StudentRecord {
            id: 0,
            student_id: row.student_id,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            major: row.major,
            course: row.course,
            year: row.year,
            section: row.section,
        };
        upsert_student(&student, &mut *txn).await.map_err(sqlx_to_custom_error)?;
        imported += 1;
    }
    txn.commit().await.map_err(sqlx_to_custom_error)?;
    info!("Imported {imported} students into the directory");
    Ok(Json(ImportSummary { imported }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_student,
            post_import_students,
        ])
}
