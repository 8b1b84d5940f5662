use rocket::serde::json::{json, Json, Value};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::db::{with_read_retry, DbPool};
use crate::error::{SbError, SbResult};
use crate::users::{load_user, require_admin};
use crate::SbApiToken;

pub type ClassId = i64;

pub const MIN_DURATION_MIN: i64 = 15;
pub const MAX_DURATION_MIN: i64 = 180;
pub const MIN_CAPACITY: i64 = 1;
pub const MAX_CAPACITY: i64 = 50;

#[derive(Serialize, Deserialize, sqlx::Type, FromFormField, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

/// A reusable offering template. Sessions reference it, they never embed it.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ClassRecord {
    pub id: ClassId,
    pub title: String,
    pub description: String,
    pub instructor_name: String,
    pub duration: i64,
    pub capacity: i64,
    pub difficulty: Difficulty,
    pub image_url: Option<String>,
    pub is_active: bool,
}

#[derive(Deserialize, Debug)]
struct PostedClass {
    title: String,
    #[serde(default)]
    description: String,
    instructor_name: String,
    duration: i64,
    capacity: i64,
    difficulty: Difficulty,
    image_url: Option<String>,
}

fn validate_class(posted: &PostedClass) -> SbResult<()> {
    if posted.title.trim().is_empty() || posted.instructor_name.trim().is_empty() {
        return Err(SbError::Validation("Title and instructor name are required".to_string()));
    }
    if !(MIN_DURATION_MIN..=MAX_DURATION_MIN).contains(&posted.duration) {
        return Err(SbError::Validation(format!(
            "Duration must be between {MIN_DURATION_MIN} and {MAX_DURATION_MIN} minutes"
        )));
    }
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&posted.capacity) {
        return Err(SbError::Validation(format!(
            "Capacity must be between {MIN_CAPACITY} and {MAX_CAPACITY} seats"
        )));
    }
    Ok(())
}

pub async fn load_class(class_id: ClassId, db: &State<DbPool>) -> SbResult<ClassRecord> {
    let pool = &db.0;
    let class = with_read_retry(|| async {
        sqlx::query_as::<_, ClassRecord>("SELECT * FROM classes WHERE id=?")
            .bind(class_id)
            .fetch_one(pool)
            .await
    })
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => SbError::NotFound("Class not found".to_string()),
        e => e.into(),
    })?;
    Ok(class)
}

#[get("/api/classes?<difficulty>")]
async fn get_classes(difficulty: Option<Difficulty>, db: &State<DbPool>) -> SbResult<Json<Vec<ClassRecord>>> {
    let pool = &db.0;
    let classes = with_read_retry(|| async {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT * FROM classes WHERE is_active=1");
        if let Some(difficulty) = difficulty {
            qb.push(" AND difficulty=").push_bind(difficulty);
        }
        qb.push(" ORDER BY id");
        qb.build_query_as::<ClassRecord>().fetch_all(pool).await
    })
    .await?;
    Ok(Json(classes))
}

#[get("/api/classes/<class_id>")]
async fn get_class(class_id: ClassId, db: &State<DbPool>) -> SbResult<Json<ClassRecord>> {
    let class = load_class(class_id, db).await?;
    Ok(Json(class))
}

#[post("/api/classes", data = "<posted>")]
async fn post_class(token: SbApiToken, posted: Json<PostedClass>, db: &State<DbPool>) -> SbResult<Json<ClassRecord>> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    validate_class(&posted)?;
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO classes (title, description, instructor_name, duration, capacity, difficulty, image_url) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(posted.title.trim())
    .bind(&posted.description)
    .bind(posted.instructor_name.trim())
    .bind(posted.duration)
    .bind(posted.capacity)
    .bind(posted.difficulty)
    .bind(&posted.image_url)
    .fetch_one(&db.0)
    .await?;
    info!("Class created, id: {id}, title: {}", posted.title);
    let class = load_class(id, db).await?;
    Ok(Json(class))
}

#[put("/api/classes/<class_id>", data = "<posted>")]
async fn put_class(class_id: ClassId, token: SbApiToken, posted: Json<PostedClass>, db: &State<DbPool>) -> SbResult<Json<ClassRecord>> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    validate_class(&posted)?;
    let res = sqlx::query(
        "UPDATE classes SET title=?, description=?, instructor_name=?, duration=?, capacity=?, difficulty=?, image_url=? \
         WHERE id=?",
    )
    .bind(posted.title.trim())
    .bind(&posted.description)
    .bind(posted.instructor_name.trim())
    .bind(posted.duration)
    .bind(posted.capacity)
    .bind(posted.difficulty)
    .bind(&posted.image_url)
    .bind(class_id)
    .execute(&db.0)
    .await?;
    if res.rows_affected() == 0 {
        return Err(SbError::NotFound("Class not found".to_string()));
    }
    info!("Class updated, id: {class_id}");
    let class = load_class(class_id, db).await?;
    Ok(Json(class))
}

// Soft delete: existing sessions keep a resolvable class reference but
// drop out of the public catalog and schedule listings.
#[delete("/api/classes/<class_id>")]
async fn delete_class(class_id: ClassId, token: SbApiToken, db: &State<DbPool>) -> SbResult<Value> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    let res = sqlx::query("UPDATE classes SET is_active=0 WHERE id=?")
        .bind(class_id)
        .execute(&db.0)
        .await?;
    if res.rows_affected() == 0 {
        return Err(SbError::NotFound("Class not found".to_string()));
    }
    info!("Class deleted, id: {class_id}");
    Ok(json!({"message": "Class deleted successfully"}))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_classes,
            get_class,
            post_class,
            put_class,
            delete_class,
        ])
}
