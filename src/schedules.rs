use std::collections::HashMap;
use std::str::FromStr;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use rocket::serde::json::{json, Json, Value};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::availability::{self, ScheduleView};
use crate::classes::{load_class, ClassId, ClassRecord};
use crate::db::{with_read_retry, DbPool};
use crate::enrollments::EnrollmentRecord;
use crate::error::{SbError, SbResult};
use crate::sbdatetime::{day_window, month_window, week_window, SbDateTime};
use crate::users::{load_user, require_admin, UserId};
use crate::{SbApiToken, SharedSbState};

pub type ScheduleId = i64;

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RecurrenceType {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for RecurrenceType {
    type Err = SbError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(RecurrenceType::Once),
            "daily" => Ok(RecurrenceType::Daily),
            "weekly" => Ok(RecurrenceType::Weekly),
            "monthly" => Ok(RecurrenceType::Monthly),
            other => Err(SbError::Validation(format!("Unknown recurrence type: {other}"))),
        }
    }
}

/// One concrete, bookable occurrence of a class. The recurrence rule is
/// consumed at authoring time; the type survives here for display only.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub class_id: ClassId,
    pub start_time: SbDateTime,
    pub end_time: SbDateTime,
    pub recurrence_type: RecurrenceType,
    pub day_of_week: Option<i64>,
    pub day_of_month: Option<i64>,
    pub created_by: UserId,
}

#[derive(Deserialize, Debug)]
struct PostedSchedule {
    class_id: ClassId,
    /// YYYY-MM-DD, taken as UTC
    date: String,
    /// HH:MM or HH:MM:SS time of day
    start_time: String,
    /// defaults to start + class duration
    end_time: Option<String>,
    #[serde(default = "recurrence_once")]
    recurrence_type: String,
    day_of_week: Option<i64>,
    day_of_month: Option<i64>,
}

fn recurrence_once() -> String {
    "once".to_string()
}

fn parse_time_of_day(s: &str) -> SbResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| SbError::Validation(format!("Unrecognized time of day: {s}")))
}

fn validate_recurrence_fields(day_of_week: Option<i64>, day_of_month: Option<i64>) -> SbResult<()> {
    if let Some(dow) = day_of_week {
        if !(0..=6).contains(&dow) {
            return Err(SbError::Validation("Day of week must be between 0 and 6".to_string()));
        }
    }
    if let Some(dom) = day_of_month {
        if !(1..=31).contains(&dom) {
            return Err(SbError::Validation("Day of month must be between 1 and 31".to_string()));
        }
    }
    Ok(())
}

/// Recurrence expansion. One authoring action yields one concrete session;
/// a daily/weekly/monthly rule does not fan out into a future series, the
/// single session just carries the tag.
fn expand_session(
    class: &ClassRecord,
    posted: &PostedSchedule,
) -> SbResult<(SbDateTime, SbDateTime, RecurrenceType)> {
    let recurrence_type = posted.recurrence_type.parse::<RecurrenceType>()?;
    validate_recurrence_fields(posted.day_of_week, posted.day_of_month)?;
    let date = NaiveDate::parse_from_str(&posted.date, "%Y-%m-%d")
        .map_err(|_| SbError::Validation(format!("Unrecognized date: {}", posted.date)))?;
    let start = date.and_time(parse_time_of_day(&posted.start_time)?);
    let end = match &posted.end_time {
        Some(end_time) => {
            let end = date.and_time(parse_time_of_day(end_time)?);
            if end <= start {
                return Err(SbError::Validation("End time must be after start time".to_string()));
            }
            end
        }
        // the derived end may cross midnight
        None => start + TimeDelta::minutes(class.duration),
    };
    Ok((
        SbDateTime::from_utc(start.and_utc()),
        SbDateTime::from_utc(end.and_utc()),
        recurrence_type,
    ))
}

pub async fn load_schedule(schedule_id: ScheduleId, db: &State<DbPool>) -> SbResult<ScheduleRecord> {
    let pool = &db.0;
    let schedule = with_read_retry(|| async {
        sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules WHERE id=?")
            .bind(schedule_id)
            .fetch_one(pool)
            .await
    })
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => SbError::NotFound("Session not found".to_string()),
        e => e.into(),
    })?;
    Ok(schedule)
}

pub async fn count_enrollments(schedule_id: ScheduleId, db: &State<DbPool>) -> SbResult<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enrollments WHERE schedule_id=?")
        .bind(schedule_id)
        .fetch_one(&db.0)
        .await?;
    Ok(count)
}

/// The read path behind the daily/weekly/monthly views: pure interval
/// membership on `start_time` in `[from, to)`, ascending.
async fn list_schedule_views(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    class_id: Option<ClassId>,
    db: &State<DbPool>,
) -> SbResult<Vec<ScheduleView>> {
    let pool = &db.0;
    let schedules = with_read_retry(|| async {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT s.* FROM schedules s JOIN classes c ON c.id = s.class_id WHERE c.is_active = 1",
        );
        if let Some(from) = from {
            qb.push(" AND s.start_time >= ").push_bind(from);
        }
        if let Some(to) = to {
            qb.push(" AND s.start_time < ").push_bind(to);
        }
        if let Some(class_id) = class_id {
            qb.push(" AND s.class_id = ").push_bind(class_id);
        }
        qb.push(" ORDER BY s.start_time");
        qb.build_query_as::<ScheduleRecord>().fetch_all(pool).await
    })
    .await?;
    let classes: HashMap<ClassId, ClassRecord> = with_read_retry(|| async {
        sqlx::query_as::<_, ClassRecord>("SELECT * FROM classes WHERE is_active=1")
            .fetch_all(pool)
            .await
    })
    .await?
    .into_iter()
    .map(|c| (c.id, c))
    .collect();
    let counts: HashMap<ScheduleId, i64> = with_read_retry(|| async {
        sqlx::query_as::<_, (ScheduleId, i64)>(
            "SELECT schedule_id, COUNT(*) FROM enrollments GROUP BY schedule_id",
        )
        .fetch_all(pool)
        .await
    })
    .await?
    .into_iter()
    .collect();
    let now = Utc::now();
    let views = schedules
        .into_iter()
        .filter_map(|schedule| {
            let class = classes.get(&schedule.class_id)?.clone();
            let enrolled = counts.get(&schedule.id).copied().unwrap_or(0);
            Some(availability::view(schedule, class, enrolled, now))
        })
        .collect();
    Ok(views)
}

#[get("/api/schedules?<from>&<to>&<class_id>")]
async fn get_schedules(
    from: Option<&str>,
    to: Option<&str>,
    class_id: Option<ClassId>,
    db: &State<DbPool>,
) -> SbResult<Json<Vec<ScheduleView>>> {
    let from = from
        .map(|s| SbDateTime::from_iso_string(s).map_err(|e| SbError::Validation(format!("Unrecognized date-time string: {s}, error: {e}"))))
        .transpose()?
        .map(SbDateTime::to_utc);
    let to = to
        .map(|s| SbDateTime::from_iso_string(s).map_err(|e| SbError::Validation(format!("Unrecognized date-time string: {s}, error: {e}"))))
        .transpose()?
        .map(SbDateTime::to_utc);
    let views = list_schedule_views(from, to, class_id, db).await?;
    Ok(Json(views))
}

#[get("/api/schedules/window/<window>")]
async fn get_schedules_window(window: &str, db: &State<DbPool>) -> SbResult<Json<Vec<ScheduleView>>> {
    let now = Utc::now();
    let (from, to) = match window {
        "day" => day_window(now),
        "week" => week_window(now),
        "month" => month_window(now),
        other => return Err(SbError::Validation(format!("Unknown schedule window: {other}"))),
    };
    let views = list_schedule_views(Some(from), Some(to), None, db).await?;
    Ok(Json(views))
}

#[derive(Serialize, Debug)]
struct ScheduleDetail {
    #[serde(flatten)]
    view: ScheduleView,
    enrollments: Vec<EnrollmentRecord>,
}

#[get("/api/schedules/<schedule_id>")]
async fn get_schedule(schedule_id: ScheduleId, db: &State<DbPool>) -> SbResult<Json<ScheduleDetail>> {
    let schedule = load_schedule(schedule_id, db).await?;
    let class = load_class(schedule.class_id, db).await?;
    let pool = &db.0;
    let enrollments = with_read_retry(|| async {
        sqlx::query_as::<_, EnrollmentRecord>(
            "SELECT * FROM enrollments WHERE schedule_id=? ORDER BY id",
        )
        .bind(schedule_id)
        .fetch_all(pool)
        .await
    })
    .await?;
    let enrolled = enrollments.len() as i64;
    let view = availability::view(schedule, class, enrolled, Utc::now());
    Ok(Json(ScheduleDetail { view, enrollments }))
}

#[post("/api/schedules", data = "<posted>")]
async fn post_schedule(token: SbApiToken, posted: Json<PostedSchedule>, db: &State<DbPool>) -> SbResult<Json<ScheduleRecord>> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    let class = load_class(posted.class_id, db).await?;
    let (start_time, end_time, recurrence_type) = expand_session(&class, &posted)?;
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO schedules (class_id, start_time, end_time, recurrence_type, day_of_week, day_of_month, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(class.id)
    .bind(start_time.to_utc())
    .bind(end_time.to_utc())
    .bind(recurrence_type)
    .bind(posted.day_of_week)
    .bind(posted.day_of_month)
    .bind(user.id)
    .fetch_one(&db.0)
    .await?;
    info!(
        "Schedule created, id: {id}, class: {}, start: {}",
        class.id,
        start_time.to_iso_string()
    );
    let schedule = load_schedule(id, db).await?;
    Ok(Json(schedule))
}

#[derive(Deserialize, Debug)]
struct PostedScheduleUpdate {
    /// ISO-8601 with offset
    start_time: Option<String>,
    end_time: Option<String>,
    recurrence_type: Option<String>,
    day_of_week: Option<i64>,
    day_of_month: Option<i64>,
}

#[put("/api/schedules/<schedule_id>", data = "<posted>")]
async fn put_schedule(
    schedule_id: ScheduleId,
    token: SbApiToken,
    posted: Json<PostedScheduleUpdate>,
    db: &State<DbPool>,
) -> SbResult<Json<ScheduleRecord>> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    let mut schedule = load_schedule(schedule_id, db).await?;
    if let Some(s) = &posted.start_time {
        schedule.start_time = SbDateTime::from_iso_string(s)
            .map_err(|e| SbError::Validation(format!("Unrecognized date-time string: {s}, error: {e}")))?;
    }
    if let Some(s) = &posted.end_time {
        schedule.end_time = SbDateTime::from_iso_string(s)
            .map_err(|e| SbError::Validation(format!("Unrecognized date-time string: {s}, error: {e}")))?;
    }
    if let Some(s) = &posted.recurrence_type {
        schedule.recurrence_type = s.parse::<RecurrenceType>()?;
    }
    if posted.day_of_week.is_some() {
        schedule.day_of_week = posted.day_of_week;
    }
    if posted.day_of_month.is_some() {
        schedule.day_of_month = posted.day_of_month;
    }
    validate_recurrence_fields(schedule.day_of_week, schedule.day_of_month)?;
    if schedule.end_time.to_utc() <= schedule.start_time.to_utc() {
        return Err(SbError::Validation("End time must be after start time".to_string()));
    }
    sqlx::query(
        "UPDATE schedules SET start_time=?, end_time=?, recurrence_type=?, day_of_week=?, day_of_month=? WHERE id=?",
    )
    .bind(schedule.start_time.to_utc())
    .bind(schedule.end_time.to_utc())
    .bind(schedule.recurrence_type)
    .bind(schedule.day_of_week)
    .bind(schedule.day_of_month)
    .bind(schedule_id)
    .execute(&db.0)
    .await?;
    info!("Schedule updated, id: {schedule_id}");
    let schedule = load_schedule(schedule_id, db).await?;
    Ok(Json(schedule))
}

// Enrollments go with their session in one transaction so a deleted
// session can never leave orphaned enrollments behind. The per-session
// lock keeps an in-flight enroll from inserting between the cascade
// and the commit.
#[delete("/api/schedules/<schedule_id>")]
async fn delete_schedule(
    schedule_id: ScheduleId,
    token: SbApiToken,
    state: &State<SharedSbState>,
    db: &State<DbPool>,
) -> SbResult<Value> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    let lock = state.write().expect("not poisoned").schedule_lock(schedule_id);
    let guard = lock.lock().await;
    let mut txn = db.0.begin().await?;
    sqlx::query("DELETE FROM enrollments WHERE schedule_id=?")
        .bind(schedule_id)
        .execute(&mut *txn)
        .await?;
    let res = sqlx::query("DELETE FROM schedules WHERE id=?")
        .bind(schedule_id)
        .execute(&mut *txn)
        .await?;
    if res.rows_affected() == 0 {
        // dropping the transaction rolls the enrollment delete back
        return Err(SbError::NotFound("Session not found".to_string()));
    }
    txn.commit().await?;
    // the session is gone, its lock map entry can go too; a latecomer
    // holding the old Arc still serializes against us on `guard`
    drop(guard);
    state.write().expect("not poisoned").forget_schedule(schedule_id);
    info!("Schedule deleted, id: {schedule_id}");
    Ok(json!({"message": "Schedule deleted successfully"}))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_schedules,
            get_schedules_window,
            get_schedule,
            post_schedule,
            put_schedule,
            delete_schedule,
        ])
}

#[cfg(test)]
mod expand_tests {
    use super::*;
    use crate::classes::Difficulty;

    fn test_class(duration: i64) -> ClassRecord {
        ClassRecord {
            id: 1,
            title: "Vinyasa Flow".to_string(),
            description: String::new(),
            instructor_name: "Mira".to_string(),
            duration,
            capacity: 12,
            difficulty: Difficulty::Beginner,
            image_url: None,
            is_active: true,
        }
    }

    fn posted(date: &str, start: &str, end: Option<&str>, recurrence: &str) -> PostedSchedule {
        PostedSchedule {
            class_id: 1,
            date: date.to_string(),
            start_time: start.to_string(),
            end_time: end.map(|s| s.to_string()),
            recurrence_type: recurrence.to_string(),
            day_of_week: None,
            day_of_month: None,
        }
    }

    #[test]
    fn test_end_defaults_to_start_plus_duration() {
        let class = test_class(75);
        let (start, end, recurrence) =
            expand_session(&class, &posted("2025-06-01", "18:00", None, "once")).unwrap();
        assert_eq!(start.to_iso_string(), "2025-06-01T18:00:00Z");
        assert_eq!(end.to_iso_string(), "2025-06-01T19:15:00Z");
        assert_eq!(recurrence, RecurrenceType::Once);
    }

    #[test]
    fn test_derived_end_crosses_midnight() {
        let class = test_class(90);
        let (_, end, _) =
            expand_session(&class, &posted("2025-06-01", "23:00", None, "once")).unwrap();
        assert_eq!(end.to_iso_string(), "2025-06-02T00:30:00Z");
    }

    #[test]
    fn test_explicit_end_must_follow_start() {
        let class = test_class(60);
        let err = expand_session(&class, &posted("2025-06-01", "18:00", Some("18:00"), "once"))
            .unwrap_err();
        assert!(matches!(err, SbError::Validation(_)));
        let err = expand_session(&class, &posted("2025-06-01", "18:00", Some("17:00"), "once"))
            .unwrap_err();
        assert!(matches!(err, SbError::Validation(_)));
    }

    #[test]
    fn test_unknown_recurrence_rejected() {
        let class = test_class(60);
        let err = expand_session(&class, &posted("2025-06-01", "18:00", None, "fortnightly"))
            .unwrap_err();
        assert!(matches!(err, SbError::Validation(_)));
    }

    #[test]
    fn test_recurring_rule_still_yields_one_session() {
        let class = test_class(60);
        let (start, _, recurrence) =
            expand_session(&class, &posted("2025-06-01", "09:30", None, "weekly")).unwrap();
        assert_eq!(recurrence, RecurrenceType::Weekly);
        assert_eq!(start.to_iso_string(), "2025-06-01T09:30:00Z");
    }

    #[test]
    fn test_recurrence_field_ranges() {
        assert!(validate_recurrence_fields(Some(0), None).is_ok());
        assert!(validate_recurrence_fields(Some(6), Some(31)).is_ok());
        assert!(validate_recurrence_fields(Some(7), None).is_err());
        assert!(validate_recurrence_fields(None, Some(0)).is_err());
        assert!(validate_recurrence_fields(None, Some(32)).is_err());
    }
}
