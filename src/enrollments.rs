use chrono::{TimeDelta, Utc};
use rocket::serde::json::{json, Json, Value};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::classes::{load_class, ClassRecord};
use crate::db::{with_read_retry, DbPool};
use crate::error::{SbError, SbResult};
use crate::sbdatetime::SbDateTime;
use crate::schedules::{count_enrollments, load_schedule, ScheduleId, ScheduleRecord};
use crate::users::{load_user, UserId, UserRecord};
use crate::{SbApiToken, SharedSbState};

pub type EnrollmentId = i64;

pub const CANCELLATION_CUTOFF_MIN: i64 = 60;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct EnrollmentRecord {
    pub id: EnrollmentId,
    pub schedule_id: ScheduleId,
    pub user_id: UserId,
    pub created: SbDateTime,
}

#[derive(Deserialize, Debug)]
struct PostedEnrollment {
    schedule_id: ScheduleId,
}

/// The write path of the ledger. The per-session lock makes the capacity
/// read and the insert atomic with respect to other enrollments on the
/// same session; distinct sessions never contend.
pub async fn enroll(
    schedule_id: ScheduleId,
    user_id: UserId,
    state: &State<SharedSbState>,
    db: &State<DbPool>,
) -> SbResult<EnrollmentRecord> {
    let lock = state.write().expect("not poisoned").schedule_lock(schedule_id);
    let _guard = lock.lock().await;

    let schedule = load_schedule(schedule_id, db).await?;
    let class = load_class(schedule.class_id, db).await?;
    if !class.is_active {
        return Err(SbError::NotFound("Class not found".to_string()));
    }
    let now = Utc::now();
    if now >= schedule.start_time.to_utc() {
        warn!("Enrollment denied, session already started: schedule={schedule_id}, user={user_id}");
        return Err(SbError::SessionStarted);
    }
    let enrolled = count_enrollments(schedule_id, db).await?;
    if enrolled >= class.capacity {
        warn!("Enrollment denied, class full: schedule={schedule_id}, user={user_id}");
        return Err(SbError::SessionFull);
    }
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM enrollments WHERE schedule_id=? AND user_id=?")
            .bind(schedule_id)
            .bind(user_id)
            .fetch_optional(&db.0)
            .await?;
    if existing.is_some() {
        warn!("Enrollment denied, duplicate: schedule={schedule_id}, user={user_id}");
        return Err(SbError::AlreadyEnrolled);
    }
    let created = SbDateTime::now();
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO enrollments (schedule_id, user_id, created) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(schedule_id)
    .bind(user_id)
    .bind(created.to_utc())
    .fetch_one(&db.0)
    .await?;
    info!("Enrollment created, id: {id}, schedule: {schedule_id}, user: {user_id}");
    Ok(EnrollmentRecord { id, schedule_id, user_id, created })
}

fn check_cancellation_window(schedule: &ScheduleRecord) -> SbResult<()> {
    let until = schedule.start_time.to_utc().signed_duration_since(Utc::now());
    // blocked in [start - 60min, start); a session already underway or
    // over may always be cancelled as cleanup
    if until > TimeDelta::zero() && until <= TimeDelta::minutes(CANCELLATION_CUTOFF_MIN) {
        return Err(SbError::CancellationWindow {
            minutes_until_class: until.num_minutes(),
        });
    }
    Ok(())
}

pub async fn cancel(
    enrollment_id: EnrollmentId,
    user: &UserRecord,
    state: &State<SharedSbState>,
    db: &State<DbPool>,
) -> SbResult<()> {
    let pool = &db.0;
    let enrollment = with_read_retry(|| async {
        sqlx::query_as::<_, EnrollmentRecord>("SELECT * FROM enrollments WHERE id=?")
            .bind(enrollment_id)
            .fetch_optional(pool)
            .await
    })
    .await?
    .ok_or_else(|| SbError::NotFound("Enrollment not found".to_string()))?;
    if enrollment.user_id != user.id && !user.is_admin() {
        warn!(
            "Cancellation denied, ownership mismatch: enrollment={enrollment_id}, user={}",
            user.id
        );
        return Err(SbError::Forbidden("Enrollment belongs to a different user".to_string()));
    }

    let lock = state.write().expect("not poisoned").schedule_lock(enrollment.schedule_id);
    let _guard = lock.lock().await;

    let schedule = load_schedule(enrollment.schedule_id, db).await?;
    if let Err(err) = check_cancellation_window(&schedule) {
        warn!(
            "Cancellation denied, inside cutoff window: enrollment={enrollment_id}, user={}",
            user.id
        );
        return Err(err);
    }
    let res = sqlx::query("DELETE FROM enrollments WHERE id=?")
        .bind(enrollment_id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        // already hard-deleted, terminal for the caller
        return Err(SbError::NotFound("Enrollment not found".to_string()));
    }
    info!("Enrollment cancelled, id: {enrollment_id}, user: {}", user.id);
    Ok(())
}

#[post("/api/enrollments", data = "<posted>")]
async fn post_enrollment(
    token: SbApiToken,
    posted: Json<PostedEnrollment>,
    state: &State<SharedSbState>,
    db: &State<DbPool>,
) -> SbResult<Json<EnrollmentRecord>> {
    let user = load_user(&token, db).await?;
    let enrollment = enroll(posted.schedule_id, user.id, state, db).await?;
    Ok(Json(enrollment))
}

#[delete("/api/enrollments/<enrollment_id>")]
async fn delete_enrollment(
    enrollment_id: EnrollmentId,
    token: SbApiToken,
    state: &State<SharedSbState>,
    db: &State<DbPool>,
) -> SbResult<Value> {
    let user = load_user(&token, db).await?;
    cancel(enrollment_id, &user, state, db).await?;
    Ok(json!({"message": "Enrollment cancelled successfully"}))
}

#[derive(Serialize, Debug)]
struct EnrollmentView {
    #[serde(flatten)]
    enrollment: EnrollmentRecord,
    schedule: ScheduleRecord,
    class: ClassRecord,
}

#[get("/api/enrollments/my")]
async fn get_my_enrollments(token: SbApiToken, db: &State<DbPool>) -> SbResult<Json<Vec<EnrollmentView>>> {
    let user = load_user(&token, db).await?;
    let pool = &db.0;
    let enrollments = with_read_retry(|| async {
        sqlx::query_as::<_, EnrollmentRecord>(
            "SELECT * FROM enrollments WHERE user_id=? ORDER BY created DESC, id DESC",
        )
        .bind(user.id)
        .fetch_all(pool)
        .await
    })
    .await?;
    let mut views = Vec::with_capacity(enrollments.len());
    for enrollment in enrollments {
        let schedule = load_schedule(enrollment.schedule_id, db).await?;
        let class = load_class(schedule.class_id, db).await?;
        views.push(EnrollmentView { enrollment, schedule, class });
    }
    Ok(Json(views))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_enrollment,
            delete_enrollment,
            get_my_enrollments,
        ])
}

#[cfg(test)]
mod cutoff_tests {
    use super::*;
    use crate::schedules::RecurrenceType;

    fn schedule_starting_in(delta: TimeDelta) -> ScheduleRecord {
        let start = Utc::now() + delta;
        ScheduleRecord {
            id: 1,
            class_id: 1,
            start_time: SbDateTime::from_utc(start),
            end_time: SbDateTime::from_utc(start + TimeDelta::minutes(60)),
            recurrence_type: RecurrenceType::Once,
            day_of_week: None,
            day_of_month: None,
            created_by: 1,
        }
    }

    #[test]
    fn test_cancel_allowed_before_cutoff() {
        assert!(check_cancellation_window(&schedule_starting_in(TimeDelta::minutes(90))).is_ok());
        assert!(check_cancellation_window(&schedule_starting_in(TimeDelta::minutes(61))).is_ok());
    }

    #[test]
    fn test_cancel_blocked_inside_window() {
        for minutes in [60, 45, 30, 1] {
            let err = check_cancellation_window(&schedule_starting_in(TimeDelta::minutes(minutes)))
                .unwrap_err();
            match err {
                SbError::CancellationWindow { minutes_until_class } => {
                    // now() moved a little between construction and check
                    assert!((minutes - 1..=minutes).contains(&minutes_until_class));
                }
                other => panic!("expected CancellationWindow, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_cancel_allowed_after_start() {
        assert!(check_cancellation_window(&schedule_starting_in(TimeDelta::zero())).is_ok());
        assert!(check_cancellation_window(&schedule_starting_in(-TimeDelta::minutes(30))).is_ok());
        assert!(check_cancellation_window(&schedule_starting_in(-TimeDelta::days(2))).is_ok());
    }
}
