#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use rocket::http::Status;
use rocket::request;
use rocket::serde::json::{json, Value};
use rocket::tokio::sync::Mutex;
use serde::{Deserialize, Serialize};
use crate::db::DbPoolFairing;
use crate::schedules::ScheduleId;

mod availability;
mod classes;
mod db;
mod enrollments;
mod error;
mod sbdatetime;
mod schedules;
mod users;

#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct SbApiToken(String);
impl_sqlx_text_type_and_decode!(SbApiToken);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for SbApiToken {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<SbApiToken, ()> {
        if let Some(api_token) = request.headers().get_one("x-api-token") {
            return request::Outcome::Success(SbApiToken(api_token.to_string()));
        }
        request::Outcome::Error((Status::Unauthorized, ()))
    }
}

/// Per-session mutual exclusion for the ledger. Enroll and cancel on one
/// session serialize on its mutex; different sessions never contend.
pub struct SbState {
    schedule_locks: HashMap<ScheduleId, Arc<Mutex<()>>>,
}
impl SbState {
    fn new() -> Self {
        Self {
            schedule_locks: Default::default(),
        }
    }
    pub fn schedule_lock(&mut self, schedule_id: ScheduleId) -> Arc<Mutex<()>> {
        self.schedule_locks
            .entry(schedule_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
    /// Called after a session is deleted so the map stays bounded by the
    /// number of live sessions. Existing clones of the Arc stay valid.
    pub fn forget_schedule(&mut self, schedule_id: ScheduleId) {
        self.schedule_locks.remove(&schedule_id);
    }
}
pub type SharedSbState = RwLock<SbState>;

#[get("/health")]
fn health() -> Value {
    json!({"status": "ok", "message": "Studio booking API is running"})
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(DbPoolFairing())
        .mount("/", routes![
            health,
        ]);
    let rocket = users::extend(rocket);
    let rocket = classes::extend(rocket);
    let rocket = schedules::extend(rocket);
    let rocket = enrollments::extend(rocket);

    rocket.manage(SharedSbState::new(SbState::new()))
}
