use std::io::Cursor;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde::Serialize;

/// Every way a booking request can be refused. Business-rule rejections
/// are terminal for the caller; only `StorageUnavailable` is worth a retry.
#[derive(Debug, Clone, PartialEq)]
pub enum SbError {
    Validation(String),
    NotFound(String),
    SessionFull,
    AlreadyEnrolled,
    SessionStarted,
    CancellationWindow { minutes_until_class: i64 },
    Forbidden(String),
    StorageUnavailable,
}

pub type SbResult<T> = Result<T, SbError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    minutes_until_class: Option<i64>,
}

impl SbError {
    fn status(&self) -> Status {
        match self {
            SbError::Validation(_) => Status::UnprocessableEntity,
            SbError::NotFound(_) => Status::NotFound,
            SbError::SessionFull
            | SbError::AlreadyEnrolled
            | SbError::SessionStarted
            | SbError::CancellationWindow { .. } => Status::Conflict,
            SbError::Forbidden(_) => Status::Forbidden,
            SbError::StorageUnavailable => Status::ServiceUnavailable,
        }
    }
    fn message(&self) -> String {
        match self {
            SbError::Validation(msg) => msg.clone(),
            SbError::NotFound(msg) => msg.clone(),
            SbError::SessionFull => "Class is full".to_string(),
            SbError::AlreadyEnrolled => "Already enrolled in this class".to_string(),
            SbError::SessionStarted => "Class has already started".to_string(),
            SbError::CancellationWindow { .. } => {
                "Cannot cancel within 1 hour of class start time".to_string()
            }
            SbError::Forbidden(msg) => msg.clone(),
            SbError::StorageUnavailable => "Storage temporarily unavailable".to_string(),
        }
    }
}

impl From<sqlx::Error> for SbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SbError::NotFound("Record not found".to_string()),
            err => {
                error!("SQL error: {err}");
                SbError::StorageUnavailable
            }
        }
    }
}

impl<'r> Responder<'r, 'static> for SbError {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        let minutes_until_class = match &self {
            SbError::CancellationWindow { minutes_until_class } => Some(*minutes_until_class),
            _ => None,
        };
        let message = self.message();
        let body = serde_json::to_string(&ErrorBody {
            error: &message,
            minutes_until_class,
        })
        .map_err(|_| Status::InternalServerError)?;
        Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
