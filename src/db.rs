use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::migrate::Migrator;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// macro to decode some type from SQL text
#[macro_export]
macro_rules! impl_sqlx_text_type_and_decode {
    ($type:ident) => {
        impl<DB: sqlx::Database> sqlx::Type<DB> for $type
        where str: sqlx::Type<DB>
        {
            fn type_info() -> <DB as sqlx::Database>::TypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<DB>>::type_info()
            }
        }

        impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for $type
        where &'r str: sqlx::Decode<'r, DB>
        {
            fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<DB>>::decode(value)?;
                Ok(Self(value.to_string()))
            }
        }
    };
}

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations"); // Auto-discovers migrations in `db/migrations/`

pub struct DbPool(pub SqlitePool);

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
}

/// Retry an idempotent read once after a short delay when storage is
/// temporarily unavailable. Mutating statements must never go through
/// this: a retried but already-applied write could double-book.
pub(crate) async fn with_read_retry<T, F, Fut>(op: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match op().await {
        Err(err) if is_transient_error(&err) => {
            warn!("Transient storage error, retrying read once: {err}");
            rocket::tokio::time::sleep(Duration::from_secs(1)).await;
            op().await
        }
        other => other,
    }
}

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite | Kind::Liftoff,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let database_url = if cfg!(test) {
            "sqlite::memory:".to_string()
        } else {
            let figment = rocket.figment();
            let database_url = figment.extract_inner::<String>("database_url").expect("database_url");
            if database_url.starts_with("sqlite://") {
                let db_path = database_url.trim_start_matches("sqlite://");
                if !Path::new(db_path).exists() {
                    std::fs::File::create(db_path).expect("Failed to create SQLite database file");
                }
            }
            database_url
        };

        info!("Opening database: {database_url}");
        let opts = SqliteConnectOptions::from_str(&database_url).expect("valid sqlite url")
            .journal_mode(SqliteJournalMode::Wal) // use WAL for better concurrency
            .pragma("foreign_keys", "true") // reject writes that would orphan a row
            ;
        // a single connection in tests, every pooled connection would
        // otherwise open its own empty in-memory database
        let max_connections = if cfg!(test) { 1 } else { 5 };
        let pool = match SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        Ok(rocket.manage(DbPool(pool)))
    }
}
