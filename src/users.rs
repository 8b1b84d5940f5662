use rand::Rng;
use rocket::serde::json::{json, Json, Value};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::db::{with_read_retry, DbPool};
use crate::error::{SbError, SbResult};
use crate::SbApiToken;

pub type UserId = i64;

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Client,
    Admin,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(skip)]
    api_token: SbApiToken,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.random_range(0..charset.len());
            charset.chars().nth(idx).unwrap()
        })
        .collect()
}

/// Resolve the caller's identity from the opaque token. The ledger and the
/// admin routes trust what comes out of here, they never re-derive identity.
pub async fn load_user(token: &SbApiToken, db: &State<DbPool>) -> SbResult<UserRecord> {
    let pool = &db.0;
    let user = with_read_retry(|| async {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE api_token=?")
            .bind(&token.0)
            .fetch_one(pool)
            .await
    })
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => SbError::Forbidden("Invalid API token".to_string()),
        e => e.into(),
    })?;
    Ok(user)
}

pub fn require_admin(user: &UserRecord) -> SbResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(SbError::Forbidden("Administrator role required".to_string()))
    }
}

#[get("/api/users/me")]
async fn get_me(token: SbApiToken, db: &State<DbPool>) -> SbResult<Json<UserRecord>> {
    let user = load_user(&token, db).await?;
    Ok(Json(user))
}

#[derive(Deserialize, Debug)]
struct PostedProfile {
    name: String,
}

#[put("/api/users/me", data = "<posted>")]
async fn put_me(token: SbApiToken, posted: Json<PostedProfile>, db: &State<DbPool>) -> SbResult<Json<UserRecord>> {
    let user = load_user(&token, db).await?;
    if posted.name.trim().is_empty() {
        return Err(SbError::Validation("Name must not be empty".to_string()));
    }
    sqlx::query("UPDATE users SET name=? WHERE id=?")
        .bind(posted.name.trim())
        .bind(user.id)
        .execute(&db.0)
        .await?;
    let user = load_user(&token, db).await?;
    info!("Profile updated, user id: {}", user.id);
    Ok(Json(user))
}

#[get("/api/users")]
async fn get_users(token: SbApiToken, db: &State<DbPool>) -> SbResult<Json<Vec<UserRecord>>> {
    let user = load_user(&token, db).await?;
    require_admin(&user)?;
    let pool = &db.0;
    let users = with_read_retry(|| async {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users ORDER BY name")
            .fetch_all(pool)
            .await
    })
    .await?;
    Ok(Json(users))
}

#[derive(Deserialize, Debug)]
struct PostedUser {
    name: String,
    email: String,
    role: Option<Role>,
}

#[derive(Serialize, Debug)]
struct CreatedUser {
    #[serde(flatten)]
    user: UserRecord,
    api_token: String,
}

#[post("/api/users", data = "<posted>")]
async fn post_user(token: SbApiToken, posted: Json<PostedUser>, db: &State<DbPool>) -> SbResult<Json<CreatedUser>> {
    let caller = load_user(&token, db).await?;
    require_admin(&caller)?;
    if posted.name.trim().is_empty() || !posted.email.contains('@') {
        return Err(SbError::Validation("Name and a valid email are required".to_string()));
    }
    let api_token = generate_random_string(16);
    let role = posted.role.unwrap_or(Role::Client);
    let row: Result<(i64,), sqlx::Error> =
        sqlx::query_as("INSERT INTO users (name, email, role, api_token) VALUES (?, ?, ?, ?) RETURNING id")
            .bind(posted.name.trim())
            .bind(&posted.email)
            .bind(role)
            .bind(&api_token)
            .fetch_one(&db.0)
            .await;
    let (id,) = row.map_err(|e| match &e {
        sqlx::Error::Database(dberr) if dberr.is_unique_violation() => {
            SbError::Validation("Email already registered".to_string())
        }
        _ => SbError::from(e),
    })?;
    info!("User created, id: {id}, email: {}", posted.email);
    let user = load_user(&SbApiToken(api_token.clone()), db).await?;
    Ok(Json(CreatedUser { user, api_token }))
}

#[derive(Deserialize, Debug)]
struct PostedRole {
    role: Role,
}

#[put("/api/users/<user_id>/role", data = "<posted>")]
async fn put_user_role(user_id: UserId, token: SbApiToken, posted: Json<PostedRole>, db: &State<DbPool>) -> SbResult<Value> {
    let caller = load_user(&token, db).await?;
    require_admin(&caller)?;
    let res = sqlx::query("UPDATE users SET role=? WHERE id=?")
        .bind(posted.role)
        .bind(user_id)
        .execute(&db.0)
        .await?;
    if res.rows_affected() == 0 {
        return Err(SbError::NotFound("User not found".to_string()));
    }
    info!("User role updated, id: {user_id}, role: {:?}", posted.role);
    Ok(json!({"message": "User role updated successfully"}))
}

/// Seed accounts for local development and the test suite.
#[get("/demo/seed")]
async fn get_create_demo_data(db: &State<DbPool>) -> SbResult<Value> {
    for (name, email, role, api_token) in [
        ("Studio Admin", "admin@studio.test", Role::Admin, "sidopomaku"),
        ("Xenia Client", "xenia@studio.test", Role::Client, "kanyvelori"),
        ("Yarrow Client", "yarrow@studio.test", Role::Client, "betuzaweno"),
    ] {
        sqlx::query("INSERT OR IGNORE INTO users (name, email, role, api_token) VALUES (?, ?, ?, ?)")
            .bind(name)
            .bind(email)
            .bind(role)
            .bind(api_token)
            .execute(&db.0)
            .await?;
    }
    info!("Demo users created");
    Ok(json!({"message": "Demo data created"}))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_me,
            put_me,
            get_users,
            post_user,
            put_user_role,
            get_create_demo_data,
        ])
}
