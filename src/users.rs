use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

pub const SESSION_TTL_HOURS: i64 = 24;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A live session. `token` is only populated right after creation; the store
/// keeps a SHA-256 digest of it.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("User already exists")]
    AlreadyInitialized,
    #[error("No user found. Please initialize the system first.")]
    NotInitialized,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("{0}")]
    Store(String),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Store(err.to_string())
    }
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token_hash)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn hash_password(password: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| e.to_string())
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| e.to_string())?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    pub async fn is_initialized(&self) -> Result<bool, String> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let count = row.try_get::<i64, _>("count").map_err(|e| e.to_string())?;
        Ok(count > 0)
    }

    /// Creates the single account. Fails once any user exists.
    pub async fn initialize_user(&self, password: &str) -> Result<User, AuthError> {
        let id = uuid::Uuid::new_v4().to_string();
        let password_hash = Self::hash_password(password).map_err(AuthError::Store)?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"INSERT INTO users (id, password_hash, created_at)
               SELECT ?, ?, ? WHERE NOT EXISTS (SELECT 1 FROM users)"#,
        )
        .bind(&id)
        .bind(&password_hash)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::AlreadyInitialized);
        }

        Ok(User {
            id,
            password_hash,
            created_at: now,
        })
    }

    pub async fn get_user(&self) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, password_hash, created_at FROM users ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.map(|row| row_to_user(&row)).transpose()
    }

    /// Checks `password` against the single account and returns its id.
    pub async fn authenticate(&self, password: &str) -> Result<String, AuthError> {
        let user = self
            .get_user()
            .await
            .map_err(AuthError::Store)?
            .ok_or(AuthError::NotInitialized)?;
        let valid =
            Self::verify_password(password, &user.password_hash).map_err(AuthError::Store)?;
        if !valid {
            return Err(AuthError::InvalidPassword);
        }
        Ok(user.id)
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::hours(SESSION_TTL_HOURS);

        sqlx::query(
            r#"INSERT INTO sessions (id, user_id, token_hash, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(hash_token(&token))
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Session {
            id,
            user_id: user_id.to_string(),
            token,
            created_at: now,
            expires_at,
        })
    }

    /// Returns the session for `token` if it exists and has not expired.
    /// Expired rows are removed on sight.
    pub async fn validate_session(&self, token: &str) -> Result<Option<Session>, String> {
        if token.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT id, user_id, created_at, expires_at FROM sessions WHERE token_hash = ?",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at = parse_ts(
            &row.try_get::<String, _>("expires_at")
                .map_err(|e| e.to_string())?,
        )?;
        if expires_at <= Utc::now() {
            self.delete_session(token).await?;
            return Ok(None);
        }

        Ok(Some(Session {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
            token: String::new(),
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(|e| e.to_string())?,
            )?,
            expires_at,
        }))
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(hash_token(token))
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64, String> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        password_hash: row.try_get("password_hash").map_err(|e| e.to_string())?,
        created_at: parse_ts(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}
