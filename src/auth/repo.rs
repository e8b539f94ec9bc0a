use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{EmailVerificationToken, NewUser, User, DEFAULT_ROLE};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
            _ => StoreError::Backend(anyhow::Error::new(e)),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for users, verification tokens and session tokens.
/// Email lookups are case-insensitive.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn create_user(&self, new: NewUser) -> StoreResult<User>;
    async fn set_password(&self, id: Uuid, password_hash: &str) -> StoreResult<()>;
    async fn mark_verified(&self, id: Uuid) -> StoreResult<()>;
    async fn set_avatar(&self, id: Uuid, avatar: &str) -> StoreResult<User>;
    async fn record_login(&self, id: Uuid) -> StoreResult<()>;

    async fn create_verification_token(
        &self,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> StoreResult<EmailVerificationToken>;
    async fn find_verification_token(&self, token: Uuid)
        -> StoreResult<Option<EmailVerificationToken>>;
    async fn delete_verification_token(&self, id: Uuid) -> StoreResult<()>;
    async fn delete_verification_tokens_for(&self, user_id: Uuid) -> StoreResult<u64>;

    /// Returns the user's existing session key, or stores `candidate` if none exists.
    async fn session_key_for(&self, user_id: Uuid, candidate: &str) -> StoreResult<String>;
    async fn user_for_session(&self, key: &str) -> StoreResult<Option<User>>;
    async fn delete_session(&self, key: &str) -> StoreResult<bool>;
}

const USER_COLUMNS: &str = "id, email, name, phone, password_hash, role, is_verified, is_active, \
                            avatar, last_login, created_at, updated_at";

#[derive(Clone)]
pub struct PgAccountStore {
    db: PgPool,
}

impl PgAccountStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create_user(&self, new: NewUser) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, name, phone, password_hash, role, is_verified, avatar)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.email.trim())
        .bind(&new.name)
        .bind(&new.phone)
        .bind(&new.password_hash)
        .bind(DEFAULT_ROLE)
        .bind(new.is_verified)
        .bind(&new.avatar)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn set_password(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await
            .context("update password")?;
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE users SET is_verified = TRUE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("mark user verified")?;
        Ok(())
    }

    async fn set_avatar(&self, id: Uuid, avatar: &str) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET avatar = $2, updated_at = now() \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(avatar)
        .fetch_one(&self.db)
        .await
        .context("update avatar")?;
        Ok(user)
    }

    async fn record_login(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE users SET last_login = now() WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("record login")?;
        Ok(())
    }

    async fn create_verification_token(
        &self,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> StoreResult<EmailVerificationToken> {
        let row = sqlx::query_as::<_, EmailVerificationToken>(
            r#"
            INSERT INTO email_verification_tokens (id, user_id, token, expires_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, token, expires_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(Uuid::new_v4())
        .bind(expires_at)
        .fetch_one(&self.db)
        .await
        .context("insert verification token")?;
        Ok(row)
    }

    async fn find_verification_token(
        &self,
        token: Uuid,
    ) -> StoreResult<Option<EmailVerificationToken>> {
        let row = sqlx::query_as::<_, EmailVerificationToken>(
            r#"
            SELECT id, user_id, token, expires_at, created_at
              FROM email_verification_tokens
             WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await
        .context("find verification token")?;
        Ok(row)
    }

    async fn delete_verification_token(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM email_verification_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("delete verification token")?;
        Ok(())
    }

    async fn delete_verification_tokens_for(&self, user_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM email_verification_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await
            .context("delete verification tokens for user")?;
        Ok(res.rows_affected())
    }

    async fn session_key_for(&self, user_id: Uuid, candidate: &str) -> StoreResult<String> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query(
            r#"
            INSERT INTO session_tokens (key, user_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(candidate)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .context("insert session token")?;
        let (key,): (String,) = sqlx::query_as("SELECT key FROM session_tokens WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .context("select session token")?;
        tx.commit().await.context("commit tx")?;
        Ok(key)
    }

    async fn user_for_session(&self, key: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.email, u.name, u.phone, u.password_hash, u.role, u.is_verified,
                   u.is_active, u.avatar, u.last_login, u.created_at, u.updated_at
              FROM session_tokens s
              JOIN users u ON u.id = s.user_id
             WHERE s.key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .context("find user by session")?;
        Ok(user)
    }

    async fn delete_session(&self, key: &str) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM session_tokens WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await
            .context("delete session token")?;
        Ok(res.rows_affected() > 0)
    }
}
