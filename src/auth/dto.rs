use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::User;

/// Registration fields, collected from the multipart form.
#[derive(Debug, Default)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    pub phone: Option<String>,
}

/// Request body for login. `username` is accepted for old clients and ignored.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    pub password: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GoogleLoginRequest {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: String,
    pub is_verified: bool,
    pub avatar: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&User> for PublicUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            phone: u.phone.clone(),
            role: u.role.clone(),
            is_verified: u.is_verified,
            avatar: u.avatar.clone(),
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// Returned after login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: PublicUser,
}

/// Returned after Google login; `created` is true when the account was just made.
#[derive(Debug, Serialize)]
pub struct GoogleAuthResponse {
    pub token: String,
    pub user: PublicUser,
    pub created: bool,
}
