use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::auth::repo::StoreError;
use crate::avatars::UploadError;
use crate::response::{Envelope, ErrorDetail};

/// Every failure a handler can report. Account-existence details are
/// flattened into the generic variants before they get here.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<ErrorDetail>),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account disabled")]
    AccountDisabled,
    #[error("missing or invalid session token")]
    Unauthenticated,
    #[error("user not found")]
    UserNotFound,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("email already verified")]
    AlreadyVerified,
    #[error("invalid google token")]
    InvalidGoogleToken,
    #[error("google email not verified")]
    EmailNotVerified,
    #[error("mail delivery failed: {0:#}")]
    MailDelivery(anyhow::Error),
    #[error("avatar upload failed: {0}")]
    AvatarUpload(UploadError),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![ErrorDetail::field(field, message)])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_)
            | ApiError::InvalidToken
            | ApiError::TokenExpired
            | ApiError::AlreadyVerified
            | ApiError::EmailNotVerified => StatusCode::BAD_REQUEST,
            ApiError::InvalidCredentials
            | ApiError::Unauthenticated
            | ApiError::InvalidGoogleToken => StatusCode::UNAUTHORIZED,
            ApiError::AccountDisabled => StatusCode::FORBIDDEN,
            ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::MailDelivery(_) | ApiError::AvatarUpload(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "Validation failed.",
            ApiError::InvalidCredentials => "Invalid credentials.",
            ApiError::AccountDisabled => "User is disabled.",
            ApiError::Unauthenticated => "Authentication credentials were not provided.",
            ApiError::UserNotFound => "No user with this email exists.",
            ApiError::InvalidToken => "Invalid token.",
            ApiError::TokenExpired => "Token has expired.",
            ApiError::AlreadyVerified => "Email is already verified.",
            ApiError::InvalidGoogleToken => "Invalid Google token.",
            ApiError::EmailNotVerified => "Google email is not verified.",
            ApiError::MailDelivery(_) => "Failed to send verification email.",
            ApiError::AvatarUpload(_) => "Avatar upload failed.",
            ApiError::Internal(_) => "Internal server error.",
        }
    }

    fn details(&self) -> Vec<ErrorDetail> {
        match self {
            ApiError::Validation(errors) => errors.clone(),
            ApiError::AvatarUpload(e) => vec![ErrorDetail::field("avatar", e.public_reason())],
            ApiError::MailDelivery(_) => {
                vec![ErrorDetail::general("The mail server rejected the message.")]
            }
            ApiError::Internal(_) => vec![ErrorDetail::general("An unexpected error occurred.")],
            _ => Vec::new(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::Error::new(e))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => {
                ApiError::field("email", "A user with this email already exists.")
            }
            StoreError::Backend(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Envelope::failure(self.public_message(), self.details());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn internal_error_does_not_leak_detail() {
        let err = ApiError::Internal(anyhow::anyhow!("password authentication failed for user"));
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("password authentication"));
        assert!(text.contains("\"success\":false"));
    }

    #[test]
    fn invalid_credentials_is_unauthorized() {
        assert_eq!(ApiError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidCredentials.public_message(), "Invalid credentials.");
    }
}
