use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::{debug, warn};

use crate::auth::repo_types::User;
use crate::error::ApiError;
use crate::state::AppState;

/// The user behind an `Authorization: Bearer <key>` (or `Token <key>`) header.
pub struct AuthUser {
    pub user: User,
    pub key: String,
}

fn session_key(header: &str) -> Option<&str> {
    let (scheme, key) = header.trim().split_once(' ')?;
    let key = key.trim();
    let known = scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token");
    (known && !key.is_empty()).then_some(key)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;

        let key = session_key(header).ok_or_else(|| {
            debug!("unsupported authorization scheme");
            ApiError::Unauthenticated
        })?;

        let user = state
            .store
            .user_for_session(key)
            .await?
            .ok_or(ApiError::Unauthenticated)?;

        if !user.is_active {
            warn!(user_id = %user.id, "session used by disabled account");
            return Err(ApiError::AccountDisabled);
        }

        Ok(AuthUser {
            user,
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bearer_and_token_schemes() {
        assert_eq!(session_key("Bearer abc123"), Some("abc123"));
        assert_eq!(session_key("bearer abc123"), Some("abc123"));
        assert_eq!(session_key("Token abc123"), Some("abc123"));
        assert_eq!(session_key("Basic abc123"), None);
        assert_eq!(session_key("Bearer "), None);
        assert_eq!(session_key("abc123"), None);
    }
}
