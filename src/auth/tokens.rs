use std::time::Duration;

use anyhow::Context;
use axum::extract::FromRef;
use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::auth::claims::{ResetClaims, RESET_AUDIENCE};
use crate::auth::repo_types::User;
use crate::config::TokenConfig;
use crate::state::AppState;

/// Signs and checks password-reset tokens.
///
/// The signing key mixes the server secret with the user's current password
/// hash and last login, so a token stops validating as soon as the password
/// changes or the user logs in again. Nothing is stored.
#[derive(Clone)]
pub struct ResetKeys {
    secret: String,
    issuer: String,
    ttl: Duration,
}

impl FromRef<AppState> for ResetKeys {
    fn from_ref(state: &AppState) -> Self {
        let TokenConfig {
            secret,
            issuer,
            password_reset_ttl_secs,
            ..
        } = state.config.tokens.clone();
        Self::new(secret, issuer, Duration::from_secs(password_reset_ttl_secs.max(0) as u64))
    }
}

impl ResetKeys {
    pub fn new(secret: String, issuer: String, ttl: Duration) -> Self {
        Self { secret, issuer, ttl }
    }

    fn key_material(&self, user: &User) -> Vec<u8> {
        let last_login = user
            .last_login
            .map(|t| t.unix_timestamp().to_string())
            .unwrap_or_default();
        format!(
            "{}:{}:{}:{}",
            self.secret,
            user.id,
            user.password_hash.as_deref().unwrap_or_default(),
            last_login
        )
        .into_bytes()
    }

    pub fn make_token(&self, user: &User) -> anyhow::Result<String> {
        self.make_token_at(user, OffsetDateTime::now_utc())
    }

    fn make_token_at(&self, user: &User, now: OffsetDateTime) -> anyhow::Result<String> {
        let ttl = i64::try_from(self.ttl.as_secs()).context("reset ttl out of range")?;
        let exp = now
            .checked_add(TimeDuration::seconds(ttl))
            .context("reset ttl out of range")?;
        let claims = ResetClaims {
            sub: user.id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: RESET_AUDIENCE.to_string(),
        };
        let key = EncodingKey::from_secret(&self.key_material(user));
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key)?;
        debug!(user_id = %user.id, "password reset token signed");
        Ok(token)
    }

    /// True only for an unexpired token signed for this user's current state.
    pub fn check_token(&self, user: &User, token: &str) -> bool {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(&[RESET_AUDIENCE]);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let key = DecodingKey::from_secret(&self.key_material(user));
        match decode::<ResetClaims>(token, &key, &validation) {
            Ok(data) => data.claims.sub == user.id,
            Err(e) => {
                debug!(user_id = %user.id, error = %e, "password reset token rejected");
                false
            }
        }
    }
}

/// URL-safe base64 of the user id, paired with the reset token in email links.
pub fn encode_uid(id: Uuid) -> String {
    Base64UrlUnpadded::encode_string(id.to_string().as_bytes())
}

pub fn decode_uid(uid: &str) -> Option<Uuid> {
    let bytes = Base64UrlUnpadded::decode_vec(uid.trim()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Uuid::parse_str(&text).ok()
}

/// 40 hex characters of OS randomness, used as a bearer session key.
pub fn new_session_key() -> String {
    let mut bytes = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;

    fn keys(ttl_secs: u64) -> ResetKeys {
        ResetKeys::new("test-secret".into(), "test".into(), Duration::from_secs(ttl_secs))
    }

    fn user() -> User {
        let now = OffsetDateTime::now_utc();
        User {
            id: Uuid::new_v4(),
            email: "reset@example.com".into(),
            name: "Reset".into(),
            phone: None,
            password_hash: Some(hash_password("OldPassw0rd!").unwrap()),
            role: "user".into(),
            is_verified: true,
            is_active: true,
            avatar: None,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn token_validates_for_issuing_user() {
        let keys = keys(3600);
        let u = user();
        let token = keys.make_token(&u).unwrap();
        assert!(keys.check_token(&u, &token));
    }

    #[test]
    fn token_is_bound_to_user_and_password() {
        let keys = keys(3600);
        let u = user();
        let token = keys.make_token(&u).unwrap();

        let other = user();
        assert!(!keys.check_token(&other, &token));

        let mut changed = u.clone();
        changed.password_hash = Some(hash_password("NewPassw0rd!").unwrap());
        assert!(!keys.check_token(&changed, &token));

        let mut logged_in = u.clone();
        logged_in.last_login = Some(OffsetDateTime::now_utc());
        assert!(!keys.check_token(&logged_in, &token));
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = keys(3600);
        let u = user();
        let issued = OffsetDateTime::now_utc() - TimeDuration::hours(2);
        let token = keys.make_token_at(&u, issued).unwrap();
        assert!(!keys.check_token(&u, &token));
    }

    #[test]
    fn unrepresentable_expiry_is_an_error() {
        assert!(keys(u64::MAX).make_token(&user()).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(!keys(3600).check_token(&user(), "not-a-jwt"));
    }

    #[test]
    fn uid_roundtrip_and_garbage() {
        let id = Uuid::new_v4();
        assert_eq!(decode_uid(&encode_uid(id)), Some(id));
        assert_eq!(decode_uid("%%%"), None);
        assert_eq!(decode_uid(&Base64UrlUnpadded::encode_string(b"42")), None);
    }

    #[test]
    fn session_keys_are_forty_hex_chars() {
        let a = new_session_key();
        let b = new_session_key();
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
