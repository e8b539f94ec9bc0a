use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audience marking a JWT as a password-reset token.
pub const RESET_AUDIENCE: &str = "password-reset";

/// Payload of a password-reset token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetClaims {
    pub sub: Uuid,   // user ID
    pub iat: usize,  // issued at (unix timestamp)
    pub exp: usize,  // expires at (unix timestamp)
    pub iss: String, // issuer
    pub aud: String, // always RESET_AUDIENCE
}
