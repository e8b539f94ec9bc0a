use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer};
use tracing::debug;

const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";
const GOOGLE_ISSUERS: &[&str] = &["accounts.google.com", "https://accounts.google.com"];

/// Claims carried by a verified Google ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    pub email: Option<String>,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// Body of Google's userinfo endpoint for an access token.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    pub email: Option<String>,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub email_verified: bool,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub picture: Option<String>,
}

/// Identity attributes from either Google payload, in one shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

impl From<IdTokenClaims> for IdentityClaims {
    fn from(c: IdTokenClaims) -> Self {
        Self {
            subject: c.sub,
            email: c.email,
            email_verified: c.email_verified,
            name: c.name,
            picture: c.picture,
        }
    }
}

impl From<UserInfo> for IdentityClaims {
    fn from(u: UserInfo) -> Self {
        Self {
            subject: u.sub,
            email: u.email,
            email_verified: u.email_verified,
            name: u.name.or(u.given_name),
            picture: u.picture,
        }
    }
}

// Google sends `email_verified` as a JSON bool in tokens and sometimes as "true" elsewhere.
fn bool_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(d)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s.eq_ignore_ascii_case("true"),
    })
}

/// Checks Google identity assertions.
#[async_trait]
pub trait GoogleIdentity: Send + Sync {
    async fn verify_id_token(&self, id_token: &str) -> anyhow::Result<IdTokenClaims>;
    async fn fetch_user_info(&self, access_token: &str) -> anyhow::Result<UserInfo>;
}

pub struct GoogleClient {
    http: reqwest::Client,
    client_id: String,
}

impl GoogleClient {
    pub fn new(client_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build google http client")?;
        Ok(Self {
            http,
            client_id: client_id.into(),
        })
    }

    async fn signing_keys(&self) -> anyhow::Result<JwkSet> {
        self.http
            .get(GOOGLE_CERTS_URL)
            .send()
            .await
            .context("fetch google certs")?
            .error_for_status()
            .context("google certs rejected")?
            .json::<JwkSet>()
            .await
            .context("parse google certs")
    }
}

#[async_trait]
impl GoogleIdentity for GoogleClient {
    async fn verify_id_token(&self, id_token: &str) -> anyhow::Result<IdTokenClaims> {
        anyhow::ensure!(!self.client_id.is_empty(), "GOOGLE_CLIENT_ID is not configured");
        let header = decode_header(id_token).context("decode id token header")?;
        let kid = header.kid.context("id token has no kid")?;
        let keys = self.signing_keys().await?;
        let jwk = keys.find(&kid).with_context(|| format!("no google key {kid}"))?;
        let key = DecodingKey::from_jwk(jwk).context("build decoding key")?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(std::slice::from_ref(&self.client_id));
        validation.set_issuer(GOOGLE_ISSUERS);
        let data = decode::<IdTokenClaims>(id_token, &key, &validation).context("verify id token")?;
        debug!(sub = %data.claims.sub, "google id token verified");
        Ok(data.claims)
    }

    async fn fetch_user_info(&self, access_token: &str) -> anyhow::Result<UserInfo> {
        let info = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .context("userinfo request")?
            .error_for_status()
            .context("userinfo rejected")?
            .json::<UserInfo>()
            .await
            .context("parse userinfo")?;
        debug!(sub = %info.sub, "google userinfo fetched");
        Ok(info)
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Maps token strings to canned claims; anything else is rejected.
    #[derive(Default)]
    pub struct FakeGoogle {
        pub id_tokens: Mutex<HashMap<String, IdTokenClaims>>,
        pub access_tokens: Mutex<HashMap<String, UserInfo>>,
    }

    impl FakeGoogle {
        pub fn with_id_token(&self, token: &str, email: &str, verified: bool) {
            self.id_tokens.lock().unwrap().insert(
                token.to_string(),
                IdTokenClaims {
                    sub: format!("sub-{email}"),
                    email: Some(email.to_string()),
                    email_verified: verified,
                    name: Some("Google User".into()),
                    picture: Some("https://lh3.googleusercontent.com/a/pic".into()),
                },
            );
        }

        pub fn with_access_token(&self, token: &str, email: &str, verified: bool) {
            self.access_tokens.lock().unwrap().insert(
                token.to_string(),
                UserInfo {
                    sub: format!("sub-{email}"),
                    email: Some(email.to_string()),
                    email_verified: verified,
                    name: None,
                    given_name: Some("Given".into()),
                    picture: None,
                },
            );
        }
    }

    #[async_trait]
    impl GoogleIdentity for FakeGoogle {
        async fn verify_id_token(&self, id_token: &str) -> anyhow::Result<IdTokenClaims> {
            self.id_tokens
                .lock()
                .unwrap()
                .get(id_token)
                .cloned()
                .context("signature mismatch")
        }

        async fn fetch_user_info(&self, access_token: &str) -> anyhow::Result<UserInfo> {
            self.access_tokens
                .lock()
                .unwrap()
                .get(access_token)
                .cloned()
                .context("401 from userinfo")
        }
    }
}
