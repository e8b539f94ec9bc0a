use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::GoogleConfig;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Metadata the provider returns for an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: Option<String>,
    pub web_view_link: Option<String>,
}

/// Object storage for avatars. Every call after `authorize` takes the
/// bearer token it returned.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn authorize(&self) -> anyhow::Result<String>;
    async fn find_folder(&self, token: &str, name: &str) -> anyhow::Result<Option<String>>;
    async fn create_folder(&self, token: &str, name: &str) -> anyhow::Result<String>;
    async fn upload_file(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        body: Bytes,
        content_type: &str,
    ) -> anyhow::Result<StoredFile>;
    async fn grant_public_read(&self, token: &str, file_id: &str) -> anyhow::Result<()>;
}

/// Direct-view URL for a publicly readable Drive file.
pub fn public_view_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=view&id={file_id}")
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

/// Google Drive v3 over REST, authenticated with a service-account key file.
pub struct DriveStorage {
    http: reqwest::Client,
    service_account_file: String,
    parent_folder_id: Option<String>,
}

impl DriveStorage {
    pub fn new(config: &GoogleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build drive http client")?;
        Ok(Self {
            http,
            service_account_file: config.service_account_file.clone(),
            parent_folder_id: config.drive_parent_folder_id.clone(),
        })
    }

    async fn load_key(&self) -> anyhow::Result<ServiceAccountKey> {
        let raw = tokio::fs::read_to_string(&self.service_account_file)
            .await
            .with_context(|| format!("read service account file {}", self.service_account_file))?;
        serde_json::from_str(&raw).context("parse service account file")
    }

    fn folder_query(&self, name: &str) -> String {
        let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
        let mut q =
            format!("name = '{escaped}' and mimeType = '{FOLDER_MIME}' and trashed = false");
        if let Some(parent) = &self.parent_folder_id {
            q.push_str(&format!(" and '{parent}' in parents"));
        }
        q
    }
}

/// Builds a `multipart/related` body: JSON metadata part followed by the media part.
fn related_body(
    boundary: &str,
    metadata: &serde_json::Value,
    body: &[u8],
    content_type: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 512);
    out.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{boundary}\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    out.extend_from_slice(body);
    out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    out
}

#[async_trait]
impl StorageClient for DriveStorage {
    async fn authorize(&self) -> anyhow::Result<String> {
        let key = self.load_key().await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: DRIVE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key =
            EncodingKey::from_rsa_pem(key.private_key.as_bytes()).context("parse private key")?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .context("sign service account assertion")?;

        let res = self
            .http
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("token request")?
            .error_for_status()
            .context("token request rejected")?;
        let token: AccessTokenResponse = res.json().await.context("parse token response")?;
        debug!(client_email = %key.client_email, "drive access token issued");
        Ok(token.access_token)
    }

    async fn find_folder(&self, token: &str, name: &str) -> anyhow::Result<Option<String>> {
        let list: FileList = self
            .http
            .get(DRIVE_FILES_URL)
            .bearer_auth(token)
            .query(&[
                ("q", self.folder_query(name).as_str()),
                ("fields", "files(id, name)"),
                ("spaces", "drive"),
            ])
            .send()
            .await
            .context("list folders")?
            .error_for_status()
            .context("list folders rejected")?
            .json()
            .await
            .context("parse folder list")?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, token: &str, name: &str) -> anyhow::Result<String> {
        let mut metadata = serde_json::json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = &self.parent_folder_id {
            metadata["parents"] = serde_json::json!([parent]);
        }
        let created: FileRef = self
            .http
            .post(DRIVE_FILES_URL)
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&metadata)
            .send()
            .await
            .context("create folder")?
            .error_for_status()
            .context("create folder rejected")?
            .json()
            .await
            .context("parse created folder")?;
        debug!(folder_id = %created.id, name, "drive folder created");
        Ok(created.id)
    }

    async fn upload_file(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        body: Bytes,
        content_type: &str,
    ) -> anyhow::Result<StoredFile> {
        let boundary = format!("avatar-{}", uuid::Uuid::new_v4().simple());
        let metadata = serde_json::json!({ "name": name, "parents": [folder_id] });
        let payload = related_body(&boundary, &metadata, &body, content_type);

        let file: StoredFile = self
            .http
            .post(DRIVE_UPLOAD_URL)
            .bearer_auth(token)
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id, name, mimeType, size, webViewLink"),
            ])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(payload)
            .send()
            .await
            .context("upload file")?
            .error_for_status()
            .context("upload file rejected")?
            .json()
            .await
            .context("parse uploaded file")?;
        Ok(file)
    }

    async fn grant_public_read(&self, token: &str, file_id: &str) -> anyhow::Result<()> {
        self.http
            .post(format!("{DRIVE_FILES_URL}/{file_id}/permissions"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "role": "reader",
                "type": "anyone",
                "allowFileDiscovery": false,
            }))
            .send()
            .await
            .context("create permission")?
            .error_for_status()
            .context("create permission rejected")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_body_wraps_metadata_and_media() {
        let meta = serde_json::json!({"name": "a.png"});
        let body = related_body("b", &meta, b"PNGDATA", "image/png");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--b\r\nContent-Type: application/json"));
        assert!(text.contains("{\"name\":\"a.png\"}"));
        assert!(text.contains("Content-Type: image/png\r\n\r\nPNGDATA\r\n--b--"));
    }

    #[test]
    fn folder_query_escapes_quotes_and_scopes_parent() {
        let storage = DriveStorage::new(&GoogleConfig {
            client_id: String::new(),
            service_account_file: "missing.json".into(),
            drive_folder_name: "avatars".into(),
            drive_parent_folder_id: Some("root123".into()),
        })
        .unwrap();
        let q = storage.folder_query("it's");
        assert!(q.starts_with("name = 'it\\'s'"));
        assert!(q.ends_with("and 'root123' in parents"));
    }

    #[tokio::test]
    async fn authorize_fails_cleanly_without_key_file() {
        let storage = DriveStorage::new(&GoogleConfig {
            client_id: String::new(),
            service_account_file: "/nonexistent/service-account.json".into(),
            drive_folder_name: "avatars".into(),
            drive_parent_folder_id: None,
        })
        .unwrap();
        let err = storage.authorize().await.unwrap_err();
        assert!(format!("{err:#}").contains("service account file"));
    }

    #[test]
    fn public_url_embeds_file_id() {
        assert_eq!(
            public_view_url("abc"),
            "https://drive.google.com/uc?export=view&id=abc"
        );
    }
}
