use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::{public_view_url, StorageClient, StoredFile};

pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;
pub const ALLOWED_AVATAR_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// An image received from a client, before validation.
pub struct AvatarFile {
    pub body: Bytes,
    pub content_type: String,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadedAvatar {
    pub url: String,
    pub file: StoredFile,
}

/// Why an avatar was not stored. The first three are client mistakes and are
/// detected before any network call.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported content type {0:?}")]
    UnsupportedType(String),
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("file is empty")]
    Empty,
    #[error("storage authentication failed: {0:#}")]
    Auth(anyhow::Error),
    #[error("folder lookup failed: {0:#}")]
    Folder(anyhow::Error),
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("permission grant failed: {0:#}")]
    Permission(anyhow::Error),
}

impl UploadError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            UploadError::UnsupportedType(_) | UploadError::TooLarge { .. } | UploadError::Empty
        )
    }

    /// Client-facing reason; provider details stay in the logs.
    pub fn public_reason(&self) -> String {
        match self {
            UploadError::UnsupportedType(_) => {
                "Unsupported image type. Allowed: JPEG, PNG, GIF, WEBP.".to_string()
            }
            UploadError::TooLarge { max, .. } => {
                format!("Image is too large. Maximum size is {} MB.", max / (1024 * 1024))
            }
            UploadError::Empty => "The submitted file is empty.".to_string(),
            UploadError::Auth(_) => "Could not authenticate with the storage provider.".to_string(),
            UploadError::Folder(_) => "Could not prepare the storage folder.".to_string(),
            UploadError::Upload(_) => "Could not store the image.".to_string(),
            UploadError::Permission(_) => "Could not publish the image.".to_string(),
        }
    }
}

pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

pub fn validate_avatar(file: &AvatarFile) -> Result<(), UploadError> {
    let ct = file.content_type.to_ascii_lowercase();
    if !ALLOWED_AVATAR_TYPES.contains(&ct.as_str()) {
        return Err(UploadError::UnsupportedType(file.content_type.clone()));
    }
    if file.body.is_empty() {
        return Err(UploadError::Empty);
    }
    if file.body.len() > MAX_AVATAR_BYTES {
        return Err(UploadError::TooLarge {
            size: file.body.len(),
            max: MAX_AVATAR_BYTES,
        });
    }
    Ok(())
}

/// Validates avatars and publishes them through a [`StorageClient`].
#[derive(Clone)]
pub struct AvatarUploader {
    storage: Arc<dyn StorageClient>,
    folder_name: String,
}

impl AvatarUploader {
    pub fn new(storage: Arc<dyn StorageClient>, folder_name: impl Into<String>) -> Self {
        Self {
            storage,
            folder_name: folder_name.into(),
        }
    }

    pub async fn upload(&self, file: AvatarFile) -> Result<UploadedAvatar, UploadError> {
        validate_avatar(&file)?;

        let content_type = file.content_type.to_ascii_lowercase();
        let ext = ext_from_mime(&content_type).unwrap_or("bin");
        let name = format!("avatar_{}.{}", Uuid::new_v4().simple(), ext);

        let token = self.storage.authorize().await.map_err(UploadError::Auth)?;
        let folder_id = self.ensure_folder(&token).await?;
        let stored = self
            .storage
            .upload_file(&token, &folder_id, &name, file.body, &content_type)
            .await
            .map_err(UploadError::Upload)?;
        self.storage
            .grant_public_read(&token, &stored.id)
            .await
            .map_err(UploadError::Permission)?;

        info!(
            file_id = %stored.id,
            name = %stored.name,
            client_name = ?file.file_name,
            "avatar uploaded"
        );
        Ok(UploadedAvatar {
            url: public_view_url(&stored.id),
            file: stored,
        })
    }

    /// Authenticates and looks up the avatar folder without creating anything.
    /// Returns the folder id if it already exists.
    pub async fn check_connection(&self) -> Result<Option<String>, UploadError> {
        let token = self.storage.authorize().await.map_err(UploadError::Auth)?;
        self.storage
            .find_folder(&token, &self.folder_name)
            .await
            .map_err(UploadError::Folder)
    }

    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    async fn ensure_folder(&self, token: &str) -> Result<String, UploadError> {
        let existing = self
            .storage
            .find_folder(token, &self.folder_name)
            .await
            .map_err(UploadError::Folder)?;
        if let Some(id) = existing {
            return Ok(id);
        }
        warn!(folder = %self.folder_name, "avatar folder missing; creating it");
        self.storage
            .create_folder(token, &self.folder_name)
            .await
            .map_err(UploadError::Folder)
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Storage double that records calls. `fail_at` names the step that errors.
    #[derive(Default)]
    pub struct FakeStorage {
        pub calls: AtomicUsize,
        pub folders: Mutex<Vec<(String, String)>>,
        pub fail_at: Mutex<Option<&'static str>>,
    }

    impl FakeStorage {
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn fail_at(&self, step: &'static str) {
            *self.fail_at.lock().unwrap() = Some(step);
        }

        fn step(&self, name: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_at.lock().unwrap() == Some(name) {
                anyhow::bail!("{name} exploded");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StorageClient for FakeStorage {
        async fn authorize(&self) -> anyhow::Result<String> {
            self.step("authorize")?;
            Ok("fake-token".into())
        }

        async fn find_folder(&self, _t: &str, name: &str) -> anyhow::Result<Option<String>> {
            self.step("find_folder")?;
            let folders = self.folders.lock().unwrap();
            Ok(folders.iter().find(|(n, _)| n == name).map(|(_, id)| id.clone()))
        }

        async fn create_folder(&self, _t: &str, name: &str) -> anyhow::Result<String> {
            self.step("create_folder")?;
            let id = format!("folder-{}", Uuid::new_v4().simple());
            self.folders.lock().unwrap().push((name.to_string(), id.clone()));
            Ok(id)
        }

        async fn upload_file(
            &self,
            _t: &str,
            _folder_id: &str,
            name: &str,
            body: Bytes,
            content_type: &str,
        ) -> anyhow::Result<StoredFile> {
            self.step("upload_file")?;
            Ok(StoredFile {
                id: format!("file{}", Uuid::new_v4().simple()),
                name: name.to_string(),
                mime_type: Some(content_type.to_string()),
                size: Some(body.len().to_string()),
                web_view_link: None,
            })
        }

        async fn grant_public_read(&self, _t: &str, _file_id: &str) -> anyhow::Result<()> {
            self.step("grant_public_read")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeStorage;
    use super::*;

    fn file(len: usize, ct: &str) -> AvatarFile {
        AvatarFile {
            body: Bytes::from(vec![7u8; len]),
            content_type: ct.to_string(),
            file_name: Some("me.png".into()),
        }
    }

    #[test]
    fn test_ext_from_mime() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/jpg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/gif"), Some("gif"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("application/octet-stream"), None);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_any_network_call() {
        let storage = Arc::new(FakeStorage::default());
        let uploader = AvatarUploader::new(storage.clone(), "avatars");
        let err = uploader.upload(file(6 * 1024 * 1024, "image/png")).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { .. }));
        assert!(err.is_invalid_input());
        assert_eq!(storage.call_count(), 0);
    }

    #[tokio::test]
    async fn disallowed_type_is_rejected_before_any_network_call() {
        let storage = Arc::new(FakeStorage::default());
        let uploader = AvatarUploader::new(storage.clone(), "avatars");
        let err = uploader.upload(file(10, "image/svg+xml")).await.unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType(_)));
        assert_eq!(storage.call_count(), 0);
    }

    #[tokio::test]
    async fn four_mib_png_uploads_and_returns_view_url() {
        let storage = Arc::new(FakeStorage::default());
        let uploader = AvatarUploader::new(storage.clone(), "avatars");
        let uploaded = uploader.upload(file(4 * 1024 * 1024, "image/png")).await.unwrap();

        let url = reqwest::Url::parse(&uploaded.url).expect("well-formed url");
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("drive.google.com"));
        let id = url.query_pairs().find(|(k, _)| k == "id").map(|(_, v)| v.into_owned());
        assert_eq!(id.as_deref(), Some(uploaded.file.id.as_str()));
        assert!(uploaded.file.name.starts_with("avatar_"));
        assert!(uploaded.file.name.ends_with(".png"));
        // authorize, find, create, upload, grant
        assert_eq!(storage.call_count(), 5);
    }

    #[tokio::test]
    async fn existing_folder_is_reused() {
        let storage = Arc::new(FakeStorage::default());
        let uploader = AvatarUploader::new(storage.clone(), "avatars");
        uploader.upload(file(100, "image/jpeg")).await.unwrap();
        uploader.upload(file(100, "image/gif")).await.unwrap();
        assert_eq!(storage.folders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connection_check_reports_folder_without_creating_it() {
        let storage = Arc::new(FakeStorage::default());
        let uploader = AvatarUploader::new(storage.clone(), "avatars");

        assert_eq!(uploader.check_connection().await.unwrap(), None);
        assert!(storage.folders.lock().unwrap().is_empty());
        assert_eq!(storage.call_count(), 2);

        uploader.upload(file(100, "image/png")).await.unwrap();
        let folder_id = storage.folders.lock().unwrap()[0].1.clone();
        assert_eq!(uploader.check_connection().await.unwrap(), Some(folder_id));
    }

    #[tokio::test]
    async fn connection_check_surfaces_auth_failure() {
        let storage = Arc::new(FakeStorage::default());
        storage.fail_at("authorize");
        let uploader = AvatarUploader::new(storage.clone(), "avatars");
        assert!(matches!(uploader.check_connection().await, Err(UploadError::Auth(_))));
        assert_eq!(storage.call_count(), 1);
    }

    fn variant(e: &UploadError) -> &'static str {
        match e {
            UploadError::Auth(_) => "auth",
            UploadError::Folder(_) => "folder",
            UploadError::Upload(_) => "upload",
            UploadError::Permission(_) => "permission",
            _ => "invalid",
        }
    }

    #[tokio::test]
    async fn each_failing_step_maps_to_its_own_variant() {
        for (step, expected) in [
            ("authorize", "auth"),
            ("find_folder", "folder"),
            ("create_folder", "folder"),
            ("upload_file", "upload"),
            ("grant_public_read", "permission"),
        ] {
            let storage = Arc::new(FakeStorage::default());
            storage.fail_at(step);
            let uploader = AvatarUploader::new(storage, "avatars");
            let err = uploader.upload(file(100, "image/webp")).await.unwrap_err();
            assert_eq!(variant(&err), expected, "step {step} produced {err:?}");
            assert!(!err.is_invalid_input());
        }
    }
}
