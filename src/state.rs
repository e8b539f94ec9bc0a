use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::auth::google::{GoogleClient, GoogleIdentity};
use crate::auth::repo::{AccountStore, PgAccountStore};
use crate::avatars::AvatarUploader;
use crate::config::AppConfig;
use crate::mail::{build_mailer, Mailer};
use crate::storage::{DriveStorage, StorageClient};

/// Everything a handler needs, built once at startup and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn AccountStore>,
    pub mailer: Arc<dyn Mailer>,
    pub google: Arc<dyn GoogleIdentity>,
    pub avatars: AvatarUploader,
}

impl AppState {
    /// Connects to the database and wires the production collaborators.
    pub async fn init() -> anyhow::Result<(Self, PgPool)> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let storage = Arc::new(DriveStorage::new(&config.google)?) as Arc<dyn StorageClient>;
        let avatars = AvatarUploader::new(storage, config.google.drive_folder_name.clone());
        report_storage(&avatars).await;
        let google = Arc::new(GoogleClient::new(config.google.client_id.clone())?);
        let mailer = build_mailer(&config.mail)?;
        let store = Arc::new(PgAccountStore::new(db.clone()));

        let state = Self::from_parts(config, store, mailer, google, avatars);
        Ok((state, db))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn AccountStore>,
        mailer: Arc<dyn Mailer>,
        google: Arc<dyn GoogleIdentity>,
        avatars: AvatarUploader,
    ) -> Self {
        Self {
            config,
            store,
            mailer,
            google,
            avatars,
        }
    }
}

/// Startup diagnostic for the Drive credentials. Failures are logged, not fatal,
/// so the rest of the service can run without avatar storage.
async fn report_storage(avatars: &AvatarUploader) {
    match avatars.check_connection().await {
        Ok(Some(folder_id)) => {
            info!(folder = %avatars.folder_name(), %folder_id, "avatar storage reachable")
        }
        Ok(None) => warn!(
            folder = %avatars.folder_name(),
            "avatar storage reachable; folder will be created on first upload"
        ),
        Err(e) => warn!(error = %e, "avatar storage check failed"),
    }
}
