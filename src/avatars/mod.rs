use crate::state::AppState;
use axum::Router;

pub mod handlers;
mod services;

pub use services::{validate_avatar, AvatarFile, AvatarUploader, UploadError};

#[cfg(test)]
pub use services::testing;

pub fn router() -> Router<AppState> {
    handlers::avatar_routes()
}
