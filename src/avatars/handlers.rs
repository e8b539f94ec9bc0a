use axum::{
    extract::{
        multipart::{Field, MultipartError},
        Multipart, State,
    },
    routing::post,
    Router,
};
use tracing::{debug, error, info, instrument};

use crate::{
    auth::{dto::PublicUser, extractors::AuthUser},
    avatars::AvatarFile,
    error::ApiError,
    response::{Envelope, ErrorDetail},
    state::AppState,
};

pub fn avatar_routes() -> Router<AppState> {
    Router::new().route("/avatar/", post(upload_avatar))
}

pub(crate) fn malformed_multipart(e: MultipartError) -> ApiError {
    debug!(error = %e, "unreadable multipart body");
    ApiError::Validation(vec![ErrorDetail::general(e.body_text())])
}

/// Reads a file part. A part with no file name and no content is how browsers
/// submit an empty file input, so it counts as absent.
pub(crate) async fn read_avatar(field: Field<'_>) -> Result<Option<AvatarFile>, ApiError> {
    let file_name = field.file_name().map(str::to_string).filter(|n| !n.is_empty());
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = field.bytes().await.map_err(malformed_multipart)?;
    if body.is_empty() && file_name.is_none() {
        return Ok(None);
    }
    Ok(Some(AvatarFile {
        body,
        content_type,
        file_name,
    }))
}

#[instrument(skip(state, auth, multipart), fields(user_id = %auth.user.id))]
pub async fn upload_avatar(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> Result<Envelope<PublicUser>, ApiError> {
    let mut avatar = None;
    while let Some(field) = multipart.next_field().await.map_err(malformed_multipart)? {
        if field.name() == Some("avatar") {
            avatar = read_avatar(field).await?;
        }
    }
    let file = avatar.ok_or_else(|| ApiError::field("avatar", "No file was submitted."))?;

    let uploaded = match state.avatars.upload(file).await {
        Ok(u) => u,
        Err(e) if e.is_invalid_input() => {
            return Err(ApiError::field("avatar", e.public_reason()));
        }
        Err(e) => {
            error!(error = %e, "avatar upload failed");
            return Err(ApiError::AvatarUpload(e));
        }
    };

    let user = state.store.set_avatar(auth.user.id, &uploaded.url).await?;
    info!(file_id = %uploaded.file.id, "avatar updated");
    Ok(Envelope::ok("Avatar updated successfully.", PublicUser::from(&user)))
}
