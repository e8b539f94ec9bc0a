use axum::{
    extract::{rejection::JsonRejection, Multipart, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{debug, instrument};

use crate::{
    auth::{
        dto::{
            AuthResponse, EmailRequest, GoogleAuthResponse, GoogleLoginRequest, LoginRequest,
            PublicUser, RegisterRequest, ResetPasswordRequest, VerifyEmailRequest,
        },
        extractors::AuthUser,
        services::{self, FORGOT_PASSWORD_MESSAGE, RESET_PASSWORD_MESSAGE},
    },
    avatars::{
        handlers::{malformed_multipart, read_avatar},
        AvatarFile,
    },
    error::ApiError,
    response::{Envelope, ErrorDetail},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register/", post(register))
        .route("/login/", post(login))
        .route("/logout/", post(logout))
        .route("/verify-email/", post(verify_email))
        .route("/resend-verification/", post(resend_verification))
        .route("/forgot-password/", post(forgot_password))
        .route("/reset-password/", post(reset_password))
        .route("/google-login/", post(google_login))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me/", get(get_me))
}

/// Unwraps a JSON body, turning axum's plain-text rejection into an envelope.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(|rej| {
        debug!(error = %rej, "rejected request body");
        ApiError::Validation(vec![ErrorDetail::general(rej.body_text())])
    })
}

async fn read_register_form(
    mut multipart: Multipart,
) -> Result<(RegisterRequest, Option<AvatarFile>), ApiError> {
    let mut req = RegisterRequest::default();
    let mut avatar = None;
    while let Some(field) = multipart.next_field().await.map_err(malformed_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "avatar" {
            avatar = read_avatar(field).await?;
            continue;
        }
        let value = field.text().await.map_err(malformed_multipart)?;
        match name.as_str() {
            "name" => req.name = value,
            "email" => req.email = value,
            "password" => req.password = value,
            "password_confirm" => req.password_confirm = value,
            "phone" => req.phone = Some(value),
            other => debug!(field = %other, "ignoring unknown form field"),
        }
    }
    Ok((req, avatar))
}

#[instrument(skip(state, multipart))]
pub async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Envelope<PublicUser>), ApiError> {
    let (req, avatar) = read_register_form(multipart).await?;
    let user = services::register(&state, req, avatar).await?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(
            "User registered successfully. Please check your email to verify your account.",
            PublicUser::from(&user),
        ),
    ))
}

#[instrument(skip(state, payload))]
pub async fn verify_email(
    State(state): State<AppState>,
    payload: Result<Json<VerifyEmailRequest>, JsonRejection>,
) -> Result<Envelope<()>, ApiError> {
    let req = body(payload)?;
    services::verify_email(&state, &req.token).await?;
    Ok(Envelope::message("Email verified successfully."))
}

#[instrument(skip(state, payload))]
pub async fn resend_verification(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Envelope<()>, ApiError> {
    let req = body(payload)?;
    services::resend_verification(&state, &req.email).await?;
    Ok(Envelope::message("Verification email sent."))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Envelope<AuthResponse>, ApiError> {
    let req = body(payload)?;
    let auth = services::login(&state, &req.email, &req.password).await?;
    Ok(Envelope::ok("Login successful.", auth))
}

#[instrument(skip(state, auth), fields(user_id = %auth.user.id))]
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Envelope<()>, ApiError> {
    services::logout(&state, &auth.key).await?;
    Ok(Envelope::message("Logged out successfully."))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Envelope<()> {
    if let Ok(Json(req)) = payload {
        services::forgot_password(&state, &req.email).await;
    }
    Envelope::message(FORGOT_PASSWORD_MESSAGE)
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Result<Envelope<()>, ApiError> {
    let req = body(payload)?;
    services::reset_password(&state, req).await?;
    Ok(Envelope::message(RESET_PASSWORD_MESSAGE))
}

#[instrument(skip(state, payload))]
pub async fn google_login(
    State(state): State<AppState>,
    payload: Result<Json<GoogleLoginRequest>, JsonRejection>,
) -> Result<Envelope<GoogleAuthResponse>, ApiError> {
    let req = body(payload)?;
    let res = services::google_login(&state, req).await?;
    let message = if res.created {
        "Google account registered successfully."
    } else {
        "Google login successful."
    };
    Ok(Envelope::ok(message, res))
}

#[instrument(skip(auth), fields(user_id = %auth.user.id))]
pub async fn get_me(auth: AuthUser) -> Envelope<PublicUser> {
    Envelope::ok("User profile.", PublicUser::from(&auth.user))
}
