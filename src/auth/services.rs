use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            AuthResponse, GoogleAuthResponse, GoogleLoginRequest, PublicUser, RegisterRequest,
            ResetPasswordRequest,
        },
        google::IdentityClaims,
        password::{check_strength, hash_password, verify_password},
        repo::StoreError,
        repo_types::{NewUser, User},
        tokens::{decode_uid, encode_uid, new_session_key, ResetKeys},
    },
    avatars::{validate_avatar, AvatarFile},
    error::ApiError,
    mail::{password_reset_email, verification_email},
    response::ErrorDetail,
    state::AppState,
};

pub const FORGOT_PASSWORD_MESSAGE: &str =
    "If this email exists, a password reset link has been sent.";
pub const RESET_PASSWORD_MESSAGE: &str = "Password reset successful.";

const REQUIRED: &str = "This field is required.";
const PHONE_FORMAT: &str =
    "Phone number must be entered in the format: '+999999999'. Up to 15 digits allowed.";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn is_valid_phone(phone: &str) -> bool {
    lazy_static! {
        static ref PHONE_RE: Regex = Regex::new(r"^\+?1?\d{9,15}$").unwrap();
    }
    PHONE_RE.is_match(phone)
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

/// Validates the form, uploads the avatar if any, creates the user and
/// issues a verification token. A failed verification email is only logged.
pub async fn register(
    st: &AppState,
    req: RegisterRequest,
    avatar: Option<AvatarFile>,
) -> Result<User, ApiError> {
    let name = req.name.trim().to_string();
    let email = req.email.trim().to_string();
    let phone = req.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
    let mut errors = Vec::new();

    if name.is_empty() {
        errors.push(ErrorDetail::field("name", REQUIRED));
    }
    if email.is_empty() {
        errors.push(ErrorDetail::field("email", REQUIRED));
    } else if !is_valid_email(&email) {
        errors.push(ErrorDetail::field("email", "Enter a valid email address."));
    } else if st.store.find_user_by_email(&email).await?.is_some() {
        errors.push(ErrorDetail::field("email", "A user with this email already exists."));
    }
    for problem in check_strength(&req.password, &[&email, &name]) {
        errors.push(ErrorDetail::field("password", problem));
    }
    if req.password != req.password_confirm {
        errors.push(ErrorDetail::field("password_confirm", "Password fields didn't match."));
    }
    if let Some(phone) = &phone {
        if !is_valid_phone(phone) {
            errors.push(ErrorDetail::field("phone", PHONE_FORMAT));
        }
    }
    if let Some(file) = &avatar {
        if let Err(e) = validate_avatar(file) {
            errors.push(ErrorDetail::field("avatar", e.public_reason()));
        }
    }
    if !errors.is_empty() {
        warn!(email = %email, count = errors.len(), "registration rejected");
        return Err(ApiError::Validation(errors));
    }

    let avatar_url = match avatar {
        Some(file) => match st.avatars.upload(file).await {
            Ok(uploaded) => Some(uploaded.url),
            Err(e) => {
                error!(error = %e, email = %email, "avatar upload failed during registration");
                return Err(ApiError::AvatarUpload(e));
            }
        },
        None => None,
    };

    let password_hash = hash_password(&req.password)?;
    let user = st
        .store
        .create_user(NewUser {
            email,
            name,
            phone,
            password_hash: Some(password_hash),
            avatar: avatar_url,
            is_verified: false,
        })
        .await?;

    if let Err(e) = send_verification(st, &user).await {
        warn!(error = %e, user_id = %user.id, "verification email not sent");
    }

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(user)
}

fn verification_expiry(now: OffsetDateTime, ttl_hours: i64) -> Option<OffsetDateTime> {
    let secs = ttl_hours.checked_mul(3600)?;
    now.checked_add(Duration::seconds(secs))
}

/// Issues a fresh verification token for `user` and emails the link.
async fn send_verification(st: &AppState, user: &User) -> Result<(), ApiError> {
    let ttl_hours = st.config.tokens.verification_ttl_hours;
    let expires_at = verification_expiry(OffsetDateTime::now_utc(), ttl_hours)
        .ok_or_else(|| anyhow::anyhow!("verification ttl of {ttl_hours}h is out of range"))?;
    let token = st.store.create_verification_token(user.id, expires_at).await?;
    let link = format!("{}/verify-email/{}/", st.config.frontend_base(), token.token);
    st.mailer
        .send(verification_email(&user.email, &link))
        .await
        .map_err(ApiError::MailDelivery)?;
    debug!(user_id = %user.id, "verification email sent");
    Ok(())
}

pub async fn verify_email(st: &AppState, token: &str) -> Result<(), ApiError> {
    let token = Uuid::parse_str(token.trim()).map_err(|_| ApiError::InvalidToken)?;
    let Some(row) = st.store.find_verification_token(token).await? else {
        return Err(ApiError::InvalidToken);
    };
    if row.is_expired_at(OffsetDateTime::now_utc()) {
        st.store.delete_verification_token(row.id).await?;
        info!(user_id = %row.user_id, "expired verification token removed");
        return Err(ApiError::TokenExpired);
    }
    st.store.mark_verified(row.user_id).await?;
    st.store.delete_verification_token(row.id).await?;
    info!(user_id = %row.user_id, "email verified");
    Ok(())
}

pub async fn resend_verification(st: &AppState, email: &str) -> Result<(), ApiError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ApiError::field("email", REQUIRED));
    }
    let user = st
        .store
        .find_user_by_email(email)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    if user.is_verified {
        return Err(ApiError::AlreadyVerified);
    }
    let removed = st.store.delete_verification_tokens_for(user.id).await?;
    debug!(user_id = %user.id, removed, "outstanding verification tokens removed");
    send_verification(st, &user).await
}

pub async fn login(st: &AppState, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
    let email = email.trim();
    let mut errors = Vec::new();
    if email.is_empty() {
        errors.push(ErrorDetail::field("email", REQUIRED));
    }
    if password.is_empty() {
        errors.push(ErrorDetail::field("password", REQUIRED));
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let Some(user) = st.store.find_user_by_email(email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(ApiError::InvalidCredentials);
    };
    let Some(hash) = user.password_hash.as_deref() else {
        warn!(user_id = %user.id, "login for account without password");
        return Err(ApiError::InvalidCredentials);
    };
    if !verify_password(password, hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }
    if !user.is_active {
        warn!(user_id = %user.id, "login for disabled account");
        return Err(ApiError::AccountDisabled);
    }

    st.store.record_login(user.id).await?;
    let token = st.store.session_key_for(user.id, &new_session_key()).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(AuthResponse {
        token,
        user: PublicUser::from(&user),
    })
}

pub async fn logout(st: &AppState, session_key: &str) -> Result<(), ApiError> {
    let removed = st.store.delete_session(session_key).await?;
    debug!(removed, "session token deleted");
    Ok(())
}

/// Emails a reset link when the address belongs to a user. Never fails, so
/// callers cannot tell whether the account exists.
pub async fn forgot_password(st: &AppState, email: &str) {
    let email = email.trim();
    if !is_valid_email(email) {
        debug!("forgot password with malformed email");
        return;
    }
    let user = match st.store.find_user_by_email(email).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            debug!("forgot password for unknown email");
            return;
        }
        Err(e) => {
            error!(error = %e, "forgot password lookup failed");
            return;
        }
    };
    let token = match ResetKeys::from_ref(st).make_token(&user) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, user_id = %user.id, "reset token signing failed");
            return;
        }
    };
    let link = format!(
        "{}/reset-password/{}/{}/",
        st.config.frontend_base(),
        encode_uid(user.id),
        token
    );
    match st.mailer.send(password_reset_email(&user.email, &link)).await {
        Ok(()) => info!(user_id = %user.id, "password reset email sent"),
        Err(e) => warn!(error = %e, user_id = %user.id, "password reset email not sent"),
    }
}

/// Only a weak new password is reported; every other outcome looks like success.
pub async fn reset_password(st: &AppState, req: ResetPasswordRequest) -> Result<(), ApiError> {
    let problems = check_strength(&req.new_password, &[]);
    if !problems.is_empty() {
        return Err(ApiError::Validation(
            problems
                .into_iter()
                .map(|p| ErrorDetail::field("new_password", p))
                .collect(),
        ));
    }

    let Some(user_id) = decode_uid(&req.uid) else {
        debug!("reset password with undecodable uid");
        return Ok(());
    };
    let user = match st.store.find_user(user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            debug!(%user_id, "reset password for unknown user");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, %user_id, "reset password lookup failed");
            return Ok(());
        }
    };
    if !ResetKeys::from_ref(st).check_token(&user, &req.token) {
        warn!(%user_id, "reset password with invalid token");
        return Ok(());
    }

    let hash = match hash_password(&req.new_password) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, %user_id, "reset password hashing failed");
            return Ok(());
        }
    };
    match st.store.set_password(user.id, &hash).await {
        Ok(()) => info!(%user_id, "password reset"),
        Err(e) => error!(error = %e, %user_id, "reset password update failed"),
    }
    Ok(())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

async fn google_claims(st: &AppState, req: GoogleLoginRequest) -> Result<IdentityClaims, ApiError> {
    if let Some(id_token) = non_empty(req.id_token) {
        let claims = st.google.verify_id_token(&id_token).await.map_err(|e| {
            warn!(error = %format!("{e:#}"), "google id token rejected");
            ApiError::InvalidGoogleToken
        })?;
        return Ok(claims.into());
    }
    if let Some(access_token) = non_empty(req.access_token) {
        let info = st.google.fetch_user_info(&access_token).await.map_err(|e| {
            warn!(error = %format!("{e:#}"), "google access token rejected");
            ApiError::InvalidGoogleToken
        })?;
        return Ok(info.into());
    }
    Err(ApiError::field("id_token", "Either id_token or access_token is required."))
}

pub async fn google_login(
    st: &AppState,
    req: GoogleLoginRequest,
) -> Result<GoogleAuthResponse, ApiError> {
    let claims = google_claims(st, req).await?;
    let email = match claims.email.as_deref().map(str::trim) {
        Some(e) if claims.email_verified && !e.is_empty() => e.to_string(),
        _ => {
            warn!(sub = %claims.subject, "google login without verified email");
            return Err(ApiError::EmailNotVerified);
        }
    };

    let (mut user, created) = match st.store.find_user_by_email(&email).await? {
        Some(user) => (user, false),
        None => {
            let new = NewUser {
                name: claims
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| local_part(&email).to_string()),
                email: email.clone(),
                phone: None,
                password_hash: None,
                avatar: claims.picture.clone(),
                is_verified: true,
            };
            match st.store.create_user(new).await {
                Ok(user) => (user, true),
                // lost a race with a concurrent first login
                Err(StoreError::DuplicateEmail) => {
                    let user = st
                        .store
                        .find_user_by_email(&email)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("user vanished after duplicate insert"))?;
                    (user, false)
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    if !user.is_active {
        warn!(user_id = %user.id, "google login for disabled account");
        return Err(ApiError::AccountDisabled);
    }
    if !user.is_verified {
        st.store.mark_verified(user.id).await?;
        user.is_verified = true;
    }

    let token = st.store.session_key_for(user.id, &new_session_key()).await?;
    info!(user_id = %user.id, created, "google login");
    Ok(GoogleAuthResponse {
        token,
        user: PublicUser::from(&user),
        created,
    })
}
