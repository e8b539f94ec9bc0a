use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

pub const MIN_PASSWORD_LEN: usize = 8;

const COMMON_PASSWORDS: &[&str] = &[
    "password", "password1", "password123", "12345678", "123456789", "1234567890",
    "qwerty123", "qwertyuiop", "iloveyou", "sunshine", "football", "baseball",
    "welcome1", "letmein1", "admin123", "abc12345", "trustno1", "passw0rd",
    "princess", "superman", "11111111", "00000000", "changeme",
];

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// Strength policy applied on registration and reset. `attributes` are user
/// fields (email, name) the password must not resemble; pass an empty slice
/// when no user is known. Returns every violated rule.
pub fn check_strength(password: &str, attributes: &[&str]) -> Vec<String> {
    let mut problems = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LEN {
        problems.push(format!(
            "This password is too short. It must contain at least {MIN_PASSWORD_LEN} characters."
        ));
    }
    if !password.is_empty() && password.chars().all(|c| c.is_ascii_digit()) {
        problems.push("This password is entirely numeric.".to_string());
    }
    let lowered = password.to_lowercase();
    if COMMON_PASSWORDS.contains(&lowered.as_str()) {
        problems.push("This password is too common.".to_string());
    }
    if is_similar_to_any(&lowered, attributes) {
        problems.push("The password is too similar to your personal information.".to_string());
    }

    problems
}

fn is_similar_to_any(lowered: &str, attributes: &[&str]) -> bool {
    if lowered.is_empty() {
        return false;
    }
    attributes.iter().any(|attr| {
        let attr = attr.trim().to_lowercase();
        // only the local part of an email is meaningful here
        let attr = attr.split('@').next().unwrap_or_default();
        std::iter::once(attr)
            .chain(attr.split(|c: char| !c.is_alphanumeric()))
            .filter(|part| part.chars().count() >= 3)
            .any(|part| lowered.contains(part) || part.contains(lowered))
    })
}
