use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub password_reset_ttl_secs: i64,
    pub verification_ttl_hours: i64,
}

pub const VERIFICATION_TTL_HOURS_RANGE: std::ops::RangeInclusive<i64> = 1..=720;
pub const PASSWORD_RESET_TTL_SECS_RANGE: std::ops::RangeInclusive<i64> = 60..=86_400;

impl TokenConfig {
    /// Rejects lifetimes that would overflow date arithmetic or issue dead tokens.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            VERIFICATION_TTL_HOURS_RANGE.contains(&self.verification_ttl_hours),
            "EMAIL_VERIFICATION_TTL_HOURS must be within {:?}, got {}",
            VERIFICATION_TTL_HOURS_RANGE,
            self.verification_ttl_hours
        );
        anyhow::ensure!(
            PASSWORD_RESET_TTL_SECS_RANGE.contains(&self.password_reset_ttl_secs),
            "PASSWORD_RESET_TIMEOUT_SECS must be within {:?}, got {}",
            PASSWORD_RESET_TTL_SECS_RANGE,
            self.password_reset_ttl_secs
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmailBackend {
    Console,
    Smtp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub backend: EmailBackend,
    pub from: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_starttls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub service_account_file: String,
    pub drive_folder_name: String,
    /// Parent under which the avatar folder is looked up and created.
    pub drive_parent_folder_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub frontend_url: String,
    pub tokens: TokenConfig,
    pub mail: MailConfig,
    pub google: GoogleConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let tokens = TokenConfig {
            secret: std::env::var("SECRET_KEY").context("SECRET_KEY must be set")?,
            issuer: env_or("TOKEN_ISSUER", "accounts"),
            password_reset_ttl_secs: env_parse("PASSWORD_RESET_TIMEOUT_SECS", 60 * 60),
            verification_ttl_hours: env_parse("EMAIL_VERIFICATION_TTL_HOURS", 24),
        };
        tokens.validate()?;
        let backend = match env_or("EMAIL_BACKEND", "console").to_lowercase().as_str() {
            "smtp" => EmailBackend::Smtp,
            "console" => EmailBackend::Console,
            other => anyhow::bail!("unsupported EMAIL_BACKEND {other:?}"),
        };
        let mail = MailConfig {
            backend,
            from: env_or("DEFAULT_FROM_EMAIL", "no-reply@example.com"),
            smtp_host: env_or("SMTP_HOST", ""),
            smtp_port: env_parse("SMTP_PORT", 587),
            smtp_username: env_opt("SMTP_USERNAME"),
            smtp_password: env_opt("SMTP_PASSWORD"),
            smtp_starttls: env_parse("SMTP_STARTTLS", true),
        };
        let google = GoogleConfig {
            client_id: env_or("GOOGLE_CLIENT_ID", ""),
            service_account_file: env_or("GOOGLE_SERVICE_ACCOUNT_FILE", "service-account.json"),
            drive_folder_name: env_or("GOOGLE_DRIVE_FOLDER_NAME", "avatars"),
            drive_parent_folder_id: env_opt("GOOGLE_DRIVE_FOLDER_ID"),
        };
        Ok(Self {
            database_url,
            frontend_url: env_or("FRONTEND_URL", "http://localhost:3000"),
            tokens,
            mail,
            google,
        })
    }

    /// Frontend base without a trailing slash, for building email links.
    pub fn frontend_base(&self) -> &str {
        self.frontend_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("ACCOUNTS_TEST_PORT", "not-a-number");
        assert_eq!(env_parse::<u16>("ACCOUNTS_TEST_PORT", 587), 587);
        std::env::set_var("ACCOUNTS_TEST_PORT", "2525");
        assert_eq!(env_parse::<u16>("ACCOUNTS_TEST_PORT", 587), 2525);
    }

    fn tokens(hours: i64, secs: i64) -> TokenConfig {
        TokenConfig {
            secret: "s".into(),
            issuer: "i".into(),
            password_reset_ttl_secs: secs,
            verification_ttl_hours: hours,
        }
    }

    #[test]
    fn token_lifetimes_must_be_in_range() {
        assert!(tokens(24, 3600).validate().is_ok());
        assert!(tokens(720, 86_400).validate().is_ok());
        assert!(tokens(0, 3600).validate().is_err());
        assert!(tokens(-24, 3600).validate().is_err());
        assert!(tokens(1_000_000_000, 3600).validate().is_err());
        assert!(tokens(24, 59).validate().is_err());
        assert!(tokens(24, i64::MAX).validate().is_err());
    }

    #[test]
    fn env_opt_ignores_blank_values() {
        std::env::set_var("ACCOUNTS_TEST_BLANK", "   ");
        assert_eq!(env_opt("ACCOUNTS_TEST_BLANK"), None);
    }
}
