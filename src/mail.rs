use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::info;

use crate::config::{EmailBackend, MailConfig};

/// A plain-text email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()>;
}

pub fn verification_email(to: &str, link: &str) -> OutgoingMail {
    OutgoingMail {
        to: to.to_string(),
        subject: "Verify your email address".to_string(),
        body: format!(
            "Welcome!\n\n\
             Please confirm your email address by opening the link below:\n{link}\n\n\
             This link expires in 24 hours.\n\
             If you did not create an account, please ignore this email."
        ),
    }
}

pub fn password_reset_email(to: &str, link: &str) -> OutgoingMail {
    OutgoingMail {
        to: to.to_string(),
        subject: "Password reset request".to_string(),
        body: format!(
            "You requested a password reset.\n\n\
             Click the link to reset your password: {link}\n\n\
             If you did not request this, please ignore this email."
        ),
    }
}

pub fn build_mailer(config: &MailConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    match config.backend {
        EmailBackend::Console => Ok(Arc::new(ConsoleMailer)),
        EmailBackend::Smtp => Ok(Arc::new(SmtpMailer::new(config)?)),
    }
}

/// Writes messages to the log instead of delivering them.
pub struct ConsoleMailer;

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        info!(to = %mail.to, subject = %mail.subject, body = %mail.body, "console email");
        Ok(())
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.smtp_host.trim().is_empty(),
            "SMTP_HOST must be set when EMAIL_BACKEND=smtp"
        );
        let from = config
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid DEFAULT_FROM_EMAIL {:?}", config.from))?;

        let builder = if config.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        }
        .context("configure smtp transport")?
        .port(config.smtp_port);

        let builder = match (&config.smtp_username, &config.smtp_password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        let to = mail
            .to
            .parse::<Mailbox>()
            .with_context(|| format!("invalid recipient {:?}", mail.to))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.as_str())
            .header(header::ContentType::TEXT_PLAIN)
            .body(mail.body)
            .context("build email message")?;
        self.transport.send(message).await.context("smtp send")?;
        info!(subject = %mail.subject, "email sent");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records every message; can be switched to fail delivery.
    #[derive(Default)]
    pub struct RecordingMailer {
        sent: Mutex<Vec<OutgoingMail>>,
        failing: AtomicBool,
    }

    impl RecordingMailer {
        pub fn sent(&self) -> Vec<OutgoingMail> {
            self.sent.lock().unwrap().clone()
        }

        pub fn fail_deliveries(&self, fail: bool) {
            self.failing.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            self.sent.lock().unwrap().push(mail);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_email_embeds_link() {
        let mail = password_reset_email("a@b.co", "http://front/reset-password/x/y/");
        assert_eq!(mail.to, "a@b.co");
        assert!(mail.body.contains("http://front/reset-password/x/y/"));
    }

    #[test]
    fn smtp_backend_requires_host() {
        let cfg = MailConfig {
            backend: EmailBackend::Smtp,
            from: "no-reply@example.com".into(),
            smtp_host: "".into(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            smtp_starttls: true,
        };
        assert!(build_mailer(&cfg).is_err());
    }
}
