//! Send emails to user for important updates.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::Mail;
use crate::error::{Result, ServerError};
use crate::user::AchievementKind;

const DEFAULT_SMTP_PORT: u16 = 587;
pub const OTP_VALIDITY_MINUTES: i64 = 10;

/// Templated messages list.
#[derive(Debug)]
pub enum Template {
    /// Verification code after registration.
    EmailVerification { code: String },
    /// A milestone was unlocked after a study session.
    AchievementUnlocked { kind: AchievementKind },
}

impl Template {
    fn subject(&self) -> String {
        match self {
            Template::EmailVerification { .. } => "Studyroom - Email Verification".into(),
            Template::AchievementUnlocked { .. } => {
                "Studyroom - New Achievement Unlocked!".into()
            },
        }
    }

    fn body(&self, username: &str) -> String {
        match self {
            Template::EmailVerification { code } => format!(
                "Hi {username},\n\nThank you for signing up! Please verify your \
                 email address with this code:\n\n    {code}\n\nThis code will \
                 expire in {OTP_VALIDITY_MINUTES} minutes.\n\nIf you didn't \
                 create an account with us, please ignore this email.",
            ),
            Template::AchievementUnlocked { kind } => format!(
                "Hi {username},\n\nCongratulations! You've earned a new \
                 achievement:\n\n    {}\n\nKeep up the great work and continue \
                 your study journey!",
                kind.display_name(),
            ),
        }
    }
}

/// Outbound SMTP manager.
///
/// Holds no transport when mail is not configured; sending then degrades to a
/// logged no-op so development setups work without a relay.
#[derive(Clone, Default)]
pub struct MailManager {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub fn new(config: &Mail) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|err| ServerError::Dependency(format!("smtp relay error: {err}")))?
            .port(config.port.unwrap_or(DEFAULT_SMTP_PORT));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        tracing::info!(host = config.host, "smtp transport configured");

        Ok(Self {
            transport: Some(builder.build()),
            from: config.from.clone(),
        })
    }

    /// Send a templated message and wait for the relay's answer.
    ///
    /// Used where delivery must be observable, e.g. registration.
    pub async fn send(&self, template: Template, email: &str, username: &str) -> Result<()> {
        let Some(transport) = &self.transport else {
            tracing::debug!(?template, to = email, "mail not configured, message dropped");
            return Ok(());
        };

        let message = Message::builder()
            .from(self.from.parse().map_err(|err| {
                ServerError::Dependency(format!("invalid sender address: {err}"))
            })?)
            .to(email.parse().map_err(|err| {
                ServerError::Dependency(format!("invalid recipient address: {err}"))
            })?)
            .subject(template.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(template.body(username))
            .map_err(|err| ServerError::Dependency(format!("failed to build message: {err}")))?;

        transport
            .send(message)
            .await
            .map_err(|err| ServerError::Dependency(format!("mail delivery failed: {err}")))?;

        tracing::trace!(?template, to = email, "mail sent");
        Ok(())
    }

    /// Fire-and-forget dispatch on a detached task.
    ///
    /// Failures are logged and never reach the caller.
    pub fn dispatch(&self, template: Template, email: String, username: String) {
        let mail = self.clone();
        tokio::spawn(async move {
            if let Err(err) = mail.send(template, &email, &username).await {
                tracing::error!(to = email, error = %err, "mail dispatch failed");
            }
        });
    }
}
