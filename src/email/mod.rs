use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::Config;

/// The SMTP collaborator named throughout §4.4: password-reset and
/// verification email dispatch is always best-effort from the caller's
/// point of view (failures are logged, never propagated as a request
/// failure), so the trait itself returns a plain `anyhow`-free `String`
/// error that callers are free to ignore.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_password_reset(&self, to_email: &str, token: &str) -> Result<(), String>;
    async fn send_verification(&self, to_email: &str, token: &str) -> Result<(), String>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    app_base_url: String,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, String> {
        let host = config.smtp_host.clone().ok_or("SMTP_HOST not configured")?;
        let user = config.smtp_user.clone().ok_or("SMTP_USER not configured")?;
        let password = config.smtp_password.clone().ok_or("SMTP_PASSWORD not configured")?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .map_err(|e| format!("failed to build SMTP transport: {e}"))?
            .credentials(Credentials::new(user.clone(), password))
            .build();

        Ok(SmtpMailer {
            transport,
            from: user,
            app_base_url: std::env::var("APP_BASE_URL").unwrap_or_else(|_| "https://app.example.com".to_string()),
        })
    }

    async fn send(&self, to_email: &str, subject: &str, body: String) -> Result<(), String> {
        let email = Message::builder()
            .from(self.from.parse().map_err(|e| format!("invalid from address: {e}"))?)
            .to(to_email.parse().map_err(|e| format!("invalid recipient address: {e}"))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| format!("failed to build message: {e}"))?;

        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| format!("SMTP send failed: {e}"))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_password_reset(&self, to_email: &str, token: &str) -> Result<(), String> {
        let body = format!(
            "A password reset was requested for your account.\n\nReset it here: {}/reset-password?token={token}\n\nIf you did not request this, ignore this email.",
            self.app_base_url
        );
        self.send(to_email, "Reset your password", body).await
    }

    async fn send_verification(&self, to_email: &str, token: &str) -> Result<(), String> {
        let body = format!(
            "Verify your email address here: {}/verify-email?token={token}",
            self.app_base_url
        );
        self.send(to_email, "Verify your email", body).await
    }
}

/// Used in development when SMTP credentials are absent — logs instead of
/// sending, so the register/login flow works without a mail server.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_password_reset(&self, to_email: &str, token: &str) -> Result<(), String> {
        tracing::info!(to = %to_email, token = %token, "password reset email (noop mailer)");
        Ok(())
    }

    async fn send_verification(&self, to_email: &str, token: &str) -> Result<(), String> {
        tracing::info!(to = %to_email, token = %token, "verification email (noop mailer)");
        Ok(())
    }
}
