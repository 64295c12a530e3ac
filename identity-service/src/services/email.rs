//! Outbound account mail: verification and password-reset links.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use secrecy::ExposeSecret;
use std::time::Duration;

use crate::config::EmailConfig;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_verification_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error>;

    async fn send_password_reset_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct SmtpEmailSender {
    mailer: SmtpTransport,
    from_address: String,
}

impl SmtpEmailSender {
    /// `None` when the config carries no SMTP settings.
    pub fn from_config(config: &EmailConfig) -> Result<Option<Self>, anyhow::Error> {
        let Some(smtp) = &config.smtp else {
            return Ok(None);
        };

        let creds = Credentials::new(
            smtp.username.clone(),
            smtp.password.expose_secret().to_string(),
        );
        let mailer = SmtpTransport::relay(&smtp.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", smtp.host, e))?
            .credentials(creds)
            .port(smtp.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %smtp.host, "Email sender initialized with SMTP relay");

        Ok(Some(Self {
            mailer,
            from_address: config.from_address.clone(),
        }))
    }

    async fn send(&self, to: &str, subject: &str, plain: String, html: String) -> Result<(), anyhow::Error> {
        let email = Message::builder()
            .from(self.from_address.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )?;

        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| anyhow::anyhow!("Mail task failed: {}", e))?
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send email");
                anyhow::anyhow!("Failed to send email: {}", e)
            })?;

        tracing::info!(subject = %subject, "Email sent");
        Ok(())
    }
}

fn html_link(heading: &str, text: &str, link: &str, label: &str) -> String {
    format!(
        r#"<html>
  <body style="font-family: Arial, sans-serif;">
    <h2>{heading}</h2>
    <p>{text}</p>
    <p><a href="{link}">{label}</a></p>
    <p style="color: #666; font-size: 12px;">If you didn't request this, please ignore this email.</p>
  </body>
</html>"#
    )
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_verification_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        let text = "Please confirm your email address by opening the link below.";
        self.send(
            to,
            "Verify your email address",
            format!("{}\n\n{}\n", text, link),
            html_link("Verify your email", text, link, "Verify email"),
        )
        .await
    }

    async fn send_password_reset_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        let text = "A password reset was requested for your account. The link below expires soon and works once.";
        self.send(
            to,
            "Reset your password",
            format!("{}\n\n{}\n", text, link),
            html_link("Reset your password", text, link, "Choose a new password"),
        )
        .await
    }
}

/// Development sender: writes links to the log instead of mailing them.
#[derive(Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_verification_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        tracing::info!(to = %to, link = %link, "Verification email (not sent, SMTP disabled)");
        Ok(())
    }

    async fn send_password_reset_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        tracing::info!(to = %to, link = %link, "Password reset email (not sent, SMTP disabled)");
        Ok(())
    }
}
