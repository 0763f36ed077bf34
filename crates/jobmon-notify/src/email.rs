//! SMTP delivery via `lettre`.

use async_trait::async_trait;
use jobmon_core::JobListing;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::{render_html, render_plain, subject_line, Notifier, NotifyError};

pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub sender: String,
    pub password: String,
    pub recipient: String,
}

impl SmtpSettings {
    /// `None` unless `EMAIL_SENDER`, `EMAIL_PASSWORD` and `EMAIL_RECIPIENT` are all set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Some(Self {
            server: non_empty("SMTP_SERVER").unwrap_or_else(|| DEFAULT_SMTP_SERVER.to_string()),
            port: non_empty("SMTP_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            sender: non_empty("EMAIL_SENDER")?,
            password: non_empty("EMAIL_PASSWORD")?,
            recipient: non_empty("EMAIL_RECIPIENT")?,
        })
    }
}

#[derive(Debug)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    /// Port 465 uses implicit TLS; any other port negotiates STARTTLS.
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let from: Mailbox = settings
            .sender
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;
        let to: Mailbox = settings
            .recipient
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        let builder = if settings.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
        }
        .map_err(|e| NotifyError::Config(e.to_string()))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(
                settings.sender.clone(),
                settings.password.clone(),
            ))
            .build();

        Ok(Self { transport, from, to })
    }

    fn build_message(&self, listings: &[JobListing]) -> Result<Message, NotifyError> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject_line(listings.len()))
            .multipart(MultiPart::alternative_plain_html(
                render_plain(listings),
                render_html(listings)?,
            ))
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, listings: &[JobListing]) -> Result<(), NotifyError> {
        let message = self.build_message(listings)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        info!(channel = "email", listings = listings.len(), "notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::listing;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn settings(port: u16) -> SmtpSettings {
        SmtpSettings {
            server: "smtp.example.com".into(),
            port,
            sender: "alerts@example.com".into(),
            password: "secret".into(),
            recipient: "me@example.com".into(),
        }
    }

    #[test]
    fn settings_require_sender_password_and_recipient() {
        assert!(SmtpSettings::from_lookup(lookup(&[("EMAIL_SENDER", "a@example.com")])).is_none());
        assert!(SmtpSettings::from_lookup(lookup(&[
            ("EMAIL_SENDER", "a@example.com"),
            ("EMAIL_PASSWORD", "  "),
            ("EMAIL_RECIPIENT", "b@example.com"),
        ]))
        .is_none());
    }

    #[test]
    fn settings_default_server_and_port() {
        let parsed = SmtpSettings::from_lookup(lookup(&[
            ("EMAIL_SENDER", "a@example.com"),
            ("EMAIL_PASSWORD", "pw"),
            ("EMAIL_RECIPIENT", "b@example.com"),
            ("SMTP_PORT", "not-a-port"),
        ]))
        .unwrap();
        assert_eq!(parsed.server, DEFAULT_SMTP_SERVER);
        assert_eq!(parsed.port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn invalid_recipient_is_a_config_error() {
        let mut bad = settings(587);
        bad.recipient = "not-an-email".into();
        assert!(matches!(
            EmailNotifier::from_settings(&bad),
            Err(NotifyError::Config(_))
        ));
    }

    #[test]
    fn message_carries_subject_and_both_bodies() {
        let notifier = EmailNotifier::from_settings(&settings(465)).unwrap();
        let message = notifier
            .build_message(&[listing("Rust Dev", "Acme", "https://example.com/a")])
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: 1 New Job Listing Found!"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }
}
