//! Notification channels for newly discovered listings.
//!
//! - `Notifier` trait for pluggable channels
//! - console and SMTP email channels
//! - `NotificationManager` fanning out to every configured channel

mod console;
mod email;

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::Utc;
use jobmon_core::{fingerprint, JobListing};
use thiserror::Error;
use tracing::{info, warn};

pub use console::{render_plain, ConsoleNotifier};
pub use email::{EmailNotifier, SmtpSettings};

pub const CRATE_NAME: &str = "jobmon-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SMTP delivery failed: {0}")]
    Smtp(String),
    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("every channel failed: {}", .0.join("; "))]
    AllChannelsFailed(Vec<String>),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message covering all of `listings`.
    async fn notify(&self, listings: &[JobListing]) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &str;
}

#[derive(Template)]
#[template(path = "new_listings.html")]
pub struct NewListingsEmail<'a> {
    pub count: usize,
    pub plural: &'a str,
    pub listings: &'a [JobListing],
}

pub fn plural_suffix(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

pub fn subject_line(count: usize) -> String {
    format!("{count} New Job Listing{} Found!", plural_suffix(count))
}

pub fn render_html(listings: &[JobListing]) -> Result<String, NotifyError> {
    let page = NewListingsEmail {
        count: listings.len(),
        plural: plural_suffix(listings.len()),
        listings,
    };
    Ok(page.render()?)
}

/// Fans a batch out to every channel; succeeds if any channel delivered.
#[derive(Default)]
pub struct NotificationManager {
    channels: Vec<Arc<dyn Notifier>>,
    email: Option<Arc<EmailNotifier>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Console always; email only when SMTP settings are complete and valid.
    pub fn from_settings(smtp: Option<&SmtpSettings>) -> Self {
        let mut manager = Self::new();
        if let Some(settings) = smtp {
            match EmailNotifier::from_settings(settings) {
                Ok(email) => {
                    let email = Arc::new(email);
                    manager.email = Some(email.clone());
                    manager.channels.push(email);
                }
                Err(err) => warn!(error = %err, "email notifications disabled"),
            }
        } else {
            warn!("email configuration incomplete; email notifications disabled");
        }
        manager.with_channel(Arc::new(ConsoleNotifier))
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn email_enabled(&self) -> bool {
        self.email.is_some()
    }

    /// Send one sample listing through the email channel only.
    pub async fn test_email(&self) -> Result<(), NotifyError> {
        let email = self
            .email
            .as_ref()
            .ok_or_else(|| NotifyError::Config("email notifications are not configured".into()))?;
        email.notify(&[sample_listing()]).await
    }
}

#[async_trait]
impl Notifier for NotificationManager {
    async fn notify(&self, listings: &[JobListing]) -> Result<(), NotifyError> {
        if listings.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut delivered = 0usize;
        for channel in &self.channels {
            match channel.notify(listings).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(channel = channel.channel_name(), error = %err, "notification channel failed");
                    failures.push(format!("{}: {err}", channel.channel_name()));
                }
            }
        }

        if delivered > 0 || failures.is_empty() {
            info!(delivered, failed = failures.len(), listings = listings.len(), "notifications sent");
            Ok(())
        } else {
            Err(NotifyError::AllChannelsFailed(failures))
        }
    }

    fn channel_name(&self) -> &str {
        "manager"
    }
}

/// Fixed listing used by `test-email`.
pub fn sample_listing() -> JobListing {
    let (title, company, location, url) = (
        "Test Job Notification",
        "Test Company",
        "Remote",
        "https://example.com",
    );
    JobListing {
        fingerprint: fingerprint("test", title, company, location, url),
        source: "test".to_string(),
        title: title.to_string(),
        company: company.to_string(),
        location: location.to_string(),
        url: url.to_string(),
        posted_date: None,
        description_snippet: String::new(),
        search_term: String::new(),
        first_seen_at: Utc::now(),
        is_read: false,
    }
}
