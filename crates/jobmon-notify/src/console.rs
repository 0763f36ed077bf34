use async_trait::async_trait;
use jobmon_core::JobListing;

use crate::{Notifier, NotifyError};

/// Prints new listings to stdout. Always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

pub fn render_plain(listings: &[JobListing]) -> String {
    let rule = "=".repeat(80);
    let mut out = format!(
        "{rule}\nFOUND {} NEW JOB LISTING{}\n{rule}\n",
        listings.len(),
        if listings.len() == 1 { "" } else { "S" }
    );

    for (idx, job) in listings.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n", idx + 1, job.title));
        if !job.company.is_empty() {
            out.push_str(&format!("   Company: {}\n", job.company));
        }
        if !job.location.is_empty() {
            out.push_str(&format!("   Location: {}\n", job.location));
        }
        out.push_str(&format!("   Source: {}\n", job.source));
        if !job.url.is_empty() {
            out.push_str(&format!("   URL: {}\n", job.url));
        }
    }
    out.push_str(&format!("\n{rule}\n"));
    out
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, listings: &[JobListing]) -> Result<(), NotifyError> {
        println!("{}", render_plain(listings));
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "console"
    }
}
