//! # notify-adapters
//!
//! Notification destinations (email, Telegram, Slack, webhook) and the Telegram
//! long-poll dispatcher.

pub mod dispatcher;
pub mod email;
pub mod slack;
pub mod telegram;
pub mod webhook;

pub use dispatcher::TelegramUpdateDispatcher;
pub use email::{EmailDestination, EmailParams, EmailSender, Mailer, SmtpMailer, SmtpParams};
pub use slack::SlackDestination;
pub use telegram::{TelegramClient, TelegramDestination, TelegramParams};
pub use webhook::WebhookDestination;

use thiserror::Error;

/// Failures collected from several independent sends.
#[derive(Error, Debug)]
#[error("{} send(s) failed: {}", .0.len(), .0.iter().map(|e| format!("{e:#}")).collect::<Vec<_>>().join("; "))]
pub struct SendErrors(pub Vec<anyhow::Error>);

impl SendErrors {
    /// `Ok` when nothing failed.
    pub fn into_result(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SendErrors(errors).into())
        }
    }
}
