pub mod sendgrid;
pub mod templates;

pub use self::sendgrid::SendGridNotifier;
pub use templates::NotificationTemplates;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SendGrid error: {0}")]
    Provider(String),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

/// Out-of-band delivery to users. Callers treat every error as non-fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError>;
}
