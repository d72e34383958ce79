use async_trait::async_trait;
use sendgrid::SGClient;
use sendgrid::{Destination, Mail};
use tracing::{error, info, warn};

use super::{EmailMessage, Notifier, NotifyError};

#[derive(Clone)]
pub struct SendGridNotifier {
    client: Option<SGClient>,
    email_from: String,
}

impl SendGridNotifier {
    /// Without an API key the notifier only logs what it would have sent.
    pub fn new(api_key: Option<String>, email_from: String) -> Self {
        let client = api_key.map(SGClient::new);
        if client.is_none() {
            warn!("SendGrid API key not found. Email notifications will be mocked.");
        }
        Self { client, email_from }
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError> {
        let Some(client) = &self.client else {
            info!(to = %message.to, subject = %message.subject, body_len = message.body.len(), "(Mock) email");
            crate::metrics::increment_notifications_sent("email");
            return Ok(());
        };

        let EmailMessage { to, subject, body } = message;
        let from = self.email_from.clone();
        let client = client.clone();
        let recipient = to.clone();

        // SGClient::send is blocking.
        let sent = tokio::task::spawn_blocking(move || {
            let mail = Mail::new()
                .add_to(Destination {
                    address: &recipient,
                    name: &recipient,
                })
                .add_from(&from)
                .add_subject(&subject)
                .add_html(&body);
            client.send(mail).map(|_| ()).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("task join error: {}", e))
        .and_then(|result| result);

        match sent {
            Ok(()) => {
                info!(%to, "email sent");
                crate::metrics::increment_notifications_sent("email");
                Ok(())
            }
            Err(e) => {
                error!(%to, error = %e, "failed to send email");
                crate::metrics::increment_notifications_failed("email");
                Err(NotifyError::Provider(e))
            }
        }
    }
}
