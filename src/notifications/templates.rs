use handlebars::Handlebars;
use serde_json::json;

use super::{EmailMessage, NotifyError};

const PROCESSING_FAILED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body { font-family: 'Helvetica Neue', Helvetica, Arial, sans-serif; line-height: 1.6; color: #333; }
        .container { max-width: 600px; margin: 0 auto; padding: 20px; border: 1px solid #ddd; border-radius: 8px; }
        .header { background-color: #fdecea; padding: 15px; border-radius: 8px 8px 0 0; text-align: center; }
        .header h1 { margin: 0; color: #b71c1c; font-size: 20px; }
        .content { padding: 20px; }
        .footer { margin-top: 30px; font-size: 12px; color: #999; text-align: center; }
    </style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>We couldn't process your video</h1>
        </div>
        <div class="content">
            <p>Your {{action}} of <strong>{{title}}</strong> failed after {{attempts}} attempts.</p>
            <p>The video has been marked as failed and will be removed automatically. Please try uploading it again.</p>
            <p><small>Reference: {{video_id}}</small></p>
        </div>
        <div class="footer">
            <p>Sent by Streamify</p>
        </div>
    </div>
</body>
</html>
"#;

pub struct NotificationTemplates {
    registry: Handlebars<'static>,
}

impl NotificationTemplates {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        Self { registry }
    }

    /// Email telling the owner that an upload or edit was given up on.
    pub fn processing_failed(
        &self,
        to: &str,
        action: &str,
        title: &str,
        video_id: &str,
        attempts: u32,
    ) -> Result<EmailMessage, NotifyError> {
        let body = self.registry.render_template(
            PROCESSING_FAILED_HTML,
            &json!({
                "action": action,
                "title": title,
                "video_id": video_id,
                "attempts": attempts,
            }),
        )?;

        Ok(EmailMessage {
            to: to.to_string(),
            subject: "Your video could not be processed".to_string(),
            body,
        })
    }
}

impl Default for NotificationTemplates {
    fn default() -> Self {
        Self::new()
    }
}
