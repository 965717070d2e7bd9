use super::{Notification, NotificationChannel};
use async_trait::async_trait;
use serde_json::json;

use crate::error::NotifyError;

/// Longest log excerpt posted; Slack truncates larger section texts.
const MAX_LOG_CHARS: usize = 2800;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, notification: &Notification) -> serde_json::Value {
        let log = tail(&notification.body, MAX_LOG_CHARS);
        json!({
            "text": notification.subject,
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": notification.subject,
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "fields": [
                        {
                            "type": "mrkdwn",
                            "text": format!("*Job:*\n`{}`", notification.job_id)
                        },
                        {
                            "type": "mrkdwn",
                            "text": format!(
                                "*Result:*\n{}",
                                if notification.success { "Success" } else { "Failure" }
                            )
                        }
                    ]
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!("```{}```", log)
                    }
                }
            ]
        })
    }
}

/// The last `max` characters of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[start..]
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = self.format_message(notification);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
