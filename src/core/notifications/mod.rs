mod mail;
mod slack;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::error::NotifyError;

pub use mail::MailNotifier;
pub use slack::SlackNotifier;

/// Summary of a finished run, sent to the job's recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub job_id: String,
    pub recipient: String,
    pub subject: String,
    /// The full run log.
    pub body: String,
    pub success: bool,
}

/// Trait for notification channel implementations (sendmail, Slack, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Sendmail => Some(Arc::new(MailNotifier::new(
            config.sendmail_path.clone(),
            config.from.clone(),
        ))),
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(SlackNotifier::new(webhook.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_channel_means_no_notifier() {
        assert!(create_notifier(&NotificationConfig::default()).is_none());
    }

    #[test]
    fn slack_requires_a_webhook() {
        let mut config = NotificationConfig {
            channel: NotificationChannelType::Slack,
            ..Default::default()
        };
        assert!(create_notifier(&config).is_none());

        config.slack_webhook = Some(String::new());
        assert!(create_notifier(&config).is_none());

        config.slack_webhook = Some("https://hooks.slack.com/services/T/B/X".into());
        assert!(create_notifier(&config).is_some());
    }

    #[test]
    fn sendmail_is_always_available() {
        let config = NotificationConfig {
            channel: NotificationChannelType::Sendmail,
            ..Default::default()
        };
        assert!(create_notifier(&config).is_some());
    }
}
