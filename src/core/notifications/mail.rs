use super::{Notification, NotificationChannel};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::NotifyError;

/// Plain-text mail handed to a local `sendmail -t`.
pub struct MailNotifier {
    sendmail_path: String,
    from: Option<String>,
}

impl MailNotifier {
    pub fn new(sendmail_path: String, from: Option<String>) -> Self {
        Self {
            sendmail_path,
            from,
        }
    }

    fn format_message(&self, notification: &Notification) -> String {
        let from = self.from.as_deref().unwrap_or(&notification.recipient);
        format!(
            "To: {}\r\nFrom: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{}",
            notification.recipient,
            from,
            header_value(&notification.subject),
            notification.body
        )
    }
}

/// Header values must stay on one line.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl NotificationChannel for MailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.format_message(notification);

        let mut child = Command::new(&self.sendmail_path)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(message.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            // A program that exits early is reported through its exit status below.
            if let Err(e) = written {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NotifyError::Command {
                program: self.sendmail_path.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
