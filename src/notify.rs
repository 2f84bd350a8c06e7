//! Escalation channel: e-mail through the local mail client.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Errors raised while sending a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The mail client could not be started or fed.
    #[error("mail client `{program}` failed: {source}")]
    Io {
        /// Client program.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The mail client exited unsuccessfully.
    #[error("mail client `{program}` exited with code {code:?}")]
    Rejected {
        /// Client program.
        program: String,
        /// Exit code, if any.
        code: Option<i32>,
    },
}

/// Sends escalation messages to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message.
    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Which mail client binary to drive.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailClient {
    /// `mailx`
    #[default]
    Mailx,
    /// `mail`
    Mail,
    /// `mutt`
    Mutt,
}

impl MailClient {
    /// Binary name on `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            Self::Mailx => "mailx",
            Self::Mail => "mail",
            Self::Mutt => "mutt",
        }
    }
}

/// Notification settings shared by both tools.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    /// Recipient addresses. Empty disables e-mail.
    #[serde(default)]
    pub receivers: Vec<String>,

    /// Mail client to use.
    #[serde(default)]
    pub client: MailClient,

    /// Optional sender address (`-S from=`).
    #[serde(default)]
    pub sender: Option<String>,

    /// Optional SMTP relay (`-S smtp=smtp://<server>`).
    #[serde(default)]
    pub mail_server: Option<String>,
}

impl NotifyConfig {
    /// Check every address looks like `local@domain.tld`.
    ///
    /// # Errors
    ///
    /// Returns the first malformed address.
    pub fn validate(&self) -> Result<(), String> {
        let addresses = self.receivers.iter().chain(self.sender.iter());
        for address in addresses {
            if !looks_like_email(address) {
                return Err(format!("'{address}' is not a valid e-mail address"));
            }
        }
        if self.mail_server.is_some() && self.receivers.is_empty() {
            return Err("mail_server is set but there are no receivers".to_owned());
        }
        Ok(())
    }
}

fn looks_like_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    }
}

/// Sends mail by piping the body into a mail client.
#[derive(Debug, Clone)]
pub struct MailNotifier {
    program: String,
    receivers: Vec<String>,
    sender: Option<String>,
    mail_server: Option<String>,
}

impl MailNotifier {
    /// Create a notifier driving `program` (normally a [`MailClient`]).
    pub fn new(program: impl Into<String>, config: &NotifyConfig) -> Self {
        Self {
            program: program.into(),
            receivers: config.receivers.clone(),
            sender: config.sender.clone(),
            mail_server: config.mail_server.clone(),
        }
    }

    /// Command-line arguments for one message.
    pub fn args(&self, subject: &str) -> Vec<String> {
        let mut args = vec!["-s".to_owned(), subject.to_owned()];
        if let Some(server) = &self.mail_server {
            args.push("-S".to_owned());
            args.push(format!("smtp=smtp://{server}"));
        }
        if let Some(sender) = &self.sender {
            args.push("-S".to_owned());
            args.push(format!("from={sender}"));
        }
        args.extend(self.receivers.iter().cloned());
        args
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let io_err = |source| NotifyError::Io {
            program: self.program.clone(),
            source,
        };

        let mut child = tokio::process::Command::new(&self.program)
            .args(self.args(subject))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(io_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes()).await.map_err(io_err)?;
            stdin.shutdown().await.map_err(io_err)?;
        }

        let status = child.wait().await.map_err(io_err)?;
        if !status.success() {
            return Err(NotifyError::Rejected {
                program: self.program.clone(),
                code: status.code(),
            });
        }
        info!(subject, receivers = self.receivers.len(), "notification sent");
        Ok(())
    }
}

/// Fallback when no receivers are configured: the message only goes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl Notifier for LogOnlyNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        warn!(subject, body, "escalation (no mail receivers configured)");
        Ok(())
    }
}

/// Build the notifier described by `config`.
pub fn from_config(config: &NotifyConfig) -> std::sync::Arc<dyn Notifier> {
    if config.receivers.is_empty() {
        std::sync::Arc::new(LogOnlyNotifier)
    } else {
        std::sync::Arc::new(MailNotifier::new(config.client.program(), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert!(looks_like_email("ops@example.com"));
        assert!(!looks_like_email("ops@example"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("ops.example.com"));
    }

    #[test]
    fn args_include_relay_and_sender() {
        let config = NotifyConfig {
            receivers: vec!["a@b.c".to_owned(), "d@e.f".to_owned()],
            client: MailClient::Mailx,
            sender: Some("hana@b.c".to_owned()),
            mail_server: Some("relay.b.c".to_owned()),
        };
        let notifier = MailNotifier::new("mailx", &config);
        assert_eq!(
            notifier.args("hello"),
            vec![
                "-s",
                "hello",
                "-S",
                "smtp=smtp://relay.b.c",
                "-S",
                "from=hana@b.c",
                "a@b.c",
                "d@e.f"
            ]
        );
    }
}
