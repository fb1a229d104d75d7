//! Report delivery by SMTP email via `lettre`.
//!
//! Delivery is best-effort: callers log a failed notification and move on.

use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during notification delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("could not read attachment {path:?}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SMTP error: {0}")]
    Smtp(String),
}

/// Delivers a finished run's reports.
pub trait Notifier {
    fn notify(
        &self,
        subject: &str,
        body: &str,
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError>;

    /// Short channel name for logs.
    fn channel_name(&self) -> &str;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn notify(
        &self,
        subject: &str,
        body: &str,
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError> {
        (**self).notify(subject, body, attachments)
    }

    fn channel_name(&self) -> &str {
        (**self).channel_name()
    }
}

/// Notifier used when delivery is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(
        &self,
        subject: &str,
        _body: &str,
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError> {
        tracing::debug!(%subject, attachments = attachments.len(), "notification disabled");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "none"
    }
}

/// SMTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    /// Port; 465 uses implicit TLS
    pub port: u16,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// STARTTLS on non-465 ports
    pub tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            timeout_secs: 30,
            username: None,
            password: None,
            tls: true,
        }
    }
}

/// Sends the reports as attachments of one email.
pub struct EmailNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    /// Build a notifier from SMTP settings.
    ///
    /// `from` defaults to the SMTP username when not given.
    pub fn from_config(
        smtp: &SmtpConfig,
        from: Option<&str>,
        to: &[String],
    ) -> Result<Self, NotifyError> {
        let from = from
            .or(smtp.username.as_deref())
            .ok_or_else(|| NotifyError::Config("no sender address configured".to_string()))?;
        let from_mailbox: Mailbox = from
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        let to_mailboxes: Vec<Mailbox> = to
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if to_mailboxes.is_empty() {
            return Err(NotifyError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        // Port 465 uses implicit TLS; everything else uses STARTTLS when TLS is enabled.
        let mut builder = if smtp.port == 465 {
            SmtpTransport::relay(&smtp.host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(smtp.port)
        } else if smtp.tls {
            SmtpTransport::starttls_relay(&smtp.host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(smtp.port)
        } else {
            SmtpTransport::builder_dangerous(&smtp.host).port(smtp.port)
        };

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let transport = builder
            .timeout(Some(Duration::from_secs(smtp.timeout_secs)))
            .build();

        Ok(Self {
            transport,
            from: from_mailbox,
            to: to_mailboxes,
        })
    }

    /// Assemble the message without sending it.
    pub fn build_message(
        &self,
        subject: &str,
        body: &str,
        attachments: &[PathBuf],
    ) -> Result<Message, NotifyError> {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
        for path in attachments {
            parts = parts.singlepart(attachment_part(path)?);
        }

        let mut builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        builder
            .subject(subject)
            .multipart(parts)
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

fn attachment_part(path: &Path) -> Result<SinglePart, NotifyError> {
    let content = std::fs::read(path).map_err(|source| NotifyError::Attachment {
        path: path.to_path_buf(),
        source,
    })?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "report.csv".to_string());
    let content_type = ContentType::parse("text/csv")
        .map_err(|e| NotifyError::Config(e.to_string()))?;
    Ok(Attachment::new(filename).body(content, content_type))
}

impl Notifier for EmailNotifier {
    fn notify(
        &self,
        subject: &str,
        body: &str,
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError> {
        let email = self.build_message(subject, body, attachments)?;

        self.transport
            .send(&email)
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        tracing::info!(
            channel = "email",
            %subject,
            recipients = self.to.len(),
            attachments = attachments.len(),
            "notification delivered"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}
