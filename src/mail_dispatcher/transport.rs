use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;
use serde::Serialize;

use super::message::MailMessage;
use super::oauth::{AccessToken, ClientCredentials};
use crate::settings::MailConfig;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("cannot read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("mail transport error: {0}")]
    Transport(String),

    #[error("sending timed out")]
    Timeout,
}

/// Everything the mail provider needs to accept a send for `sender`.
///
/// Only the access token is short-lived; the client registration and refresh
/// token travel with it because some providers want all of them.
#[derive(Clone)]
pub struct MailCredential {
    pub sender: String,
    pub access_token: AccessToken,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl MailCredential {
    pub fn new(credentials: ClientCredentials, access_token: AccessToken) -> Self {
        MailCredential {
            sender: credentials.sender_email,
            access_token,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            refresh_token: credentials.refresh_token,
        }
    }
}

impl fmt::Debug for MailCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |v: &str| if v.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("MailCredential")
            .field("sender", &self.sender)
            .field("access_token", &self.access_token)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("refresh_token", &redacted(&self.refresh_token))
            .finish()
    }
}

/// What the provider said after accepting a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryInfo {
    pub response: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<DeliveryInfo, SendError>;
}

/// Builds a transport bound to one credential.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect(&self, credential: &MailCredential) -> Result<Box<dyn Transport>, SendError>;
}

/// SMTP relay authenticated with XOAUTH2.
#[derive(Debug, Clone)]
pub struct SmtpTransportFactory {
    host: String,
    port: Option<u16>,
    timeout: Duration,
}

impl SmtpTransportFactory {
    pub fn from_config(config: &MailConfig) -> Self {
        SmtpTransportFactory {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            timeout: config.timeout(),
        }
    }
}

impl TransportFactory for SmtpTransportFactory {
    fn connect(&self, credential: &MailCredential) -> Result<Box<dyn Transport>, SendError> {
        debug!("Connecting to {} with {:?}", self.host, credential);
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
            .map_err(|e| SendError::Transport(e.to_string()))?
            .credentials(Credentials::new(
                credential.sender.clone(),
                credential.access_token.secret().to_string(),
            ))
            .authentication(vec![Mechanism::Xoauth2])
            .timeout(Some(self.timeout));

        if let Some(port) = self.port {
            builder = builder.port(port);
        }

        Ok(Box::new(SmtpTransport {
            transport: builder.build(),
        }))
    }
}

pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &MailMessage) -> Result<DeliveryInfo, SendError> {
        let email = build_message(message).await?;

        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        Ok(DeliveryInfo {
            response: format!(
                "{} {}",
                response.code(),
                response.message().collect::<Vec<_>>().join(" ")
            ),
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, SendError> {
    address
        .parse()
        .map_err(|_| SendError::InvalidAddress(address.to_string()))
}

fn guess_content_type(path: &Path) -> ContentType {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    ContentType::parse(mime.as_ref()).unwrap_or(ContentType::TEXT_PLAIN)
}

async fn attachment_part(path: &Path) -> Result<SinglePart, SendError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|source| SendError::Attachment {
            path: path.to_path_buf(),
            source,
        })?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
        .to_string();

    debug!("Attaching {} ({} bytes)", filename, data.len());
    Ok(Attachment::new(filename).body(data, guess_content_type(path)))
}

/// Render a [`MailMessage`] as MIME: plain text alone, or `multipart/mixed`
/// with one part per attachment.
pub async fn build_message(message: &MailMessage) -> Result<Message, SendError> {
    let builder = Message::builder()
        .from(parse_mailbox(&message.from)?)
        .to(parse_mailbox(&message.to)?)
        .subject(message.subject.clone());

    let email = match &message.attachments {
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.text.clone()),
        Some(attachments) => {
            let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(message.text.clone()));
            for attachment in attachments {
                parts = parts.singlepart(attachment_part(&attachment.path).await?);
            }
            builder.multipart(parts)
        }
    };

    email.map_err(|e| SendError::Build(e.to_string()))
}
