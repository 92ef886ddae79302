use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static EMAIL_SHAPE: OnceLock<Regex> = OnceLock::new();

fn is_email_shaped(address: &str) -> bool {
    EMAIL_SHAPE
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex compiles"))
        .is_match(address)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("missing recipient address")]
    MissingRecipient,
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
}

/// One form submission, validated and ready to dispatch.
#[derive(Debug, Clone)]
pub struct EmailRequest {
    recipient: String,
    subject: String,
    body: String,
    attachment: Option<PathBuf>,
}

impl EmailRequest {
    pub fn new(
        recipient: &str,
        subject: impl Into<String>,
        body: impl Into<String>,
        attachment: Option<PathBuf>,
    ) -> Result<Self, InvalidRequest> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(InvalidRequest::MissingRecipient);
        }
        if !is_email_shaped(recipient) {
            return Err(InvalidRequest::InvalidRecipient(recipient.to_string()));
        }

        Ok(EmailRequest {
            recipient: recipient.to_string(),
            subject: subject.into(),
            body: body.into(),
            attachment,
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attachment(&self) -> Option<&Path> {
        self.attachment.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailAttachment {
    pub path: PathBuf,
}

/// The message handed to a transport.
///
/// `attachments` is `None` rather than an empty list when the request carried
/// no file, and the key is left out of the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<MailAttachment>>,
}

impl MailMessage {
    pub fn compose(sender: &str, request: &EmailRequest) -> Self {
        MailMessage {
            from: sender.to_string(),
            to: request.recipient().to_string(),
            subject: request.subject().to_string(),
            text: request.body().to_string(),
            attachments: request.attachment().map(|path| {
                vec![MailAttachment {
                    path: path.to_path_buf(),
                }]
            }),
        }
    }
}
