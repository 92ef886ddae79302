use serde::Deserialize;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use backtrace::Backtrace;
use log::error;

pub const DEFAULT_SETTINGS_PATH: &str = "src/resources/settings.yaml";

// Main configuration struct
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3005,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AttachmentConfig {
    pub directory: PathBuf,
    pub max_size_bytes: u64,
}

impl AttachmentConfig {
    /// Body limit for a whole submission: the attachment plus room for the text fields.
    pub fn request_limit(&self) -> usize {
        usize::try_from(self.max_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(1024 * 1024)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        AttachmentConfig {
            directory: PathBuf::from("./attachments"),
            max_size_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: Option<u16>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_url: String,
    pub timeout_seconds: u64,
    pub credentials: OAuthCredentials,
}

impl MailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        MailConfig {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            redirect_url: "https://developers.google.com/oauthplayground".to_string(),
            timeout_seconds: 30,
            credentials: OAuthCredentials::default(),
        }
    }
}

/// Sender identity and OAuth client registration.
///
/// Every field may be missing at load time; the dispatcher reports the gap
/// when it first needs a token.
#[derive(Deserialize, Clone, Default)]
#[serde(default)]
pub struct OAuthCredentials {
    pub sender_email: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl OAuthCredentials {
    pub const SENDER_EMAIL: &'static str = "SENDER_EMAIL";
    pub const CLIENT_ID: &'static str = "OAUTH_CLIENT_ID";
    pub const CLIENT_SECRET: &'static str = "OAUTH_CLIENT_SECRET";
    pub const REFRESH_TOKEN: &'static str = "OAUTH_REFRESH_TOKEN";

    /// Overwrites fields with any non-empty value `lookup` returns for their variable.
    pub fn overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields = [
            (Self::SENDER_EMAIL, &mut self.sender_email),
            (Self::CLIENT_ID, &mut self.client_id),
            (Self::CLIENT_SECRET, &mut self.client_secret),
            (Self::REFRESH_TOKEN, &mut self.refresh_token),
        ];
        for (name, field) in fields {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *field = Some(value);
            }
        }
    }
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("OAuthCredentials")
            .field("sender_email", &self.sender_email)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("refresh_token", &redacted(&self.refresh_token))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot open settings file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot deserialize settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

fn log_with_backtrace(err: &SettingsError) {
    error!("Error: {}", err);

    // Capture and print the backtrace
    let backtrace = Backtrace::new();
    error!("Backtrace:\n{:?}", backtrace);
}

/// Reads the YAML file, then overlays OAuth credentials from the environment.
pub fn load_settings(path: &Path) -> Result<Config, SettingsError> {
    let mut config = read_settings_file(path)?;
    validate(&config).inspect_err(log_with_backtrace)?;
    config
        .mail
        .credentials
        .overlay(|name| std::env::var(name).ok());
    Ok(config)
}

fn validate(config: &Config) -> Result<(), SettingsError> {
    if config.mail.timeout_seconds == 0 {
        return Err(SettingsError::Invalid {
            field: "mail.timeout_seconds",
            reason: "must be at least 1",
        });
    }
    Ok(())
}

fn read_settings_file(path: &Path) -> Result<Config, SettingsError> {
    let file = File::open(path).map_err(|source| {
        let err = SettingsError::Open {
            path: path.to_path_buf(),
            source,
        };
        log_with_backtrace(&err);
        err
    })?;

    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    serde_yaml::from_reader(reader).map_err(|source| {
        let err = SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        };
        log_with_backtrace(&err);
        err
    })
}
