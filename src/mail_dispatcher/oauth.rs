use std::fmt;

use async_trait::async_trait;
use log::debug;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RedirectUrl, RefreshToken, RequestTokenError, TokenResponse,
    TokenUrl,
};

use crate::settings::{MailConfig, OAuthCredentials};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid OAuth endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("token provider rejected the request: {0}")]
    Rejected(String),

    #[error("token request failed: {0}")]
    Request(String),

    #[error("token provider returned an empty access token")]
    Empty,

    #[error("token request timed out")]
    Timeout,
}

/// Client registration and refresh token, all present.
#[derive(Clone)]
pub struct ClientCredentials {
    pub sender_email: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl ClientCredentials {
    pub fn from_config(credentials: &OAuthCredentials) -> Result<Self, TokenError> {
        fn require(
            value: &Option<String>,
            name: &'static str,
        ) -> Result<String, TokenError> {
            value
                .as_ref()
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or(TokenError::MissingCredential(name))
        }

        Ok(ClientCredentials {
            sender_email: require(&credentials.sender_email, OAuthCredentials::SENDER_EMAIL)?,
            client_id: require(&credentials.client_id, OAuthCredentials::CLIENT_ID)?,
            client_secret: require(&credentials.client_secret, OAuthCredentials::CLIENT_SECRET)?,
            refresh_token: require(&credentials.refresh_token, OAuthCredentials::REFRESH_TOKEN)?,
        })
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("sender_email", &self.sender_email)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        AccessToken(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Exchange the refresh token for a fresh access token.
    async fn fetch_access_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, TokenError>;
}

/// Refresh-token grant against Google's OAuth2 endpoints.
#[derive(Debug, Clone)]
pub struct GoogleTokenProvider {
    auth_url: AuthUrl,
    token_url: TokenUrl,
    redirect_url: RedirectUrl,
}

fn endpoint<T>(
    url: &str,
    parse: impl FnOnce(String) -> Result<T, oauth2::url::ParseError>,
) -> Result<T, TokenError> {
    parse(url.to_string()).map_err(|e| TokenError::InvalidEndpoint {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

impl GoogleTokenProvider {
    pub fn from_config(config: &MailConfig) -> Result<Self, TokenError> {
        Ok(GoogleTokenProvider {
            auth_url: endpoint(&config.auth_url, AuthUrl::new)?,
            token_url: endpoint(&config.token_url, TokenUrl::new)?,
            redirect_url: endpoint(&config.redirect_url, RedirectUrl::new)?,
        })
    }

    fn client(&self, credentials: &ClientCredentials) -> BasicClient {
        BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(credentials.client_secret.clone())),
            self.auth_url.clone(),
            Some(self.token_url.clone()),
        )
        .set_redirect_uri(self.redirect_url.clone())
    }
}

#[async_trait]
impl TokenProvider for GoogleTokenProvider {
    async fn fetch_access_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, TokenError> {
        debug!("Requesting access token from {}", self.token_url.url());

        let token_result = self
            .client(credentials)
            .exchange_refresh_token(&RefreshToken::new(credentials.refresh_token.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    TokenError::Rejected(response.to_string())
                }
                other => TokenError::Request(other.to_string()),
            })?;

        let secret = token_result.access_token().secret();
        if secret.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(AccessToken::new(secret.clone()))
    }
}
