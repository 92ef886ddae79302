pub mod message;
pub mod oauth;
pub mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use crate::settings::{MailConfig, OAuthCredentials};
use message::MailMessage;
use oauth::ClientCredentials;
use transport::MailCredential;
pub use message::{EmailRequest, InvalidRequest};
pub use oauth::{GoogleTokenProvider, TokenError, TokenProvider};
pub use transport::{DeliveryInfo, SendError, SmtpTransportFactory, TransportFactory};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Send(#[from] SendError),
}

pub struct MailDispatcher {
    credentials: OAuthCredentials,
    timeout: Duration,
    token_provider: Arc<dyn TokenProvider>,
    transports: Arc<dyn TransportFactory>,
}

async fn with_timeout<T, E>(
    limit: Duration,
    on_timeout: E,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout),
    }
}

impl MailDispatcher {
    pub fn new(
        config: &MailConfig,
        token_provider: Arc<dyn TokenProvider>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        MailDispatcher {
            credentials: config.credentials.clone(),
            timeout: config.timeout(),
            token_provider,
            transports,
        }
    }

    /// Fetch a fresh token, then send. A token failure means the transport is
    /// never built.
    pub async fn dispatch(&self, request: &EmailRequest) -> Result<DeliveryInfo, DispatchError> {
        info!("Dispatching email to {}", request.recipient());
        let credential = self.fetch_credential().await.inspect_err(|e| {
            error!("Failed to create access token: {}", e);
        })?;

        let transport = self.transports.connect(&credential)?;
        let message = MailMessage::compose(&credential.sender, request);
        match serde_json::to_string_pretty(&message) {
            Ok(json) => debug!("Sending message {}", json),
            Err(e) => error!("Error converting to JSON: {}", e),
        }

        let info = with_timeout(self.timeout, SendError::Timeout, transport.send(&message))
            .await
            .inspect_err(|e| error!("Failed to send email to {}: {}", message.to, e))?;

        info!("Email sent: {}", info.response);
        Ok(info)
    }

    async fn fetch_credential(&self) -> Result<MailCredential, TokenError> {
        let credentials = ClientCredentials::from_config(&self.credentials)?;
        let access_token = with_timeout(
            self.timeout,
            TokenError::Timeout,
            self.token_provider.fetch_access_token(&credentials),
        )
        .await?;

        Ok(MailCredential::new(credentials, access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail_dispatcher::message::MailAttachment;
    use crate::tests::fakes::{
        complete_credentials, FailingTokenProvider, RecordingTransports, SlowTokenProvider,
        StaticTokenProvider,
    };
    use std::path::PathBuf;

    fn config() -> MailConfig {
        MailConfig {
            credentials: complete_credentials(),
            ..MailConfig::default()
        }
    }

    fn request(attachment: Option<PathBuf>) -> EmailRequest {
        EmailRequest::new("a@example.com", "Hi", "Hello", attachment).unwrap()
    }

    #[tokio::test]
    async fn sends_with_fresh_token_and_sender() {
        let transports = RecordingTransports::default();
        let dispatcher = MailDispatcher::new(
            &config(),
            Arc::new(StaticTokenProvider::new("ya29.fresh")),
            Arc::new(transports.clone()),
        );

        let info = dispatcher.dispatch(&request(None)).await.unwrap();

        assert_eq!(info.response, "250 OK");
        let credentials = transports.credentials();
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].sender, "sender@example.com");
        assert_eq!(credentials[0].access_token.secret(), "ya29.fresh");
        assert_eq!(credentials[0].client_id, "client-id");
        assert_eq!(credentials[0].refresh_token, "refresh-token");

        let sent = transports.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "sender@example.com");
        assert!(sent[0].attachments.is_none());
    }

    #[tokio::test]
    async fn token_is_fetched_for_every_dispatch() {
        let tokens = Arc::new(StaticTokenProvider::new("ya29.fresh"));
        let dispatcher = MailDispatcher::new(
            &config(),
            tokens.clone(),
            Arc::new(RecordingTransports::default()),
        );

        dispatcher.dispatch(&request(None)).await.unwrap();
        dispatcher.dispatch(&request(None)).await.unwrap();

        assert_eq!(tokens.calls(), 2);
    }

    #[tokio::test]
    async fn token_failure_never_reaches_transport() {
        let transports = RecordingTransports::default();
        let dispatcher = MailDispatcher::new(
            &config(),
            Arc::new(FailingTokenProvider),
            Arc::new(transports.clone()),
        );

        let result = dispatcher.dispatch(&request(None)).await;

        assert!(matches!(result, Err(DispatchError::Token(TokenError::Rejected(_)))));
        assert!(transports.credentials().is_empty());
        assert!(transports.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_credentials_fail_at_token_step() {
        let tokens = Arc::new(StaticTokenProvider::new("ya29.fresh"));
        let transports = RecordingTransports::default();
        let dispatcher = MailDispatcher::new(
            &MailConfig::default(),
            tokens.clone(),
            Arc::new(transports.clone()),
        );

        let result = dispatcher.dispatch(&request(None)).await;

        assert!(matches!(
            result,
            Err(DispatchError::Token(TokenError::MissingCredential(_)))
        ));
        assert_eq!(tokens.calls(), 0);
        assert!(transports.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_token_provider_times_out() {
        let transports = RecordingTransports::default();
        let dispatcher = MailDispatcher::new(
            &config(),
            Arc::new(SlowTokenProvider(Duration::from_secs(600))),
            Arc::new(transports.clone()),
        );

        let result = dispatcher.dispatch(&request(None)).await;

        assert!(matches!(result, Err(DispatchError::Token(TokenError::Timeout))));
        assert!(transports.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_transport_times_out() {
        let tokens = Arc::new(StaticTokenProvider::new("ya29.fresh"));
        let transports = RecordingTransports::slow(Duration::from_secs(600));
        let dispatcher = MailDispatcher::new(&config(), tokens.clone(), Arc::new(transports.clone()));

        let result = dispatcher.dispatch(&request(None)).await;

        assert!(matches!(result, Err(DispatchError::Send(SendError::Timeout))));
        assert_eq!(tokens.calls(), 1);
        assert_eq!(transports.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_is_reported_once() {
        let transports = RecordingTransports::failing();
        let dispatcher = MailDispatcher::new(
            &config(),
            Arc::new(StaticTokenProvider::new("ya29.fresh")),
            Arc::new(transports.clone()),
        );

        let result = dispatcher
            .dispatch(&request(Some(PathBuf::from("/tmp/attachment_1_a.txt"))))
            .await;

        assert!(matches!(result, Err(DispatchError::Send(SendError::Transport(_)))));
        let sent = transports.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].attachments,
            Some(vec![MailAttachment {
                path: PathBuf::from("/tmp/attachment_1_a.txt")
            }])
        );
    }
}
