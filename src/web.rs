use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use tera::Tera;
use std::sync::Arc;
use crate::mail_dispatcher::{
    DeliveryInfo, DispatchError, EmailRequest, InvalidRequest, MailDispatcher, SendError,
    TokenError,
};
use crate::settings::{AttachmentConfig, ServerConfig};
use crate::upload_handler::{receive_submission, UploadError};
use log::{debug, error, info};

pub const SUCCESS_PAGE: &str = "/success.html";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Invalid(#[from] InvalidRequest),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Upload(UploadError::Malformed(e)) => e.status(),
            AppError::Upload(UploadError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Upload(UploadError::UnexpectedField(_)) => StatusCode::BAD_REQUEST,
            AppError::Upload(UploadError::Storage { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::Dispatch(DispatchError::Send(SendError::InvalidAddress(_))) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Dispatch(DispatchError::Token(TokenError::Timeout))
            | AppError::Dispatch(DispatchError::Send(SendError::Timeout)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            AppError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn respond(self, tera: &Tera) -> Response {
        let status = self.status();
        match self {
            AppError::Upload(e) => (status, format!("Error uploading file: {}", e)).into_response(),
            AppError::Invalid(e) => (status, e.to_string()).into_response(),
            AppError::Dispatch(_) => (
                status,
                render_error(tera, "The email could not be sent. Please try again later."),
            )
                .into_response(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub tera: Arc<Tera>,
    pub dispatcher: Arc<MailDispatcher>,
    pub attachments: AttachmentConfig,
}

pub fn load_templates() -> Result<Tera, tera::Error> {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        ("index.html", include_str!("../templates/index.html")),
        ("success.html", include_str!("../templates/success.html")),
        ("error.html", include_str!("../templates/error.html")),
    ])?;
    Ok(tera)
}

fn render_error(tera: &Tera, error_message: &str) -> Html<String> {
    let mut ctx = tera::Context::new();
    ctx.insert("error_message", error_message);
    match tera.render("error.html", &ctx) {
        Ok(html) => Html(html),
        Err(e) => Html(format!("Error rendering error page: {}", e))
    }
}

fn render_page(tera: &Tera, template: &str) -> Response {
    match tera.render(template, &tera::Context::new()) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Cannot render {}: {}", template, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                render_error(tera, "Page unavailable"),
            )
                .into_response()
        }
    }
}

async fn index(State(state): State<AppState>) -> Response {
    render_page(&state.tera, "index.html")
}

async fn success(State(state): State<AppState>) -> Response {
    render_page(&state.tera, "success.html")
}

async fn relay_submission(
    state: &AppState,
    multipart: Multipart,
) -> Result<DeliveryInfo, AppError> {
    let submission = receive_submission(multipart, &state.attachments).await?;
    if let Some(stored) = &submission.attachment {
        info!(
            "{} {:?} stored as {}",
            stored.field_name, stored.original_name, stored.file_name
        );
    }
    let attachment_path = submission.attachment.map(|stored| stored.path);

    info!("recipient {:?}", submission.email);
    info!("subject {:?}", submission.subject);
    debug!("message {:?}", submission.message);
    info!("attachmentPath {:?}", attachment_path);

    let request = EmailRequest::new(
        submission.email.as_deref().unwrap_or_default(),
        submission.subject.unwrap_or_default(),
        submission.message.unwrap_or_default(),
        attachment_path,
    )?;

    Ok(state.dispatcher.dispatch(&request).await?)
}

async fn send_email(State(state): State<AppState>, multipart: Multipart) -> Response {
    match relay_submission(&state, multipart).await {
        Ok(_) => Redirect::to(SUCCESS_PAGE).into_response(),
        Err(e) => {
            error!("Cannot relay form submission: {}", e);
            e.respond(&state.tera)
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.attachments.request_limit();

    Router::new()
        .route("/", get(index))
        .route(SUCCESS_PAGE, get(success))
        .route("/send_email", post(send_email))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down");
}

pub async fn start_server(server: &ServerConfig, router: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((server.host.as_str(), server.port)).await?;
    info!("Server running on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
