pub mod file_naming;

use std::io;
use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::settings::AttachmentConfig;
use crate::upload_handler::file_naming::stored_file_name;

/// The only field allowed to carry a file.
pub const ATTACHMENT_FIELD: &str = "attachment";

// Attempts at a free filename when two uploads land in the same millisecond
const NAME_ATTEMPTS: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("malformed multipart payload: {0}")]
    Malformed(#[from] MultipartError),

    #[error("unexpected file field: {0}")]
    UnexpectedField(String),

    #[error("attachment exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("cannot store attachment at {path}: {source}")]
    Storage { path: PathBuf, source: io::Error },
}

fn storage_error(path: &Path) -> impl FnOnce(io::Error) -> UploadError + '_ {
    move |source| UploadError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

/// A file persisted under the attachment directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub file_name: String,
    /// Absolute.
    pub path: PathBuf,
    pub original_name: String,
    pub field_name: String,
}

/// Text fields of the form plus the stored file, if one was sent.
#[derive(Debug, Default)]
pub struct FormSubmission {
    pub email: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub attachment: Option<StoredAttachment>,
}

/// Walk the multipart stream, collecting text fields and writing at most one
/// `attachment` file to `config.directory`.
pub async fn receive_submission(
    mut multipart: Multipart,
    config: &AttachmentConfig,
) -> Result<FormSubmission, UploadError> {
    let mut submission = FormSubmission::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        match (name.as_str(), field.file_name().map(str::to_string)) {
            (ATTACHMENT_FIELD, Some(original)) if original.trim().is_empty() => {
                debug!("Empty file input, treating the submission as text-only");
            }
            (ATTACHMENT_FIELD, Some(original)) => {
                if submission.attachment.is_some() {
                    return Err(UploadError::UnexpectedField(name));
                }
                submission.attachment = Some(store_attachment(field, &original, config).await?);
            }
            (_, Some(_)) => return Err(UploadError::UnexpectedField(name)),
            ("email", None) => submission.email = Some(field.text().await?),
            ("subject", None) => submission.subject = Some(field.text().await?),
            ("message", None) => submission.message = Some(field.text().await?),
            _ => debug!("Ignoring form field {:?}", name),
        }
    }

    Ok(submission)
}

async fn prepare_directory(directory: &Path) -> Result<PathBuf, UploadError> {
    fs::create_dir_all(directory)
        .await
        .map_err(storage_error(directory))?;
    fs::canonicalize(directory)
        .await
        .map_err(storage_error(directory))
}

async fn create_unique(
    directory: &Path,
    original: &str,
) -> Result<(String, PathBuf, File), UploadError> {
    let timestamp = Utc::now().timestamp_millis();

    for attempt in 0..NAME_ATTEMPTS {
        let file_name = stored_file_name(ATTACHMENT_FIELD, timestamp + attempt, original);
        let path = directory.join(&file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file_name, path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(storage_error(&path)(e)),
        }
    }

    let path = directory.join(stored_file_name(ATTACHMENT_FIELD, timestamp, original));
    Err(storage_error(&path)(io::ErrorKind::AlreadyExists.into()))
}

async fn write_field(
    field: &mut Field<'_>,
    file: &mut File,
    path: &Path,
    limit: u64,
) -> Result<u64, UploadError> {
    let mut written: u64 = 0;

    while let Some(chunk) = field.chunk().await? {
        written += chunk.len() as u64;
        if written > limit {
            return Err(UploadError::TooLarge { limit });
        }
        file.write_all(&chunk).await.map_err(storage_error(path))?;
    }

    file.flush().await.map_err(storage_error(path))?;
    Ok(written)
}

async fn store_attachment(
    mut field: Field<'_>,
    original: &str,
    config: &AttachmentConfig,
) -> Result<StoredAttachment, UploadError> {
    let directory = prepare_directory(&config.directory).await?;
    let (file_name, path, mut file) = create_unique(&directory, original).await?;

    match write_field(&mut field, &mut file, &path, config.max_size_bytes).await {
        Ok(size) => {
            info!("Stored attachment {} ({} bytes)", path.display(), size);
            Ok(StoredAttachment {
                file_name,
                path,
                original_name: original.to_string(),
                field_name: ATTACHMENT_FIELD.to_string(),
            })
        }
        Err(e) => {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!("Cannot remove partial upload {}: {}", path.display(), remove_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::TestServer;

    // Echo what the handler stored so tests can inspect it
    fn upload_server(config: AttachmentConfig) -> TestServer {
        let app = Router::new().route(
            "/upload",
            post(move |multipart: Multipart| {
                let config = config.clone();
                async move {
                    match receive_submission(multipart, &config).await {
                        Ok(submission) => (
                            StatusCode::OK,
                            format!(
                                "{}|{}|{}|{}",
                                submission.email.unwrap_or_default(),
                                submission.subject.unwrap_or_default(),
                                submission.message.unwrap_or_default(),
                                submission
                                    .attachment
                                    .map(|a| a.path.display().to_string())
                                    .unwrap_or_default()
                            ),
                        ),
                        Err(UploadError::TooLarge { .. }) => {
                            (StatusCode::PAYLOAD_TOO_LARGE, String::new())
                        }
                        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
                    }
                }
            }),
        );
        TestServer::new(app).unwrap()
    }

    fn config_in(dir: &Path, max_size_bytes: u64) -> AttachmentConfig {
        AttachmentConfig {
            directory: dir.join("attachments"),
            max_size_bytes,
        }
    }

    fn stored_files(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir.join("attachments")) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn text_only_form_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new()
            .add_text("email", "a@example.com")
            .add_text("subject", "Hi")
            .add_text("message", "Hello");
        let response = server.post("/upload").multipart(form).await;

        response.assert_status_ok();
        response.assert_text("a@example.com|Hi|Hello|");
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn attachment_is_written_with_generated_name() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new().add_text("email", "a@example.com").add_part(
            "attachment",
            Part::bytes(b"quarterly numbers".to_vec()).file_name("report.pdf"),
        );
        let response = server.post("/upload").multipart(form).await;
        response.assert_status_ok();

        let files = stored_files(dir.path());
        assert_eq!(files.len(), 1);
        let name = &files[0];
        let timestamp = name
            .strip_prefix("attachment_")
            .and_then(|rest| rest.strip_suffix("_report.pdf"))
            .unwrap();
        assert!(timestamp.parse::<i64>().is_ok(), "{name}");

        let stored_path = response.text().rsplit('|').next().unwrap().to_string();
        assert!(Path::new(&stored_path).is_absolute());
        assert!(stored_path.ends_with(name.as_str()));
        assert_eq!(std::fs::read(&stored_path).unwrap(), b"quarterly numbers");
    }

    #[tokio::test]
    async fn traversal_in_filename_stays_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new().add_part(
            "attachment",
            Part::bytes(b"x".to_vec()).file_name("../../escape.txt"),
        );
        server.post("/upload").multipart(form).await.assert_status_ok();

        let files = stored_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_escape.txt"));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn oversized_attachment_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 8));

        let form = MultipartForm::new().add_part(
            "attachment",
            Part::bytes(vec![b'a'; 64]).file_name("big.bin"),
        );
        let response = server.post("/upload").multipart(form).await;

        response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn file_under_other_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new()
            .add_part("photo", Part::bytes(b"x".to_vec()).file_name("a.png"));
        let response = server.post("/upload").multipart(form).await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.text().contains("photo"));
    }

    #[tokio::test]
    async fn second_attachment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new()
            .add_part("attachment", Part::bytes(b"1".to_vec()).file_name("one.txt"))
            .add_part("attachment", Part::bytes(b"2".to_vec()).file_name("two.txt"));
        let response = server.post("/upload").multipart(form).await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_file_input_counts_as_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = upload_server(config_in(dir.path(), 1024));

        let form = MultipartForm::new()
            .add_text("email", "a@example.com")
            .add_part("attachment", Part::bytes(Vec::new()).file_name(""));
        let response = server.post("/upload").multipart(form).await;

        response.assert_status_ok();
        response.assert_text("a@example.com|||");
        assert!(stored_files(dir.path()).is_empty());
    }
}
