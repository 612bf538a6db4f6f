use crate::config::AppConfig;
use crate::models::{ExtractionOutcome, ExtractionResult, Notice, RemoteFile};
use crate::services::gemini::{GeminiApi, GeminiError};
use crate::utils::validation::{ValidatedImage, ValidationError, validate_upload};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Instruction sent alongside the uploaded image
pub const EXTRACTION_PROMPT: &str = "Extract the sort code and account number from the referenced image. \
Respond ONLY with JSON exactly like {\"sort_code\":\"...\",\"account_number\":\"...\"} and nothing else.";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to stage upload: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("Failed to upload file: {primary} | fallback: {fallback}")]
    Upload {
        primary: GeminiError,
        fallback: GeminiError,
    },

    #[error("{0}")]
    Generation(#[source] GeminiError),
}

impl ExtractError {
    /// Message shown to the user, prefixed with the failing step for remote errors.
    pub fn user_message(&self) -> String {
        match self {
            ExtractError::Upload { .. } => format!("Upload failed: {}", self),
            ExtractError::Generation(e) => format!("Gemini generateContent failed: {}", e),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Timed out waiting for file {name} to be ready after {waited:?}")]
    Timeout { name: String, waited: Duration },

    #[error("Remote processing failed for file {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub model: String,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub max_file_size: usize,
    /// Where uploads are staged; system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl From<&AppConfig> for ExtractionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            poll_timeout: config.poll_timeout(),
            poll_interval: config.poll_interval(),
            max_file_size: config.max_file_size,
            temp_dir: None,
        }
    }
}

/// Parses the model text as JSON, falling back to the raw text.
pub fn parse_model_output(raw: &str) -> (ExtractionResult, Notice) {
    let raw = raw.trim();
    match serde_json::from_str(raw) {
        Ok(value) => (
            ExtractionResult::Parsed(value),
            Notice::success("Extraction result:"),
        ),
        Err(e) => {
            debug!("Model output is not JSON: {}", e);
            (
                ExtractionResult::Raw(raw.to_string()),
                Notice::error("Gemini did not return strict JSON. Raw output shown below:"),
            )
        }
    }
}

/// Runs one upload, poll, generate, parse sequence per call.
pub struct ExtractionService {
    api: Arc<dyn GeminiApi>,
    settings: ExtractionSettings,
}

impl ExtractionService {
    pub fn new(api: Arc<dyn GeminiApi>, settings: ExtractionSettings) -> Self {
        Self { api, settings }
    }

    pub async fn extract(
        &self,
        filename: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<ExtractionOutcome, ExtractError> {
        let image = validate_upload(filename, content_type, data, self.settings.max_file_size)?;
        info!(
            "🖼️  Accepted {} ({}, {}x{}, {} bytes)",
            image.filename,
            image.mime_type,
            image.width,
            image.height,
            data.len()
        );

        let staged = self.stage(&image, data)?;
        let outcome = self.run(staged.path(), &image).await;

        // Deletes the staged copy; dropping the handle does the same on early return
        if let Err(e) = staged.close() {
            warn!("Failed to remove staged upload: {}", e);
        }

        outcome
    }

    fn stage(&self, image: &ValidatedImage, data: &[u8]) -> Result<NamedTempFile, ExtractError> {
        let suffix = format!(".{}", image.extension);
        let mut builder = tempfile::Builder::new();
        builder.prefix("bank-doc-").suffix(&suffix);

        let mut file = match &self.settings.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(ExtractError::TempFile)?;

        file.write_all(data).map_err(ExtractError::TempFile)?;
        file.flush().map_err(ExtractError::TempFile)?;
        debug!("Staged upload at {}", file.path().display());
        Ok(file)
    }

    async fn run(
        &self,
        path: &Path,
        image: &ValidatedImage,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let mut notices = Vec::new();

        let uploaded = self
            .upload_with_fallback(path, &image.mime_type, &image.filename)
            .await?;
        info!("☁️  Uploaded {} as {}", image.filename, uploaded.name);
        notices.push(Notice::info("Uploaded file. Waiting for processing..."));

        let mut file = match self.wait_for_file_ready(&uploaded).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Continuing without a ready file: {}", e);
                notices.push(Notice::warning(format!(
                    "File may not be fully processed but continuing: {}",
                    e
                )));
                uploaded
            }
        };
        if file.mime_type.is_none() {
            file.mime_type = Some(image.mime_type.clone());
        }

        info!("🤖 Calling {} generateContent for {}", self.settings.model, file.name);
        let raw = self
            .api
            .generate_content(&self.settings.model, &file, EXTRACTION_PROMPT)
            .await
            .map_err(ExtractError::Generation)?;

        let (result, notice) = parse_model_output(&raw);
        notices.push(notice);

        Ok(ExtractionOutcome {
            remote_file: file,
            result,
            notices,
        })
    }

    /// Multipart upload first, resumable upload if that fails. Two attempts, no backoff.
    pub async fn upload_with_fallback(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, ExtractError> {
        let primary = match self.api.upload_file(path, mime_type, display_name).await {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };
        warn!("Multipart upload failed, trying resumable upload: {}", primary);

        self.api
            .upload_file_resumable(path, mime_type, display_name)
            .await
            .map_err(|fallback| ExtractError::Upload { primary, fallback })
    }

    /// Polls file status until a ready state, `FAILED`, or the timeout.
    /// Status-call errors are ignored and polling continues. The timeout
    /// also bounds each status call, so a hung request cannot outlast it.
    pub async fn wait_for_file_ready(&self, file: &RemoteFile) -> Result<RemoteFile, PollError> {
        let start = Instant::now();
        let deadline = start + self.settings.poll_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.api.get_file(&file.name)).await {
                Ok(Ok(latest)) if latest.state.is_ready() => {
                    debug!("File {} is {}", latest.name, latest.state);
                    return Ok(latest);
                }
                Ok(Ok(latest)) if latest.state.is_failed() => {
                    return Err(PollError::Failed(latest.name));
                }
                Ok(Ok(latest)) => debug!("File {} is still {}", latest.name, latest.state),
                Ok(Err(e)) => debug!("Status check for {} failed: {}", file.name, e),
                Err(_) => debug!("Status check for {} hit the poll deadline", file.name),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Timeout {
                    name: file.name.clone(),
                    waited: now - start,
                });
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileState;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PNG_1X1: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    fn api_error(message: &str) -> GeminiError {
        GeminiError::Api {
            status: 500,
            message: message.to_string(),
        }
    }

    fn remote(state: FileState) -> RemoteFile {
        RemoteFile {
            name: "files/abc123".to_string(),
            mime_type: Some("image/png".to_string()),
            uri: Some("https://example.test/v1beta/files/abc123".to_string()),
            state,
            ..Default::default()
        }
    }

    /// Scripted stand-in for the remote service
    #[derive(Default)]
    struct FakeGemini {
        fail_upload: bool,
        fail_resumable: bool,
        /// Delay before each `get_file` answers
        status_delay: Option<Duration>,
        /// States returned by successive `get_file` calls; last one repeats
        states: Mutex<VecDeque<Option<FileState>>>,
        reply: Mutex<Option<Result<String, GeminiError>>>,
        staged_paths: Mutex<Vec<PathBuf>>,
        resumable_calls: AtomicUsize,
        get_calls: AtomicUsize,
        generate_calls: AtomicUsize,
    }

    impl FakeGemini {
        fn replying(text: &str) -> Self {
            Self {
                states: Mutex::new(VecDeque::from([Some(FileState::Active)])),
                reply: Mutex::new(Some(Ok(text.to_string()))),
                ..Default::default()
            }
        }

        fn with_states(self, states: Vec<Option<FileState>>) -> Self {
            *self.states.lock().unwrap() = states.into();
            self
        }
    }

    #[async_trait::async_trait]
    impl GeminiApi for FakeGemini {
        async fn upload_file(
            &self,
            path: &Path,
            _mime_type: &str,
            _display_name: &str,
        ) -> Result<RemoteFile, GeminiError> {
            assert!(path.exists());
            self.staged_paths.lock().unwrap().push(path.to_path_buf());
            if self.fail_upload {
                return Err(api_error("upload endpoint missing"));
            }
            Ok(remote(FileState::Processing))
        }

        async fn upload_file_resumable(
            &self,
            path: &Path,
            _mime_type: &str,
            _display_name: &str,
        ) -> Result<RemoteFile, GeminiError> {
            assert!(path.exists());
            self.resumable_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_resumable {
                return Err(api_error("resumable endpoint missing"));
            }
            Ok(remote(FileState::Processing))
        }

        async fn get_file(&self, _name: &str) -> Result<RemoteFile, GeminiError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.status_delay {
                tokio::time::sleep(delay).await;
            }
            let mut states = self.states.lock().unwrap();
            let next = if states.len() > 1 {
                states.pop_front().flatten()
            } else {
                states.front().cloned().flatten()
            };
            next.map(remote).ok_or_else(|| api_error("status unavailable"))
        }

        async fn generate_content(
            &self,
            _model: &str,
            file: &RemoteFile,
            prompt: &str,
        ) -> Result<String, GeminiError> {
            assert_eq!(prompt, EXTRACTION_PROMPT);
            assert!(file.mime_type.is_some());
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(api_error("no reply scripted")))
        }
    }

    fn service(fake: Arc<FakeGemini>) -> ExtractionService {
        let settings = ExtractionSettings {
            model: "gemini-2.0-flash".to_string(),
            poll_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            max_file_size: 1024 * 1024,
            temp_dir: None,
        };
        ExtractionService::new(fake, settings)
    }

    fn staged_path(fake: &FakeGemini) -> PathBuf {
        fake.staged_paths.lock().unwrap()[0].clone()
    }

    #[test]
    fn test_parse_model_output() {
        let (result, notice) =
            parse_model_output(" {\"sort_code\":\"12-34-56\",\"account_number\":\"12345678\"}\n");
        assert_eq!(result.sort_code(), Some("12-34-56"));
        assert_eq!(result.account_number(), Some("12345678"));
        assert_eq!(notice, Notice::success("Extraction result:"));

        let (result, notice) = parse_model_output("```json\n{}\n```");
        assert_eq!(result, ExtractionResult::Raw("```json\n{}\n```".to_string()));
        assert_eq!(notice.level, crate::models::NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_extract_parses_json_and_removes_temp_file() {
        let fake = Arc::new(FakeGemini::replying(
            r#"{"sort_code":"12-34-56","account_number":"87654321"}"#,
        ));
        let outcome = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap();

        assert_eq!(
            outcome.result,
            ExtractionResult::Parsed(serde_json::json!({
                "sort_code": "12-34-56",
                "account_number": "87654321"
            }))
        );
        assert_eq!(outcome.remote_file.state, FileState::Active);
        assert_eq!(outcome.notices.len(), 2);
        assert!(!staged_path(&fake).exists());
    }

    #[tokio::test]
    async fn test_non_json_reply_is_returned_verbatim() {
        let fake = Arc::new(FakeGemini::replying("Sort code: 12-34-56"));
        let outcome = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap();

        assert_eq!(
            outcome.result,
            ExtractionResult::Raw("Sort code: 12-34-56".to_string())
        );
        assert!(!staged_path(&fake).exists());
    }

    #[tokio::test]
    async fn test_upload_falls_back_to_resumable() {
        let fake = Arc::new(FakeGemini {
            fail_upload: true,
            ..FakeGemini::replying("{}")
        });
        let outcome = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap();

        assert_eq!(fake.resumable_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, ExtractionResult::Parsed(serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_both_uploads_failing_aborts_and_cleans_up() {
        let fake = Arc::new(FakeGemini {
            fail_upload: true,
            fail_resumable: true,
            ..FakeGemini::replying("{}")
        });
        let err = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap_err();

        assert!(
            err.user_message()
                .starts_with("Upload failed: Failed to upload file:")
        );
        let message = err.to_string();
        assert!(message.starts_with("Failed to upload file:"));
        assert!(message.contains("upload endpoint missing"));
        assert!(message.contains("| fallback:"));
        assert!(message.contains("resumable endpoint missing"));
        assert_eq!(fake.generate_calls.load(Ordering::SeqCst), 0);
        assert!(!staged_path(&fake).exists());
    }

    #[tokio::test]
    async fn test_poll_timeout_still_generates() {
        let fake = Arc::new(
            FakeGemini::replying(r#"{"sort_code":"1","account_number":"2"}"#)
                .with_states(vec![Some(FileState::Processing)]),
        );
        let outcome = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap();

        assert_eq!(fake.generate_calls.load(Ordering::SeqCst), 1);
        assert!(fake.get_calls.load(Ordering::SeqCst) > 1);
        assert!(outcome.notices.iter().any(|n| {
            n.level == crate::models::NoticeLevel::Warning
                && n.message
                    .starts_with("File may not be fully processed but continuing: Timed out")
        }));
        assert_eq!(outcome.result.sort_code(), Some("1"));
    }

    #[tokio::test]
    async fn test_poll_ignores_status_errors_until_ready() {
        let fake = Arc::new(FakeGemini::replying("{}").with_states(vec![
            None,
            Some(FileState::Processing),
            Some(FileState::from("READY".to_string())),
        ]));
        let svc = service(fake.clone());
        let ready = svc
            .wait_for_file_ready(&remote(FileState::Processing))
            .await
            .unwrap();

        assert!(ready.state.is_ready());
        assert_eq!(fake.get_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hung_status_call_is_cut_off_at_poll_timeout() {
        let fake = Arc::new(FakeGemini {
            status_delay: Some(Duration::from_secs(2)),
            ..FakeGemini::replying("{}").with_states(vec![Some(FileState::Active)])
        });
        let started = std::time::Instant::now();
        let err = service(fake.clone())
            .wait_for_file_ready(&remote(FileState::Processing))
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_state_stops_polling() {
        let fake = Arc::new(FakeGemini::replying("{}").with_states(vec![Some(FileState::Failed)]));
        let err = service(fake.clone())
            .wait_for_file_ready(&remote(FileState::Processing))
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Failed(_)));
        assert_eq!(fake.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_still_removes_temp_file() {
        let fake = Arc::new(FakeGemini::default().with_states(vec![Some(FileState::Active)]));
        let err = service(fake.clone())
            .extract("cheque.png", Some("image/png"), PNG_1X1)
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Generation(_)));
        assert_eq!(
            err.user_message(),
            "Gemini generateContent failed: Gemini API error (500): no reply scripted"
        );
        assert!(!staged_path(&fake).exists());
    }

    #[tokio::test]
    async fn test_invalid_upload_never_reaches_remote() {
        let fake = Arc::new(FakeGemini::replying("{}"));
        let err = service(fake.clone())
            .extract("statement.pdf", Some("application/pdf"), b"%PDF-1.5")
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Validation(_)));
        assert!(fake.staged_paths.lock().unwrap().is_empty());
    }
}
