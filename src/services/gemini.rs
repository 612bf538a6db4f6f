//! Client for the Gemini Files API and `generateContent`.
//!
//! The [`GeminiApi`] trait is the boundary the extraction pipeline talks to;
//! [`GeminiClient`] is the reqwest implementation used in production.

use crate::config::AppConfig;
use crate::models::RemoteFile;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const API_VERSION: &str = "v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gemini API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode {context}: {message}")]
    Decode {
        context: &'static str,
        message: String,
    },

    #[error("Resumable upload did not return an upload URL")]
    MissingUploadUrl,

    #[error("Gemini returned no text: {0}")]
    EmptyResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Remote operations the extractor needs from Gemini
#[async_trait::async_trait]
pub trait GeminiApi: Send + Sync {
    /// Single-request multipart upload of a local file
    async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, GeminiError>;

    /// Two-step resumable upload of a local file
    async fn upload_file_resumable(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, GeminiError>;

    /// Fetch fresh metadata for a remote file by resource name
    async fn get_file(&self, name: &str) -> Result<RemoteFile, GeminiError>;

    /// Ask `model` about `file` and return the concatenated response text
    async fn generate_content(
        &self,
        model: &str,
        file: &RemoteFile,
        prompt: &str,
    ) -> Result<String, GeminiError>;
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: RemoteFile,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    File {
        #[serde(rename = "fileData")]
        file_data: FileData<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Result<String, GeminiError> {
        let block_reason = self.prompt_feedback.and_then(|f| f.block_reason);
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(GeminiError::EmptyResponse(match block_reason {
                Some(reason) => format!("prompt blocked ({})", reason),
                None => "no candidates".to_string(),
            }));
        };

        let texts: Vec<String> = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        // Blank text is still an answer; only a reply without text parts is empty
        if texts.is_empty() {
            return Err(GeminiError::EmptyResponse(format!(
                "finish reason {}",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(texts.concat())
    }
}

/// reqwest-backed Gemini client. Build once and share.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GeminiError> {
        // Trailing slash so `join` appends instead of replacing the last segment
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, GeminiError> {
        Self::new(
            &config.gemini_base_url,
            &config.gemini_api_key,
            config.request_timeout(),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, GeminiError> {
        Ok(self.base_url.join(path)?)
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert(API_KEY_HEADER, value);
        }
        headers
    }

    fn file_resource(name: &str) -> String {
        if name.starts_with("files/") {
            name.to_string()
        } else {
            format!("files/{}", name)
        }
    }

    async fn error_from(response: reqwest::Response) -> GeminiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => match envelope.error.status {
                Some(s) => format!("{} ({})", envelope.error.message, s),
                None => envelope.error.message,
            },
            Err(_) if body.trim().is_empty() => "empty response body".to_string(),
            Err(_) => body,
        };
        GeminiError::Api { status, message }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &'static str,
    ) -> Result<T, GeminiError> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| GeminiError::Decode {
            context,
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl GeminiApi for GeminiClient {
    async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, GeminiError> {
        let content = tokio::fs::read(path).await?;
        let mut url = self.endpoint(&format!("upload/{}/files", API_VERSION))?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");

        let metadata = serde_json::json!({ "file": { "display_name": display_name } });
        let metadata_part = reqwest::multipart::Part::text(metadata.to_string())
            .mime_str(mime::APPLICATION_JSON.essence_str())?;
        let file_part = reqwest::multipart::Part::bytes(content)
            .file_name(display_name.to_string())
            .mime_str(mime_type)?;
        let form = reqwest::multipart::Form::new()
            .part("metadata", metadata_part)
            .part("file", file_part);

        tracing::debug!("Multipart upload of {} to {}", display_name, url.path());
        let response = self
            .http
            .post(url)
            .headers(self.auth_headers())
            .multipart(form)
            .send()
            .await?;

        let envelope: FileEnvelope = Self::read_json(response, "upload response").await?;
        Ok(envelope.file)
    }

    async fn upload_file_resumable(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, GeminiError> {
        let content = tokio::fs::read(path).await?;
        let url = self.endpoint(&format!("upload/{}/files", API_VERSION))?;

        tracing::debug!("Starting resumable upload of {}", display_name);
        let start = self
            .http
            .post(url)
            .headers(self.auth_headers())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", content.len())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        if !start.status().is_success() {
            return Err(Self::error_from(start).await);
        }

        let upload_url = start
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or(GeminiError::MissingUploadUrl)?;

        let response = self
            .http
            .post(upload_url)
            .headers(self.auth_headers())
            .header(CONTENT_LENGTH, content.len())
            .header(CONTENT_TYPE, mime_type)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(content)
            .send()
            .await?;

        let envelope: FileEnvelope = Self::read_json(response, "resumable upload response").await?;
        Ok(envelope.file)
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile, GeminiError> {
        let url = self.endpoint(&format!("{}/{}", API_VERSION, Self::file_resource(name)))?;
        let response = self
            .http
            .get(url)
            .headers(self.auth_headers())
            .send()
            .await?;
        Self::read_json(response, "file metadata").await
    }

    async fn generate_content(
        &self,
        model: &str,
        file: &RemoteFile,
        prompt: &str,
    ) -> Result<String, GeminiError> {
        let model = model.strip_prefix("models/").unwrap_or(model);
        let url = self.endpoint(&format!(
            "{}/models/{}:generateContent",
            API_VERSION, model
        ))?;

        let mime_type = file.mime_type.as_deref().unwrap_or(DEFAULT_MIME_TYPE);
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::File {
                        file_data: FileData {
                            mime_type,
                            file_uri: file.file_uri(),
                        },
                    },
                    Part::Text { text: prompt },
                ],
            }],
        };

        let response = self
            .http
            .post(url)
            .headers(self.auth_headers())
            .json(&request)
            .send()
            .await?;

        let parsed: GenerateContentResponse =
            Self::read_json(response, "generateContent response").await?;
        parsed.into_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client =
            GeminiClient::new("http://localhost:9000/proxy/", "k", Duration::from_secs(1)).unwrap();
        let url = client.endpoint("v1beta/files/abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/proxy/v1beta/files/abc");

        let url = client
            .endpoint("v1beta/models/gemini-2.0-flash:generateContent")
            .unwrap();
        assert_eq!(
            url.path(),
            "/proxy/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_file_resource_prefix() {
        assert_eq!(GeminiClient::file_resource("abc"), "files/abc");
        assert_eq!(GeminiClient::file_resource("files/abc"), "files/abc");
    }

    #[test]
    fn test_generate_request_shape() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::File {
                        file_data: FileData {
                            mime_type: "image/png",
                            file_uri: "https://example/files/abc",
                        },
                    },
                    Part::Text { text: "hello" },
                ],
            }],
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(
            v["contents"][0]["parts"][0]["fileData"]["fileUri"],
            "https://example/files/abc"
        );
        assert_eq!(v["contents"][0]["parts"][0]["fileData"]["mimeType"], "image/png");
        assert_eq!(v["contents"][0]["parts"][1]["text"], "hello");
    }

    #[test]
    fn test_response_text_concatenates_parts() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"sort_code\":" }, { "text": "\"1\"}" }] },
                "finishReason": "STOP"
            }]
        });
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "{\"sort_code\":\"1\"}");
    }

    #[test]
    fn test_blank_text_is_returned_not_rejected() {
        let raw = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "   \n" }] }, "finishReason": "STOP" }]
        });
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "   \n");

        let raw = serde_json::json!({
            "candidates": [{ "content": { "parts": [] }, "finishReason": "MAX_TOKENS" }]
        });
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let err = parsed.into_text().unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS"));
    }

    #[test]
    fn test_response_without_candidates() {
        let raw = serde_json::json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let err = parsed.into_text().unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }
}
