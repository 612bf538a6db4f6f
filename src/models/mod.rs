use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use utoipa::ToSchema;

/// Processing state of a remote file as reported by the Files API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum FileState {
    #[default]
    Unspecified,
    Processing,
    Active,
    Failed,
    Other(String),
}

/// State names that mean the file can be referenced by a generation request.
pub const READY_STATES: &[&str] = &["ACTIVE", "READY", "PROCESSED"];

impl FileState {
    pub fn is_ready(&self) -> bool {
        match self {
            FileState::Active => true,
            FileState::Other(s) => READY_STATES.contains(&s.to_uppercase().as_str()),
            _ => false,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileState::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            FileState::Unspecified => "STATE_UNSPECIFIED",
            FileState::Processing => "PROCESSING",
            FileState::Active => "ACTIVE",
            FileState::Failed => "FAILED",
            FileState::Other(s) => s,
        }
    }
}

impl From<String> for FileState {
    fn from(value: String) -> Self {
        match value.to_uppercase().as_str() {
            "" | "STATE_UNSPECIFIED" => FileState::Unspecified,
            "PROCESSING" => FileState::Processing,
            "ACTIVE" => FileState::Active,
            "FAILED" => FileState::Failed,
            _ => FileState::Other(value),
        }
    }
}

impl From<FileState> for String {
    fn from(value: FileState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File resource owned by the remote service, referenced by `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// Resource name, e.g. `files/abc123`
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    #[schema(value_type = String, example = "ACTIVE")]
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl RemoteFile {
    /// URI used in `file_data` parts; falls back to the resource name.
    pub fn file_uri(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.name)
    }
}

/// Outcome of parsing the model's text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExtractionResult {
    #[serde(rename = "json")]
    Parsed(Value),
    Raw(String),
}

impl ExtractionResult {
    pub fn parsed(&self) -> Option<&Value> {
        match self {
            ExtractionResult::Parsed(v) => Some(v),
            ExtractionResult::Raw(_) => None,
        }
    }

    /// Convenience accessor for the `sort_code` key of a parsed result
    pub fn sort_code(&self) -> Option<&str> {
        self.parsed()?.get("sort_code")?.as_str()
    }

    pub fn account_number(&self) -> Option<&str> {
        self.parsed()?.get("account_number")?.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A banner shown to the user alongside the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub remote_file: RemoteFile,
    pub result: ExtractionResult,
    pub notices: Vec<Notice>,
}
