use std::io::Cursor;
use std::path::Path;

/// Maximum image size: 20 MB
pub const MAX_FILE_SIZE: usize = 20 * 1024 * 1024; // 20 MB

/// Extensions the upload widget accepts
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Allowed MIME types: the image formats the extractor accepts
pub const ALLOWED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/jpg", "image/pjpeg"];

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_too_large(&self) -> bool {
        self.code == "FILE_TOO_LARGE"
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// An upload that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    pub filename: String,
    /// Lowercase extension without the dot, e.g. `png`
    pub extension: String,
    /// MIME type detected from content
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Validates file size against maximum limit
pub fn validate_file_size(size: usize, max_size: usize) -> Result<()> {
    if size == 0 {
        return Err(ValidationError::new("EMPTY_FILE", "File appears to be empty"));
    }
    if size > max_size {
        return Err(ValidationError::new(
            "FILE_TOO_LARGE",
            format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        ));
    }
    Ok(())
}

/// Validates MIME type against allowlist
pub fn validate_mime_type(content_type: &str) -> Result<()> {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    if ALLOWED_MIME_TYPES
        .iter()
        .any(|&allowed| allowed == normalized)
    {
        return Ok(());
    }

    Err(ValidationError::new(
        "INVALID_MIME_TYPE",
        format!(
            "MIME type '{}' is not allowed. Only png, jpg and jpeg images are accepted.",
            content_type
        ),
    ))
}

/// Sanitizes filename to prevent path traversal and injection attacks
/// Returns the sanitized filename or an error if the name is invalid
pub fn sanitize_filename(filename: &str) -> Result<String> {
    // Normalise Windows separators so the last component is picked on every platform
    let normalized = filename.replace('\\', "/");
    let name = Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if name.is_empty() {
        return Err(ValidationError::new(
            "INVALID_FILENAME",
            "Filename cannot be empty",
        ));
    }

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.starts_with('.') {
        return Err(ValidationError::new(
            "HIDDEN_FILE",
            "Hidden files (starting with '.') are not allowed",
        ));
    }

    Ok(sanitized)
}

/// Returns the lowercase extension if it is one the extractor accepts
pub fn validate_extension(filename: &str) -> Result<String> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(ValidationError::new(
            "INVALID_EXTENSION",
            format!("File extension '.{}' is not allowed (png, jpg, jpeg)", ext),
        ))
    }
}

/// Checks if file content appears to be executable
pub fn is_executable_content(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }

    // ELF binary (Linux)
    if header.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return true;
    }

    // PE/COFF (Windows .exe, .dll)
    if header.starts_with(&[0x4D, 0x5A]) {
        return true;
    }

    // Mach-O (macOS)
    if header.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || header.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || header.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || header.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return true;
    }

    // Shebang (shell scripts)
    header.starts_with(b"#!")
}

/// Detects the real image type from magic bytes and checks it against the claimed one.
/// Returns the detected MIME type.
pub fn verify_magic_bytes(data: &[u8], claimed_mime: Option<&str>) -> Result<String> {
    if data.is_empty() {
        return Err(ValidationError::new("EMPTY_FILE", "File appears to be empty"));
    }

    if is_executable_content(data) {
        return Err(ValidationError::new(
            "EXECUTABLE_CONTENT",
            "File contains executable content which is not allowed",
        ));
    }

    let detected = infer::get(data).map(|kind| kind.mime_type()).ok_or_else(|| {
        ValidationError::new("UNKNOWN_CONTENT", "Could not detect an image format from content")
    })?;
    validate_mime_type(detected)?;

    // Browsers send image/jpg or image/pjpeg for jpeg; treat same category as a match
    if let Some(claimed) = claimed_mime {
        let claimed = claimed.split(';').next().unwrap_or("").trim().to_lowercase();
        let generic = claimed.is_empty() || claimed == "application/octet-stream";
        if !generic && validate_mime_type(&claimed).is_err() {
            return Err(ValidationError::new(
                "INVALID_MIME_TYPE",
                format!("MIME type '{}' is not allowed", claimed),
            ));
        }
        let claimed_is_png = claimed == "image/png";
        let detected_is_png = detected == "image/png";
        if !generic && claimed_is_png != detected_is_png {
            return Err(ValidationError::new(
                "MIME_MISMATCH",
                format!(
                    "Content looks like '{}' but was uploaded as '{}'",
                    detected, claimed
                ),
            ));
        }
    }

    Ok(detected.to_string())
}

/// Reads image dimensions without decoding the full bitmap
pub fn image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    image::io::Reader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ValidationError::new("INVALID_IMAGE", e.to_string()))?
        .into_dimensions()
        .map_err(|e| {
            ValidationError::new("INVALID_IMAGE", format!("Image could not be read: {}", e))
        })
}

/// Full validation pipeline for uploaded images
pub fn validate_upload(
    filename: &str,
    content_type: Option<&str>,
    data: &[u8],
    max_size: usize,
) -> Result<ValidatedImage> {
    // 1. Size check
    validate_file_size(data.len(), max_size)?;

    // 2. Sanitize filename, then the extension allowlist
    let filename = sanitize_filename(filename)?;
    let extension = validate_extension(&filename)?;

    // 3. Magic bytes verification against the claimed MIME type
    let mime_type = verify_magic_bytes(data, content_type)?;

    // 4. Header must describe a readable image
    let (width, height) = image_dimensions(data)?;

    Ok(ValidatedImage {
        filename,
        extension,
        mime_type,
        width,
        height,
    })
}
