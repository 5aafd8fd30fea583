// ABOUTME: Error types for the clip pipeline
// ABOUTME: Maps every failure to one HTTP status, a pipeline stage tag and a short message

use http::StatusCode;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Rejected before the body was looked at
    Request,
    Ingest,
    Normalize,
    ExtractPalette,
    ExtractEncode,
    ReadOutput,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Ingest => "ingest",
            Stage::Normalize => "normalize",
            Stage::ExtractPalette => "extract-palette",
            Stage::ExtractEncode => "extract-encode",
            Stage::ReadOutput => "read-output",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which external tool pass failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractStage {
    /// Palette generation (optimized path, first pass)
    Palette,
    /// Final GIF encode (simple path, or optimized second pass)
    Encode,
}

impl ExtractStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractStage::Palette => "palette",
            ExtractStage::Encode => "encode",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ExtractStage::Palette => Stage::ExtractPalette,
            ExtractStage::Encode => Stage::ExtractEncode,
        }
    }
}

impl fmt::Display for ExtractStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for a clip request
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("Method not allowed: only POST is accepted")]
    MethodNotAllowed,

    #[error("Content-Type header missing. Send multipart/form-data")]
    MissingContentType,

    #[error("Unsupported Content-Type: {0}")]
    UnsupportedContentType(String),

    /// Body flagged as base64 but not decodable
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Upload exceeds the maximum size of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error("Failed to store upload: {0}")]
    IngestIo(String),

    #[error("No file uploaded")]
    NoFileUploaded,

    /// External tool failure. `diagnostics` holds the tool's stderr and is
    /// for logs only.
    #[error("Conversion failed during {stage} pass: {message}")]
    Extract {
        stage: ExtractStage,
        message: String,
        diagnostics: String,
    },

    #[error("Failed to read converted output: {0}")]
    OutputRead(String),
}

impl ClipError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClipError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ClipError::MissingContentType => StatusCode::BAD_REQUEST,
            ClipError::UnsupportedContentType(_) => StatusCode::BAD_REQUEST,
            ClipError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ClipError::NoFileUploaded => StatusCode::BAD_REQUEST,
            ClipError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ClipError::IngestIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClipError::Extract { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ClipError::OutputRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable taxonomy name used as the `error` field of JSON payloads
    pub fn code(&self) -> &'static str {
        match self {
            ClipError::MethodNotAllowed => "MethodNotAllowed",
            ClipError::MissingContentType => "MissingContentType",
            ClipError::UnsupportedContentType(_) => "UnsupportedContentType",
            ClipError::InvalidBody(_) => "InvalidBody",
            ClipError::UploadTooLarge { .. } => "UploadTooLarge",
            ClipError::IngestIo(_) => "IngestIOError",
            ClipError::NoFileUploaded => "NoFileUploaded",
            ClipError::Extract { .. } => "ExtractError",
            ClipError::OutputRead(_) => "OutputReadError",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ClipError::MethodNotAllowed => Stage::Request,
            ClipError::MissingContentType
            | ClipError::UnsupportedContentType(_)
            | ClipError::InvalidBody(_)
            | ClipError::UploadTooLarge { .. }
            | ClipError::IngestIo(_)
            | ClipError::NoFileUploaded => Stage::Ingest,
            ClipError::Extract { stage, .. } => stage.stage(),
            ClipError::OutputRead(_) => Stage::ReadOutput,
        }
    }

    /// User-facing message. Never includes tool diagnostics.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Failure of a single external tool invocation
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost track of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exited with {status}")]
    Exit { status: String, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ToolError {
    /// Collected diagnostic output, if the tool produced any
    pub fn diagnostics(&self) -> &str {
        match self {
            ToolError::Exit { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Result type alias for clip operations
pub type Result<T> = std::result::Result<T, ClipError>;
