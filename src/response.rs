// ABOUTME: Response encoding for the clip handler
// ABOUTME: Base64 GIF bodies with an explicit encoding flag, JSON error payloads otherwise

use crate::error::{ClipError, Stage};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const GIF_CONTENT_TYPE: &str = "image/gif";

/// Serverless-style response (`{statusCode, headers, body, isBase64Encoded}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// Error payload
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    stage: Stage,
    message: String,
}

impl ClipResponse {
    /// 200 with the GIF inlined as base64
    pub fn gif(data: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(data));

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), GIF_CONTENT_TYPE.to_string());
        headers.insert("Cache-Control".to_string(), "no-store".to_string());
        headers.insert("X-Sha256".to_string(), digest);
        headers.insert("X-Content-Length".to_string(), data.len().to_string());

        Self {
            status_code: 200,
            headers,
            body: BASE64.encode(data),
            is_base64_encoded: true,
        }
    }

    pub fn error(err: &ClipError) -> Self {
        let payload = ErrorBody {
            error: err.code(),
            stage: err.stage(),
            message: err.message(),
        };
        let body = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into());

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if matches!(err, ClipError::MethodNotAllowed) {
            headers.insert("Allow".to_string(), "POST".to_string());
        }

        Self {
            status_code: err.status_code().as_u16(),
            headers,
            body,
            is_base64_encoded: false,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as raw bytes, undoing the transport encoding
    pub fn body_bytes(&self) -> Vec<u8> {
        if self.is_base64_encoded {
            BASE64
                .decode(&self.body)
                .unwrap_or_else(|_| self.body.as_bytes().to_vec())
        } else {
            self.body.as_bytes().to_vec()
        }
    }
}

impl From<std::result::Result<Vec<u8>, ClipError>> for ClipResponse {
    fn from(result: std::result::Result<Vec<u8>, ClipError>) -> Self {
        match result {
            Ok(data) => ClipResponse::gif(&data),
            Err(e) => ClipResponse::error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractStage;

    #[test]
    fn test_gif_response_is_base64_flagged() {
        let resp = ClipResponse::gif(b"GIF89a\x00\xff");

        assert_eq!(resp.status_code, 200);
        assert!(resp.is_base64_encoded);
        assert_eq!(resp.header("content-type"), Some("image/gif"));
        assert_eq!(resp.header("X-Content-Length"), Some("8"));
        assert_eq!(resp.header("x-sha256").map(str::len), Some(64));
        assert_eq!(resp.body_bytes(), b"GIF89a\x00\xff");
    }

    #[test]
    fn test_error_payload_has_stage_and_message() {
        let resp = ClipResponse::error(&ClipError::Extract {
            stage: ExtractStage::Encode,
            message: "exited with exit status: 1".into(),
            diagnostics: "raw ffmpeg noise".into(),
        });

        assert_eq!(resp.status_code, 500);
        assert!(!resp.is_base64_encoded);

        let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(json["error"], "ExtractError");
        assert_eq!(json["stage"], "extract-encode");
        assert!(json["message"].as_str().unwrap().contains("encode"));
        assert!(!resp.body.contains("raw ffmpeg noise"));
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let resp = ClipResponse::error(&ClipError::MethodNotAllowed);
        assert_eq!(resp.status_code, 405);
        assert_eq!(resp.header("allow"), Some("POST"));
    }

    #[test]
    fn test_serializes_as_trigger_response() {
        let json = serde_json::to_value(ClipResponse::gif(b"x")).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["isBase64Encoded"], true);
        assert_eq!(json["headers"]["Content-Type"], "image/gif");
    }
}
