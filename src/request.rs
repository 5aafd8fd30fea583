// ABOUTME: Inbound request model for the clip handler
// ABOUTME: Accepts raw HTTP requests and serverless trigger events alike

use crate::error::{ClipError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use serde::Deserialize;
use std::collections::HashMap;

/// One invocation's request. Header lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set by the trigger runtime when `body` holds base64 text
    pub is_base64_encoded: bool,
}

impl IncomingRequest {
    pub fn new(method: Method, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            headers,
            body: body.into(),
            is_base64_encoded: false,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Body bytes ready for multipart parsing. Raw bodies are passed through
    /// untouched so binary parts survive.
    pub fn decoded_body(&self) -> Result<Bytes> {
        if !self.is_base64_encoded {
            return Ok(self.body.clone());
        }

        // Some runtimes wrap long base64 bodies across lines
        let compact: Vec<u8> = self
            .body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();

        BASE64
            .decode(compact)
            .map(Bytes::from)
            .map_err(|e| ClipError::InvalidBody(format!("body is not valid base64: {}", e)))
    }
}

/// Serverless trigger event (`{httpMethod, headers, body, isBase64Encoded}`)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub http_method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl From<TriggerEvent> for IncomingRequest {
    fn from(event: TriggerEvent) -> Self {
        // Unknown verbs still need to reach the handler so it can answer 405
        let method = Method::from_bytes(event.http_method.to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::GET);

        let mut headers = HeaderMap::with_capacity(event.headers.len());
        for (name, value) in &event.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "Dropping unrepresentable trigger header"),
            }
        }

        IncomingRequest {
            method,
            headers,
            body: Bytes::from(event.body.unwrap_or_default()),
            is_base64_encoded: event.is_base64_encoded,
        }
    }
}
