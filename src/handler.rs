// ABOUTME: Request orchestration: ingest, normalize, extract, respond
// ABOUTME: Every request resolves to exactly one response and leaves no temp files behind

use crate::artifacts::ArtifactSet;
use crate::config::Config;
use crate::error::{ClipError, Result};
use crate::extract::{extract_clip, FfmpegTranscoder, Transcoder};
use crate::ingest::{ingest, multipart_boundary, IngestOptions};
use crate::params::normalize;
use crate::request::IncomingRequest;
use crate::response::ClipResponse;
use bytes::Bytes;
use futures::Stream;
use http::{header, HeaderMap, Method};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The upload-to-GIF handler. Holds no per-request state.
#[derive(Clone)]
pub struct ClipService {
    config: Arc<Config>,
    transcoder: Arc<dyn Transcoder>,
}

impl ClipService {
    pub fn new(config: Config, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            config: Arc::new(config),
            transcoder,
        }
    }

    /// Service driving the ffmpeg binary named in `config`
    pub fn with_ffmpeg(config: Config) -> Self {
        let transcoder = Arc::new(FfmpegTranscoder::from_config(&config));
        Self::new(config, transcoder)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle one buffered invocation (serverless trigger or base64 body)
    pub async fn handle(&self, req: IncomingRequest) -> ClipResponse {
        info!(method = %req.method, base64 = req.is_base64_encoded, "Clip request");

        if req.method != Method::POST {
            return ClipResponse::error(&ClipError::MethodNotAllowed);
        }

        let mut artifacts = ArtifactSet::new(&self.config.temp_dir);
        let prepared = multipart_boundary(req.content_type())
            .and_then(|boundary| req.decoded_body().map(|body| (boundary, body)));

        let result = match prepared {
            Ok((boundary, body)) => {
                let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
                self.convert(boundary, stream, &mut artifacts).await
            }
            Err(e) => Err(e),
        };

        self.finish(artifacts, result).await
    }

    /// Handle a raw HTTP request whose body is still arriving.
    ///
    /// The body is only polled for POST requests with a multipart
    /// Content-Type, and file parts go to disk as chunks arrive.
    pub async fn handle_stream<S, O, E>(&self, method: Method, headers: &HeaderMap, body: S) -> ClipResponse
    where
        S: Stream<Item = std::result::Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        info!(method = %method, "Clip request (streamed)");

        if method != Method::POST {
            return ClipResponse::error(&ClipError::MethodNotAllowed);
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());

        let mut artifacts = ArtifactSet::new(&self.config.temp_dir);
        let result = match multipart_boundary(content_type) {
            Ok(boundary) => self.convert(boundary, body, &mut artifacts).await,
            Err(e) => Err(e),
        };

        self.finish(artifacts, result).await
    }

    async fn finish(&self, artifacts: ArtifactSet, result: Result<Vec<u8>>) -> ClipResponse {
        artifacts.release().await;

        match &result {
            Ok(gif) => info!(bytes = gif.len(), "Clip converted"),
            Err(e) if e.status_code().is_client_error() => {
                warn!(error = %e, stage = %e.stage(), "Clip request rejected")
            }
            Err(e) => error!(error = %e, stage = %e.stage(), "Clip conversion failed"),
        }

        ClipResponse::from(result)
    }

    async fn convert<S, O, E>(&self, boundary: String, body: S, artifacts: &mut ArtifactSet) -> Result<Vec<u8>>
    where
        S: Stream<Item = std::result::Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let options = IngestOptions {
            max_upload_bytes: self.config.max_upload_bytes,
            buffer_in_memory: self.config.buffer_uploads,
        };
        let upload = ingest(boundary, body, artifacts, options).await?;

        // Only the first file is converted; the rest are just cleaned up
        let file = upload.files.first().ok_or(ClipError::NoFileUploaded)?;
        let input = file.materialize(artifacts).await?;

        let spec = normalize(&upload.fields);
        info!(
            job_id = %artifacts.job_id(),
            file = %file.filename,
            start = spec.start_seconds,
            duration = spec.duration_seconds,
            fps = spec.fps,
            width = spec.width,
            optimize = spec.optimize_palette,
            "Processing clip"
        );

        let output = extract_clip(self.transcoder.as_ref(), &self.config, &input, &spec, artifacts).await?;

        let gif = tokio::fs::read(&output)
            .await
            .map_err(|e| ClipError::OutputRead(e.to_string()))?;

        if gif.is_empty() {
            return Err(ClipError::OutputRead("ffmpeg produced an empty file".into()));
        }

        Ok(gif)
    }
}
