// ABOUTME: Multipart/form-data ingestion for clip uploads
// ABOUTME: Streams file parts into registered temp files and collects scalar fields

use crate::artifacts::{sanitize_filename, ArtifactRole, ArtifactSet};
use crate::error::{ClipError, Result};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use multer::{Constraints, Multipart, SizeLimit};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Scalar form fields. A repeated name keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet(HashMap<String, String>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = FieldSet::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// Where an uploaded part's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStorage {
    /// Registered temp file (already closed)
    Disk(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    /// Client filename reduced to its last path component
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub storage: FileStorage,
}

impl UploadedFile {
    /// Path the external tool can read. In-memory uploads are written to a
    /// newly registered input artifact first.
    pub async fn materialize(&self, artifacts: &mut ArtifactSet) -> Result<PathBuf> {
        match &self.storage {
            FileStorage::Disk(path) => Ok(path.clone()),
            FileStorage::Memory(data) => {
                let path = artifacts.register(ArtifactRole::Input, &format!("input_{}", self.filename));
                tokio::fs::write(&path, data)
                    .await
                    .map_err(|e| ClipError::IngestIo(format!("writing {}: {}", self.filename, e)))?;
                Ok(path)
            }
        }
    }
}

/// Parsed multipart body
#[derive(Debug, Default)]
pub struct Upload {
    pub fields: FieldSet,
    /// In arrival order
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub max_upload_bytes: u64,
    pub buffer_in_memory: bool,
}

/// Validate the Content-Type header and extract the multipart boundary
pub fn multipart_boundary(content_type: Option<&str>) -> Result<String> {
    let content_type = content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .ok_or(ClipError::MissingContentType)?;

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if essence != "multipart/form-data" {
        return Err(ClipError::UnsupportedContentType(essence));
    }

    multer::parse_boundary(content_type).map_err(|_| {
        ClipError::UnsupportedContentType("multipart/form-data without boundary".into())
    })
}

/// Parse a multipart body.
///
/// File parts are written chunk by chunk to paths registered in `artifacts`
/// before the first byte lands, so an aborted upload leaves nothing behind
/// once the set is released.
pub async fn ingest<S, O, E>(
    boundary: String,
    body: S,
    artifacts: &mut ArtifactSet,
    options: IngestOptions,
) -> Result<Upload>
where
    S: Stream<Item = std::result::Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let constraints =
        Constraints::new().size_limit(SizeLimit::new().whole_stream(options.max_upload_bytes));
    let mut multipart = Multipart::with_constraints(body, boundary, constraints);
    let mut upload = Upload::default();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().unwrap_or_default().to_string();

        let Some(original_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await.map_err(multipart_error)?;
            debug!(field = %field_name, "Received form field");
            upload.fields.insert(field_name, value);
            continue;
        };

        let filename = sanitize_filename(&original_name);
        let content_type = field.content_type().map(|m| m.to_string());
        info!(field = %field_name, filename = %filename, content_type = ?content_type, "Receiving file");

        let (storage, size) = if options.buffer_in_memory {
            let mut buf = BytesMut::new();
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                buf.extend_from_slice(&chunk);
            }
            let size = buf.len() as u64;
            (FileStorage::Memory(buf.freeze()), size)
        } else {
            let suffix = format!("in{}_{}", upload.files.len(), filename);
            let path = artifacts.register(ArtifactRole::Input, &suffix);
            let size = stream_to_file(&mut field, &path, &filename).await?;
            (FileStorage::Disk(path), size)
        };

        info!(filename = %filename, bytes = size, "Upload stored");
        upload.files.push(UploadedFile {
            field_name,
            filename,
            content_type,
            size,
            storage,
        });
    }

    Ok(upload)
}

async fn stream_to_file(field: &mut multer::Field<'_>, path: &Path, filename: &str) -> Result<u64> {
    let io_error = |e: std::io::Error| ClipError::IngestIo(format!("writing {}: {}", filename, e));

    let mut file = tokio::fs::File::create(path).await.map_err(io_error)?;
    let mut written: u64 = 0;

    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        file.write_all(&chunk).await.map_err(io_error)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(io_error)?;
    // Closed here so the tool never sees a half-flushed input
    drop(file);

    Ok(written)
}

fn multipart_error(e: multer::Error) -> ClipError {
    match e {
        multer::Error::StreamSizeExceeded { limit } => ClipError::UploadTooLarge { limit },
        other => ClipError::IngestIo(format!("multipart parse failed: {}", other)),
    }
}
