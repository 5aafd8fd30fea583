// ABOUTME: Library root for the video-to-GIF clip service
// ABOUTME: Exposes the request pipeline so the HTTP binary and tests share it

pub mod artifacts;
pub mod config;
pub mod error;
pub mod extract;
pub mod handler;
pub mod ingest;
pub mod params;
pub mod request;
pub mod response;

pub use config::Config;
pub use error::{ClipError, ExtractStage, Result, Stage, ToolError};
pub use extract::{FfmpegTranscoder, ToolInvocation, Transcoder};
pub use handler::ClipService;
pub use params::ClipSpec;
pub use request::{IncomingRequest, TriggerEvent};
pub use response::ClipResponse;
