// ABOUTME: Runtime configuration loaded once from the environment
// ABOUTME: Passed by value into the service; nothing here is global or mutable

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default upload ceiling (200 MB)
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;

const DEFAULT_TOOL_TIMEOUT_BASE_SECS: u64 = 30;

const DEFAULT_TOOL_TIMEOUT_PER_CLIP_SECOND: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// ffmpeg executable, resolved through PATH when not absolute
    pub ffmpeg_path: PathBuf,
    /// Directory holding every per-request artifact
    pub temp_dir: PathBuf,
    pub port: u16,
    pub max_upload_bytes: u64,
    /// Keep uploaded parts in memory instead of streaming them to disk
    pub buffer_uploads: bool,
    pub tool_timeout_base: Duration,
    pub tool_timeout_per_clip_second: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            temp_dir: env::temp_dir(),
            port: 8080,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            buffer_uploads: false,
            tool_timeout_base: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_BASE_SECS),
            tool_timeout_per_clip_second: DEFAULT_TOOL_TIMEOUT_PER_CLIP_SECOND as u32,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ffmpeg_path: env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            temp_dir: env::var("GIFCLIP_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_upload_bytes),
            buffer_uploads: env::var("BUFFER_UPLOADS")
                .map(|v| v == "true")
                .unwrap_or(defaults.buffer_uploads),
            tool_timeout_base: env::var("TOOL_TIMEOUT_BASE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout_base),
            tool_timeout_per_clip_second: env::var("TOOL_TIMEOUT_PER_CLIP_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tool_timeout_per_clip_second),
        }
    }

    /// Hard ceiling for one tool invocation on a clip of `duration_seconds`
    pub fn tool_timeout(&self, duration_seconds: f64) -> Duration {
        self.tool_timeout_base
            + Duration::from_secs_f64(duration_seconds.max(0.0))
                * self.tool_timeout_per_clip_second
    }
}
