// ABOUTME: Clip extraction by driving the external ffmpeg binary
// ABOUTME: One-pass GIF encode, or palette generation followed by a palette-constrained encode

use crate::artifacts::{ArtifactRole, ArtifactSet};
use crate::config::Config;
use crate::error::{ClipError, ExtractStage, Result, ToolError};
use crate::params::ClipSpec;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Resampling filter used for every rescale
const SCALE_FLAGS: &str = "lanczos";

/// Lines of tool stderr kept for diagnostics
const MAX_DIAGNOSTIC_LINES: usize = 200;

/// How the filter graph is passed to the tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterGraph {
    /// Single-input chain (`-vf`)
    Simple(String),
    /// Multi-input graph (`-lavfi`)
    Complex(String),
}

/// One fully specified tool run
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub stage: ExtractStage,
    pub inputs: Vec<PathBuf>,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    pub filter: FilterGraph,
    /// Forced output container; `None` lets the tool infer it from the extension
    pub format: Option<&'static str>,
    /// Loop forever (animated output only)
    pub looped: bool,
    pub output: PathBuf,
}

impl ToolInvocation {
    /// Command-line arguments, program name excluded
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

        for (i, input) in self.inputs.iter().enumerate() {
            // Seek only the clip input; later inputs (the palette) are stills
            if i == 0 {
                args.push("-ss".into());
                args.push(format_seconds(self.start_seconds));
            }
            args.push("-i".into());
            args.push(input.to_string_lossy().into_owned());
        }

        args.push("-t".into());
        args.push(format_seconds(self.duration_seconds));

        match &self.filter {
            FilterGraph::Simple(chain) => {
                args.push("-vf".into());
                args.push(chain.clone());
            }
            FilterGraph::Complex(graph) => {
                args.push("-lavfi".into());
                args.push(graph.clone());
            }
        }

        if self.looped {
            args.push("-loop".into());
            args.push("0".into());
        }
        if let Some(format) = self.format {
            args.push("-f".into());
            args.push(format.into());
        }

        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Seconds with millisecond precision and no trailing zeros
fn format_seconds(seconds: f64) -> String {
    let rendered = format!("{:.3}", seconds.max(0.0));
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn scale_chain(spec: &ClipSpec) -> String {
    format!("fps={},scale={}:-1:flags={}", spec.fps, spec.width, SCALE_FLAGS)
}

/// One-pass encode with the tool's generic color table
pub fn simple_invocation(input: &Path, spec: &ClipSpec, output: &Path) -> ToolInvocation {
    ToolInvocation {
        stage: ExtractStage::Encode,
        inputs: vec![input.to_path_buf()],
        start_seconds: spec.start_seconds,
        duration_seconds: spec.duration_seconds,
        filter: FilterGraph::Simple(scale_chain(spec)),
        format: Some("gif"),
        looped: true,
        output: output.to_path_buf(),
    }
}

/// First optimized pass: analyze the clip into a still palette image
pub fn palette_invocation(input: &Path, spec: &ClipSpec, palette: &Path) -> ToolInvocation {
    ToolInvocation {
        stage: ExtractStage::Palette,
        inputs: vec![input.to_path_buf()],
        start_seconds: spec.start_seconds,
        duration_seconds: spec.duration_seconds,
        filter: FilterGraph::Simple(format!("{},palettegen", scale_chain(spec))),
        format: None,
        looped: false,
        output: palette.to_path_buf(),
    }
}

/// Second optimized pass: quantize the clip through the generated palette
pub fn apply_invocation(input: &Path, palette: &Path, spec: &ClipSpec, output: &Path) -> ToolInvocation {
    ToolInvocation {
        stage: ExtractStage::Encode,
        inputs: vec![input.to_path_buf(), palette.to_path_buf()],
        start_seconds: spec.start_seconds,
        duration_seconds: spec.duration_seconds,
        filter: FilterGraph::Complex(format!("{} [x]; [x][1:v] paletteuse", scale_chain(spec))),
        format: Some("gif"),
        looped: true,
        output: output.to_path_buf(),
    }
}

/// Runs one tool invocation to completion
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation, timeout: Duration) -> std::result::Result<(), ToolError>;
}

/// [`Transcoder`] backed by the ffmpeg CLI
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ffmpeg_path)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn run(&self, invocation: &ToolInvocation, timeout: Duration) -> std::result::Result<(), ToolError> {
        let args = invocation.to_args();
        info!(stage = %invocation.stage, program = %self.program.display(), args = ?args, "Starting ffmpeg");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stderr = child.stderr.take();
        let stage = invocation.stage;

        let run = async move {
            let diagnostics = match stderr {
                Some(stderr) => drain_stderr(stderr, stage).await,
                None => VecDeque::new(),
            };
            let status = child.wait().await;
            (status, diagnostics)
        };

        // Dropping the future on timeout drops the child, which kills it
        let (status, diagnostics) = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ToolError::Timeout(timeout))?;

        let status = status.map_err(|source| ToolError::Wait {
            program: self.program.display().to_string(),
            source,
        })?;

        if status.success() {
            info!(stage = %invocation.stage, output = %invocation.output.display(), "ffmpeg finished");
            Ok(())
        } else {
            Err(ToolError::Exit {
                status: status.to_string(),
                stderr: Vec::from(diagnostics).join("\n"),
            })
        }
    }
}

/// Read stderr to EOF, keeping the last lines for diagnostics.
///
/// The pipe stays open until the tool closes it; lines are decoded lossily
/// since ffmpeg echoes container metadata in whatever encoding it was written.
async fn drain_stderr<R>(stderr: R, stage: ExtractStage) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut diagnostics = VecDeque::with_capacity(MAX_DIAGNOSTIC_LINES);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end_matches(&['\r', '\n'][..]).to_string();
                debug!(stage = %stage, "[ffmpeg] {}", line);
                if diagnostics.len() == MAX_DIAGNOSTIC_LINES {
                    diagnostics.pop_front();
                }
                diagnostics.push_back(line);
            }
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed reading ffmpeg stderr");
                break;
            }
        }
    }

    diagnostics
}

/// Run one invocation, translating tool failures into a stage-tagged error
async fn run_stage(tool: &dyn Transcoder, invocation: &ToolInvocation, timeout: Duration) -> Result<()> {
    tool.run(invocation, timeout).await.map_err(|e| {
        let diagnostics = e.diagnostics().to_string();
        error!(
            stage = %invocation.stage,
            error = %e,
            diagnostics = %diagnostics,
            "ffmpeg invocation failed"
        );
        ClipError::Extract {
            stage: invocation.stage,
            message: e.to_string(),
            diagnostics,
        }
    })
}

/// Produce the GIF for `spec` from `input`.
///
/// Palette and output paths are registered in `artifacts` before the tool is
/// started, so they are cleaned up however the run ends.
pub async fn extract_clip(
    tool: &dyn Transcoder,
    config: &Config,
    input: &Path,
    spec: &ClipSpec,
    artifacts: &mut ArtifactSet,
) -> Result<PathBuf> {
    let timeout = config.tool_timeout(spec.duration_seconds);
    let output = artifacts.register(ArtifactRole::Output, "out.gif");

    if spec.optimize_palette {
        let palette = artifacts.register(ArtifactRole::Palette, "palette.png");

        run_stage(tool, &palette_invocation(input, spec, &palette), timeout).await?;
        // The apply pass consumes the palette, so it strictly follows the first run
        run_stage(tool, &apply_invocation(input, &palette, spec, &output), timeout).await?;
    } else {
        run_stage(tool, &simple_invocation(input, spec, &output), timeout).await?;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn spec() -> ClipSpec {
        ClipSpec {
            start_seconds: 2.0,
            duration_seconds: 3.0,
            fps: 10,
            width: 320,
            optimize_palette: false,
        }
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(0.0), "0");
        assert_eq!(format_seconds(2.0), "2");
        assert_eq!(format_seconds(0.1), "0.1");
        assert_eq!(format_seconds(1.23456), "1.235");
        assert_eq!(format_seconds(60.0), "60");
    }

    #[test]
    fn test_simple_args() {
        let args = simple_invocation(Path::new("/tmp/in.mp4"), &spec(), Path::new("/tmp/out.gif")).to_args();
        assert_eq!(
            args,
            [
                "-hide_banner", "-y", "-ss", "2", "-i", "/tmp/in.mp4", "-t", "3", "-vf",
                "fps=10,scale=320:-1:flags=lanczos", "-loop", "0", "-f", "gif", "/tmp/out.gif",
            ]
        );
    }

    #[test]
    fn test_palette_args() {
        let args = palette_invocation(Path::new("in.mp4"), &spec(), Path::new("p.png")).to_args();
        assert_eq!(
            args,
            [
                "-hide_banner", "-y", "-ss", "2", "-i", "in.mp4", "-t", "3", "-vf",
                "fps=10,scale=320:-1:flags=lanczos,palettegen", "p.png",
            ]
        );
    }

    #[test]
    fn test_apply_args_seek_only_clip_input() {
        let args = apply_invocation(Path::new("in.mp4"), Path::new("p.png"), &spec(), Path::new("o.gif")).to_args();
        assert_eq!(
            args,
            [
                "-hide_banner", "-y", "-ss", "2", "-i", "in.mp4", "-i", "p.png", "-t", "3", "-lavfi",
                "fps=10,scale=320:-1:flags=lanczos [x]; [x][1:v] paletteuse", "-loop", "0", "-f", "gif", "o.gif",
            ]
        );
    }

    /// Records invocations and writes a stub file at each output path
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<ToolInvocation>>,
        fail_stage: Option<ExtractStage>,
    }

    #[async_trait]
    impl Transcoder for Recorder {
        async fn run(&self, invocation: &ToolInvocation, _timeout: Duration) -> std::result::Result<(), ToolError> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.fail_stage == Some(invocation.stage) {
                return Err(ToolError::Exit {
                    status: "exit status: 1".into(),
                    stderr: "moov atom not found".into(),
                });
            }
            std::fs::write(&invocation.output, b"GIF89a").unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_extract_simple_runs_once() {
        let dir = TempDir::new().unwrap();
        let mut artifacts = ArtifactSet::new(dir.path());
        let tool = Recorder::default();

        let out = extract_clip(&tool, &Config::default(), Path::new("in.mp4"), &spec(), &mut artifacts)
            .await
            .unwrap();

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stage, ExtractStage::Encode);
        assert_eq!(calls[0].output, out);
        assert_eq!(artifacts.path_for(ArtifactRole::Palette), None);
    }

    #[tokio::test]
    async fn test_extract_optimized_chains_palette() {
        let dir = TempDir::new().unwrap();
        let mut artifacts = ArtifactSet::new(dir.path());
        let tool = Recorder::default();
        let spec = ClipSpec {
            optimize_palette: true,
            ..spec()
        };

        let out = extract_clip(&tool, &Config::default(), Path::new("in.mp4"), &spec, &mut artifacts)
            .await
            .unwrap();

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].stage, ExtractStage::Palette);
        assert_eq!(calls[1].stage, ExtractStage::Encode);
        assert_eq!(calls[1].inputs[1], calls[0].output);
        assert_eq!(calls[1].output, out);
    }

    #[tokio::test]
    async fn test_palette_failure_skips_apply() {
        let dir = TempDir::new().unwrap();
        let mut artifacts = ArtifactSet::new(dir.path());
        let tool = Recorder {
            fail_stage: Some(ExtractStage::Palette),
            ..Default::default()
        };
        let spec = ClipSpec {
            optimize_palette: true,
            ..spec()
        };

        let err = extract_clip(&tool, &Config::default(), Path::new("in.mp4"), &spec, &mut artifacts)
            .await
            .unwrap_err();

        match err {
            ClipError::Extract { stage, diagnostics, .. } => {
                assert_eq!(stage, ExtractStage::Palette);
                assert_eq!(diagnostics, "moov atom not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(tool.calls.lock().unwrap().len(), 1);
        // Both paths were registered up front
        assert!(artifacts.path_for(ArtifactRole::Output).is_some());
        assert!(artifacts.path_for(ArtifactRole::Palette).is_some());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tool = FfmpegTranscoder::new("/nonexistent/bin/ffmpeg-for-tests");
        let invocation = simple_invocation(Path::new("in.mp4"), &spec(), Path::new("out.gif"));

        let err = tool.run(&invocation, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_collects_stderr() {
        let dir = TempDir::new().unwrap();
        let program = script(dir.path(), "fake-ffmpeg", "echo 'in.mp4: No such file or directory' >&2\nexit 1");
        let tool = FfmpegTranscoder::new(program);
        let invocation = simple_invocation(Path::new("in.mp4"), &spec(), &dir.path().join("out.gif"));

        let err = tool.run(&invocation, Duration::from_secs(10)).await.unwrap_err();
        match err {
            ToolError::Exit { stderr, .. } => assert!(stderr.contains("No such file")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_stderr_does_not_break_the_run() {
        let dir = TempDir::new().unwrap();
        let program = script(
            dir.path(),
            "latin1-ffmpeg",
            "printf 'title: caf\\351\\n' >&2\ni=0\nwhile [ $i -lt 3000 ]; do echo \"frame=$i fps=30\" >&2; i=$((i+1)); done\nexit 0",
        );
        let tool = FfmpegTranscoder::new(program);
        let invocation = simple_invocation(Path::new("in.mp4"), &spec(), &dir.path().join("out.gif"));

        tool.run(&invocation, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_keeps_last_lines_lossily() {
        let mut input = b"caf\xe9\r\n".to_vec();
        for i in 0..(MAX_DIAGNOSTIC_LINES + 50) {
            input.extend_from_slice(format!("frame={}\n", i).as_bytes());
        }
        input.extend_from_slice(b"tail without newline");

        let lines = drain_stderr(&input[..], ExtractStage::Encode).await;

        assert_eq!(lines.len(), MAX_DIAGNOSTIC_LINES);
        assert_eq!(lines.back().map(String::as_str), Some("tail without newline"));
        assert!(!lines.iter().any(|l| l.starts_with("caf")));

        let lines = drain_stderr(&b"caf\xe9\nok\n"[..], ExtractStage::Encode).await;
        assert_eq!(Vec::from(lines), ["caf\u{fffd}", "ok"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_tool_times_out() {
        let dir = TempDir::new().unwrap();
        let program = script(dir.path(), "slow-ffmpeg", "exec sleep 30");
        let tool = FfmpegTranscoder::new(program);
        let invocation = simple_invocation(Path::new("in.mp4"), &spec(), &dir.path().join("out.gif"));

        let err = tool.run(&invocation, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }
}
