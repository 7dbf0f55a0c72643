use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{RenderQueueError, Result};

/// Output lines buffered between the engine pipes and the executor.
const OUTPUT_BUFFER: usize = 256;

/// What to render for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RenderMode {
    /// The full frame range
    Animation,
    /// The first frame only, optionally written to a specific directory
    SingleFrame { output_dir: Option<PathBuf> },
}

/// A running render invocation.
#[async_trait]
pub trait RenderProcess: Send {
    /// Next line of combined stdout/stderr, `None` once both pipes close.
    async fn next_line(&mut self) -> Option<String>;

    /// Forcibly terminate the process.
    async fn kill(&mut self) -> Result<()>;

    /// Wait for the process to exit and return its exit code. A process
    /// killed by a signal reports -1.
    async fn wait(&mut self) -> Result<i32>;
}

/// Starts render invocations. The scheduler only sees this boundary.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn start(&self, target: &Path, mode: &RenderMode) -> Result<Box<dyn RenderProcess>>;
}

/// Runs the render engine as a child process.
///
/// Animation: `<engine> -b <file> -a`.
/// Single frame: `<engine> -b <file> [-o <dir>/<stem>####.jpg] -f 1`.
#[derive(Debug, Clone)]
pub struct EngineRunner {
    config: EngineConfig,
}

impl EngineRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn build_args(target: &Path, mode: &RenderMode) -> Vec<String> {
        let mut args = vec!["-b".to_string(), target.to_string_lossy().into_owned()];

        match mode {
            RenderMode::Animation => args.push("-a".to_string()),
            RenderMode::SingleFrame { output_dir } => {
                if let Some(dir) = output_dir {
                    args.push("-o".to_string());
                    args.push(output_pattern(dir, target));
                }
                args.push("-f".to_string());
                args.push("1".to_string());
            }
        }

        args
    }
}

/// `<dir>/<stem>####.jpg`, with forward slashes as the engine expects.
fn output_pattern(dir: &Path, target: &Path) -> String {
    let mut dir = dir.to_string_lossy().replace('\\', "/");
    if !dir.ends_with('/') {
        dir.push('/');
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{}####.jpg", dir, stem)
}

#[async_trait]
impl ProcessRunner for EngineRunner {
    async fn start(&self, target: &Path, mode: &RenderMode) -> Result<Box<dyn RenderProcess>> {
        if let RenderMode::SingleFrame {
            output_dir: Some(dir),
        } = mode
        {
            tokio::fs::create_dir_all(dir).await?;
        }

        let args = Self::build_args(target, mode);
        tracing::info!(
            engine = %self.config.executable.display(),
            args = ?args,
            "Starting render engine"
        );

        let mut child = Command::new(&self.config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RenderQueueError::Spawn(format!("{}: {}", self.config.executable.display(), e))
            })?;

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        Ok(Box::new(EngineProcess { child, line_rx }))
    }
}

/// Forward every line written to `pipe`. Bytes that are not UTF-8 are
/// replaced rather than ending the read, so the pipe is drained until EOF.
async fn forward_lines<R: AsyncRead + Unpin>(pipe: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read render engine output");
                break;
            }
        }
    }
}

struct EngineProcess {
    child: Child,
    line_rx: mpsc::Receiver<String>,
}

#[async_trait]
impl RenderProcess for EngineProcess {
    async fn next_line(&mut self) -> Option<String> {
        self.line_rx.recv().await
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}
