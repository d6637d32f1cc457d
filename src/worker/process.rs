//! Task process: spawn, drain output, terminate.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkerError;

/// Cap on each of stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Per-task artifact directory, relative to the task's working directory.
pub const OUTPUT_DIR_NAME: &str = ".agent-output";

/// What a finished process produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub duration: Duration,
}

/// A running task process.
pub struct TaskProcess {
    task_id: Uuid,
    child: Child,
    pgid: Option<i32>,
    stdout: OutputReader,
    stderr: OutputReader,
    output_dir: PathBuf,
    started: Instant,
}

/// Resolve a task's `dir` against the worker's base directory.
pub fn resolve_dir(base: &Path, dir: &str) -> PathBuf {
    let dir = dir.trim();
    if dir.is_empty() {
        base.to_path_buf()
    } else if let Some(rest) = dir.strip_prefix("~/") {
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => base.join(rest),
        }
    } else {
        base.join(dir)
    }
}

impl TaskProcess {
    /// Launch `command` with `prompt` appended, in `dir`.
    pub fn spawn(
        command: &[String],
        prompt: &str,
        dir: &Path,
        task_id: Uuid,
    ) -> Result<Self, WorkerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WorkerError::Spawn("no command configured".to_string()))?;

        if !dir.is_dir() {
            return Err(WorkerError::Spawn(format!(
                "directory not found: {}",
                dir.display()
            )));
        }

        let output_dir = dir.join(OUTPUT_DIR_NAME).join(task_id.to_string());
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            WorkerError::Spawn(format!(
                "cannot create output dir {}: {e}",
                output_dir.display()
            ))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(prompt)
            .current_dir(dir)
            .env("AGENT_TASK_ID", task_id.to_string())
            .env("AGENT_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{program}: {e}")))?;

        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        let stdout = OutputReader::new(match child.stdout.take() {
            Some(out) => tokio::spawn(read_capped(out, MAX_OUTPUT_BYTES)),
            None => tokio::spawn(async { String::new() }),
        });
        let stderr = OutputReader::new(match child.stderr.take() {
            Some(err) => tokio::spawn(read_capped(err, MAX_OUTPUT_BYTES)),
            None => tokio::spawn(async { String::new() }),
        });

        debug!(task_id = %task_id, pid = ?pgid, dir = %dir.display(), "Task process spawned");

        Ok(Self {
            task_id,
            child,
            pgid,
            stdout,
            stderr,
            output_dir,
            started: Instant::now(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM the process group, then SIGKILL after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        self.signal_group(Signal::Term);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(task_id = %self.task_id, grace_secs = grace.as_secs(), "Process ignored SIGTERM, killing");
                self.signal_group(Signal::Kill);
                if let Err(e) = self.child.kill().await {
                    debug!(task_id = %self.task_id, error = %e, "Kill after grace failed");
                }
            }
        }
    }

    fn signal_group(&self, signal: Signal) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid {
                let sig = match signal {
                    Signal::Term => libc::SIGTERM,
                    Signal::Kill => libc::SIGKILL,
                };
                unsafe {
                    libc::kill(-pgid, sig);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }

    /// Collect output after the process has exited.
    ///
    /// Children left behind in the group may still hold the pipes open. They
    /// get `drain` to let go, then the whole group is SIGKILLed and anything
    /// still unread is given up. Safe to cancel and call again.
    pub async fn collect(
        &mut self,
        status: std::io::Result<ExitStatus>,
        drain: Duration,
    ) -> ProcessOutput {
        let duration = self.started.elapsed();

        if !self.drain_readers(drain).await {
            warn!(
                task_id = %self.task_id,
                drain_ms = drain.as_millis() as u64,
                "Output still open after exit, killing process group"
            );
            self.signal_group(Signal::Kill);
            if !self.drain_readers(drain).await {
                self.stdout.abort();
                self.stderr.abort();
            }
        }
        let stdout = self.stdout.take();
        let stderr = self.stderr.take();

        match status {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let error = if status.success() {
                    None
                } else if stderr.trim().is_empty() {
                    Some(format!("process exited with {status}"))
                } else {
                    Some(stderr.trim().to_string())
                };
                ProcessOutput {
                    output: stdout,
                    exit_code,
                    error,
                    duration,
                }
            }
            Err(e) => ProcessOutput {
                output: stdout,
                exit_code: -1,
                error: Some(format!("wait failed: {e}")),
                duration,
            },
        }
    }

    async fn drain_readers(&mut self, limit: Duration) -> bool {
        let (stdout, stderr) = (&mut self.stdout, &mut self.stderr);
        tokio::time::timeout(limit, async {
            stdout.wait().await;
            stderr.wait().await;
        })
        .await
        .is_ok()
    }
}

/// A pipe reader task whose result survives a cancelled wait.
struct OutputReader {
    handle: JoinHandle<String>,
    text: Option<String>,
}

impl OutputReader {
    fn new(handle: JoinHandle<String>) -> Self {
        Self { handle, text: None }
    }

    async fn wait(&mut self) {
        if self.text.is_none() {
            let text = (&mut self.handle).await.unwrap_or_default();
            self.text = Some(text);
        }
    }

    fn abort(&mut self) {
        if self.text.is_none() {
            self.handle.abort();
            self.text = Some(String::new());
        }
    }

    /// The captured text. Empty if the reader never finished.
    fn take(&mut self) -> String {
        self.text.replace(String::new()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Read to EOF, keeping at most `cap` bytes. The rest is drained so the child
/// never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
                if n > room {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}
