//! Lane execution: runs the external test command for one connector group.

use crate::error::{HarnessError, HarnessResult};
use crate::lane::{LaneCommand, LaneEnvironment};
use crate::matrix::ConnectorGroup;
use crate::outcome::{parse_result_line, ResultLine, TestOutcome, TestStatus};
use crate::report::{LaneReport, LaneStatus};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to keep reading a killed lane's output.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Runs the lane command and records per-test outcomes.
///
/// Test failures are recorded, never retried. Each lane writes only to its
/// own `lane-<n>.log`.
#[derive(Debug, Clone)]
pub struct LaneInvoker {
    command: LaneCommand,
    env: LaneEnvironment,
    log_dir: PathBuf,
}

impl LaneInvoker {
    pub fn new(command: LaneCommand, env: LaneEnvironment, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            env,
            log_dir: log_dir.into(),
        }
    }

    pub fn lane_log_path(&self, lane: usize) -> PathBuf {
        self.log_dir.join(format!("lane-{}.log", lane))
    }

    /// Check that the test command exists and is executable.
    pub fn preflight(&self) -> HarnessResult<PathBuf> {
        let exe = self
            .command
            .executable()
            .ok_or_else(|| HarnessError::ScriptInvocation {
                command: String::new(),
                reason: "empty command".to_string(),
            })?;
        resolve_executable(exe, self.command.working_dir.as_deref())
    }

    /// Execute the command for `group`, streaming output to the lane log.
    pub async fn run_lane(&self, group: &ConnectorGroup) -> HarnessResult<LaneReport> {
        let start = Instant::now();
        let argv = self.command.render(group);
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::ScriptInvocation {
                command: String::new(),
                reason: "empty command".to_string(),
            })?;

        let log_path = self.lane_log_path(group.lane);
        let file = File::create(&log_path)
            .await
            .map_err(|e| HarnessError::io(&log_path, e))?;

        info!(lane = group.lane, connectors = %group.joined(), "Starting lane");
        debug!(lane = group.lane, argv = ?argv, "Lane command");

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(self.env.vars_for(group))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a timeout also reaches the processes the
        // command spawns (cargo's test binary, browsers).
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_error(exe, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut log = LaneLog::new(log_path.clone(), file, start);

        let drain = async {
            while let Some(line) = rx.recv().await {
                log.record(&line).await?;
            }
            child
                .wait()
                .await
                .map_err(|e| HarnessError::io(&log_path, e))
        };

        let waited = if self.command.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(self.command.timeout_secs), drain)
                .await
                .ok()
        } else {
            Some(drain.await)
        };

        let (status, exit_code) = match waited {
            Some(exit) => {
                let exit = exit?;
                let code = exit.code().unwrap_or(-1);
                if exit.success() && !log.has_failures() {
                    (LaneStatus::Passed, code)
                } else {
                    (LaneStatus::Failed, code)
                }
            }
            None => {
                warn!(
                    lane = group.lane,
                    timeout_secs = self.command.timeout_secs,
                    "Lane timed out, killing test command"
                );
                kill_process_group(&child);
                if let Err(e) = child.kill().await {
                    warn!(lane = group.lane, error = %e, "Failed to kill lane command");
                }
                // Keep whatever the lane printed before it was killed.
                let tail = async {
                    while let Some(line) = rx.recv().await {
                        log.record(&line).await?;
                    }
                    Ok::<_, HarnessError>(())
                };
                match tokio::time::timeout(OUTPUT_GRACE, tail).await {
                    Ok(drained) => drained?,
                    Err(_) => warn!(lane = group.lane, "Lane output still open after kill"),
                }
                log.note(&format!(
                    "lane {} timed out after {}s",
                    group.lane, self.command.timeout_secs
                ))
                .await?;
                (LaneStatus::TimedOut, -1)
            }
        };

        let outcomes = log.finish().await.map_err(|e| HarnessError::io(&log_path, e))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let report = LaneReport {
            lane: group.lane,
            connectors: group.connectors().to_vec(),
            status,
            exit_code,
            outcomes,
            log_path,
            duration_ms,
        };

        info!(
            lane = report.lane,
            status = ?report.status,
            passed = report.passed_count(),
            failed = report.failed_count(),
            duration_ms,
            "Lane finished"
        );

        Ok(report)
    }
}

/// Forward output line by line. Bytes that are not valid UTF-8 are
/// replaced, never dropped, so later result lines still reach the log.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read lane output");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own group, see `process_group(0)` at spawn.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Lane log writer that also collects test outcomes.
struct LaneLog {
    path: PathBuf,
    writer: BufWriter<File>,
    outcomes: Vec<TestOutcome>,
    last_mark: Instant,
}

impl LaneLog {
    fn new(path: PathBuf, file: File, start: Instant) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            outcomes: Vec::new(),
            last_mark: start,
        }
    }

    async fn record(&mut self, line: &str) -> HarnessResult<()> {
        self.note(line).await?;

        match parse_result_line(line) {
            Some(ResultLine::Outcome { name, status }) => {
                let now = Instant::now();
                let duration_ms = now.duration_since(self.last_mark).as_millis() as u64;
                self.last_mark = now;
                self.outcomes.push(TestOutcome {
                    name,
                    status,
                    duration_ms,
                });
            }
            Some(ResultLine::Ignored { .. }) => self.last_mark = Instant::now(),
            None => {}
        }
        Ok(())
    }

    async fn note(&mut self, line: &str) -> HarnessResult<()> {
        let written = match self.writer.write_all(line.as_bytes()).await {
            Ok(()) => self.writer.write_all(b"\n").await,
            Err(e) => Err(e),
        };
        written.map_err(|e| HarnessError::io(&self.path, e))
    }

    fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.status == TestStatus::Failed)
    }

    async fn finish(mut self) -> std::io::Result<Vec<TestOutcome>> {
        self.writer.flush().await?;
        Ok(self.outcomes)
    }
}

fn spawn_error(exe: &str, e: std::io::Error) -> HarnessError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => HarnessError::ScriptInvocation {
            command: exe.to_string(),
            reason: e.to_string(),
        },
        _ => HarnessError::io(exe, e),
    }
}

/// Resolve `program` the way a shell would: paths are checked directly,
/// bare names are looked up on `PATH`.
pub fn resolve_executable(program: &str, working_dir: Option<&Path>) -> HarnessResult<PathBuf> {
    let invocation_error = |reason: &str| HarnessError::ScriptInvocation {
        command: program.to_string(),
        reason: reason.to_string(),
    };

    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        let candidate = match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if !candidate.exists() {
            return Err(invocation_error("no such file"));
        }
        if !is_executable(&candidate) {
            return Err(invocation_error("not executable"));
        }
        return Ok(candidate);
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| invocation_error("not found on PATH"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
