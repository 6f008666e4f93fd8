// Subprocess scan executor
// Runs a nuclei-compatible scanner binary and streams its JSONL output as findings
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scanfleet_core::application::dispatcher::constants::EXECUTOR_TERMINATION_GRACE;
use scanfleet_core::domain::Finding;
use scanfleet_core::port::{ScanError, ScanExecutor, ScanRequest};

/// Environment passed through to the scanner when nothing else is configured
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG"];

/// How much of stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 2048;

/// Subprocess scan executor
///
/// Invocation: `{binary} {extra_args..} -u {target} [-t {rule}..] -jsonl -silent`.
/// The child gets a cleared environment plus the allowlisted variables.
pub struct CommandScanExecutor {
    binary: PathBuf,
    extra_args: Vec<String>,
    env_allowlist: Vec<String>,
    all_rules_dir: Option<PathBuf>,
    termination_grace: Duration,
}

impl CommandScanExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            all_rules_dir: None,
            termination_grace: EXECUTOR_TERMINATION_GRACE,
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_env_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.env_allowlist = allowlist;
        self
    }

    /// Rule directory handed to the scanner for scan-all jobs.
    /// Without it the scanner falls back to its own default rule set.
    pub fn with_all_rules_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.all_rules_dir = dir;
        self
    }

    /// Time between SIGTERM and SIGKILL on cancellation
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    fn build_args(&self, request: &ScanRequest) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push("-u".to_string());
        args.push(request.target.clone());

        for path in &request.rule_paths {
            args.push("-t".to_string());
            args.push(path.display().to_string());
        }
        if request.scan_all && request.rule_paths.is_empty() {
            if let Some(dir) = &self.all_rules_dir {
                args.push("-t".to_string());
                args.push(dir.display().to_string());
            }
        }

        args.push("-jsonl".to_string());
        args.push("-silent".to_string());
        args
    }

    /// Keep only allowlisted variables
    fn filter_env(&self, vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
        vars.filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }

    fn spawn(&self, request: &ScanRequest) -> Result<Child, ScanError> {
        Command::new(&self.binary)
            .args(self.build_args(request))
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::Spawn(format!("{}: {}", self.binary.display(), e)))
    }

    /// SIGTERM first, SIGKILL once the grace runs out
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            info!(pid = %pid, "Sending SIGTERM to scanner");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid = %pid, error = %e, "SIGTERM failed");
            }
            if tokio::time::timeout(self.termination_grace, child.wait())
                .await
                .is_ok()
            {
                debug!(pid = %pid, "Scanner exited after SIGTERM");
                return;
            }
            warn!(pid = %pid, "Scanner ignored SIGTERM, sending SIGKILL");
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill scanner");
        }
    }
}

#[async_trait]
impl ScanExecutor for CommandScanExecutor {
    async fn scan(
        &self,
        request: &ScanRequest,
        findings: Sender<Finding>,
        cancel: CancellationToken,
    ) -> Result<(), ScanError> {
        let mut child = self.spawn(request)?;
        info!(
            job_id = %request.job_id,
            target = %request.target,
            rules = request.rule_paths.len(),
            scan_all = request.scan_all,
            pid = ?child.id(),
            "Scanner started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::Spawn("scanner stdout not captured".to_string()))?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        let mut lines = BufReader::new(stdout).lines();
        let mut emitted = 0usize;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(finding) = parse_finding(&line, &request.target) {
                            emitted += 1;
                            tokio::select! {
                                _ = findings.send(finding) => {}
                                _ = cancel.cancelled() => {
                                    self.terminate(&mut child).await;
                                    return Err(ScanError::Cancelled);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.terminate(&mut child).await;
                        return Err(ScanError::Failed(format!("reading scanner output: {}", e)));
                    }
                },
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Err(ScanError::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| ScanError::Failed(e.to_string()))?,
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                return Err(ScanError::Cancelled);
            }
        };
        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        info!(
            job_id = %request.job_id,
            exit_code = ?status.code(),
            findings = emitted,
            "Scanner finished"
        );

        if status.success() {
            Ok(())
        } else {
            Err(classify_failure(status.code(), &stderr_tail))
        }
    }
}

/// One JSONL record -> Finding; non-JSON lines (banners, progress) are skipped
fn parse_finding(line: &str, target: &str) -> Option<Finding> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let raw: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable scanner line");
            return None;
        }
    };

    let field = |name: &str| raw.get(name).and_then(|v| v.as_str()).map(str::to_string);
    let rule_id = field("template-id").or_else(|| field("template"))?;
    let host = field("host").unwrap_or_else(|| target.to_string());
    let matched_at = field("matched-at");
    let severity = raw
        .get("info")
        .and_then(|info| info.get("severity"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Some(Finding {
        rule_id,
        host,
        matched_at,
        severity,
        raw,
    })
}

fn classify_failure(code: Option<i32>, stderr: &str) -> ScanError {
    let detail = if stderr.trim().is_empty() {
        format!("scanner exited with {:?}", code)
    } else {
        format!("scanner exited with {:?}: {}", code, stderr.trim())
    };

    let lower = stderr.to_lowercase();
    if lower.contains("template") && (lower.contains("could not") || lower.contains("no templates")) {
        ScanError::RuleLoad(detail)
    } else if lower.contains("could not connect")
        || lower.contains("no such host")
        || lower.contains("connection refused")
    {
        ScanError::TargetUnreachable(detail)
    } else {
        ScanError::Failed(detail)
    }
}

/// Drain a stream, keeping only its last STDERR_TAIL_BYTES
async fn read_tail(mut stream: impl AsyncRead + Unpin) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
