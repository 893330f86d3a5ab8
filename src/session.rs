//! One caller's execution context: a supervised worker process and the
//! namespace it holds.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::CellError;
use crate::worker::protocol::{
    Request, Response, ResultKind, MAX_MEMORY_ENV, POLICY_ENV, PRELOAD_ENV, PURE_FALLBACK_ENV,
    WORKER_MODE_ARG,
};

const TRUNCATION_MARKER: &str = "\n… [output truncated]";

/// Outcome of one successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerResult {
    pub kind: ResultKind,
    /// `repr` of the trailing expression; absent for statements and `None`.
    pub result: Option<String>,
    /// LaTeX rendering when one was requested and available.
    pub alt_format: Option<String>,
    pub stdout: String,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub live: bool,
    pub started_at: Option<f64>,
    pub last_used_at: f64,
    pub idle_seconds: f64,
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn unix_seconds_now() -> f64 {
    unix_millis(SystemTime::now()) as f64 / 1000.0
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    async fn send(&mut self, request: &Request) -> Result<(), String> {
        let mut line = serde_json::to_string(request).map_err(|e| format!("encode request: {e}"))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write to worker: {e}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("flush worker stdin: {e}"))
    }

    async fn recv(&mut self) -> Result<Response, String> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| format!("read from worker: {e}"))?;
        if read == 0 {
            return Err("worker exited unexpectedly".to_string());
        }
        serde_json::from_str(line.trim()).map_err(|e| format!("malformed worker response: {e}"))
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!("kill worker: {err}");
        }
    }
}

enum Slot {
    Unstarted,
    Running(WorkerProcess),
    Stopped,
}

struct Worker {
    slot: Slot,
    /// A request was written whose response may still be unread.
    dirty: bool,
}

enum Exchange {
    Reply(Response),
    TimedOut,
    Cancelled,
    Failed(String),
}

pub struct Session {
    id: String,
    settings: Arc<Settings>,
    worker: Mutex<Worker>,
    /// Bumped by `cancel` and `shutdown`; in-flight requests watch it.
    cancel: watch::Sender<u64>,
    /// Unix millis; 0 until the first launch.
    started_at: AtomicU64,
    last_used_at: AtomicU64,
}

impl Session {
    pub fn new(id: impl Into<String>, settings: Arc<Settings>) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            id: id.into(),
            settings,
            worker: Mutex::new(Worker {
                slot: Slot::Unstarted,
                dirty: false,
            }),
            cancel,
            started_at: AtomicU64::new(0),
            last_used_at: AtomicU64::new(unix_millis(SystemTime::now())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Launch the worker unless one is already running.
    pub async fn ensure_started(&self) -> Result<(), CellError> {
        let mut worker = self.worker.lock().await;
        self.start_locked(&mut worker).await
    }

    /// Run `code` in the session's namespace.
    pub async fn evaluate(
        &self,
        code: &str,
        want_alt_format: bool,
        capture_output: bool,
        timeout: Option<Duration>,
    ) -> Result<WorkerResult, CellError> {
        let mut cancel = self.cancel.subscribe();
        let mut worker = self.worker.lock().await;
        if cancel.has_changed().unwrap_or(true) {
            return Err(CellError::Process("cancelled".to_string()));
        }
        self.prepare_locked(&mut worker).await?;

        let limit = timeout.unwrap_or(self.settings.eval_timeout);
        let request = Request::Execute {
            id: Uuid::new_v4().to_string(),
            code: code.to_string(),
            want_alt_format,
            capture_output,
        };
        match self.exchange(&mut worker, &request, limit, &mut cancel).await {
            Exchange::Reply(response) => {
                self.touch();
                match self.decode(response) {
                    Some(outcome) => outcome,
                    None => {
                        self.restart_locked(&mut worker).await;
                        Err(CellError::Process(
                            "unexpected acknowledgement to an execute request".to_string(),
                        ))
                    }
                }
            }
            Exchange::TimedOut => {
                warn!(session = %self.id, timeout = ?limit, "evaluation timed out, restarting worker");
                self.restart_locked(&mut worker).await;
                Err(CellError::Timeout(limit))
            }
            Exchange::Cancelled => {
                self.kill_locked(&mut worker).await;
                Err(CellError::Process("cancelled".to_string()))
            }
            Exchange::Failed(message) => {
                warn!(session = %self.id, "worker failed: {message}");
                self.restart_locked(&mut worker).await;
                Err(CellError::Process(message))
            }
        }
    }

    /// Replace the namespace with a freshly preloaded one.
    pub async fn reset(&self) -> Result<(), CellError> {
        let mut cancel = self.cancel.subscribe();
        let mut worker = self.worker.lock().await;
        self.prepare_locked(&mut worker).await?;

        let request = Request::Reset {
            id: Uuid::new_v4().to_string(),
        };
        let limit = self.settings.eval_timeout;
        match self.exchange(&mut worker, &request, limit, &mut cancel).await {
            Exchange::Reply(Response::Ack { .. }) => {
                self.touch();
                debug!(session = %self.id, "namespace reset");
                Ok(())
            }
            Exchange::Cancelled => {
                self.kill_locked(&mut worker).await;
                Err(CellError::Process("cancelled".to_string()))
            }
            other => {
                let reason = match other {
                    Exchange::Failed(message) => message,
                    Exchange::TimedOut => "worker did not acknowledge reset in time".to_string(),
                    _ => "worker rejected reset".to_string(),
                };
                warn!(session = %self.id, "reset failed, restarting worker: {reason}");
                self.restart_locked(&mut worker).await;
                Err(CellError::Process(reason))
            }
        }
    }

    /// Abandon any in-flight request and replace the worker.
    pub async fn cancel(&self) -> Result<(), CellError> {
        self.cancel.send_modify(|epoch| *epoch += 1);
        let mut worker = self.worker.lock().await;
        if matches!(worker.slot, Slot::Stopped) {
            return Err(CellError::Process("session is shut down".to_string()));
        }
        self.kill_locked(&mut worker).await;
        self.start_locked(&mut worker).await?;
        info!(session = %self.id, "worker restarted by cancel");
        Ok(())
    }

    /// Stop the worker for good. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<(), CellError> {
        self.cancel.send_modify(|epoch| *epoch += 1);
        let mut worker = self.worker.lock().await;
        let Slot::Running(mut process) = std::mem::replace(&mut worker.slot, Slot::Stopped) else {
            return Ok(());
        };
        worker.dirty = false;

        let request = Request::Shutdown {
            id: Uuid::new_v4().to_string(),
        };
        let graceful = tokio::time::timeout(self.settings.shutdown_grace, async {
            if let Err(err) = process.send(&request).await {
                debug!(session = %self.id, "shutdown request not delivered: {err}");
            }
            process.child.wait().await
        })
        .await;
        match graceful {
            Ok(Ok(status)) => {
                info!(session = %self.id, %status, "worker exited");
                Ok(())
            }
            Ok(Err(err)) => {
                process.kill().await;
                Err(CellError::Process(format!("wait for worker: {err}")))
            }
            Err(_) => {
                warn!(session = %self.id, "worker ignored shutdown, killing");
                process.kill().await;
                Ok(())
            }
        }
    }

    /// Whether a worker process is running. A session that is busy counts as
    /// alive.
    pub fn is_alive(&self) -> bool {
        match self.worker.try_lock() {
            Err(_) => true,
            Ok(mut worker) => match &mut worker.slot {
                Slot::Running(process) => process.is_running(),
                _ => false,
            },
        }
    }

    fn is_busy(&self) -> bool {
        self.worker.try_lock().is_err()
    }

    pub fn idle_for(&self, now: SystemTime) -> Duration {
        let last = self.last_used_at.load(Ordering::Relaxed);
        Duration::from_millis(unix_millis(now).saturating_sub(last))
    }

    /// Idle strictly longer than the configured TTL and not mid-request.
    pub fn should_cull(&self, now: SystemTime) -> bool {
        self.idle_for(now) > self.settings.idle_ttl && !self.is_busy()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let started = self.started_at.load(Ordering::Relaxed);
        SessionSnapshot {
            id: self.id.clone(),
            live: self.is_alive(),
            started_at: (started > 0).then(|| started as f64 / 1000.0),
            last_used_at: self.last_used_at.load(Ordering::Relaxed) as f64 / 1000.0,
            idle_seconds: self.idle_for(SystemTime::now()).as_secs_f64(),
        }
    }

    fn touch(&self) {
        self.last_used_at
            .store(unix_millis(SystemTime::now()), Ordering::Relaxed);
    }

    fn decode(&self, response: Response) -> Option<Result<WorkerResult, CellError>> {
        let max = self.settings.max_stdout_chars;
        match response {
            Response::Executed {
                result_type,
                result,
                alt_format,
                stdout,
                elapsed_ms,
                ..
            } => Some(Ok(WorkerResult {
                kind: result_type,
                result,
                alt_format,
                stdout: truncate_output(stdout, max),
                elapsed_ms,
            })),
            Response::Failed { error, stdout, .. } => Some(Err(match error.kind.as_str() {
                "SyntaxError" => CellError::Parse {
                    message: error.message,
                },
                "SecurityViolation" => CellError::SecurityViolation {
                    message: error.message,
                },
                _ => CellError::Evaluation {
                    kind: error.kind,
                    message: error.message,
                    traceback: error.traceback,
                    stdout: truncate_output(stdout.unwrap_or_default(), max),
                },
            })),
            Response::Ack { .. } => None,
        }
    }

    /// Make sure a clean worker is ready to receive a request.
    async fn prepare_locked(&self, worker: &mut Worker) -> Result<(), CellError> {
        if worker.dirty {
            debug!(session = %self.id, "previous request was abandoned, restarting worker");
            self.kill_locked(worker).await;
        }
        self.start_locked(worker).await
    }

    async fn exchange(
        &self,
        worker: &mut Worker,
        request: &Request,
        limit: Duration,
        cancel: &mut watch::Receiver<u64>,
    ) -> Exchange {
        let Slot::Running(process) = &mut worker.slot else {
            return Exchange::Failed("worker is not running".to_string());
        };
        worker.dirty = true;
        let io = async {
            process.send(request).await?;
            process.recv().await
        };
        let outcome = tokio::select! {
            _ = cancel.changed() => Exchange::Cancelled,
            result = tokio::time::timeout(limit, io) => match result {
                Err(_) => Exchange::TimedOut,
                Ok(Err(message)) => Exchange::Failed(message),
                Ok(Ok(response)) if response.id() == Some(request.id()) => Exchange::Reply(response),
                Ok(Ok(response)) => Exchange::Failed(format!(
                    "response id {:?} does not match request {}",
                    response.id(),
                    request.id()
                )),
            },
        };
        if matches!(outcome, Exchange::Reply(_)) {
            worker.dirty = false;
        }
        outcome
    }

    async fn start_locked(&self, worker: &mut Worker) -> Result<(), CellError> {
        match &mut worker.slot {
            Slot::Stopped => {
                return Err(CellError::Process("session is shut down".to_string()));
            }
            Slot::Running(process) => {
                if process.is_running() {
                    return Ok(());
                }
                warn!(session = %self.id, "worker exited on its own, relaunching");
            }
            Slot::Unstarted => {}
        }
        let process = self.spawn()?;
        worker.slot = Slot::Running(process);
        worker.dirty = false;
        self.started_at
            .store(unix_millis(SystemTime::now()), Ordering::Relaxed);
        Ok(())
    }

    async fn kill_locked(&self, worker: &mut Worker) {
        if let Slot::Running(process) = &mut worker.slot {
            process.kill().await;
            worker.slot = Slot::Unstarted;
        }
        worker.dirty = false;
    }

    async fn restart_locked(&self, worker: &mut Worker) {
        self.kill_locked(worker).await;
        if let Err(err) = self.start_locked(worker).await {
            error!(session = %self.id, "failed to relaunch worker: {err}");
        }
    }

    fn spawn(&self) -> Result<WorkerProcess, CellError> {
        let settings = &self.settings;
        let binary = settings.worker_binary()?;
        let policy = serde_json::to_string(&settings.policy)
            .map_err(|e| CellError::Process(format!("encode policy: {e}")))?;

        let mut command = Command::new(&binary);
        command
            .arg(WORKER_MODE_ARG)
            .env(PRELOAD_ENV, &settings.preload)
            .env(POLICY_ENV, policy)
            .env(PURE_FALLBACK_ENV, if settings.pure_fallback { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match settings.max_memory_mb {
            Some(mb) => command.env(MAX_MEMORY_ENV, mb.to_string()),
            None => command.env_remove(MAX_MEMORY_ENV),
        };

        let mut child = command.spawn().map_err(|e| {
            CellError::Process(format!("failed to launch {}: {e}", binary.display()))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(CellError::Process("worker stdio was not captured".to_string()));
        };
        if let Some(stderr) = child.stderr.take() {
            let id = self.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(session = %id, "worker: {line}");
                }
            });
        }
        info!(session = %self.id, pid = ?child.id(), "worker started");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

fn truncate_output(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut truncated = text[..cut].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_truncated_on_char_boundaries() {
        assert_eq!(truncate_output("short".into(), 10), "short");
        assert_eq!(truncate_output("ééééé".into(), 5), "ééééé");
        assert_eq!(
            truncate_output("ééééé".into(), 2),
            format!("éé{TRUNCATION_MARKER}")
        );
    }

    #[test]
    fn fresh_sessions_are_not_culled() {
        let session = Session::new("s", Arc::new(Settings::default()));
        let now = SystemTime::now();
        assert!(!session.should_cull(now));
        assert!(session.should_cull(now + Duration::from_secs(16 * 60)));
        assert!(!session.is_alive());
        assert!(session.snapshot().started_at.is_none());
    }

    #[test]
    fn failures_map_onto_error_kinds() {
        let session = Session::new("s", Arc::new(Settings::default()));
        let failed = |kind: &str| {
            let response = Response::failed(Some("x".into()), kind, "m");
            session.decode(response).and_then(Result::err)
        };
        assert!(matches!(failed("SyntaxError"), Some(CellError::Parse { .. })));
        assert!(matches!(
            failed("SecurityViolation"),
            Some(CellError::SecurityViolation { .. })
        ));
        assert!(matches!(
            failed("NameError"),
            Some(CellError::Evaluation { ref kind, .. }) if kind == "NameError"
        ));
        assert!(session.decode(Response::ack("x")).is_none());
    }
}
