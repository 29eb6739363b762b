//! A single worker process and the task that drives it.
//!
//! Each worker is one tokio task owning the child process. Commands, protocol
//! lines from stdout, the idle deadline and the call deadline are all handled
//! by one `select!` loop, so the worker's state is only ever touched from one
//! place. Whatever ends the loop, the process is stopped and the pool is
//! notified exactly once, in [`WorkerActor::finish`].

use super::protocol::{InvocationContext, Request, Response};
use super::signals::{TerminationReason, send_signal};
use super::spawn::{WorkerSpec, spawn_worker};
use crate::error::{Error, InvokeError, Result};
use nix::sys::signal::Signal;
use serde_json::Value;
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Weak;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};

/// How long a terminated worker gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Deadline `duration` from now, capped for absurdly long durations.
fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Process started, no call yet.
    Spawned,
    Idle,
    Invoking,
    /// Graceful shutdown requested while a call was in flight.
    Draining,
    Dead,
}

/// Receives the outcome of one call. Runs exactly once.
pub type Completion = Box<dyn FnOnce(std::result::Result<Value, InvokeError>) + Send + 'static>;

/// Hooks a worker uses to talk back to its pool.
pub trait WorkerObserver: Send + Sync {
    /// Remove the idle worker `id`. Returns false if it was picked for a call.
    fn try_evict(&self, id: u64) -> bool;

    /// The worker `id` is dead. Called once, before any pending caller is resolved.
    fn exited(&self, id: u64);
}

enum Command {
    Invoke {
        event: Value,
        context: InvocationContext,
        completion: Completion,
    },
    Shutdown {
        graceful: bool,
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: u64,
    pid: Option<u32>,
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("name", &self.name)
            .finish()
    }
}

impl WorkerHandle {
    /// Start a worker process and its driving task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: u64,
        spec: &WorkerSpec,
        call_timeout: Duration,
        max_idle: Duration,
        observer: Weak<dyn WorkerObserver>,
    ) -> Result<Self> {
        let mut child = spawn_worker(spec)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("Child stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.name.clone(), pid, stderr));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = WorkerActor {
            id,
            name: spec.name.clone(),
            pid,
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            commands: rx,
            observer,
            call_timeout,
            max_idle,
            state: WorkerState::Spawned,
            next_request_id: 1,
            pending: HashMap::new(),
            idle_deadline: deadline_after(max_idle),
            graceful_shutdown_requested: false,
            deferred: None,
            acks: Vec::new(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            id,
            pid,
            name: spec.name.clone(),
            commands: tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send a call to the worker. `completion` runs once with the outcome.
    pub fn invoke(&self, event: Value, context: InvocationContext, completion: Completion) {
        let command = Command::Invoke {
            event,
            context,
            completion,
        };
        if let Err(mpsc::error::SendError(Command::Invoke { completion, .. })) =
            self.commands.send(command)
        {
            completion(Err(InvokeError::Failed {
                name: self.name.clone(),
                reason: "worker is no longer running".to_string(),
            }));
        }
    }

    /// Ask the worker to stop. The receiver completes once the process is gone.
    ///
    /// A graceful shutdown lets an in-flight call finish first.
    pub fn shutdown(&self, graceful: bool) -> oneshot::Receiver<()> {
        let (ack, done) = oneshot::channel();
        // If the worker already exited the ack is dropped, which also completes `done`.
        let _ = self.commands.send(Command::Shutdown { graceful, ack });
        done
    }
}

struct PendingCall {
    started_at: Instant,
    deadline: Instant,
    completion: Completion,
}

/// Why the worker loop stopped.
#[derive(Debug)]
enum Cause {
    /// Idle past `max_idle`.
    Idle,
    /// A call passed its deadline.
    CallTimeout,
    /// stdout reached EOF.
    Exited,
    /// Reading or writing the pipes failed.
    Broken(String),
    /// A line on stdout was not a protocol envelope.
    ProtocolViolation(String),
    Shutdown,
    /// The in-flight call of a graceful shutdown completed.
    Drained,
    /// Every handle and the pool are gone.
    Released,
}

impl Cause {
    /// Signal that stops the process for this cause, if it is not already exiting.
    fn signal(&self) -> Option<Signal> {
        match self {
            Cause::CallTimeout | Cause::Broken(_) | Cause::ProtocolViolation(_) => {
                Some(Signal::SIGKILL)
            }
            Cause::Idle | Cause::Shutdown | Cause::Drained | Cause::Released => {
                Some(Signal::SIGTERM)
            }
            Cause::Exited => None,
        }
    }
}

struct WorkerActor {
    id: u64,
    name: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    commands: mpsc::UnboundedReceiver<Command>,
    observer: Weak<dyn WorkerObserver>,
    call_timeout: Duration,
    max_idle: Duration,
    state: WorkerState,
    next_request_id: u64,
    pending: HashMap<u64, PendingCall>,
    idle_deadline: Instant,
    graceful_shutdown_requested: bool,
    /// Outcome held back until the pool has dropped this worker.
    deferred: Option<(Completion, std::result::Result<Value, InvokeError>)>,
    acks: Vec<oneshot::Sender<()>>,
}

impl WorkerActor {
    async fn run(mut self) {
        let cause = loop {
            let call_deadline = self.call_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { event, context, completion }) => {
                        if let Some(cause) = self.start_call(event, context, completion).await {
                            break cause;
                        }
                    }
                    Some(Command::Shutdown { graceful, ack }) => {
                        self.acks.push(ack);
                        if graceful && !self.pending.is_empty() {
                            tracing::debug!(worker_id = self.id, function = %self.name, "Draining worker");
                            self.graceful_shutdown_requested = true;
                            self.state = WorkerState::Draining;
                            continue;
                        }
                        break Cause::Shutdown;
                    }
                    None => break Cause::Released,
                },
                line = self.lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(cause) = self.handle_line(&line) {
                            break cause;
                        }
                    }
                    Ok(None) => break Cause::Exited,
                    Err(e) => break Cause::Broken(format!("failed to read from worker: {}", e)),
                },
                _ = sleep_until(self.idle_deadline) => {
                    if !self.pending.is_empty() {
                        self.idle_deadline = deadline_after(self.max_idle);
                        continue;
                    }
                    let Some(observer) = self.observer.upgrade() else {
                        break Cause::Released;
                    };
                    if observer.try_evict(self.id) {
                        break Cause::Idle;
                    }
                    // Picked for a call in the meantime; its command is on the way.
                    self.idle_deadline = deadline_after(self.max_idle);
                },
                _ = sleep_until(call_deadline.unwrap_or(self.idle_deadline)), if call_deadline.is_some() => {
                    break Cause::CallTimeout;
                },
            }
        };
        self.finish(cause).await;
    }

    fn call_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|call| call.deadline).min()
    }

    /// Register and send one call. Returns a cause if the worker cannot go on.
    async fn start_call(
        &mut self,
        event: Value,
        context: InvocationContext,
        completion: Completion,
    ) -> Option<Cause> {
        if self.graceful_shutdown_requested {
            completion(Err(InvokeError::Failed {
                name: self.name.clone(),
                reason: "worker is shutting down".to_string(),
            }));
            return None;
        }

        let now = Instant::now();
        self.idle_deadline = deadline_after(self.max_idle);

        let id = self.next_request_id;
        self.next_request_id += 1;
        let request = Request::new(id, event, context);
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                completion(Err(InvokeError::Failed {
                    name: self.name.clone(),
                    reason: format!("failed to encode request: {}", e),
                }));
                return None;
            }
        };

        let deadline = deadline_after(self.call_timeout);
        self.pending.insert(
            id,
            PendingCall {
                started_at: now,
                deadline,
                completion,
            },
        );
        self.state = WorkerState::Invoking;

        tracing::trace!(
            worker_id = self.id,
            request_id = id,
            aws_request_id = %request.context.aws_request_id,
            "Sending request"
        );

        let Some(stdin) = self.stdin.as_mut() else {
            return Some(Cause::Broken("worker stdin is closed".to_string()));
        };
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout_at(deadline, write).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Cause::Broken(format!("failed to write to worker: {}", e))),
            Err(_) => Some(Cause::CallTimeout),
        }
    }

    /// Handle one line from the worker's stdout.
    fn handle_line(&mut self, line: &str) -> Option<Cause> {
        if line.trim().is_empty() {
            return None;
        }
        let response = match Response::from_line(line) {
            Ok(response) => response,
            Err(e) => {
                return Some(Cause::ProtocolViolation(format!(
                    "invalid worker message: {}",
                    e
                )));
            }
        };

        let Some(call) = self.pending.remove(&response.id) else {
            tracing::trace!(
                worker_id = self.id,
                request_id = response.id,
                "Ignoring response for unknown request"
            );
            return None;
        };

        if let Some(mem) = &response.mem {
            tracing::trace!(
                worker_id = self.id,
                rss = mem.rss,
                heap_used = mem.heap_used,
                "Worker memory"
            );
        }
        tracing::debug!(
            worker_id = self.id,
            function = %self.name,
            request_id = response.id,
            duration_ms = call.started_at.elapsed().as_millis() as u64,
            "Call completed"
        );

        let outcome = response.decode(&self.name);
        if self.pending.is_empty() && self.state == WorkerState::Invoking {
            self.state = WorkerState::Idle;
        }

        if self.graceful_shutdown_requested {
            self.deferred = Some((call.completion, outcome));
            return Some(Cause::Drained);
        }
        (call.completion)(outcome);
        None
    }

    /// The single terminal path: stop the process, leave the pool, resolve callers.
    async fn finish(mut self, cause: Cause) {
        self.state = WorkerState::Dead;
        self.stdin = None;

        if let Some(sig) = cause.signal() {
            if sig == Signal::SIGKILL {
                let _ = self.child.start_kill();
            } else if let Some(pid) = self.pid {
                send_signal(pid, sig);
            }
        }

        if matches!(cause, Cause::CallTimeout) {
            tracing::warn!(
                worker_id = self.id,
                function = %self.name,
                timeout_ms = self.call_timeout.as_millis() as u64,
                "Lambda timed out, killed worker"
            );
        }

        if let Some(observer) = self.observer.upgrade() {
            observer.exited(self.id);
        }

        if let Some((completion, outcome)) = self.deferred.take() {
            completion(outcome);
        }

        // An unsolicited exit is only explained by its status.
        let mut status = None;
        if matches!(cause, Cause::Exited) {
            status = self.reap().await;
        }

        let reason = self.failure_reason(&cause, status);
        let now = Instant::now();
        let pending: Vec<PendingCall> = self.pending.drain().map(|(_, call)| call).collect();
        if !pending.is_empty() && !matches!(cause, Cause::CallTimeout) {
            tracing::warn!(
                worker_id = self.id,
                function = %self.name,
                calls = pending.len(),
                reason = %reason,
                "Worker died with calls in flight"
            );
        }
        for call in pending {
            let err = if call.deadline <= now {
                InvokeError::Timeout {
                    name: self.name.clone(),
                    timeout: self.call_timeout,
                }
            } else {
                InvokeError::Failed {
                    name: self.name.clone(),
                    reason: reason.clone(),
                }
            };
            (call.completion)(Err(err));
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Invoke { completion, .. } => completion(Err(InvokeError::Failed {
                    name: self.name.clone(),
                    reason: reason.clone(),
                })),
                Command::Shutdown { ack, .. } => self.acks.push(ack),
            }
        }

        if status.is_none() {
            status = self.reap().await;
        }

        tracing::debug!(
            worker_id = self.id,
            function = %self.name,
            pid = self.pid,
            cause = ?cause,
            exit = %status
                .map(TerminationReason::from_status)
                .unwrap_or(TerminationReason::Unknown),
            "Worker stopped"
        );

        for ack in self.acks.drain(..) {
            let _ = ack.send(());
        }
    }

    /// Wait for the process to exit, killing it after [`KILL_GRACE`].
    async fn reap(&mut self) -> Option<ExitStatus> {
        match timeout(KILL_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::debug!(worker_id = self.id, error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                tracing::debug!(worker_id = self.id, "Worker ignored SIGTERM, sending SIGKILL");
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        }
    }

    fn failure_reason(&self, cause: &Cause, status: Option<ExitStatus>) -> String {
        match cause {
            Cause::Exited => match status {
                Some(status) => format!(
                    "worker {}",
                    TerminationReason::from_status(status).description()
                ),
                None => "worker exited".to_string(),
            },
            Cause::Broken(reason) | Cause::ProtocolViolation(reason) => reason.clone(),
            Cause::CallTimeout => "worker was killed after a call timed out".to_string(),
            Cause::Shutdown | Cause::Drained => "worker was shut down".to_string(),
            Cause::Idle => "worker was evicted".to_string(),
            Cause::Released => "worker pool was dropped".to_string(),
        }
    }
}

/// Forward a worker's stderr into the log, one record per line.
async fn forward_stderr(name: String, pid: Option<u32>, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "lambda_pool::function", function = %name, pid, "{}", line);
    }
}
