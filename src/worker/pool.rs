//! Pool of worker processes serving one function.

use super::process::{WorkerHandle, WorkerObserver};
use super::protocol::InvocationContext;
use super::spawn::WorkerSpec;
use crate::config::FunctionConfig;
use crate::error::InvokeError;
use crate::invocation::{Invocation, InvokeOptions, ShutdownOptions};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::instrument;

/// Account used in function ARNs unless `STUDIO_AWS_ACCOUNT` is set.
const DEFAULT_ACCOUNT: &str = "0000";

/// Statistics of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live worker processes.
    pub instances: usize,
    /// Invocations received, whatever their outcome.
    pub requests: u64,
    /// Workers currently running a call.
    pub active: usize,
}

struct WorkerEntry {
    id: u64,
    worker: WorkerHandle,
    active: bool,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<WorkerEntry>,
    requests: u64,
    next_worker_id: u64,
}

struct PoolShared {
    name: String,
    config: FunctionConfig,
    spec: WorkerSpec,
    arn: String,
    max_idle: Duration,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark worker `id` as available again.
    fn release(&self, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.active = false;
        }
    }

    fn context(&self, sequence: u64, aws_request_id: Option<String>) -> InvocationContext {
        let aws_request_id = aws_request_id.unwrap_or_else(|| {
            let millis = chrono::Utc::now().timestamp_millis();
            format!("{:09}_{}_{}", millis, self.name, sequence)
        });
        InvocationContext {
            function_name: self.name.clone(),
            timeout: self.config.timeout.as_secs_f64(),
            memory_limit_in_mb: self.config.memory,
            invoked_function_arn: self.arn.clone(),
            aws_request_id,
        }
    }
}

impl WorkerObserver for PoolShared {
    fn try_evict(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.entries.iter().position(|e| e.id == id) {
            Some(index) if state.entries[index].active => false,
            Some(index) => {
                state.entries.remove(index);
                tracing::debug!(function = %self.name, worker_id = id, "Evicting idle worker");
                true
            }
            // Already gone; let it stop.
            None => true,
        }
    }

    fn exited(&self, id: u64) {
        let mut state = self.lock();
        state.entries.retain(|e| e.id != id);
    }
}

/// All workers of one function.
///
/// Calls go to the first idle worker; when every worker is busy a new one is
/// spawned. There is no upper bound on the number of workers.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(name: &str, config: FunctionConfig, max_idle: Duration) -> Self {
        let spec = WorkerSpec::new(name, &config);
        let account = spec
            .environment
            .get("STUDIO_AWS_ACCOUNT")
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACCOUNT);
        let arn = format!(
            "arn:aws:lambda:{}:{}:function:{}",
            spec.region(),
            account,
            name
        );
        Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                config,
                spec,
                arn,
                max_idle,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &FunctionConfig {
        &self.shared.config
    }

    /// ARN reported to the function in its context.
    pub fn arn(&self) -> &str {
        &self.shared.arn
    }

    /// Run one call on an idle worker, spawning one if needed.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(level = "debug", skip(self, event, options), fields(function = %self.shared.name))]
    pub fn invoke(&self, event: Value, options: InvokeOptions) -> Invocation {
        let shared = &self.shared;
        let (worker, context) = {
            let mut state = shared.lock();
            state.requests += 1;
            let context = shared.context(state.requests, options.aws_request_id);

            let worker = match state.entries.iter_mut().find(|e| !e.active) {
                Some(entry) => {
                    entry.active = true;
                    entry.worker.clone()
                }
                None => {
                    let id = state.next_worker_id;
                    state.next_worker_id += 1;
                    let observer: Weak<PoolShared> = Arc::downgrade(shared);
                    match WorkerHandle::spawn(
                        id,
                        &shared.spec,
                        shared.config.timeout,
                        shared.max_idle,
                        observer,
                    ) {
                        Ok(worker) => {
                            state.entries.push(WorkerEntry {
                                id,
                                worker: worker.clone(),
                                active: true,
                            });
                            worker
                        }
                        Err(e) => {
                            tracing::warn!(function = %shared.name, error = %e, "Failed to launch worker");
                            return Invocation::ready(Err(InvokeError::Launch {
                                name: shared.name.clone(),
                                reason: e.to_string(),
                            }));
                        }
                    }
                }
            };
            (worker, context)
        };

        tracing::trace!(
            worker_id = worker.id(),
            pid = worker.pid(),
            aws_request_id = %context.aws_request_id,
            "Routing call to worker"
        );

        let (tx, rx) = oneshot::channel();
        let pool = Arc::downgrade(shared);
        let id = worker.id();
        worker.invoke(
            event,
            context,
            Box::new(move |outcome| {
                if let Some(pool) = pool.upgrade() {
                    pool.release(id);
                }
                let _ = tx.send(outcome);
            }),
        );
        Invocation::pending(shared.name.clone(), rx)
    }

    /// Stop every current worker. Resolves once all of them have exited.
    pub async fn shutdown(&self, options: ShutdownOptions) {
        for ack in self.begin_shutdown(options) {
            let _ = ack.await;
        }
    }

    /// Send the shutdown to every current worker without waiting.
    ///
    /// Each receiver completes once its worker has exited.
    pub(crate) fn begin_shutdown(&self, options: ShutdownOptions) -> Vec<oneshot::Receiver<()>> {
        let workers: Vec<WorkerHandle> = {
            let state = self.shared.lock();
            state.entries.iter().map(|e| e.worker.clone()).collect()
        };
        tracing::debug!(
            function = %self.shared.name,
            workers = workers.len(),
            graceful = options.graceful,
            "Shutting down pool"
        );

        workers
            .iter()
            .map(|worker| worker.shutdown(options.graceful))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            instances: state.entries.len(),
            requests: state.requests,
            active: state.entries.iter().filter(|e| e.active).count(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn config(entry: &str, env: &[(&str, &str)]) -> FunctionConfig {
        let mut environment: BTreeMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        FunctionConfig {
            entry: PathBuf::from(entry),
            args: Vec::new(),
            environment,
            timeout: Duration::from_secs(5),
            memory: 128,
        }
    }

    #[test]
    fn test_arn_defaults() {
        let pool = Pool::new("context", config("/bin/cat", &[]), Duration::from_secs(60));
        assert!(pool.arn().ends_with(":0000:function:context"));
        assert!(pool.arn().starts_with("arn:aws:lambda:"));
    }

    #[test]
    fn test_arn_from_environment() {
        let pool = Pool::new(
            "context",
            config(
                "/bin/cat",
                &[("AWS_REGION", "eu-central-1"), ("STUDIO_AWS_ACCOUNT", "12345678")],
            ),
            Duration::from_secs(60),
        );
        assert_eq!(
            pool.arn(),
            "arn:aws:lambda:eu-central-1:12345678:function:context"
        );
    }

    #[test]
    fn test_generated_request_id() {
        let pool = Pool::new("context", config("/bin/cat", &[]), Duration::from_secs(60));
        let context = pool.shared.context(1, None);
        assert!(context.aws_request_id.ends_with("_context_1"));
        let millis = context.aws_request_id.split('_').next().unwrap();
        assert!(millis.len() >= 9);
        assert!(millis.chars().all(|c| c.is_ascii_digit()));

        let context = pool.shared.context(2, Some("666".to_string()));
        assert_eq!(context.aws_request_id, "666");
        assert_eq!(context.timeout, 5.0);
    }

    #[tokio::test]
    async fn test_sequential_calls_reuse_worker() {
        let pool = Pool::new("echo", config("/bin/cat", &[]), Duration::from_secs(60));

        assert_eq!(pool.invoke(json!(1), InvokeOptions::default()).await, Ok(Value::Null));
        assert_eq!(pool.invoke(json!(2), InvokeOptions::default()).await, Ok(Value::Null));
        assert_eq!(
            pool.stats(),
            PoolStats {
                instances: 1,
                requests: 2,
                active: 0
            }
        );

        pool.shutdown(ShutdownOptions::default()).await;
        assert_eq!(pool.stats().instances, 0);
        assert_eq!(pool.stats().requests, 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_spawn_workers() {
        let pool = Pool::new("echo", config("/bin/cat", &[]), Duration::from_secs(60));

        let first = pool.invoke(json!(1), InvokeOptions::default());
        let second = pool.invoke(json!(2), InvokeOptions::default());
        let third = pool.invoke(json!(3), InvokeOptions::default());
        assert_eq!(pool.stats().instances, 3);
        assert_eq!(pool.stats().active, 3);

        let (a, b, c) = tokio::join!(first, second, third);
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().instances, 3);

        pool.shutdown(ShutdownOptions::default()).await;
        assert_eq!(pool.stats().instances, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_counts_request() {
        let pool = Pool::new(
            "ghost",
            config("/nonexistent/lambda-pool/ghost/index", &[]),
            Duration::from_secs(60),
        );
        let err = pool
            .invoke(json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_json(),
            json!({ "message": "Failed to launch \"ghost\"" })
        );
        assert_eq!(
            pool.stats(),
            PoolStats {
                instances: 0,
                requests: 1,
                active: 0
            }
        );
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_removed_before_caller_resolves() {
        let mut cfg = config("/bin/sleep", &[]);
        cfg.args = vec!["30".to_string()];
        cfg.timeout = Duration::from_millis(100);
        let pool = Arc::new(Pool::new("sleepy", cfg, Duration::from_secs(60)));

        let err = pool
            .invoke(json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(pool.stats().instances, 0);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_idle_worker_is_evicted() {
        let pool = Pool::new("echo", config("/bin/cat", &[]), Duration::from_millis(100));
        pool.invoke(json!(1), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(pool.stats().instances, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.stats().instances, 0);
        assert_eq!(pool.stats().requests, 1);
    }
}
