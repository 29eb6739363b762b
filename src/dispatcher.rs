//! Top-level entry point mapping function names to pools.

use crate::config::{ConfigResolver, FileConfigResolver, Options};
use crate::error::{Error, InvokeError};
use crate::invocation::{Invocation, InvokeOptions, InvokeResult, ShutdownOptions};
use crate::worker::{Pool, PoolStats};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Routes invocations to per-function pools, creating them on first use.
pub struct Dispatcher {
    options: Arc<Options>,
    resolver: Arc<dyn ConfigResolver>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl Dispatcher {
    /// Dispatcher resolving functions from disk with [`FileConfigResolver`].
    pub fn new(options: Options) -> Self {
        let resolver = Arc::new(FileConfigResolver::new(options.clone()));
        Self::with_resolver(options, resolver)
    }

    /// Dispatcher with a custom configuration source.
    pub fn with_resolver(options: Options, resolver: Arc<dyn ConfigResolver>) -> Self {
        Self {
            options: Arc::new(options),
            resolver,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Arc<Pool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool for `name`, created if needed. Failures are not remembered.
    fn pool(&self, name: &str) -> Result<Arc<Pool>, Error> {
        if let Some(pool) = self.pools().get(name) {
            return Ok(Arc::clone(pool));
        }

        let config = self.resolver.resolve(name)?;
        let pool = Arc::new(Pool::new(name, config, self.options.max_idle));
        // Another caller may have created it while we were resolving.
        let pool = self
            .pools()
            .entry(name.to_string())
            .or_insert(pool)
            .clone();
        Ok(pool)
    }

    /// Invoke function `name` with `event`.
    ///
    /// Never fails synchronously: every outcome, including configuration
    /// errors, is delivered through the returned future.
    pub fn invoke(&self, name: &str, event: Value, options: InvokeOptions) -> Invocation {
        match self.pool(name) {
            Ok(pool) => pool.invoke(event, options),
            Err(e) => {
                tracing::warn!(function = name, error = %e, "Failed to create pool");
                Invocation::ready(Err(InvokeError::Launch {
                    name: name.to_string(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Invoke function `name` and hand the outcome to `callback` on a tokio task.
    pub fn invoke_with_callback<F>(&self, name: &str, event: Value, options: InvokeOptions, callback: F)
    where
        F: FnOnce(InvokeResult) + Send + 'static,
    {
        let invocation = self.invoke(name, event, options);
        tokio::spawn(async move {
            callback(invocation.await);
        });
    }

    /// Shut down every pool. Resolves once all their workers have exited.
    ///
    /// Every worker is signalled before any of them is waited for.
    pub async fn shutdown(&self, options: ShutdownOptions) {
        let pools: Vec<Arc<Pool>> = self.pools().values().cloned().collect();
        tracing::debug!(pools = pools.len(), graceful = options.graceful, "Shutting down");
        let acks: Vec<_> = pools
            .iter()
            .flat_map(|pool| pool.begin_shutdown(options))
            .collect();
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Statistics of every pool created so far, by function name.
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("options", &self.options)
            .field("pools", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunctionConfig;
    use crate::error::ConfigError;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` resolutions, then serves `/bin/cat`.
    struct FlakyResolver {
        failures: usize,
        calls: AtomicUsize,
    }

    impl ConfigResolver for FlakyResolver {
        fn resolve(&self, _name: &str) -> Result<FunctionConfig, ConfigError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ConfigError::MissingVariable {
                    key: "SECRET".to_string(),
                    variable: "UNSET".to_string(),
                });
            }
            Ok(FunctionConfig {
                entry: PathBuf::from("/bin/cat"),
                args: Vec::new(),
                environment: BTreeMap::new(),
                timeout: Duration::from_secs(5),
                memory: 128,
            })
        }
    }

    /// Runs `/bin/sh -c <script>` for the listed functions and `/bin/cat` otherwise.
    struct ScriptResolver {
        scripts: HashMap<&'static str, &'static str>,
    }

    impl ConfigResolver for ScriptResolver {
        fn resolve(&self, name: &str) -> Result<FunctionConfig, ConfigError> {
            let (entry, args) = match self.scripts.get(name) {
                Some(script) => ("/bin/sh", vec!["-c".to_string(), script.to_string()]),
                None => ("/bin/cat", Vec::new()),
            };
            Ok(FunctionConfig {
                entry: PathBuf::from(entry),
                args,
                environment: BTreeMap::from([(
                    "PATH".to_string(),
                    "/usr/bin:/bin".to_string(),
                )]),
                timeout: Duration::from_secs(10),
                memory: 128,
            })
        }
    }

    fn scripted(scripts: &[(&'static str, &'static str)]) -> Dispatcher {
        let resolver = Arc::new(ScriptResolver {
            scripts: scripts.iter().copied().collect(),
        });
        Dispatcher::with_resolver(Options::default(), resolver)
    }

    fn dispatcher(failures: usize) -> (Dispatcher, Arc<FlakyResolver>) {
        let resolver = Arc::new(FlakyResolver {
            failures,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::with_resolver(Options::default(), resolver.clone());
        (dispatcher, resolver)
    }

    #[tokio::test]
    async fn test_resolver_failure_is_not_cached() {
        let (dispatcher, resolver) = dispatcher(1);

        let err = dispatcher
            .invoke("env", json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_json(), json!({ "message": "Failed to launch \"env\"" }));
        assert!(dispatcher.stats().is_empty());

        let value = dispatcher
            .invoke("env", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

        // The pool is cached from now on.
        dispatcher
            .invoke("env", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats()["env"].requests, 2);

        dispatcher.shutdown(ShutdownOptions::default()).await;
    }

    #[tokio::test]
    async fn test_stats_per_function() {
        let (dispatcher, _) = dispatcher(0);
        dispatcher
            .invoke("a", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        dispatcher
            .invoke("b", json!({}), InvokeOptions::default())
            .await
            .unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(stats["a"].instances, 1);

        dispatcher.shutdown(ShutdownOptions::default()).await;
        let stats = dispatcher.stats();
        assert_eq!(stats["a"].instances, 0);
        assert_eq!(stats["b"].requests, 1);
    }

    #[tokio::test]
    async fn test_invoke_with_callback_runs_once() {
        let (dispatcher, _) = dispatcher(0);
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatcher.invoke_with_callback("cb", json!({}), InvokeOptions::default(), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(Value::Null));
        dispatcher.shutdown(ShutdownOptions::default()).await;
    }

    // Both workers ignore SIGTERM, so each one costs the full kill grace.
    #[tokio::test]
    async fn test_shutdown_stops_pools_concurrently() {
        const STUBBORN: &str = "trap '' TERM; read line; sleep 30";
        let dispatcher = scripted(&[("stubborn-a", STUBBORN), ("stubborn-b", STUBBORN)]);

        let first = dispatcher.invoke("stubborn-a", json!({}), InvokeOptions::default());
        let second = dispatcher.invoke("stubborn-b", json!({}), InvokeOptions::default());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        dispatcher.shutdown(ShutdownOptions::default()).await;
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(3500), "shutdown took {:?}", elapsed);

        assert!(first.await.unwrap_err().is_failed());
        assert!(second.await.unwrap_err().is_failed());
        let stats = dispatcher.stats();
        assert_eq!(stats["stubborn-a"].instances, 0);
        assert_eq!(stats["stubborn-b"].instances, 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_does_not_hold_back_idle_pools() {
        let dispatcher = Arc::new(scripted(&[(
            "slow",
            r#"read line; sleep 1; echo '{"id":1,"res":"1"}'; sleep 30"#,
        )]));

        for name in ["idle-a", "idle-b", "idle-c"] {
            dispatcher
                .invoke(name, json!({}), InvokeOptions::default())
                .await
                .unwrap();
        }
        let slow = dispatcher.invoke("slow", json!({}), InvokeOptions::default());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let shutdown = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.shutdown(ShutdownOptions::graceful()).await }
        });
        tokio::time::sleep(Duration::from_millis(400)).await;

        let stats = dispatcher.stats();
        for name in ["idle-a", "idle-b", "idle-c"] {
            assert_eq!(stats[name].instances, 0, "{} still running", name);
        }
        assert_eq!(stats["slow"].instances, 1);

        assert_eq!(slow.await, Ok(json!(1)));
        shutdown.await.unwrap();
        assert_eq!(dispatcher.stats()["slow"].instances, 0);
    }
}
