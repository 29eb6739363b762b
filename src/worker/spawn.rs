//! Worker subprocess spawning.
//!
//! A worker is the function's entry executable, started in its own
//! directory with a scrubbed environment and piped stdio.

use crate::config::FunctionConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Region used when the host environment does not name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Everything needed to start one worker process of a function.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub entry: PathBuf,
    pub args: Vec<String>,
    /// Complete child environment; nothing is inherited beyond this.
    pub environment: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn new(name: &str, config: &FunctionConfig) -> Self {
        Self {
            name: name.to_string(),
            entry: config.entry.clone(),
            args: config.args.clone(),
            environment: worker_environment(name, config, |key| std::env::var(key).ok()),
        }
    }

    /// Region the worker believes it runs in.
    pub fn region(&self) -> &str {
        self.environment
            .get("AWS_REGION")
            .map(String::as_str)
            .unwrap_or(DEFAULT_REGION)
    }
}

/// Build a worker's environment: baseline, then the function's configured
/// environment on top.
///
/// `host` looks up variables of the hosting process.
pub fn worker_environment<F>(
    name: &str,
    config: &FunctionConfig,
    host: F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let region = host("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
    let mut env = BTreeMap::new();

    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };
    if let Some(profile) = host("AWS_PROFILE") {
        set("AWS_PROFILE", profile);
    }
    set("AWS_REGION", region.clone());
    set("AWS_DEFAULT_REGION", region);
    set("AWS_ACCOUNT_ID", "000000000000".to_string());
    set("AWS_EXECUTION_ENV", "AWS_Lambda_rust".to_string());
    set("AWS_LAMBDA_FUNCTION_NAME", name.to_string());
    set("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", config.memory.to_string());
    set("AWS_LAMBDA_FUNCTION_VERSION", "1".to_string());
    set(
        "LAMBDA_TASK_ROOT",
        config.task_root().to_string_lossy().into_owned(),
    );
    set("LANG", "en_US.UTF-8".to_string());
    set("TZ", "UTC".to_string());
    if let Some(path) = host("PATH") {
        set("PATH", path);
    }
    set("NODE_TLS_REJECT_UNAUTHORIZED", "0".to_string());
    if let Some(debug) = host("DEBUG") {
        set("DEBUG", debug);
    }

    env.extend(
        config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env
}

/// Spawn a worker subprocess.
///
/// The child is killed if its handle is dropped.
pub fn spawn_worker(spec: &WorkerSpec) -> Result<Child> {
    let mut cmd = Command::new(&spec.entry);
    cmd.args(&spec.args);
    if let Some(dir) = spec.entry.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    cmd.env_clear();
    cmd.envs(&spec.environment);

    // Set up IPC pipes
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| Error::Spawn {
        name: spec.name.clone(),
        source,
    })?;

    tracing::debug!(
        function = %spec.name,
        pid = child.id(),
        entry = %spec.entry.display(),
        "Spawned worker process"
    );

    Ok(child)
}
