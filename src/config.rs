//! Host options and per-function configuration resolution.
//!
//! [`Options`] mirrors the knobs accepted by [`create`](crate::create). A
//! [`ConfigResolver`] turns a function name into a [`FunctionConfig`] once,
//! when the function's pool is first needed.
//!
//! Path templates and descriptor values may reference `${VAR}` placeholders.
//! `LAMBDA_NAME` expands to the function name; other variables are looked up
//! in `Options::env` first and in the host process environment second.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder that expands to the function name.
pub const LAMBDA_NAME_VAR: &str = "LAMBDA_NAME";

/// Default template for a function's entry executable.
pub const DEFAULT_LAMBDA_PATH: &str = "functions/${LAMBDA_NAME}/index";

/// Default template for a function's descriptor file.
pub const DEFAULT_CONFIG_FILE: &str = "functions/${LAMBDA_NAME}/function.${AWS_PROFILE}.json";

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default memory size handed to workers (MB).
pub const DEFAULT_MEMORY_MB: u32 = 128;

/// Default idle window before a worker is evicted (one hour).
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60 * 60);

/// Options accepted when creating a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Template for the entry executable of a function.
    pub lambda_path: String,
    /// Template for the descriptor file of a function.
    pub config_file: String,
    /// Base directory for relative templates (default: current directory).
    pub base_dir: Option<PathBuf>,
    /// Default environment, overridden by descriptor environments.
    pub env: BTreeMap<String, String>,
    /// Extra arguments passed to every worker executable.
    pub args: Vec<String>,
    /// Default per-call timeout, in (fractional) seconds on the wire.
    #[serde(with = "serde_seconds")]
    pub timeout: Duration,
    /// Default memory size in MB.
    pub memory: u32,
    /// Idle eviction window, in milliseconds on the wire.
    #[serde(with = "serde_millis")]
    pub max_idle: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lambda_path: DEFAULT_LAMBDA_PATH.to_string(),
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            base_dir: None,
            env: BTreeMap::new(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            memory: DEFAULT_MEMORY_MB,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn with_lambda_path(mut self, template: impl Into<String>) -> Self {
        self.lambda_path = template.into();
        self
    }

    pub fn with_config_file(mut self, template: impl Into<String>) -> Self {
        self.config_file = template.into();
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Add one default environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory(mut self, memory_mb: u32) -> Self {
        self.memory = memory_mb;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Resolve a possibly relative path against `base_dir` or the current directory.
    fn absolutize(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            return path;
        }
        match &self.base_dir {
            Some(base) => base.join(path),
            None => std::env::current_dir()
                .map(|cwd| cwd.join(&path))
                .unwrap_or(path),
        }
    }

    /// Look up a template variable in `env`, then in the host environment.
    fn lookup(&self, variable: &str) -> Option<String> {
        self.env
            .get(variable)
            .cloned()
            .or_else(|| std::env::var(variable).ok())
    }
}

/// Resolved configuration of one function. Immutable for the lifetime of its pool.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionConfig {
    /// Absolute path of the entry executable.
    pub entry: PathBuf,
    /// Arguments passed to the entry executable.
    pub args: Vec<String>,
    /// `Options::env` overlaid by the descriptor environment.
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Memory size in MB.
    pub memory: u32,
}

impl FunctionConfig {
    /// Directory the worker runs in.
    pub fn task_root(&self) -> &Path {
        self.entry.parent().unwrap_or(Path::new("/"))
    }
}

/// Turns a function name into its [`FunctionConfig`].
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, name: &str) -> std::result::Result<FunctionConfig, ConfigError>;
}

/// On-disk per-function descriptor.
#[derive(Debug, Default, Deserialize)]
struct Descriptor {
    #[serde(default)]
    environment: BTreeMap<String, String>,
    /// Seconds.
    timeout: Option<f64>,
    /// MB.
    memory: Option<u32>,
}

/// Resolver reading `Options::config_file` descriptors from disk.
#[derive(Debug, Clone)]
pub struct FileConfigResolver {
    options: Options,
}

impl FileConfigResolver {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    fn read_descriptor(&self, path: &Path) -> std::result::Result<Descriptor, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %path.display(), "No descriptor, using defaults");
                return Ok(Descriptor::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ConfigResolver for FileConfigResolver {
    fn resolve(&self, name: &str) -> std::result::Result<FunctionConfig, ConfigError> {
        let lookup = |variable: &str| {
            if variable == LAMBDA_NAME_VAR {
                Some(name.to_string())
            } else {
                self.options.lookup(variable)
            }
        };

        let entry = self
            .options
            .absolutize(&expand_lenient(&self.options.lambda_path, lookup));
        let descriptor_path = self
            .options
            .absolutize(&expand_lenient(&self.options.config_file, lookup));
        let descriptor = self.read_descriptor(&descriptor_path)?;

        let mut environment = self.options.env.clone();
        for (key, value) in &descriptor.environment {
            let value = expand_strict(value, lookup).map_err(|variable| {
                ConfigError::MissingVariable {
                    key: key.clone(),
                    variable,
                }
            })?;
            environment.insert(key.clone(), value);
        }

        // Zero counts as unset, in the descriptor and in the options.
        let default_timeout = if self.options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.options.timeout
        };
        let timeout = match descriptor.timeout {
            Some(seconds) if seconds != 0.0 => {
                Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidTimeout {
                    path: descriptor_path.clone(),
                    value: seconds,
                })?
            }
            _ => default_timeout,
        };
        let memory = match (descriptor.memory, self.options.memory) {
            (Some(mb), _) if mb > 0 => mb,
            (_, 0) => DEFAULT_MEMORY_MB,
            (_, mb) => mb,
        };

        tracing::debug!(
            function = name,
            entry = %entry.display(),
            descriptor = %descriptor_path.display(),
            timeout_ms = timeout.as_millis() as u64,
            "Resolved function configuration"
        );

        Ok(FunctionConfig {
            entry,
            args: self.options.args.clone(),
            environment,
            timeout,
            memory,
        })
    }
}

/// Expand `${VAR}` placeholders; unknown variables expand to the empty string.
pub fn expand_lenient<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    expand(template, &mut out, |variable| {
        Ok(lookup(variable).unwrap_or_default())
    })
    .map(|()| out)
    .unwrap_or_default()
}

/// Expand `${VAR}` placeholders, failing with the name of the first unknown variable.
pub fn expand_strict<F>(template: &str, lookup: F) -> std::result::Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    expand(template, &mut out, |variable| {
        lookup(variable).ok_or_else(|| variable.to_string())
    })?;
    Ok(out)
}

fn expand<F>(template: &str, out: &mut String, mut resolve: F) -> std::result::Result<(), String>
where
    F: FnMut(&str) -> std::result::Result<String, String>,
{
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(len) = after.find('}') else {
            break;
        };
        let variable = &after[..len];
        if !is_variable_name(variable) {
            // Not a placeholder, keep it literally.
            out.push_str(&rest[..start + 2]);
            rest = after;
            continue;
        }
        out.push_str(&rest[..start]);
        out.push_str(&resolve(variable)?);
        rest = &after[len + 1..];
    }
    out.push_str(rest);
    Ok(())
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// `Duration` as fractional seconds.
mod serde_seconds {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(de::Error::custom)
    }
}

/// `Duration` as whole milliseconds.
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
