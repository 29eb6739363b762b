//! Command-line interface definitions using clap.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lambda_pool::Options;
use lambda_pool::logging::LogFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Run serverless functions locally.
#[derive(Parser, Debug)]
#[command(name = "lambda-pool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log format.
    #[arg(long, global = true, env = "LAMBDA_POOL_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true, env = "LAMBDA_POOL_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(flatten)]
    pub options: OptionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Invoke a function and print its result as JSON.
    Invoke(InvokeArgs),
}

/// Host options, layered over `--options FILE` when given.
#[derive(Args, Debug, Default)]
pub struct OptionArgs {
    /// JSON file with host options.
    #[arg(long = "options", global = true, value_name = "FILE")]
    pub options_file: Option<PathBuf>,

    /// Template for function executables.
    #[arg(long, global = true, value_name = "TEMPLATE")]
    pub lambda_path: Option<String>,

    /// Template for function descriptor files.
    #[arg(long, global = true, value_name = "TEMPLATE")]
    pub config_file: Option<String>,

    /// Base directory for relative templates.
    #[arg(long, global = true, env = "LAMBDA_POOL_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Default environment variable for functions (repeatable).
    #[arg(long = "env", short = 'e', global = true, value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Default call timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<f64>,

    /// Default memory size in MB.
    #[arg(long, global = true)]
    pub memory: Option<u32>,

    /// Idle eviction window in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    pub max_idle: Option<u64>,
}

impl OptionArgs {
    /// Build host options: file first, then flags.
    pub fn to_options(&self) -> Result<Options> {
        let mut options = match &self.options_file {
            Some(path) => Options::from_file(path)
                .with_context(|| format!("Failed to load options from {}", path.display()))?,
            None => Options::default(),
        };

        if let Some(template) = &self.lambda_path {
            options.lambda_path = template.clone();
        }
        if let Some(template) = &self.config_file {
            options.config_file = template.clone();
        }
        if let Some(dir) = &self.base_dir {
            options.base_dir = Some(dir.clone());
        }
        for (key, value) in &self.env {
            options.env.insert(key.clone(), value.clone());
        }
        if let Some(seconds) = self.timeout {
            options.timeout = Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("--timeout must be a non-negative number, got {}", seconds))?;
        }
        if let Some(memory) = self.memory {
            options.memory = memory;
        }
        if let Some(ms) = self.max_idle {
            options.max_idle = Duration::from_millis(ms);
        }
        Ok(options)
    }
}

/// Arguments for the invoke command.
#[derive(Args, Debug)]
pub struct InvokeArgs {
    /// Function name.
    pub name: String,

    /// Event passed to the function, as JSON.
    #[arg(long, default_value = "{}")]
    pub event: String,

    /// Request id handed to the function instead of a generated one.
    #[arg(long)]
    pub request_id: Option<String>,

    /// Number of invocations.
    #[arg(long, short = 'n', default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    /// Start all invocations at once instead of one after another.
    #[arg(long)]
    pub concurrent: bool,

    /// Print pool statistics to stderr before shutting down.
    #[arg(long)]
    pub stats: bool,

    /// Let in-flight calls finish on shutdown.
    #[arg(long)]
    pub graceful: bool,
}

fn parse_log_format(s: &str) -> std::result::Result<LogFormat, String> {
    s.parse()
}

/// Parse a `KEY=VALUE` pair.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invoke() {
        let cli = Cli::try_parse_from([
            "lambda-pool",
            "invoke",
            "hello",
            "--event",
            r#"{"name":"X"}"#,
            "--repeat",
            "3",
            "--concurrent",
        ])
        .unwrap();
        let Commands::Invoke(args) = cli.command;
        assert_eq!(args.name, "hello");
        assert_eq!(args.repeat, 3);
        assert!(args.concurrent);
        assert!(!args.graceful);
    }

    #[test]
    fn test_repeat_must_be_positive() {
        let result = Cli::try_parse_from(["lambda-pool", "invoke", "hello", "--repeat", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_option_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "lambda-pool",
            "invoke",
            "hello",
            "--timeout",
            "0.5",
            "--memory",
            "64",
            "--max-idle",
            "200",
            "-e",
            "AWS_PROFILE=local",
            "--env",
            "EMPTY=",
        ])
        .unwrap();
        let options = cli.options.to_options().unwrap();
        assert_eq!(options.timeout, Duration::from_millis(500));
        assert_eq!(options.memory, 64);
        assert_eq!(options.max_idle, Duration::from_millis(200));
        assert_eq!(options.env["AWS_PROFILE"], "local");
        assert_eq!(options.env["EMPTY"], "");
    }

    #[test]
    fn test_options_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"memory": 256, "timeout": 2, "env": {"A": "1"}}"#).unwrap();

        let options = OptionArgs {
            options_file: Some(path),
            memory: Some(512),
            ..Default::default()
        }
        .to_options()
        .unwrap();
        assert_eq!(options.memory, 512);
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.env["A"], "1");
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let options = OptionArgs {
            timeout: Some(-1.0),
            ..Default::default()
        };
        assert!(options.to_options().is_err());
    }
}
