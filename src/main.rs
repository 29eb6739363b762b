//! lambda-pool - run serverless functions locally

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use lambda_pool::logging::{self, LogConfig};
use lambda_pool::{InvokeOptions, InvokeResult, ShutdownOptions};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::{Value, json};

use cli::{Cli, Commands, InvokeArgs};

/// Parses arguments, runs the command and reports errors.
///
/// Exits with status 1 when the command fails or any invocation failed.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let mut log_config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        log_config = log_config.with_file(path.clone());
    }
    logging::init(log_config);

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

/// Run the selected command. Returns whether every invocation succeeded.
fn run(cli: &Cli) -> Result<bool> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        match &cli.command {
            Commands::Invoke(args) => cmd_invoke(cli, args).await,
        }
    })
}

async fn cmd_invoke(cli: &Cli, args: &InvokeArgs) -> Result<bool> {
    let options = cli.options.to_options()?;
    let event: Value = serde_json::from_str(&args.event).context("--event is not valid JSON")?;
    let invoke_options = InvokeOptions {
        aws_request_id: args.request_id.clone(),
    };

    let dispatcher = lambda_pool::create(options);

    let mut results: Vec<InvokeResult> = Vec::with_capacity(args.repeat as usize);
    if args.concurrent {
        let calls: Vec<_> = (0..args.repeat)
            .map(|_| dispatcher.invoke(&args.name, event.clone(), invoke_options.clone()))
            .collect();
        for call in calls {
            results.push(call.await);
        }
    } else {
        for _ in 0..args.repeat {
            results.push(
                dispatcher
                    .invoke(&args.name, event.clone(), invoke_options.clone())
                    .await,
            );
        }
    }

    let mut all_ok = true;
    for result in &results {
        let line = match result {
            Ok(value) => value.clone(),
            Err(e) => {
                all_ok = false;
                tracing::debug!(function = %args.name, error = %e, "Invocation failed");
                json!({ "error": e.to_json() })
            }
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
    }

    dispatcher
        .shutdown(ShutdownOptions {
            graceful: args.graceful,
        })
        .await;

    Ok(all_ok)
}
