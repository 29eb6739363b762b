//! Worker-side runtime for functions written in Rust.
//!
//! A function binary hands its handler to [`run`] (or awaits [`serve`]). The
//! runtime reads requests from stdin, runs each one on its own task and
//! writes exactly one response line per request to stdout. [`run`] moves
//! the function's own stdout onto stderr, so whatever it prints ends up in
//! the host's log.
//!
//! ```no_run
//! use lambda_pool::runtime::{self, Context, HandlerError};
//! use serde_json::{Value, json};
//!
//! async fn hello(event: Value, _ctx: Context) -> Result<Value, HandlerError> {
//!     Ok(json!(format!("Hello {}", event["name"].as_str().unwrap_or("world"))))
//! }
//!
//! fn main() {
//!     runtime::run(hello)
//! }
//! ```

use crate::error::Result;
use crate::worker::protocol::{InvocationContext, MemoryUsage, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot};

/// Environment variable carrying the memory limit in MB.
pub const MEMORY_SIZE_VAR: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";

/// Call metadata as seen by a handler.
#[derive(Debug, Clone)]
pub struct Context {
    pub function_name: String,
    pub memory_limit_in_mb: u32,
    pub invoked_function_arn: String,
    pub aws_request_id: String,
    pub timeout: Duration,
    received_at: Instant,
}

impl Context {
    /// Context for a request received just now.
    pub fn new(context: InvocationContext) -> Self {
        Self {
            timeout: Duration::try_from_secs_f64(context.timeout).unwrap_or_default(),
            function_name: context.function_name,
            memory_limit_in_mb: context.memory_limit_in_mb,
            invoked_function_arn: context.invoked_function_arn,
            aws_request_id: context.aws_request_id,
            received_at: Instant::now(),
        }
    }

    /// Time left before the host kills this call.
    pub fn remaining_time(&self) -> Duration {
        self.timeout.saturating_sub(self.received_at.elapsed())
    }

    /// Milliseconds left; negative once the deadline has passed.
    pub fn remaining_time_in_millis(&self) -> i64 {
        self.timeout.as_millis() as i64 - self.received_at.elapsed().as_millis() as i64
    }
}

/// Error returned by a handler. Sent to the caller as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl HandlerError {
    /// Error named `Error`, with the caller's location as its stack.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    #[track_caller]
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let caller = Location::caller();
        Self {
            stack: Some(format!("{}: {}\n    at {}", name, message, caller)),
            name,
            message,
        }
    }

    /// JSON form placed in the response's `err` field.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

pub type HandlerFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static>>;

/// A function body. Implemented for every `async fn(Value, Context)`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, event: Value, context: Context) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, event: Value, context: Context) -> HandlerFuture {
        Box::pin(self(event, context))
    }
}

/// Completion handed to callback-style handlers. Consumed by its first use.
#[derive(Debug)]
pub struct Callback {
    tx: oneshot::Sender<std::result::Result<Value, HandlerError>>,
}

impl Callback {
    pub fn done(self, result: std::result::Result<Value, HandlerError>) {
        let _ = self.tx.send(result);
    }

    pub fn succeed(self, value: Value) {
        self.done(Ok(value))
    }

    pub fn fail(self, error: HandlerError) {
        self.done(Err(error))
    }
}

/// Handler built by [`callback`].
pub struct CallbackHandler<F>(F);

/// Adapt a callback-style function into a [`Handler`].
///
/// The function may complete its [`Callback`] later, from another task.
pub fn callback<F>(f: F) -> CallbackHandler<F>
where
    F: Fn(Value, Context, Callback) + Send + Sync + 'static,
{
    CallbackHandler(f)
}

impl<F> Handler for CallbackHandler<F>
where
    F: Fn(Value, Context, Callback) + Send + Sync + 'static,
{
    fn call(&self, event: Value, context: Context) -> HandlerFuture {
        let (tx, rx) = oneshot::channel();
        (self.0)(event, context, Callback { tx });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(HandlerError::new("callback dropped without a result")))
        })
    }
}

/// Peak resident set size of this process in bytes.
fn max_rss_bytes() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                max_rss
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                max_rss * 1024
            }
        }
        Err(_) => 0,
    }
}

fn memory_limit_bytes() -> Option<u64> {
    std::env::var(MEMORY_SIZE_VAR)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|mb| mb * 1024 * 1024)
}

/// Encode the outcome of request `id` as a response.
fn respond(id: u64, outcome: std::result::Result<Value, HandlerError>, rss: u64) -> Response {
    let response = match outcome {
        Ok(value) => Response::success(id, &value).unwrap_or_else(|e| {
            Response::failure(id, HandlerError::new(e.to_string()).to_json())
        }),
        Err(err) => Response::failure(id, err.to_json()),
    };
    response.with_memory(MemoryUsage {
        rss,
        ..MemoryUsage::default()
    })
}

/// Serve requests from stdin until it closes, answering on stdout.
///
/// A panicking handler or a memory overrun ends the process with status 1
/// without answering, which the host reports as a failed call.
pub async fn serve<H: Handler>(handler: H) -> Result<()> {
    serve_with(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Like [`serve`], reading requests from `input` and writing responses to `output`.
pub async fn serve_with<H, R, W>(handler: H, input: R, output: W) -> Result<()>
where
    H: Handler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::new(handler);
    let output = Arc::new(Mutex::new(output));
    let memory_limit = memory_limit_bytes();

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match Request::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("Invalid request: {}", e);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let output = Arc::clone(&output);
        tokio::spawn(async move {
            let id = request.id;
            let context = Context::new(request.context);
            let call = tokio::spawn(handler.call(request.event, context));
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    eprintln!("Handler panicked, exiting");
                    std::process::exit(1);
                }
                Err(_) => return,
            };

            let rss = max_rss_bytes();
            if let Some(limit) = memory_limit
                && rss > limit
            {
                eprintln!(
                    "Memory limit exceeded: {} MB used, {} MB allowed",
                    rss / (1024 * 1024),
                    limit / (1024 * 1024)
                );
                std::process::exit(1);
            }

            let line = match respond(id, outcome, rss).to_line() {
                Ok(line) => line,
                Err(e) => {
                    eprintln!("Failed to encode response: {}", e);
                    return;
                }
            };
            let mut out = output.lock().await;
            if out.write_all(line.as_bytes()).await.is_err() || out.flush().await.is_err() {
                // Host is gone.
                std::process::exit(0);
            }
        });
    }
    Ok(())
}

/// Take over stdout for protocol messages and point fd 1 at stderr.
///
/// Anything the function prints then ends up in the host's log instead of
/// corrupting the message stream.
fn claim_protocol_stdout() -> nix::Result<std::fs::File> {
    use nix::fcntl::{FcntlArg, fcntl};
    use std::os::fd::{AsRawFd, FromRawFd};

    let stdout = std::io::stdout().as_raw_fd();
    let protocol = fcntl(stdout, FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // SAFETY: `protocol` is a fresh descriptor owned by nothing else.
    let file = unsafe { std::fs::File::from_raw_fd(protocol) };
    nix::unistd::dup2(std::io::stderr().as_raw_fd(), stdout)?;
    Ok(file)
}

/// Run `handler` as this process's function. Never returns.
pub fn run<H: Handler>(handler: H) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let protocol = match claim_protocol_stdout() {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to redirect stdout: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let served = runtime.block_on(async move {
        let output = tokio::fs::File::from_std(protocol);
        serve_with(handler, tokio::io::stdin(), output).await
    });
    match served {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
