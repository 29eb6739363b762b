//! Demo functions for lambda-pool.
//!
//! One executable serving several functions; the function is picked from
//! `AWS_LAMBDA_FUNCTION_NAME`. Point `--lambda-path` at this binary to try
//! them out:
//!
//! ```text
//! lambda-pool --lambda-path target/debug/lambda-demo invoke hello --event '{"name":"X"}'
//! ```

use lambda_pool::runtime::{self, Callback, Context, HandlerError, callback};
use lambda_pool::worker::protocol::{Request, Response};
use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type HandlerResult = Result<Value, HandlerError>;

/// Calls served by this process.
static COUNTER: AtomicU64 = AtomicU64::new(0);

fn name_of(event: &Value) -> &str {
    event["name"].as_str().unwrap_or("world")
}

fn delay_of(event: &Value) -> Duration {
    Duration::from_millis(event["delay_ms"].as_u64().unwrap_or(0))
}

async fn hello(event: Value, _ctx: Context) -> HandlerResult {
    Ok(json!(format!("Hello {}", name_of(&event))))
}

fn hello_async(event: Value, _ctx: Context, done: Callback) {
    tokio::spawn(async move {
        tokio::time::sleep(delay_of(&event)).await;
        done.succeed(json!(format!("Hello {}", name_of(&event))));
    });
}

async fn reuse(_event: Value, _ctx: Context) -> HandlerResult {
    let count = COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    Ok(json!(format!("Count {}", count)))
}

/// Counts like `reuse` but answers late, so overlapping calls need separate workers.
fn concurrent(_event: Value, _ctx: Context, done: Callback) {
    let count = COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        done.succeed(json!(format!("Count {}", count)));
    });
}

async fn context(_event: Value, ctx: Context) -> HandlerResult {
    Ok(json!({
        "functionName": ctx.function_name,
        "memoryLimitInMB": ctx.memory_limit_in_mb,
        "awsRequestId": ctx.aws_request_id,
        "invokedFunctionArn": ctx.invoked_function_arn,
    }))
}

async fn env(_event: Value, _ctx: Context) -> HandlerResult {
    let vars: serde_json::Map<String, Value> = std::env::vars()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    Ok(Value::Object(vars))
}

async fn timeout(_event: Value, _ctx: Context) -> HandlerResult {
    std::future::pending().await
}

async fn throw(_event: Value, _ctx: Context) -> HandlerResult {
    panic!("Ouch!")
}

async fn crash(_event: Value, _ctx: Context) -> HandlerResult {
    std::process::exit(70)
}

async fn error(_event: Value, _ctx: Context) -> HandlerResult {
    Err(HandlerError::new("Ouch!"))
}

async fn remaining_time(_event: Value, ctx: Context) -> HandlerResult {
    Ok(json!(ctx.remaining_time_in_millis()))
}

async fn memory(event: Value, _ctx: Context) -> HandlerResult {
    let mib = event["mib"].as_u64().unwrap_or(32) as usize;
    let block = std::hint::black_box(vec![0xA5u8; mib * 1024 * 1024]);
    Ok(json!(block.len()))
}

async fn echo(event: Value, _ctx: Context) -> HandlerResult {
    tokio::time::sleep(delay_of(&event)).await;
    Ok(event)
}

async fn log(event: Value, ctx: Context) -> HandlerResult {
    println!("Raw log line");
    eprintln!("{} received {}", ctx.aws_request_id, event);
    Ok(Value::Null)
}

async fn unknown(_event: Value, ctx: Context) -> HandlerResult {
    Err(HandlerError::new(format!(
        "Unknown demo function: {}",
        ctx.function_name
    )))
}

/// Answers every request with a result that is not JSON.
fn invalid_response() -> ! {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(request) = Request::from_line(&line) else {
            continue;
        };
        let response = Response {
            id: request.id,
            err: None,
            res: Some("not json".to_string()),
            mem: None,
        };
        let Ok(out) = response.to_line() else { continue };
        if stdout.write_all(out.as_bytes()).and_then(|_| stdout.flush()).is_err() {
            break;
        }
    }
    std::process::exit(0)
}

fn main() {
    let name = std::env::var("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_default();
    match name.as_str() {
        "hello" => runtime::run(hello),
        "hello-async" => runtime::run(callback(hello_async)),
        "reuse" => runtime::run(reuse),
        "concurrent" => runtime::run(callback(concurrent)),
        "context" => runtime::run(context),
        "env" => runtime::run(env),
        "timeout" => runtime::run(timeout),
        "throw" => runtime::run(throw),
        "crash" => runtime::run(crash),
        "error" => runtime::run(error),
        "invalid-response" => invalid_response(),
        "remaining-time" => runtime::run(remaining_time),
        "memory" => runtime::run(memory),
        "echo" => runtime::run(echo),
        "log" => runtime::run(log),
        _ => runtime::run(unknown),
    }
}
