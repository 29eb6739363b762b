//! lambda-pool - run serverless functions locally.
//!
//! A [`Dispatcher`] maps function names to pools of worker processes. Each
//! call goes to an idle worker of its function, or to a freshly spawned one.
//! Calls are bounded by a per-function timeout, idle workers are reclaimed
//! after `max_idle`, and [`Dispatcher::shutdown`] stops everything.
//!
//! ```no_run
//! # async fn demo() {
//! use lambda_pool::{InvokeOptions, Options, ShutdownOptions};
//! use serde_json::json;
//!
//! let dispatcher = lambda_pool::create(Options::default());
//! let value = dispatcher
//!     .invoke("hello", json!({ "name": "X" }), InvokeOptions::default())
//!     .await;
//! println!("{:?}", value);
//! dispatcher.shutdown(ShutdownOptions::default()).await;
//! # }
//! ```
//!
//! Functions are executables speaking the line protocol in
//! [`worker::protocol`]; the [`runtime`] module implements the worker side
//! for functions written in Rust.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod runtime;
pub mod worker;

pub use config::{ConfigResolver, FileConfigResolver, FunctionConfig, Options};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, Error, InvokeError, Result};
pub use invocation::{Invocation, InvokeOptions, InvokeResult, ShutdownOptions};
pub use worker::PoolStats;

/// Create a dispatcher reading function descriptors from disk.
pub fn create(options: Options) -> Dispatcher {
    Dispatcher::new(options)
}
