//! Worker processes and per-function pools.
//!
//! Every function name gets a [`Pool`]. A pool owns any number of workers,
//! each one a child process speaking newline-delimited JSON over its
//! stdin/stdout and driven by a single tokio task.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Dispatcher    │
//!                     └────────┬────────┘
//!                              │ name → Pool
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │  Pool A   │  │  Pool B   │  │  Pool N   │
//!         └─────┬─────┘  └───────────┘  └───────────┘
//!               │ first inactive entry, or spawn
//!         ┌─────▼─────┐  ┌───────────┐
//!         │ Worker 1  │  │ Worker 2  │   one actor task per process
//!         │ (process) │  │ (process) │   stdin: requests
//!         └───────────┘  └───────────┘   stdout: responses, stderr: logs
//! ```
//!
//! # Lifecycle
//!
//! - **Reuse**: an idle worker takes the next call for its function
//! - **Idle eviction**: workers idle past `max_idle` get SIGTERM
//! - **Call timeout**: a call past its deadline kills the worker with SIGKILL
//! - **Crash recovery**: a dead worker is dropped from its pool and the next
//!   call spawns a fresh one

mod pool;
mod process;
pub mod protocol;
mod signals;
mod spawn;

pub use pool::{Pool, PoolStats};
pub use process::WorkerState;
pub use protocol::{InvocationContext, MemoryUsage, Request, Response};
pub use spawn::worker_environment;
