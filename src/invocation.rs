//! Per-call options and the future returned by `invoke`.

use crate::error::InvokeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Options for a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvokeOptions {
    /// Request id handed to the function instead of a generated one.
    pub aws_request_id: Option<String>,
}

impl InvokeOptions {
    pub fn with_request_id(id: impl Into<String>) -> Self {
        Self {
            aws_request_id: Some(id.into()),
        }
    }
}

/// Options for [`Dispatcher::shutdown`](crate::Dispatcher::shutdown).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownOptions {
    /// Let in-flight calls finish before their workers are stopped.
    pub graceful: bool,
}

impl ShutdownOptions {
    pub fn graceful() -> Self {
        Self { graceful: true }
    }
}

/// Outcome of one invocation.
pub type InvokeResult = Result<Value, InvokeError>;

/// Future resolving to the outcome of one invocation.
///
/// Dropping it does not cancel the call; the worker still runs it to
/// completion or timeout.
#[must_use = "an Invocation does nothing to report its outcome unless awaited"]
pub struct Invocation {
    inner: Inner,
}

enum Inner {
    /// Failed before reaching a worker.
    Ready(Option<InvokeResult>),
    Pending {
        name: String,
        rx: oneshot::Receiver<InvokeResult>,
    },
}

impl Invocation {
    pub(crate) fn ready(result: InvokeResult) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    pub(crate) fn pending(name: impl Into<String>, rx: oneshot::Receiver<InvokeResult>) -> Self {
        Self {
            inner: Inner::Pending {
                name: name.into(),
                rx,
            },
        }
    }
}

impl Future for Invocation {
    type Output = InvokeResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(result) => {
                Poll::Ready(result.take().expect("Invocation polled after completion"))
            }
            Inner::Pending { name, rx } => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(InvokeError::Failed {
                        name: name.clone(),
                        reason: "worker dropped the call".to_string(),
                    })
                })
            }),
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Ready(_) => f.write_str("Invocation(ready)"),
            Inner::Pending { name, .. } => write!(f, "Invocation(pending: {})", name),
        }
    }
}
