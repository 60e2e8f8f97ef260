//! Panic containment for launched work.
//!
//! Every asynchronous execution path runs its unit of work through
//! [`catch_panic`], which turns a panic into a typed [`Aborted`] value the
//! caller must handle instead of a lost task or a poisoned counter.

use std::any::Any;
use std::future::Future;

use tokio_util::task::AbortOnDropHandle;

/// Why a guarded unit of work produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Aborted {
    #[error("panicked: {0}")]
    Panicked(String),

    /// The runtime cancelled the task (shutdown).
    #[error("aborted by runtime")]
    Cancelled,
}

/// Run `fut` on its own task and report a panic instead of propagating it.
///
/// The spawned task is aborted if the returned future is dropped, so no work
/// outlives its caller.
pub async fn catch_panic<F>(fut: F) -> Result<F::Output, Aborted>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match AbortOnDropHandle::new(tokio::spawn(fut)).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => Err(Aborted::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(Aborted::Cancelled),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
