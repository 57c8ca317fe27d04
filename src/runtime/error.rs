//! Internal error type for runtime plumbing.
//!
//! Client-visible failures never use this type: every operation visible
//! across the language boundary produces a [`Value`](crate::runtime::Value)
//! carrying an error tag instead. `RuntimeError` covers the small set of
//! infrastructure failures (thread spawn, shutdown races) that can only be
//! observed by in-process embedders.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The V8 platform was never initialized. Call
    /// [`init_platform`](crate::runtime::init_platform) first.
    #[error("V8 platform is not initialized")]
    PlatformNotInitialized,

    /// The OS refused to spawn the isolate owner thread.
    #[error("failed to spawn isolate thread: {0}")]
    ThreadSpawn(String),

    /// The owner thread has already exited; the isolate is gone.
    #[error("isolate owner thread has exited")]
    IsolateGone,
}
