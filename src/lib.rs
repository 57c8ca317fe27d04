//! jsgate: an embeddable V8 frontend for multi-threaded hosts.
//!
//! The crate wraps one V8 isolate per [`Context`] behind a dedicated owner
//! thread. Hosts (in-process Rust callers, or foreign languages through the
//! [`ffi`] boundary) submit work from any thread, receive opaque value
//! handles back, and get asynchronous results through a single callback
//! function pointer. Long-running scripts are cancelable and heap growth
//! can be capped with soft and hard limits.

pub mod ffi;
pub mod runtime;

pub use runtime::{
    engine_version, init_platform, is_platform_initialized, Context, PlatformConfig, RawHandle,
    RuntimeError, RuntimeResult, TypeTag, Value,
};
