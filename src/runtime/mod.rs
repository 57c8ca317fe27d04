//! Multi-threaded frontend for an embedded V8 engine.
//!
//! Each [`Context`] owns a single V8 isolate running on a dedicated OS
//! thread. External threads never touch the isolate directly: all engine
//! access is funneled through the owner thread's task queue, values cross
//! the boundary as stable handle pointers, and long-running scripts can be
//! cancelled cooperatively from any thread.

pub mod callback;
pub mod collector;
pub mod context;
pub mod error;
pub mod eval;
pub mod factory;
pub mod heap;
pub mod isolate;
pub mod memory;
pub mod object;
pub mod task;
pub mod value;

use std::path::PathBuf;

use once_cell::sync::OnceCell;

pub use context::Context;
pub use error::{RuntimeError, RuntimeResult};
pub use value::{RawHandle, TypeTag, Value};

/// Global V8 platform instance.
///
/// V8 requires exactly one platform to be initialized before creating
/// isolates. This is a singleton that is initialized once on first access.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Process-wide engine options, consumed by [`init_platform`].
#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    /// Raw V8 flag string, e.g. `"--expose-gc --single-threaded"`.
    pub flags: String,

    /// Path to an external ICU data file. The bundled engine build carries
    /// its own ICU data, so this is accepted for interface compatibility
    /// and otherwise ignored.
    pub icu_data_path: Option<PathBuf>,

    /// Path to an external startup snapshot. Ignored for the same reason.
    pub snapshot_path: Option<PathBuf>,
}

/// Initialize the V8 platform exactly once.
///
/// Safe to call multiple times; only the first call's configuration takes
/// effect. Must be called before creating any [`Context`].
///
/// If `flags` contains `--single-threaded`, the single-threaded platform is
/// used and V8 spawns no worker threads of its own.
pub fn init_platform(config: &PlatformConfig) {
    V8_PLATFORM.get_or_init(|| {
        if config.icu_data_path.is_some() || config.snapshot_path.is_some() {
            tracing::debug!("external ICU/snapshot paths ignored; engine data is bundled");
        }

        if !config.flags.is_empty() {
            v8::V8::set_flags_from_string(&config.flags);
        }

        let platform = if config.flags.contains("--single-threaded") {
            v8::new_single_threaded_default_platform(false).make_shared()
        } else {
            v8::new_default_platform(0, false).make_shared()
        };
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();

        platform
    });
}

/// Check if the V8 platform has been initialized.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

/// Shared reference to the platform, for the owner-thread message pump.
pub(crate) fn platform() -> Option<v8::SharedRef<v8::Platform>> {
    V8_PLATFORM.get().cloned()
}

/// Version string of the embedded engine.
pub fn engine_version() -> &'static str {
    v8::V8::get_version()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_initialization() {
        test_util::init_v8();
        assert!(is_platform_initialized());

        // Should be safe to call again
        init_platform(&PlatformConfig::default());
        assert!(is_platform_initialized());
    }

    #[test]
    fn test_engine_version_nonempty() {
        assert!(!engine_version().is_empty());
    }
}
