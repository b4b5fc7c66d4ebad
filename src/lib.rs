//! crabframe: resilient frame acquisition from hardware video pipelines
//!
//! This crate delivers a continuous stream of compressed video frames from a
//! blocking device session to one consumer, recovering from transient device
//! faults by reopening the session with the same configuration.
//!
//! # Features
//! - One acquisition thread per provider, never two pollers on one session
//! - Expected vs. unexpected error classification
//! - Bounded consecutive restarts with a terminal error state
//! - Single-slot handoff channel with backpressure
//! - Scripted backend for deterministic testing
//! - V4L2 backend (`v4l2` feature, Linux only)
//!
//! # Usage
//! ```rust,no_run
//! use crabframe::testing::ScriptedBackend;
//! use crabframe::{FrameProvider, StreamConfiguration, VideoFormat};
//!
//! let config = StreamConfiguration::new().format(VideoFormat::H264).framerate(30);
//! let provider = FrameProvider::new(ScriptedBackend::new(), config);
//! let frames = provider.frames();
//!
//! provider.start().expect("start provider");
//! for frame in frames.iter().take(10) {
//!     println!("{}", frame);
//! }
//! provider.stop();
//! ```
pub mod config;
pub mod device;
pub mod errors;
pub mod provider;
pub mod types;

// Testing utilities - scripted device backend for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::CrabFrameConfig;
pub use device::{DeviceBackend, DeviceHandle, DeviceInfo};
pub use errors::{ConfigError, DeviceError, DeviceErrorCode, ProviderError};
pub use provider::{
    CodeClassifier, ErrorClass, ErrorClassifier, FrameProvider, FrameReceiver, ProviderSettings,
    ProviderState, ProviderStats,
};
pub use types::{AcquisitionError, Frame, FrameType, StreamConfiguration, VideoFormat};

#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use device::{V4l2Backend, V4l2Handle};

/// Initialize logging for the frame provider
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabframe=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        v4l2: cfg!(all(feature = "v4l2", target_os = "linux")),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Whether the V4L2 backend is compiled in
    pub v4l2: bool,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "crabframe");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        init_logging();
        init_logging();
    }
}
