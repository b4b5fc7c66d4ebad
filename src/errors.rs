use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Low-level failure codes reported by a video device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorCode {
    NotFound,
    Exists,
    InvalidArgument,
    PermissionDenied,
    NotSupported,
    Closed,
    Busy,
    Io,
    Hal,
    #[serde(rename = "dbus")]
    DBus,
    Oom,
    Idle,
    NoData,
    NoBufferSpace,
    BufferFailure,
    InterfaceDown,
    Failed,
    Fatal,
    NotControlled,
    NoEvent,
}

impl DeviceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceErrorCode::NotFound => "not_found",
            DeviceErrorCode::Exists => "exists",
            DeviceErrorCode::InvalidArgument => "invalid_argument",
            DeviceErrorCode::PermissionDenied => "permission_denied",
            DeviceErrorCode::NotSupported => "not_supported",
            DeviceErrorCode::Closed => "closed",
            DeviceErrorCode::Busy => "busy",
            DeviceErrorCode::Io => "io",
            DeviceErrorCode::Hal => "hal",
            DeviceErrorCode::DBus => "dbus",
            DeviceErrorCode::Oom => "oom",
            DeviceErrorCode::Idle => "idle",
            DeviceErrorCode::NoData => "no_data",
            DeviceErrorCode::NoBufferSpace => "no_buffer_space",
            DeviceErrorCode::BufferFailure => "buffer_failure",
            DeviceErrorCode::InterfaceDown => "interface_down",
            DeviceErrorCode::Failed => "failed",
            DeviceErrorCode::Fatal => "fatal",
            DeviceErrorCode::NotControlled => "not_controlled",
            DeviceErrorCode::NoEvent => "no_event",
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a device backend or handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device error ({code}): {message}")]
pub struct DeviceError {
    pub code: DeviceErrorCode,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn interface_down(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorCode::InterfaceDown, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorCode::NotFound, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorCode::Failed, message)
    }
}

/// Errors surfaced synchronously by [`crate::FrameProvider`] control calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to open device session: {0}")]
    Open(#[source] DeviceError),
    #[error("failed to start device session: {0}")]
    Start(#[source] DeviceError),
    #[error("failed to restart device session: {0}")]
    Restart(#[source] DeviceError),
    #[error("frame provider is already started")]
    AlreadyStarted,
    #[error("frame provider is not started")]
    NotStarted,
    #[error("frame provider is in a terminal error state and must be recreated")]
    Terminal,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ProviderError {
    /// The underlying device error, if this failure came from the device.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            ProviderError::Open(e) | ProviderError::Start(e) | ProviderError::Restart(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

/// Errors raised while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("configuration file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
