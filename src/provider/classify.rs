//! Expected vs. unexpected device errors.
//!
//! Expected errors are the ones a device reports while its service is being
//! restarted or reconfigured (a dynamic range switch, a capture mode change,
//! a force-stopped video daemon). They are the only errors that trigger an
//! automatic session restart.

use crate::errors::{DeviceError, DeviceErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Recoverable by reopening the session.
    Expected,
    /// Forwarded to the consumer as data.
    Unexpected,
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, error: &DeviceError) -> ErrorClass;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&DeviceError) -> ErrorClass + Send + Sync + 'static,
{
    fn classify(&self, error: &DeviceError) -> ErrorClass {
        self(error)
    }
}

/// Classifies by error code membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeClassifier {
    expected: HashSet<DeviceErrorCode>,
}

impl CodeClassifier {
    /// Codes reported while the device service is going through maintenance.
    pub const DEFAULT_EXPECTED: [DeviceErrorCode; 3] = [
        DeviceErrorCode::InterfaceDown,
        DeviceErrorCode::Closed,
        DeviceErrorCode::DBus,
    ];

    pub fn new(expected: impl IntoIterator<Item = DeviceErrorCode>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
        }
    }

    pub fn is_expected(&self, code: DeviceErrorCode) -> bool {
        self.expected.contains(&code)
    }
}

impl Default for CodeClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXPECTED)
    }
}

impl ErrorClassifier for CodeClassifier {
    fn classify(&self, error: &DeviceError) -> ErrorClass {
        if self.is_expected(error.code) {
            ErrorClass::Expected
        } else {
            ErrorClass::Unexpected
        }
    }
}
