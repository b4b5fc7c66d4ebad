//! Device session contract consumed by the frame provider.
//!
//! A [`DeviceBackend`] opens sessions; a [`DeviceHandle`] is one open session
//! with the video pipeline. The provider drives a handle through
//! `start -> acquire_frame* -> stop -> release`, and restarts by releasing the
//! handle and opening a fresh one with the same configuration, so backends
//! must not keep shared state between sessions.

use crate::errors::DeviceError;
use crate::types::{Frame, StreamConfiguration};
use std::collections::BTreeMap;

#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::{V4l2Backend, V4l2Handle};

/// Stream statistics reported by a session, keyed the way video devices
/// name them (`width`, `framerate`, `statistics.frame_count`, ...).
/// Flags are reported as 0 or 1.
pub type DeviceInfo = BTreeMap<String, u64>;

/// Opens device sessions.
pub trait DeviceBackend: Send + Sync + 'static {
    type Handle: DeviceHandle;

    /// Allocate a session configured from the set fields of `config`.
    ///
    /// The returned handle does not deliver frames until [`DeviceHandle::start`].
    fn open(&self, config: &StreamConfiguration) -> Result<Self::Handle, DeviceError>;
}

/// One open session with a video device.
pub trait DeviceHandle: Send + 'static {
    /// Begin buffering frames.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block until the next frame or a low-level error.
    ///
    /// Must be safe to call repeatedly until [`DeviceHandle::stop`].
    fn acquire_frame(&mut self) -> Result<Frame, DeviceError>;

    /// Halt buffering. Idempotent.
    fn stop(&mut self);

    /// Current stream statistics. Backends without any report nothing.
    fn info(&self) -> DeviceInfo {
        DeviceInfo::new()
    }

    /// Release OS-level resources held by the session.
    fn release(self);
}

/// Open and start a session, releasing it again if `start` fails.
pub(crate) fn open_and_start<B: DeviceBackend>(
    backend: &B,
    config: &StreamConfiguration,
) -> Result<B::Handle, OpenFailure> {
    let mut handle = backend.open(config).map_err(OpenFailure::Open)?;
    if let Err(e) = handle.start() {
        handle.release();
        return Err(OpenFailure::Start(e));
    }
    Ok(handle)
}

/// Stop then release a session.
pub(crate) fn close<H: DeviceHandle>(mut handle: H) {
    handle.stop();
    handle.release();
}

/// Which step of [`open_and_start`] failed.
#[derive(Debug)]
pub(crate) enum OpenFailure {
    Open(DeviceError),
    Start(DeviceError),
}

impl OpenFailure {
    pub(crate) fn into_inner(self) -> DeviceError {
        match self {
            OpenFailure::Open(e) | OpenFailure::Start(e) => e,
        }
    }
}
