use crate::types::Frame;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Consumer side of a provider's single-slot frame channel.
///
/// The channel outlives restarts and stop/start cycles, so one receiver
/// keeps working for the lifetime of the provider.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: Receiver<Frame>,
}

impl FrameReceiver {
    pub(crate) fn new(rx: Receiver<Frame>) -> Self {
        Self { rx }
    }

    /// Block until the next frame.
    pub fn recv(&self) -> Result<Frame, RecvError> {
        self.rx.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Frame, TryRecvError> {
        self.rx.try_recv()
    }

    /// Frames currently waiting in the handoff slot (0 or 1).
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocking iterator over delivered frames.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Frame> {
        self.rx.iter()
    }
}

impl<'a> IntoIterator for &'a FrameReceiver {
    type Item = Frame;
    type IntoIter = crossbeam_channel::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.iter()
    }
}
