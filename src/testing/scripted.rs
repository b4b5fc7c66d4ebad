//! Scripted device backend.
//!
//! Every session opened from one [`ScriptedBackend`] pulls from the same
//! step queue, so a script keeps going across restarts. Sequence numbers are
//! assigned from a single counter and never repeat.

use crate::device::{DeviceBackend, DeviceHandle, DeviceInfo};
use crate::errors::{DeviceError, DeviceErrorCode};
use crate::types::{Frame, FrameType, SettingValue, StreamConfiguration, VideoFormat};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One scripted outcome of `acquire_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Deliver a frame of this type.
    Frame(FrameType),
    /// Fail with this code.
    Error(DeviceErrorCode),
    /// Block until [`ScriptedBackend::release_hold`], then continue with the next step.
    Hold,
}

/// What `acquire_frame` does once the script is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Keep producing frames in a GOP pattern matching the configured format.
    Frames,
    /// Keep failing with this code.
    Error(DeviceErrorCode),
}

/// Calls observed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptCounters {
    pub opens: u64,
    pub open_failures: u64,
    pub starts: u64,
    pub start_failures: u64,
    pub stops: u64,
    pub releases: u64,
    pub acquires: u64,
    pub active_acquires: u32,
    pub max_concurrent_acquires: u32,
    pub holds_waiting: u32,
}

impl ScriptCounters {
    /// Sessions opened successfully and not yet released.
    pub fn live_sessions(&self) -> u64 {
        (self.opens - self.open_failures).saturating_sub(self.releases)
    }
}

#[derive(Debug)]
struct ScriptState {
    steps: VecDeque<Step>,
    exhaustion: Exhaustion,
    open_outcomes: VecDeque<Option<DeviceErrorCode>>,
    start_outcomes: VecDeque<Option<DeviceErrorCode>>,
    acquire_delay: Duration,
    gop_length: u64,
    next_sequence: u64,
    holds_released: u64,
    holds_taken: u64,
    applied: Vec<Vec<(&'static str, SettingValue)>>,
    counters: ScriptCounters,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<ScriptState>,
    cv: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic [`DeviceBackend`] for tests and demos.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Backend with an empty script that produces frames forever.
    pub fn new() -> Self {
        Self::with_steps(Vec::new())
    }

    pub fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ScriptState {
                    steps: steps.into_iter().collect(),
                    exhaustion: Exhaustion::Frames,
                    open_outcomes: VecDeque::new(),
                    start_outcomes: VecDeque::new(),
                    acquire_delay: Duration::ZERO,
                    gop_length: 30,
                    next_sequence: 1,
                    holds_released: 0,
                    holds_taken: 0,
                    applied: Vec::new(),
                    counters: ScriptCounters::default(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn exhaustion(self, exhaustion: Exhaustion) -> Self {
        self.inner.lock().exhaustion = exhaustion;
        self
    }

    /// Time every `acquire_frame` call spends "waiting for the sensor".
    pub fn acquire_delay(self, delay: Duration) -> Self {
        self.inner.lock().acquire_delay = delay;
        self
    }

    pub fn gop_length(self, gop: u32) -> Self {
        self.inner.lock().gop_length = u64::from(gop.max(1));
        self
    }

    /// Outcomes for the next `open` calls, in order. `None` succeeds.
    /// Opens beyond the list succeed.
    pub fn open_outcomes(self, outcomes: impl IntoIterator<Item = Option<DeviceErrorCode>>) -> Self {
        self.inner.lock().open_outcomes.extend(outcomes);
        self
    }

    /// Outcomes for the next `start` calls, in order. `None` succeeds.
    pub fn start_outcomes(
        self,
        outcomes: impl IntoIterator<Item = Option<DeviceErrorCode>>,
    ) -> Self {
        self.inner.lock().start_outcomes.extend(outcomes);
        self
    }

    /// Make the next `count` opens fail with `code`.
    pub fn fail_next_opens(&self, count: usize, code: DeviceErrorCode) {
        let mut state = self.inner.lock();
        for _ in 0..count {
            state.open_outcomes.push_front(Some(code));
        }
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.lock().steps.extend(steps);
        self.inner.cv.notify_all();
    }

    /// Let one blocked [`Step::Hold`] continue.
    pub fn release_hold(&self) {
        self.inner.lock().holds_released += 1;
        self.inner.cv.notify_all();
    }

    pub fn counters(&self) -> ScriptCounters {
        self.inner.lock().counters.clone()
    }

    /// Settings applied by each successful `open`, in order.
    pub fn applied_settings(&self) -> Vec<Vec<(&'static str, SettingValue)>> {
        self.inner.lock().applied.clone()
    }

    /// Wait until `predicate` holds for the counters, or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&ScriptCounters) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if predicate(&state.counters) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .inner
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    /// Wait until `count` acquisitions are parked on [`Step::Hold`].
    pub fn wait_for_holds(&self, count: u32, timeout: Duration) -> bool {
        self.wait_for(timeout, |c| c.holds_waiting >= count)
    }
}

impl DeviceBackend for ScriptedBackend {
    type Handle = ScriptedHandle;

    fn open(&self, config: &StreamConfiguration) -> Result<ScriptedHandle, DeviceError> {
        let mut state = self.inner.lock();
        state.counters.opens += 1;
        let outcome = state.open_outcomes.pop_front().flatten();
        let result = match outcome {
            Some(code) => {
                state.counters.open_failures += 1;
                Err(DeviceError::new(code, "scripted open failure"))
            }
            None => {
                let settings = config.settings();
                state.applied.push(settings.clone());
                Ok(ScriptedHandle {
                    inner: Arc::clone(&self.inner),
                    format: config.format.unwrap_or(VideoFormat::H264),
                    settings,
                    started: false,
                    stopped: false,
                    stats: SessionStats::default(),
                })
            }
        };
        drop(state);
        self.inner.cv.notify_all();
        result
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    frames: u64,
    key_frames: u64,
    failed: u64,
    bytes: u64,
}

/// Session opened from a [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedHandle {
    inner: Arc<Inner>,
    format: VideoFormat,
    settings: Vec<(&'static str, SettingValue)>,
    started: bool,
    stopped: bool,
    stats: SessionStats,
}

impl ScriptedHandle {
    fn next_frame(&self, state: &mut ScriptState, frame_type: FrameType) -> Frame {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        Frame::new(sequence, frame_type, synthetic_payload(frame_type, sequence))
    }

    fn gop_frame_type(&self, state: &ScriptState) -> FrameType {
        let key = (state.next_sequence - 1) % state.gop_length == 0;
        match (self.format, key) {
            (VideoFormat::H265, true) => FrameType::H265Idr,
            (VideoFormat::H265, false) => FrameType::H265P,
            (VideoFormat::Jpeg, _) => FrameType::Jpeg,
            (_, true) => FrameType::H264Idr,
            (_, false) => FrameType::H264P,
        }
    }
}

impl DeviceHandle for ScriptedHandle {
    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = self.inner.lock();
        state.counters.starts += 1;
        if let Some(code) = state.start_outcomes.pop_front().flatten() {
            state.counters.start_failures += 1;
            return Err(DeviceError::new(code, "scripted start failure"));
        }
        self.started = true;
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Frame, DeviceError> {
        if !self.started || self.stopped {
            return Err(DeviceError::new(
                DeviceErrorCode::Closed,
                "session is not streaming",
            ));
        }

        let mut state = self.inner.lock();
        state.counters.acquires += 1;
        state.counters.active_acquires += 1;
        state.counters.max_concurrent_acquires = state
            .counters
            .max_concurrent_acquires
            .max(state.counters.active_acquires);
        self.inner.cv.notify_all();

        let delay = state.acquire_delay;
        if !delay.is_zero() {
            drop(state);
            std::thread::sleep(delay);
            state = self.inner.lock();
        }

        let result = loop {
            match state.steps.pop_front() {
                Some(Step::Hold) => {
                    let ticket = state.holds_taken;
                    state.holds_taken += 1;
                    state.counters.holds_waiting += 1;
                    self.inner.cv.notify_all();
                    while state.holds_released <= ticket {
                        state = self
                            .inner
                            .cv
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    state.counters.holds_waiting -= 1;
                }
                Some(Step::Frame(frame_type)) => break Ok(self.next_frame(&mut state, frame_type)),
                Some(Step::Error(code)) => {
                    break Err(DeviceError::new(code, "scripted acquisition failure"))
                }
                None => match state.exhaustion {
                    Exhaustion::Frames => {
                        let frame_type = self.gop_frame_type(&state);
                        break Ok(self.next_frame(&mut state, frame_type));
                    }
                    Exhaustion::Error(code) => {
                        break Err(DeviceError::new(code, "scripted acquisition failure"))
                    }
                },
            }
        };

        state.counters.active_acquires -= 1;
        drop(state);
        self.inner.cv.notify_all();

        match &result {
            Ok(frame) => {
                self.stats.frames += 1;
                self.stats.bytes += frame.size() as u64;
                if frame.is_key_frame() {
                    self.stats.key_frames += 1;
                }
            }
            Err(_) => self.stats.failed += 1,
        }
        result
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.inner.lock().counters.stops += 1;
        self.inner.cv.notify_all();
    }

    /// The applied settings plus this session's frame statistics.
    fn info(&self) -> DeviceInfo {
        let mut info: DeviceInfo = self
            .settings
            .iter()
            .map(|(key, value)| {
                let value = match *value {
                    SettingValue::U32(v) => u64::from(v),
                    SettingValue::Bool(v) => u64::from(v),
                };
                (key.to_string(), value)
            })
            .collect();
        info.insert("running".to_string(), u64::from(self.started && !self.stopped));
        info.insert("statistics.frame_count".to_string(), self.stats.frames);
        info.insert("statistics.idrframe_count".to_string(), self.stats.key_frames);
        info.insert("statistics.failed_frames".to_string(), self.stats.failed);
        info.insert("statistics.accumulated_bytes".to_string(), self.stats.bytes);
        info
    }

    fn release(self) {
        self.inner.lock().counters.releases += 1;
        self.inner.cv.notify_all();
    }
}

/// Payload shaped like the frame type: an Annex B start code and NAL header
/// for H.264/H.265, SOI/EOI markers for JPEG, followed by the sequence number.
pub fn synthetic_payload(frame_type: FrameType, sequence: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    match frame_type {
        FrameType::Jpeg => buf.put_slice(&[0xFF, 0xD8]),
        t if t.format() == VideoFormat::H264 => {
            buf.put_slice(&[0, 0, 0, 1]);
            buf.put_u8(if t.is_key_frame() { 0x65 } else { 0x41 });
        }
        t if t.format() == VideoFormat::H265 => {
            buf.put_slice(&[0, 0, 0, 1]);
            buf.put_slice(if t.is_key_frame() { &[0x26, 0x01] } else { &[0x02, 0x01] });
        }
        _ => {}
    }
    buf.put_u64(sequence);
    if frame_type == FrameType::Jpeg {
        buf.put_slice(&[0xFF, 0xD9]);
    }
    buf.freeze()
}
