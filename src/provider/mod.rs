//! Frame provider: one device session, one acquisition thread, bounded restarts.
//!
//! The provider owns a [`DeviceHandle`] and a background thread that pulls
//! frames from it and hands them to the consumer through a single-slot
//! channel. Expected device errors (see [`classify`]) trigger a
//! close-and-reopen of the session with the same configuration; after
//! [`ProviderSettings::max_restart_retries`] consecutive failed reopens the
//! provider enters [`ProviderState::Error`] and stops producing frames. That
//! outcome is latched: `stop` still moves to [`ProviderState::Stopped`], but
//! `start` and `restart` are refused from then on.
//! Unexpected errors are delivered to the consumer as frames carrying the
//! error.
//!
//! Device calls are never interrupted. `stop` and `restart` clear the
//! thread's running flag and join it, so they return only after an in-flight
//! `acquire_frame` has come back. The restart delay and a send blocked on a
//! full channel are interruptible.

pub mod classify;
mod receiver;

pub use classify::{CodeClassifier, ErrorClass, ErrorClassifier};
pub use crossbeam_channel::{RecvError, RecvTimeoutError, TryRecvError};
pub use receiver::FrameReceiver;

use crate::device::{self, DeviceBackend, DeviceHandle, DeviceInfo, OpenFailure};
use crate::errors::{DeviceError, DeviceErrorCode, ProviderError};
use crate::types::{Frame, StreamConfiguration};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consecutive failed restarts tolerated before the provider gives up.
pub const MAX_RESTART_RETRIES: u32 = 4;

/// Pause between releasing a session and reopening it.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);

const THREAD_NAME: &str = "crabframe-acquire";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Constructed, `start` not called yet.
    Init,
    /// Session open and acquisition thread running, no frame delivered yet.
    Started,
    /// Frames are being delivered.
    Running,
    /// Session is being closed and reopened.
    Restarting,
    Stopped,
    /// Restart retries exhausted. Only `stop` leaves it.
    Error,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderState::Init => "init",
            ProviderState::Started => "started",
            ProviderState::Running => "running",
            ProviderState::Restarting => "restarting",
            ProviderState::Stopped => "stopped",
            ProviderState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub max_restart_retries: u32,
    pub restart_delay: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            max_restart_retries: MAX_RESTART_RETRIES,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Snapshot of provider counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub state: ProviderState,
    /// Consecutive failed restarts since the last successful acquisition.
    pub restart_retries: u32,
    /// Frames waiting in the handoff slot.
    pub channel_len: usize,
    pub frames_delivered: u64,
    pub errors_forwarded: u64,
    pub restarts: u64,
    pub restart_failures: u64,
    /// Set once restart retries ran out; survives `stop`.
    pub terminal: bool,
    /// Stream statistics last reported by the device session.
    pub device: DeviceInfo,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State visible to both the owner and the acquisition thread.
#[derive(Debug)]
struct Shared {
    state: Mutex<ProviderState>,
    generation: AtomicU64,
    restart_retries: AtomicU32,
    frames_delivered: AtomicU64,
    errors_forwarded: AtomicU64,
    restarts: AtomicU64,
    restart_failures: AtomicU64,
    terminal: AtomicBool,
    device_info: Mutex<DeviceInfo>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState::Init),
            generation: AtomicU64::new(0),
            restart_retries: AtomicU32::new(0),
            frames_delivered: AtomicU64::new(0),
            errors_forwarded: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            restart_failures: AtomicU64::new(0),
            terminal: AtomicBool::new(false),
            device_info: Mutex::new(DeviceInfo::new()),
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    fn state(&self) -> ProviderState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ProviderState) {
        *lock(&self.state) = state;
    }

    fn set_device_info(&self, info: DeviceInfo) {
        *lock(&self.device_info) = info;
    }

    /// Apply `update` only while `generation` is the current thread generation.
    fn update_state_for(
        &self,
        generation: u64,
        update: impl FnOnce(ProviderState) -> Option<ProviderState>,
    ) {
        let mut state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(next) = update(*state) {
            *state = next;
        }
    }
}

/// Close `current`, pause, then open and start a fresh session.
///
/// `pause` returns false when the restart should be abandoned.
fn reopen<B: DeviceBackend>(
    backend: &B,
    config: &StreamConfiguration,
    current: Option<B::Handle>,
    pause: impl FnOnce() -> bool,
) -> Result<B::Handle, DeviceError> {
    if let Some(handle) = current {
        device::close(handle);
    }
    if !pause() {
        return Err(DeviceError::new(
            DeviceErrorCode::Closed,
            "restart cancelled by stop request",
        ));
    }
    device::open_and_start(backend, config).map_err(OpenFailure::into_inner)
}

/// Spawn a thread running `run` on `handle`.
///
/// The handle moves to the thread only once it exists. If spawning fails it
/// is returned with the error so the caller can close it.
fn spawn_with_session<H, F>(
    builder: thread::Builder,
    handle: H,
    run: F,
) -> Result<JoinHandle<Option<H>>, (io::Error, H)>
where
    H: DeviceHandle,
    F: FnOnce(H) -> Option<H> + Send + 'static,
{
    let (handoff, session) = crossbeam_channel::bounded::<H>(1);
    let thread = match builder.spawn(move || session.recv().ok().and_then(run)) {
        Ok(thread) => thread,
        Err(e) => return Err((e, handle)),
    };
    if let Err(returned) = handoff.send(handle) {
        // The thread is gone before taking the session.
        device::close(returned.into_inner());
    }
    Ok(thread)
}

/// A launched acquisition thread.
struct Worker<H> {
    generation: u64,
    running: Arc<AtomicBool>,
    shutdown: Sender<()>,
    thread: JoinHandle<Option<H>>,
}

impl<H> Worker<H> {
    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.thread.is_finished()
    }

    /// Clear the running flag, wake interruptible waits and join the thread.
    ///
    /// Returns the session the thread was holding, if any.
    fn retire(self) -> Option<H> {
        let Worker {
            generation,
            running,
            shutdown,
            thread,
        } = self;
        running.store(false, Ordering::SeqCst);
        drop(shutdown);
        match thread.join() {
            Ok(handle) => handle,
            Err(_) => {
                log::error!("Acquisition thread {} panicked", generation);
                None
            }
        }
    }
}

/// Everything the acquisition thread needs.
struct Acquisition<B: DeviceBackend> {
    backend: Arc<B>,
    config: Arc<StreamConfiguration>,
    classifier: Arc<dyn ErrorClassifier>,
    settings: ProviderSettings,
    shared: Arc<Shared>,
    frames: Sender<Frame>,
    running: Arc<AtomicBool>,
    shutdown: Receiver<()>,
    generation: u64,
}

impl<B: DeviceBackend> Acquisition<B> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn channel(&self) -> u32 {
        self.config.channel_or_default()
    }

    fn publish_info(&self, handle: &B::Handle) {
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            self.shared.set_device_info(handle.info());
        }
    }

    fn run(self, handle: B::Handle) -> Option<B::Handle> {
        let mut handle = Some(handle);

        while self.is_running() {
            let Some(session) = handle.as_mut() else {
                // The last restart failed; retry it before polling again.
                match self.restart(None) {
                    Ok(fresh) => handle = Some(fresh),
                    Err(e) => {
                        if self.restart_failed(&e) {
                            break;
                        }
                    }
                }
                continue;
            };

            match session.acquire_frame() {
                Ok(frame) => {
                    if !self.is_running() {
                        break;
                    }
                    self.shared.restart_retries.store(0, Ordering::SeqCst);
                    self.publish_info(session);
                    if !self.deliver(frame) {
                        break;
                    }
                    self.shared.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .update_state_for(self.generation, |state| match state {
                            ProviderState::Started => Some(ProviderState::Running),
                            _ => None,
                        });
                }
                Err(err) => {
                    if !self.is_running() {
                        break;
                    }
                    match self.classifier.classify(&err) {
                        ErrorClass::Expected => {
                            log::warn!(
                                "Channel({}): restarting stream, device is in maintenance: {}",
                                self.channel(),
                                err
                            );
                            match self.restart(handle.take()) {
                                Ok(fresh) => handle = Some(fresh),
                                Err(e) => {
                                    if self.restart_failed(&e) {
                                        break;
                                    }
                                }
                            }
                        }
                        ErrorClass::Unexpected => {
                            log::error!(
                                "Channel({}): device returned an error while acquiring a frame: {}",
                                self.channel(),
                                err
                            );
                            self.shared.restart_retries.store(0, Ordering::SeqCst);
                            self.publish_info(session);
                            if !self.deliver(Frame::failed(err, false)) {
                                break;
                            }
                            self.shared.errors_forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        handle
    }

    /// Push a frame, blocking until the consumer drains the previous one.
    ///
    /// Returns false if a stop request arrived first; the frame is dropped.
    fn deliver(&self, frame: Frame) -> bool {
        crossbeam_channel::select! {
            send(self.frames, frame) -> res => res.is_ok(),
            recv(self.shutdown) -> _ => false,
        }
    }

    fn restart(&self, current: Option<B::Handle>) -> Result<B::Handle, DeviceError> {
        self.shared
            .update_state_for(self.generation, |_| Some(ProviderState::Restarting));
        log::info!("Channel({}): trying to restart stream", self.channel());

        let delay = self.settings.restart_delay;
        let fresh = reopen(&*self.backend, &self.config, current, || {
            matches!(
                self.shutdown.recv_timeout(delay),
                Err(crossbeam_channel::RecvTimeoutError::Timeout)
            )
        })?;

        self.shared.restarts.fetch_add(1, Ordering::Relaxed);
        self.publish_info(&fresh);
        self.shared
            .update_state_for(self.generation, |_| Some(ProviderState::Started));
        log::info!("Channel({}): successfully restarted stream", self.channel());
        Ok(fresh)
    }

    /// Count a failed restart. Returns true when the thread must exit.
    fn restart_failed(&self, err: &DeviceError) -> bool {
        if !self.is_running() {
            return true;
        }
        self.shared.restart_failures.fetch_add(1, Ordering::Relaxed);
        let retries = self.shared.restart_retries.fetch_add(1, Ordering::SeqCst) + 1;
        if retries >= self.settings.max_restart_retries.max(1) {
            log::error!(
                "Channel({}): max retries for stream restart reached ({}), stream is stopped: {}",
                self.channel(),
                retries,
                err
            );
            self.shared.update_state_for(self.generation, |_| {
                self.shared.terminal.store(true, Ordering::SeqCst);
                Some(ProviderState::Error)
            });
            return true;
        }
        log::warn!(
            "Channel({}): unable to restart stream (attempt {}/{}), trying again: {}",
            self.channel(),
            retries,
            self.settings.max_restart_retries,
            err
        );
        false
    }
}

/// Delivers frames from one device session to one consumer, restarting the
/// session on expected device errors.
pub struct FrameProvider<B: DeviceBackend> {
    backend: Arc<B>,
    config: Arc<StreamConfiguration>,
    classifier: Arc<dyn ErrorClassifier>,
    settings: ProviderSettings,
    shared: Arc<Shared>,
    frames_tx: Sender<Frame>,
    frames_rx: Receiver<Frame>,
    worker: Mutex<Option<Worker<B::Handle>>>,
}

impl<B: DeviceBackend> FrameProvider<B> {
    /// Provider with default settings and the default error classifier.
    pub fn new(backend: B, config: StreamConfiguration) -> Self {
        Self::with_settings(
            backend,
            config,
            ProviderSettings::default(),
            CodeClassifier::default(),
        )
    }

    pub fn with_settings(
        backend: B,
        config: StreamConfiguration,
        settings: ProviderSettings,
        classifier: impl ErrorClassifier,
    ) -> Self {
        let (frames_tx, frames_rx) = crossbeam_channel::bounded(1);
        Self {
            backend: Arc::new(backend),
            config: Arc::new(config),
            classifier: Arc::new(classifier),
            settings,
            shared: Arc::new(Shared::new()),
            frames_tx,
            frames_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfiguration {
        &self.config
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Receiver for delivered frames.
    pub fn frames(&self) -> FrameReceiver {
        FrameReceiver::new(self.frames_rx.clone())
    }

    pub fn state(&self) -> ProviderState {
        self.shared.state()
    }

    pub fn restart_retries(&self) -> u32 {
        self.shared.restart_retries.load(Ordering::SeqCst)
    }

    /// Whether restart retries ran out. Stays true after `stop`; the
    /// provider has to be recreated.
    pub fn is_terminal(&self) -> bool {
        self.shared.is_terminal()
    }

    /// Whether an acquisition thread is currently active.
    pub fn is_running(&self) -> bool {
        lock(&self.worker).as_ref().is_some_and(Worker::is_active)
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            state: self.shared.state(),
            restart_retries: self.shared.restart_retries.load(Ordering::SeqCst),
            channel_len: self.frames_rx.len(),
            frames_delivered: self.shared.frames_delivered.load(Ordering::Relaxed),
            errors_forwarded: self.shared.errors_forwarded.load(Ordering::Relaxed),
            restarts: self.shared.restarts.load(Ordering::Relaxed),
            restart_failures: self.shared.restart_failures.load(Ordering::Relaxed),
            terminal: self.shared.is_terminal(),
            device: lock(&self.shared.device_info).clone(),
        }
    }

    /// Open and start a session and launch the acquisition thread.
    ///
    /// On failure the state is left unchanged and no thread is launched.
    pub fn start(&self) -> Result<(), ProviderError> {
        let mut slot = lock(&self.worker);
        if self.shared.is_terminal() {
            return Err(ProviderError::Terminal);
        }
        match self.shared.state() {
            ProviderState::Init | ProviderState::Stopped => {}
            ProviderState::Error => return Err(ProviderError::Terminal),
            ProviderState::Started | ProviderState::Running | ProviderState::Restarting => {
                return Err(ProviderError::AlreadyStarted)
            }
        }

        for (key, value) in self.config.settings() {
            log::debug!("Channel({}): {} = {}", self.channel(), key, value);
        }

        let handle = device::open_and_start(&*self.backend, &self.config).map_err(|failure| {
            match failure {
                OpenFailure::Open(e) => ProviderError::Open(e),
                OpenFailure::Start(e) => ProviderError::Start(e),
            }
        })?;

        self.launch(&mut slot, handle)?;
        log::info!("Channel({}): stream is started", self.channel());
        Ok(())
    }

    /// Stop acquisition and release the session.
    ///
    /// Blocks until the acquisition thread has exited, which includes waiting
    /// for an in-flight `acquire_frame` to return. Always ends in
    /// [`ProviderState::Stopped`], also from [`ProviderState::Error`]; a
    /// provider that ran out of restart retries still refuses `start`.
    pub fn stop(&self) {
        let mut slot = lock(&self.worker);
        self.shutdown(&mut slot);
        self.shared.set_state(ProviderState::Stopped);
        log::info!("Channel({}): stream is stopped", self.channel());
    }

    /// Close the current session and reopen it with the same configuration.
    ///
    /// The running acquisition thread is joined before the session is
    /// touched, and a new thread is launched only once the new session is
    /// started. On failure the provider stays in
    /// [`ProviderState::Restarting`] without a thread; `restart` can be
    /// retried and `stop` is always valid.
    ///
    /// A frame the old thread already acquired but could not hand over
    /// because the slot was full is dropped, so the consumer can see a gap
    /// in sequence numbers across the restart.
    pub fn restart(&self) -> Result<(), ProviderError> {
        let mut slot = lock(&self.worker);
        if self.shared.is_terminal() {
            return Err(ProviderError::Terminal);
        }
        match self.shared.state() {
            ProviderState::Init | ProviderState::Stopped => return Err(ProviderError::NotStarted),
            ProviderState::Error => return Err(ProviderError::Terminal),
            ProviderState::Started | ProviderState::Running | ProviderState::Restarting => {}
        }

        let current = slot.take().and_then(Worker::retire);
        if self.shared.is_terminal() {
            // Retries ran out while the thread was being joined.
            if let Some(handle) = current {
                device::close(handle);
            }
            return Err(ProviderError::Terminal);
        }

        self.shared.set_state(ProviderState::Restarting);
        log::info!("Channel({}): trying to restart stream", self.channel());

        let delay = self.settings.restart_delay;
        let fresh = reopen(&*self.backend, &self.config, current, || {
            thread::sleep(delay);
            true
        })
        .map_err(|e| {
            log::warn!("Channel({}): unable to restart stream: {}", self.channel(), e);
            ProviderError::Restart(e)
        })?;

        self.shared.restarts.fetch_add(1, Ordering::Relaxed);
        self.launch(&mut slot, fresh)?;
        log::info!("Channel({}): successfully restarted stream", self.channel());
        Ok(())
    }

    fn channel(&self) -> u32 {
        self.config.channel_or_default()
    }

    fn launch(
        &self,
        slot: &mut Option<Worker<B::Handle>>,
        handle: B::Handle,
    ) -> Result<(), ProviderError> {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        let task = Acquisition {
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
            classifier: Arc::clone(&self.classifier),
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
            frames: self.frames_tx.clone(),
            running: Arc::clone(&running),
            shutdown: shutdown_rx,
            generation,
        };

        let previous = self.shared.state();
        self.shared.set_state(ProviderState::Started);

        self.shared.set_device_info(handle.info());
        let builder = thread::Builder::new().name(THREAD_NAME.to_string());
        let thread = match spawn_with_session(builder, handle, move |h| task.run(h)) {
            Ok(thread) => thread,
            Err((e, handle)) => {
                log::error!(
                    "Channel({}): failed to spawn acquisition thread: {}",
                    self.channel(),
                    e
                );
                self.shared.set_state(previous);
                device::close(handle);
                return Err(ProviderError::Spawn(e));
            }
        };

        *slot = Some(Worker {
            generation,
            running,
            shutdown: shutdown_tx,
            thread,
        });
        Ok(())
    }

    fn shutdown(&self, slot: &mut Option<Worker<B::Handle>>) {
        if let Some(worker) = slot.take() {
            if let Some(handle) = worker.retire() {
                device::close(handle);
            }
        }
    }
}

impl<B: DeviceBackend> fmt::Debug for FrameProvider<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProvider")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend> Drop for FrameProvider<B> {
    fn drop(&mut self) {
        let slot = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.take() {
            if let Some(handle) = worker.retire() {
                device::close(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn open_started(backend: &ScriptedBackend) -> crate::testing::ScriptedHandle {
        device::open_and_start(backend, &StreamConfiguration::new())
            .map_err(OpenFailure::into_inner)
            .unwrap()
    }

    #[test]
    fn test_spawned_thread_receives_session() {
        let backend = ScriptedBackend::new();
        let handle = open_started(&backend);

        let thread = spawn_with_session(thread::Builder::new(), handle, |mut h| {
            h.acquire_frame().ok()?;
            Some(h)
        })
        .unwrap();
        let handle = thread.join().unwrap().unwrap();
        device::close(handle);

        let counters = backend.counters();
        assert_eq!(counters.acquires, 1);
        assert_eq!(counters.live_sessions(), 0);
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_failed_spawn_hands_session_back() {
        let backend = ScriptedBackend::new();
        let handle = open_started(&backend);

        // No address space for this stack, so the spawn itself fails.
        let builder = thread::Builder::new().stack_size(usize::MAX / 2);
        let (err, handle) = spawn_with_session(builder, handle, Some).unwrap_err();
        assert!(!err.to_string().is_empty());
        device::close(handle);

        let counters = backend.counters();
        assert_eq!(counters.acquires, 0);
        assert_eq!(counters.stops, 1);
        assert_eq!(counters.live_sessions(), 0);
    }

    #[test]
    fn test_stop_clears_error_state_but_not_terminal_latch() {
        let provider = FrameProvider::new(ScriptedBackend::new(), StreamConfiguration::new());
        provider.shared.set_state(ProviderState::Error);
        provider.shared.terminal.store(true, Ordering::SeqCst);

        provider.stop();
        assert_eq!(provider.state(), ProviderState::Stopped);
        assert!(matches!(provider.start(), Err(ProviderError::Terminal)));
        assert!(matches!(provider.restart(), Err(ProviderError::Terminal)));
        assert_eq!(provider.backend().counters().opens, 0);
    }
}
