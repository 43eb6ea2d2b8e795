//! The engine handle and its playback thread.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, info_span, warn};

use crate::bank::SampleBank;
use crate::config::EngineConfig;
use crate::error::{DeviceError, Error, SyncError};
use crate::listener::{ListenerId, NoteStartedListener};
use crate::note::Pattern;
use crate::playback::{CycleOutcome, PlaybackControls, Session};
use crate::sink::{AudioDevice, SinkConfig};
use crate::sync::SyncRequest;

/// Lifecycle of the playback thread.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped = 0,
    /// Opening a sink (initially or after a routing change)
    Starting = 1,
    Running = 2,
    Stopping = 3,
    /// A restart could not reopen the device; see [`Metrum::last_device_error`]
    Unavailable = 4,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Unavailable,
            _ => Self::Stopped,
        }
    }
}

struct Shared {
    controls: Arc<PlaybackControls>,
    state: AtomicU8,
    restart_requested: AtomicBool,
    sessions: AtomicUsize,
    sink_config: Mutex<Option<SinkConfig>>,
    failure: Mutex<Option<DeviceError>>,
}

impl Shared {
    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_sink_config(&self, config: Option<SinkConfig>) {
        *self.sink_config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    fn set_failure(&self, e: Option<DeviceError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = e;
    }

    fn fail(&self, e: DeviceError) {
        self.set_failure(Some(e));
        self.set_state(PlaybackState::Unavailable);
    }
}

struct Worker {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_current_thread(&self) -> bool {
        self.handle.thread().id() == std::thread::current().id()
    }
}

/// A looping pattern player.
///
/// Owns an [`AudioDevice`] and a [`SampleBank`]. [`start`](Self::start)
/// spawns a playback thread that opens a sink and keeps rendering the
/// current [`Pattern`] until [`stop`](Self::stop). The pattern, the
/// listeners and the phase can be changed from any thread while playing.
///
/// When the device's output route changes the playback thread closes its
/// sink and opens a new one on its own; if that fails the state becomes
/// [`PlaybackState::Unavailable`].
pub struct Metrum<D: AudioDevice, B: SampleBank> {
    shared: Arc<Shared>,
    device: Arc<Mutex<D>>,
    bank: Arc<B>,
    config: EngineConfig,
    worker: Mutex<Option<Worker>>,
}

impl<D: AudioDevice, B: SampleBank> Metrum<D, B> {
    pub fn new(device: D, bank: B) -> Self {
        Self {
            shared: Arc::new(Shared {
                controls: Arc::new(PlaybackControls::new()),
                state: AtomicU8::new(PlaybackState::Stopped as u8),
                restart_requested: AtomicBool::new(false),
                sessions: AtomicUsize::new(0),
                sink_config: Mutex::new(None),
                failure: Mutex::new(None),
            }),
            device: Arc::new(Mutex::new(device)),
            bank: Arc::new(bank),
            config: EngineConfig::default(),
            worker: Mutex::new(None),
        }
    }

    /// Replace the engine configuration. Takes effect on the next session.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Start playback. Does nothing if already running.
    ///
    /// Blocks until the sink is open; a device that cannot be opened is
    /// reported here as [`Error::Device`].
    pub fn start(&self) -> crate::Result<()> {
        let mut worker = self.lock_worker();
        if let Some(running) = worker.as_ref() {
            if !running.handle.is_finished() && self.state() != PlaybackState::Unavailable {
                return Ok(());
            }
        }
        // reap a thread that gave up on its device
        if let Some(finished) = worker.take() {
            let _ = finished.handle.join();
        }

        self.shared.set_state(PlaybackState::Starting);
        self.shared.restart_requested.store(false, Ordering::Release);

        let cancel = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = PlaybackThread {
            shared: self.shared.clone(),
            device: self.device.clone(),
            bank: self.bank.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || thread.run(ready_tx))
            .map_err(|e| {
                self.shared.set_state(PlaybackState::Stopped);
                DeviceError::ThreadSpawn(e.to_string())
            })?;

        let opened = ready_rx.recv().unwrap_or_else(|_| {
            Err(DeviceError::Stream("playback thread exited before opening the sink".into()))
        });
        match opened {
            Ok(()) => {
                *worker = Some(Worker { cancel, handle });
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                error!("failed to open audio device: {e}");
                self.shared.set_state(PlaybackState::Stopped);
                Err(Error::Device(e))
            }
        }
    }

    /// Stop playback and wait until the sink is released.
    ///
    /// Called from the playback thread itself (e.g. inside a listener), this
    /// only requests the stop; the thread exits after the current cycle.
    /// While another thread is already stopping the engine it returns
    /// immediately.
    pub fn stop(&self) {
        let worker = {
            let mut slot = self.lock_worker();
            if let Some(w) = slot.as_ref().filter(|w| w.is_current_thread()) {
                w.cancel.store(true, Ordering::Release);
                self.shared.set_state(PlaybackState::Stopping);
                return;
            }
            if slot.is_none() && self.state() == PlaybackState::Stopping {
                // the stopping thread joins the loop and resets the state
                return;
            }
            let worker = slot.take();
            if worker.is_some() {
                self.shared.set_state(PlaybackState::Stopping);
            }
            worker
        };

        if let Some(worker) = worker {
            worker.cancel.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                error!("playback thread panicked");
            }
        }
        self.shared.set_sink_config(None);
        self.shared.set_state(PlaybackState::Stopped);
    }

    /// Stop, then start again with a freshly opened sink.
    ///
    /// From the playback thread this rebuilds the session in place at the
    /// end of the current cycle.
    pub fn restart(&self) -> crate::Result<()> {
        if self.lock_worker().as_ref().is_some_and(Worker::is_current_thread) {
            self.shared.restart_requested.store(true, Ordering::Release);
            return Ok(());
        }
        info!("restarting playback");
        self.stop();
        self.start()
    }

    /// Play `pattern` from the next cycle on. The scheduler position is kept.
    pub fn set_pattern(&self, pattern: Pattern) {
        self.shared.controls.set_pattern(Some(pattern));
    }

    /// Stop scheduling new notes; notes already playing ring out.
    pub fn clear_pattern(&self) {
        self.shared.controls.set_pattern(None);
    }

    pub fn pattern(&self) -> Option<Pattern> {
        self.shared.controls.pattern()
    }

    /// Register `listener` to be told when notes start, `delay_millis` after
    /// (or, if negative, before) the audible onset.
    ///
    /// Registering the same listener again replaces its previous registration.
    pub fn register_listener(
        &self,
        listener: Arc<dyn NoteStartedListener>,
        delay_millis: f32,
    ) -> ListenerId {
        let id = self.shared.controls.listeners().register(listener, delay_millis);
        debug!(?id, delay_millis, "listener registered");
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.controls.listeners().unregister(id)
    }

    /// Returns `false` if `id` is not registered.
    pub fn set_listener_delay(&self, id: ListenerId, delay_millis: f32) -> bool {
        self.shared.controls.listeners().set_delay(id, delay_millis)
    }

    /// Align the pattern's first step to `reference_time + n * beat_duration`.
    ///
    /// Applied by the playback thread on its next cycle; a newer request
    /// replaces one that was not applied yet.
    pub fn synchronize_time(
        &self,
        reference_time: Instant,
        beat_duration: f32,
    ) -> Result<(), SyncError> {
        if !beat_duration.is_finite() || beat_duration <= 0.0 {
            return Err(SyncError::InvalidBeatDuration(beat_duration));
        }
        self.shared.controls.sync().post(SyncRequest::new(reference_time, beat_duration));
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == PlaybackState::Running
    }

    /// Configuration of the open sink, if any.
    pub fn sink_config(&self) -> Option<SinkConfig> {
        *self.shared.sink_config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sinks opened since construction.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::Acquire)
    }

    /// The error that made the engine [`Unavailable`](PlaybackState::Unavailable).
    ///
    /// Cleared once a sink opens again.
    pub fn last_device_error(&self) -> Option<DeviceError> {
        self.shared.failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: AudioDevice, B: SampleBank> Drop for Metrum<D, B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a session ended
enum SessionEnd {
    Cancelled,
    Restart(&'static str),
}

struct PlaybackThread<D: AudioDevice, B: SampleBank> {
    shared: Arc<Shared>,
    device: Arc<Mutex<D>>,
    bank: Arc<B>,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
}

impl<D: AudioDevice, B: SampleBank> PlaybackThread<D, B> {
    fn lock_device(&self) -> MutexGuard<'_, D> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(self, ready: Sender<Result<(), DeviceError>>) {
        let mut ready = Some(ready);
        loop {
            if self.cancel.load(Ordering::Acquire) {
                self.shared.set_state(PlaybackState::Stopped);
                return;
            }

            let opened = self.lock_device().open();
            let sink = match opened {
                Ok(sink) => sink,
                Err(e) => {
                    match ready.take() {
                        Some(ready) => {
                            let _ = ready.send(Err(e));
                        }
                        None => {
                            error!("could not reopen audio device: {e}");
                            self.shared.fail(e);
                        }
                    }
                    return;
                }
            };

            self.shared.set_failure(None);
            let session_id = self.shared.sessions.fetch_add(1, Ordering::AcqRel) + 1;
            let span = info_span!("playback", session = session_id);
            let _enter = span.enter();

            let controls = self.shared.controls.clone();
            let mut session = Session::new(sink, &*self.bank, controls, &self.config);
            let config = session.config();
            info!(
                sample_rate = config.sample_rate,
                buffer_size = config.buffer_size,
                mixing_buffer = session.mixing_buffer_size(),
                "sink opened"
            );
            self.shared.set_sink_config(Some(config));
            self.shared.set_state(PlaybackState::Running);
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }

            let end = self.drive(&mut session);
            session.close();
            self.shared.set_sink_config(None);

            match end {
                SessionEnd::Cancelled => {
                    info!("playback loop exited");
                    self.shared.set_state(PlaybackState::Stopped);
                    return;
                }
                SessionEnd::Restart(reason) => {
                    info!(reason, "reopening sink");
                    self.shared.set_state(PlaybackState::Starting);
                }
            }
        }
    }

    fn drive(&self, session: &mut Session<D::Sink>) -> SessionEnd {
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return SessionEnd::Cancelled;
            }
            if self.shared.restart_requested.swap(false, Ordering::AcqRel) {
                return SessionEnd::Restart("restart requested");
            }
            match session.cycle(|| self.lock_device().native_config()) {
                CycleOutcome::Continue => {}
                CycleOutcome::RoutingChanged => {
                    info!("audio routing changed");
                    return SessionEnd::Restart("routing changed");
                }
                CycleOutcome::WriteFailed(e) => {
                    warn!("sink write failed: {e}");
                    return SessionEnd::Restart("write failed");
                }
            }
        }
    }
}
