//! In-memory audio device for tests and offline rendering.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::DeviceError;
use crate::sink::{AudioDevice, AudioSink, SinkConfig};

#[derive(Default)]
struct OfflineState {
    native: Mutex<Option<SinkConfig>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    failing_opens: AtomicUsize,
    fail_next_write: AtomicBool,
    route_lost: AtomicBool,
    /// Recorded frames, one entry per opened sink
    sessions: Mutex<Vec<Vec<f32>>>,
}

/// Shared view of an [`OfflineDevice`], usable after the device moved into an engine.
///
/// Lets tests inspect what was written and simulate device events.
#[derive(Clone, Default)]
pub struct OfflineHandle {
    state: Arc<OfflineState>,
}

impl OfflineHandle {
    /// Number of sinks opened so far.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of sinks closed so far.
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Frames recorded by the `session`-th opened sink (0-based).
    pub fn captured(&self, session: usize) -> Vec<f32> {
        self.lock_sessions().get(session).cloned().unwrap_or_default()
    }

    /// Frames recorded by the most recently opened sink.
    pub fn last_captured(&self) -> Vec<f32> {
        self.lock_sessions().last().cloned().unwrap_or_default()
    }

    /// Change the native configuration, as a switch to another output would.
    pub fn set_native_config(&self, config: SinkConfig) {
        *self.state.native.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    /// Make the device report no native configuration.
    pub fn clear_native_config(&self) {
        *self.state.native.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Make the next `count` calls to [`AudioDevice::open`] fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next write on the open sink fail.
    pub fn fail_next_write(&self) {
        self.state.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Raise the open sink's routing-changed flag, as a lost output would.
    pub fn lose_route(&self) {
        self.state.route_lost.store(true, Ordering::SeqCst);
    }

    fn native_config(&self) -> Option<SinkConfig> {
        *self.state.native.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<Vec<f32>>> {
        self.state.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An [`AudioDevice`] that records into memory instead of playing.
///
/// Writes are paced to real time multiplied by a speed factor, so the
/// playback loop behaves as with hardware. An unpaced device renders as fast
/// as the loop can go.
///
/// ```
/// use metrum::{AudioDevice, AudioSink, OfflineDevice};
///
/// let mut device = OfflineDevice::new(48000, 1024).unpaced();
/// let handle = device.handle();
///
/// let mut sink = device.open()?;
/// sink.write(&[0.5; 256])?;
/// assert_eq!(sink.playback_position(), 256);
/// sink.close();
///
/// assert_eq!(handle.captured(0).len(), 256);
/// assert_eq!((handle.opens(), handle.closes()), (1, 1));
/// # Ok::<(), metrum::DeviceError>(())
/// ```
pub struct OfflineDevice {
    handle: OfflineHandle,
    speed: f64,
    capture_limit: usize,
}

impl OfflineDevice {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        let handle = OfflineHandle::default();
        handle.set_native_config(SinkConfig::new(sample_rate, buffer_size.max(1)));
        Self {
            handle,
            speed: 1.0,
            capture_limit: usize::MAX,
        }
    }

    /// Play `speed` times faster than real time.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Do not pace writes at all.
    pub fn unpaced(self) -> Self {
        self.with_speed(f64::INFINITY)
    }

    /// Record at most `frames` frames per session; later frames are counted but dropped.
    pub fn with_capture_limit(mut self, frames: usize) -> Self {
        self.capture_limit = frames;
        self
    }

    pub fn handle(&self) -> OfflineHandle {
        self.handle.clone()
    }
}

impl AudioDevice for OfflineDevice {
    type Sink = OfflineSink;

    fn open(&mut self) -> Result<OfflineSink, DeviceError> {
        let state = &self.handle.state;
        if state
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeviceError::Stream("simulated open failure".into()));
        }
        let config = self.handle.native_config().ok_or(DeviceError::NoDevice)?;

        let session = {
            let mut sessions = self.handle.lock_sessions();
            sessions.push(Vec::new());
            sessions.len() - 1
        };
        state.route_lost.store(false, Ordering::SeqCst);
        state.fail_next_write.store(false, Ordering::SeqCst);
        state.opens.fetch_add(1, Ordering::SeqCst);

        Ok(OfflineSink {
            handle: self.handle.clone(),
            config,
            session,
            frames_written: 0,
            speed: self.speed,
            capture_limit: self.capture_limit,
            started: Instant::now(),
            closed: false,
        })
    }

    fn native_config(&mut self) -> Option<SinkConfig> {
        self.handle.native_config()
    }
}

/// Sink opened by an [`OfflineDevice`].
///
/// Its playback position is the number of frames written, as for an ideal
/// output with no latency.
pub struct OfflineSink {
    handle: OfflineHandle,
    config: SinkConfig,
    session: usize,
    frames_written: u64,
    speed: f64,
    capture_limit: usize,
    started: Instant,
    closed: bool,
}

impl OfflineSink {
    /// Sleep until the wall clock catches up with the written frames.
    fn pace(&self) {
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return;
        }
        let rate = f64::from(self.config.sample_rate.max(1));
        let secs = self.frames_written as f64 / rate / self.speed;
        let due = self.started + Duration::from_secs_f64(secs);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

impl AudioSink for OfflineSink {
    fn config(&self) -> SinkConfig {
        self.config
    }

    fn write(&mut self, buffer: &[f32]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if self.handle.state.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Stream("simulated write failure".into()));
        }

        {
            let mut sessions = self.handle.lock_sessions();
            if let Some(captured) = sessions.get_mut(self.session) {
                let room = self.capture_limit.saturating_sub(captured.len());
                captured.extend_from_slice(&buffer[..buffer.len().min(room)]);
            }
        }
        self.frames_written += buffer.len() as u64;
        self.pace();
        Ok(())
    }

    fn playback_position(&self) -> i64 {
        self.frames_written as i64
    }

    fn routing_changed(&self) -> bool {
        self.handle.state.route_lost.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.handle.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for OfflineSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_failures_are_counted_down() {
        let mut device = OfflineDevice::new(48000, 512).unpaced();
        let handle = device.handle();
        handle.fail_next_opens(2);
        assert!(device.open().is_err());
        assert!(device.open().is_err());
        assert!(device.open().is_ok());
        assert_eq!(handle.opens(), 1);
    }

    #[test]
    fn closed_sink_rejects_writes_and_closes_once() {
        let mut device = OfflineDevice::new(48000, 512).unpaced();
        let handle = device.handle();
        let mut sink = device.open().unwrap();
        sink.close();
        assert_eq!(sink.write(&[0.0; 4]), Err(DeviceError::Closed));
        drop(sink);
        assert_eq!(handle.closes(), 1);
    }

    #[test]
    fn capture_limit_keeps_counting_position() {
        let mut device = OfflineDevice::new(48000, 512).unpaced().with_capture_limit(10);
        let handle = device.handle();
        let mut sink = device.open().unwrap();
        sink.write(&[1.0; 8]).unwrap();
        sink.write(&[1.0; 8]).unwrap();
        assert_eq!(sink.playback_position(), 16);
        assert_eq!(handle.captured(0).len(), 10);
    }

    #[test]
    fn pacing_follows_the_sample_rate() {
        let mut device = OfflineDevice::new(1000, 100).with_speed(2.0);
        let mut sink = device.open().unwrap();
        let start = Instant::now();
        // 100 frames at 1kHz, played twice as fast: 50ms
        sink.write(&[0.0; 100]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn route_loss_is_per_sink() {
        let mut device = OfflineDevice::new(48000, 512).unpaced();
        let handle = device.handle();
        let sink = device.open().unwrap();
        handle.lose_route();
        assert!(sink.routing_changed());
        drop(sink);
        assert!(!device.open().unwrap().routing_changed());
    }
}
