//! Engine configuration

use alloc::string::String;
use core::time::Duration;

/// Upper bound for the mixing buffer, in frames.
///
/// The mixing buffer is half the sink buffer, capped at this value. Smaller
/// buffers mean lower notification latency but more loop iterations.
pub const DEFAULT_MAX_MIXING_BUFFER: usize = 512;

/// Sinks are opened with this multiple of the device's minimum buffer size.
pub const MIN_BUFFER_SIZE_FACTOR: usize = 2;

/// Sink buffer size used when a device does not report a supported range (frames)
pub const DEFAULT_SINK_BUFFER_SIZE: usize = 1024;

/// Tuning knobs for [`Metrum`](crate::Metrum).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use metrum::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_max_mixing_buffer(256)
///     .with_routing_poll_interval(Duration::from_millis(100));
///
/// assert_eq!(config.mixing_buffer_size(1024), 256);
/// assert_eq!(config.mixing_buffer_size(300), 150);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Cap for the mixing buffer in frames
    pub max_mixing_buffer: usize,
    /// How often the playback loop compares the device's native config with the open sink
    pub routing_poll_interval: Duration,
    /// Name of the playback thread
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_mixing_buffer: DEFAULT_MAX_MIXING_BUFFER,
            routing_poll_interval: Duration::from_millis(250),
            thread_name: String::from("metrum-playback"),
        }
    }
}

impl EngineConfig {
    /// Set the mixing buffer cap (at least one frame).
    pub fn with_max_mixing_buffer(mut self, frames: usize) -> Self {
        self.max_mixing_buffer = frames.max(1);
        self
    }

    /// Set the routing-change poll interval.
    pub fn with_routing_poll_interval(mut self, interval: Duration) -> Self {
        self.routing_poll_interval = interval;
        self
    }

    /// Set the playback thread's name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Mixing buffer size for a sink with the given buffer size.
    #[inline]
    pub fn mixing_buffer_size(&self, sink_buffer_size: usize) -> usize {
        (sink_buffer_size / 2).min(self.max_mixing_buffer).max(1)
    }

    /// Number of mixing cycles between two routing polls.
    pub(crate) fn routing_poll_cycles(&self, mixing_buffer_size: usize, sample_rate: u32) -> u64 {
        let cycle_secs = mixing_buffer_size as f64 / sample_rate.max(1) as f64;
        let cycles = self.routing_poll_interval.as_secs_f64() / cycle_secs;
        (cycles.round() as u64).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixing_buffer_is_half_the_sink_buffer_capped() {
        let config = EngineConfig::default();
        assert_eq!(config.mixing_buffer_size(4096), 512);
        assert_eq!(config.mixing_buffer_size(512), 256);
        assert_eq!(config.mixing_buffer_size(1), 1);
    }

    #[test]
    fn routing_poll_cycles_follow_buffer_duration() {
        let config = EngineConfig::default().with_routing_poll_interval(Duration::from_millis(100));
        // 480 frames at 48kHz = 10ms per cycle
        assert_eq!(config.routing_poll_cycles(480, 48000), 10);

        let config = config.with_routing_poll_interval(Duration::ZERO);
        assert_eq!(config.routing_poll_cycles(480, 48000), 1);
    }
}
