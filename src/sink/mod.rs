//! Audio outputs.
//!
//! An [`AudioDevice`] opens [`AudioSink`]s. The playback loop writes mono
//! buffers to the sink, reads its playback position to time notifications,
//! and asks the device for its native configuration to detect routing
//! changes.

mod offline;
#[cfg(feature = "cpal_sink")]
mod cpal_sink;

pub use offline::{OfflineDevice, OfflineHandle, OfflineSink};
#[cfg(feature = "cpal_sink")]
pub use cpal_sink::CpalSink;

use crate::error::DeviceError;

/// Timing parameters of an open sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkConfig {
    /// Frames per second
    pub sample_rate: u32,
    /// Size of the sink's internal buffer in frames
    pub buffer_size: usize,
}

impl SinkConfig {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        Self { sample_rate, buffer_size }
    }
}

/// An open mono output stream.
pub trait AudioSink: Send + 'static {
    fn config(&self) -> SinkConfig;

    /// Queue `buffer` for playback, blocking until the sink accepted all of it.
    ///
    /// This call paces the playback loop to real time.
    fn write(&mut self, buffer: &[f32]) -> Result<(), DeviceError>;

    /// Frames played since the sink was opened. Never decreases.
    fn playback_position(&self) -> i64;

    /// Whether the sink noticed that its output route went away.
    fn routing_changed(&self) -> bool {
        false
    }

    /// Flush and release the output. Further writes fail with [`DeviceError::Closed`].
    fn close(&mut self);
}

/// Something that can open [`AudioSink`]s, typically a hardware output.
pub trait AudioDevice: Send + 'static {
    type Sink: AudioSink;

    /// Open a sink at the device's native configuration.
    fn open(&mut self) -> Result<Self::Sink, DeviceError>;

    /// The configuration a sink opened now would get, or `None` if it cannot be queried.
    ///
    /// Polled by the playback loop; a value different from the open sink's
    /// config counts as a routing change.
    fn native_config(&mut self) -> Option<SinkConfig>;
}
