//! Error types for scheduling, phase synchronization and audio devices.

use alloc::string::String;

use thiserror::Error;

/// The pattern cannot be scheduled.
///
/// Each case would stall or overflow the scheduler's frame cursor, so the
/// pattern is rejected before anything is queued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The pattern has no notes
    #[error("cannot schedule an empty pattern")]
    EmptyPattern,

    /// One loop of the pattern rounds to zero frames at the sink rate
    #[error("pattern has no note with a positive duration")]
    NoPositiveDuration,

    /// A note duration is infinite or NaN
    #[error("pattern has a note with an infinite or NaN duration")]
    NonFiniteDuration,
}

/// A phase synchronization request cannot be applied.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SyncError {
    /// Beat duration is zero, negative, not finite, or shorter than one frame
    #[error("invalid beat duration: {0}s")]
    InvalidBeatDuration(f32),
}

/// Errors raised by audio devices and sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No audio output device available
    #[error("no audio output device available")]
    NoDevice,

    /// Failed to query or apply a device configuration
    #[error("failed to get device config: {0}")]
    Config(String),

    /// Failed to build, start or feed the output stream
    #[error("audio stream error: {0}")]
    Stream(String),

    /// The sink was already closed
    #[error("audio sink is closed")]
    Closed,

    /// The playback thread could not be spawned
    #[error("failed to spawn playback thread: {0}")]
    ThreadSpawn(String),
}

/// Any error surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for engine operations
pub type Result<T> = core::result::Result<T, Error>;
