//! # Metrum
//!
//! A frame-accurate engine for looping a pattern of percussive notes.
//!
//! Metrum repeatedly plays a [`NoteList`] (each step a sample, a volume and a
//! duration), feeding an audio sink one buffer at a time while the pattern,
//! the listeners and the phase reference change concurrently.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use metrum::{Metrum, NoteList, NoteListItem, OfflineDevice, Pattern, StaticSampleBank};
//!
//! let mut bank = StaticSampleBank::new();
//! let click = bank.push(metrum::synth_click(1760.0, 0.03, 48000), 48000);
//!
//! let pattern = Pattern::new(NoteList::from(vec![
//!     NoteListItem::new(click, 1.0, 0.5),
//!     NoteListItem::new(click, 0.5, 0.5),
//! ]));
//!
//! let metrum = Metrum::new(OfflineDevice::new(48000, 1024), bank);
//! metrum.set_pattern(pattern);
//! metrum.register_listener(Arc::new(|note: NoteListItem| println!("tick {:?}", note.note)), 0.0);
//! metrum.start().expect("sink unavailable");
//! ```
//!
//! ## Architecture
//!
//! - [`RingQueue`] holds the in-flight [`QueuedNote`]s in start order
//! - [`queue_next_notes`] commits notes one mixing buffer ahead of the write position
//! - [`mix`] renders the queued notes into the next buffer and retires finished ones
//! - [`synchronize`] realigns the schedule to an external beat grid
//! - [`Metrum`] owns the playback thread, the sink and the restart logic
//!
//! The playback thread never blocks on the pattern lock: if the pattern is
//! being edited it keeps playing the previous snapshot for one more cycle.

extern crate alloc;

mod bank;
mod config;
mod error;
mod listener;
mod metrum;
mod mixer;
mod note;
mod playback;
mod queue;
mod scheduler;
mod sync;

#[cfg(feature = "cpal_sink")]
mod device;

pub mod sink;

pub use bank::{synth_click, SampleBank, StaticSampleBank};
pub use config::{
    EngineConfig, DEFAULT_MAX_MIXING_BUFFER, DEFAULT_SINK_BUFFER_SIZE, MIN_BUFFER_SIZE_FACTOR,
};
pub use error::{DeviceError, Error, Result, ScheduleError, SyncError};
pub use listener::{
    note_delay_frames, ListenerEntry, ListenerId, ListenerRegistry, NoteStartedListener,
    PendingNotification,
};
pub use metrum::{Metrum, PlaybackState};
pub use mixer::mix;
pub use note::{NoteId, NoteList, NoteListItem, Pattern};
pub use playback::{CycleOutcome, PlaybackControls, Session};
pub use queue::{QueuedNote, RingQueue};
pub use scheduler::{queue_next_notes, ScheduleContext, SchedulerCursor};
pub use sink::{AudioDevice, AudioSink, OfflineDevice, OfflineHandle, OfflineSink, SinkConfig};
pub use sync::{synchronize, DeviceClock, SyncMailbox, SyncRequest};

#[cfg(feature = "cpal_sink")]
pub use device::CpalDevice;
#[cfg(feature = "cpal_sink")]
pub use sink::CpalSink;
