//! One playback session: an open sink plus the engine state built for it.
//!
//! A [`Session`] lives from opening a sink to closing it. Its queue,
//! cursor and pending notifications are only valid for that sink's sample
//! rate and frame counter, so a restart always builds a new session.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, trace, warn};

use crate::bank::SampleBank;
use crate::config::EngineConfig;
use crate::error::{DeviceError, ScheduleError};
use crate::listener::{ListenerEntry, ListenerRegistry, PendingNotification};
use crate::mixer::mix;
use crate::note::{NoteId, NoteList, Pattern};
use crate::queue::{QueuedNote, RingQueue};
use crate::scheduler::{queue_next_notes, ScheduleContext, SchedulerCursor};
use crate::sink::{AudioSink, SinkConfig};
use crate::sync::{synchronize, DeviceClock, SyncMailbox};

/// Inputs the playback thread reads every cycle, written from other threads.
#[derive(Default)]
pub struct PlaybackControls {
    pattern: ArcSwapOption<Pattern>,
    listeners: Mutex<ListenerRegistry>,
    sync: SyncMailbox,
}

impl PlaybackControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the pattern being played. `None` plays nothing.
    pub fn set_pattern(&self, pattern: Option<Pattern>) {
        self.pattern.store(pattern.map(Arc::new));
    }

    pub fn pattern(&self) -> Option<Pattern> {
        self.pattern.load_full().map(|p| (*p).clone())
    }

    /// Lock the listener registry. Keep the guard short-lived, the
    /// playback thread takes the same lock once per cycle.
    pub fn listeners(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sync(&self) -> &SyncMailbox {
        &self.sync
    }
}

/// Result of one [`Session::cycle`].
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Continue,
    /// The sink's route or native configuration changed; the session must be rebuilt
    RoutingChanged,
    /// The sink rejected a buffer
    WriteFailed(DeviceError),
}

/// Engine state for one open sink.
pub struct Session<S: AudioSink> {
    sink: S,
    config: SinkConfig,
    controls: Arc<PlaybackControls>,
    /// Sample data per note id, at the sink's rate
    samples: Vec<Vec<f32>>,
    queue: RingQueue<QueuedNote>,
    cursor: SchedulerCursor,
    /// Frames handed to the mixer so far; start of the next mixing buffer
    queued_frames: i64,
    mix_buffer: Vec<f32>,
    notifications: Vec<PendingNotification>,
    pattern: NoteList,
    listeners: Vec<ListenerEntry>,
    listener_generation: Option<u64>,
    note_delay_frames: i64,
    schedule_error: Option<ScheduleError>,
    poll_every: u64,
    cycles: u64,
}

impl<S: AudioSink> Session<S> {
    /// Build a session around an open sink, loading every sample of `bank`
    /// at the sink's rate.
    pub fn new<B: SampleBank + ?Sized>(
        sink: S,
        bank: &B,
        controls: Arc<PlaybackControls>,
        engine: &EngineConfig,
    ) -> Self {
        let config = sink.config();
        let mixing_buffer_size = engine.mixing_buffer_size(config.buffer_size);
        let samples = (0..bank.len())
            .map(|i| bank.sample(NoteId(i as u32), config.sample_rate))
            .collect();

        Self {
            sink,
            config,
            controls,
            samples,
            queue: RingQueue::default(),
            cursor: SchedulerCursor::new(0, (config.buffer_size / 2) as i64),
            queued_frames: 0,
            mix_buffer: vec![0.0; mixing_buffer_size],
            notifications: Vec::new(),
            pattern: NoteList::new(),
            listeners: Vec::new(),
            listener_generation: None,
            note_delay_frames: 0,
            schedule_error: None,
            poll_every: engine.routing_poll_cycles(mixing_buffer_size, config.sample_rate),
            cycles: 0,
        }
    }

    pub fn config(&self) -> SinkConfig {
        self.config
    }

    pub fn mixing_buffer_size(&self) -> usize {
        self.mix_buffer.len()
    }

    pub fn cursor(&self) -> SchedulerCursor {
        self.cursor
    }

    pub fn queued_frames(&self) -> i64 {
        self.queued_frames
    }

    pub fn queue(&self) -> &RingQueue<QueuedNote> {
        &self.queue
    }

    /// Notifications waiting for the playback position.
    pub fn pending_notifications(&self) -> &[PendingNotification] {
        &self.notifications
    }

    /// Note delay currently applied, in frames.
    pub fn note_delay_frames(&self) -> i64 {
        self.note_delay_frames
    }

    /// The buffer written by the last cycle.
    pub fn last_buffer(&self) -> &[f32] {
        &self.mix_buffer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run one schedule / sync / mix / notify / write iteration.
    ///
    /// `native_config` is called every few cycles (per
    /// [`EngineConfig::routing_poll_interval`]) to compare the device's
    /// native configuration with the open sink.
    pub fn cycle(&mut self, native_config: impl FnOnce() -> Option<SinkConfig>) -> CycleOutcome {
        self.refresh_pattern();
        self.refresh_listeners();
        self.schedule();

        if let Some(request) = self.controls.sync.take() {
            let clock = DeviceClock::new(self.sink.playback_position(), Instant::now());
            match synchronize(
                &request,
                &self.pattern,
                self.cursor,
                clock,
                self.note_delay_frames,
                self.config.sample_rate,
            ) {
                Ok(cursor) => {
                    debug!(
                        from = self.cursor.next_note_frame,
                        to = cursor.next_note_frame,
                        "phase synchronized"
                    );
                    self.cursor = cursor;
                }
                Err(e) => warn!("ignoring sync request: {e}"),
            }
        }

        self.queued_frames += self.mix_buffer.len() as i64;
        let retired = mix(&mut self.mix_buffer, &mut self.queue, &self.samples);
        if retired > 0 {
            trace!(retired, in_flight = self.queue.len(), "notes finished");
        }

        self.fire_notifications();

        if let Err(e) = self.sink.write(&self.mix_buffer) {
            return CycleOutcome::WriteFailed(e);
        }

        if self.sink.routing_changed() {
            return CycleOutcome::RoutingChanged;
        }
        self.cycles += 1;
        if self.cycles % self.poll_every == 0 {
            if let Some(native) = native_config() {
                if native != self.config {
                    info!(?native, open = ?self.config, "native output configuration changed");
                    return CycleOutcome::RoutingChanged;
                }
            }
        }
        CycleOutcome::Continue
    }

    /// Flush and release the sink, dropping everything still queued.
    pub fn close(mut self) {
        self.sink.close();
        debug!(
            dropped_notes = self.queue.len(),
            dropped_notifications = self.notifications.len(),
            "session closed"
        );
    }

    fn refresh_pattern(&mut self) {
        match self.controls.pattern.load().as_deref() {
            // keep last cycle's snapshot while an edit holds the lock
            Some(pattern) => {
                pattern.copy_if_unlocked(&mut self.pattern);
            }
            None => self.pattern.clear(),
        }
    }

    fn refresh_listeners(&mut self) {
        let registry = self.controls.listeners();
        if self.listener_generation == Some(registry.generation()) {
            return;
        }
        self.listener_generation = Some(registry.generation());
        self.listeners = registry.entries(self.config.sample_rate);
        let note_delay_frames = registry.note_delay_frames(self.config.sample_rate);
        drop(registry);

        if note_delay_frames != self.note_delay_frames {
            debug!(frames = note_delay_frames, "note delay changed");
        }
        self.note_delay_frames = note_delay_frames;
    }

    fn schedule(&mut self) {
        let frames_to_queue = self.mix_buffer.len() as i64;
        let ctx = ScheduleContext {
            sample_rate: self.config.sample_rate,
            note_delay_frames: self.note_delay_frames,
            listeners: &self.listeners,
        };
        let result = queue_next_notes(
            self.cursor,
            &self.pattern,
            self.queued_frames,
            frames_to_queue,
            &ctx,
            &mut self.queue,
            &mut self.notifications,
        );

        match result {
            Ok(cursor) => {
                if self.schedule_error.take().is_some() {
                    info!("pattern can be scheduled again");
                }
                self.cursor = cursor;
            }
            Err(e) => {
                if self.schedule_error != Some(e) {
                    if self.controls.pattern.load().is_some() {
                        warn!("pattern cannot be scheduled: {e}");
                    } else {
                        debug!("no pattern set");
                    }
                    self.schedule_error = Some(e);
                }
                // resume at the write position once the pattern is valid again
                let horizon = self.queued_frames + frames_to_queue;
                self.cursor.next_note_frame = self.cursor.next_note_frame.max(horizon);
            }
        }
    }

    fn fire_notifications(&mut self) {
        let position = self.sink.playback_position();
        self.notifications.retain(|pending| {
            if pending.frame <= position {
                trace!(frame = pending.frame, position, uid = pending.note.uid(), "note started");
                pending.listener.on_note_started(pending.note.clone());
                false
            } else {
                true
            }
        });
    }
}
