//! Note-started listeners and their registry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::note::NoteListItem;

/// Observer notified when a note starts playing.
///
/// Called on the playback thread, so implementations should return quickly
/// (forward to a channel if real work is needed). Any
/// `Fn(NoteListItem) + Send + Sync` closure is a listener.
///
/// ```
/// use std::sync::Arc;
/// use metrum::{NoteListItem, NoteStartedListener};
///
/// let listener: Arc<dyn NoteStartedListener> = Arc::new(|note: NoteListItem| {
///     println!("note {} started", note.uid());
/// });
/// ```
pub trait NoteStartedListener: Send + Sync + 'static {
    /// `note` is a copy of the pattern step as it was when it got scheduled.
    fn on_note_started(&self, note: NoteListItem);
}

impl<F> NoteStartedListener for F
where
    F: Fn(NoteListItem) + Send + Sync + 'static,
{
    fn on_note_started(&self, note: NoteListItem) {
        self(note)
    }
}

/// Handle of a registered listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

struct Registration {
    listener: Arc<dyn NoteStartedListener>,
    delay_millis: f32,
}

/// A listener with its delay converted to frames for one sink.
#[derive(Clone)]
pub struct ListenerEntry {
    pub id: ListenerId,
    pub listener: Arc<dyn NoteStartedListener>,
    pub delay_frames: i64,
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("delay_frames", &self.delay_frames)
            .finish()
    }
}

/// A notification waiting for the playback position to reach `frame`.
#[derive(Clone)]
pub struct PendingNotification {
    pub frame: i64,
    pub note: NoteListItem,
    pub listener: Arc<dyn NoteStartedListener>,
}

impl fmt::Debug for PendingNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingNotification")
            .field("frame", &self.frame)
            .field("note", &self.note)
            .finish()
    }
}

/// Registered listeners and their delays in milliseconds.
///
/// Every mutation bumps [`generation`](Self::generation), which lets the
/// playback loop re-derive its per-sink view only when something changed.
#[derive(Default)]
pub struct ListenerRegistry {
    registrations: HashMap<ListenerId, Registration>,
    next_id: u64,
    generation: u64,
}

#[inline]
fn millis_to_frames(millis: f32, sample_rate: u32) -> i64 {
    (f64::from(millis) / 1000.0 * f64::from(sample_rate)).round() as i64
}

/// Delay added to every note so the most negative listener delay still
/// resolves to a frame at or after the note's nominal start.
///
/// `max(0, -round(min(delays) * sample_rate))`, or 0 without listeners.
pub fn note_delay_frames(delays_millis: impl IntoIterator<Item = f32>, sample_rate: u32) -> i64 {
    delays_millis
        .into_iter()
        .min_by(f32::total_cmp)
        .map_or(0, |min| (-millis_to_frames(min, sample_rate)).max(0))
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`, replacing an earlier registration of the same object.
    pub fn register(
        &mut self,
        listener: Arc<dyn NoteStartedListener>,
        delay_millis: f32,
    ) -> ListenerId {
        let existing = self
            .registrations
            .iter()
            .find(|(_, r)| Arc::ptr_eq(&r.listener, &listener))
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            self.registrations.remove(&id);
        }

        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.registrations.insert(id, Registration { listener, delay_millis });
        self.generation += 1;
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let removed = self.registrations.remove(&id).is_some();
        if removed {
            self.generation += 1;
        }
        removed
    }

    /// Returns `false` if `id` is not registered.
    pub fn set_delay(&mut self, id: ListenerId, delay_millis: f32) -> bool {
        match self.registrations.get_mut(&id) {
            Some(r) => {
                r.delay_millis = delay_millis;
                self.generation += 1;
                true
            }
            None => false,
        }
    }

    pub fn delay(&self, id: ListenerId) -> Option<f32> {
        self.registrations.get(&id).map(|r| r.delay_millis)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The global note delay for the current registrations.
    pub fn note_delay_frames(&self, sample_rate: u32) -> i64 {
        note_delay_frames(self.registrations.values().map(|r| r.delay_millis), sample_rate)
    }

    /// Listeners with delays in frames, in registration order.
    pub fn entries(&self, sample_rate: u32) -> Vec<ListenerEntry> {
        self.registrations
            .iter()
            .sorted_by_key(|(id, _)| **id)
            .map(|(id, r)| ListenerEntry {
                id: *id,
                listener: r.listener.clone(),
                delay_frames: millis_to_frames(r.delay_millis, sample_rate),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn NoteStartedListener> {
        Arc::new(|_note: NoteListItem| {})
    }

    #[test]
    fn note_delay_is_negated_minimum() {
        assert_eq!(note_delay_frames(std::iter::empty(), 48000), 0);
        assert_eq!(note_delay_frames([10.0, 20.0], 48000), 0);
        assert_eq!(note_delay_frames([-50.0], 48000), 2400);
        assert_eq!(note_delay_frames([30.0, -10.0, -50.0], 48000), 2400);
    }

    #[test]
    fn registry_tracks_delay_and_generation() {
        let mut registry = ListenerRegistry::new();
        assert_eq!(registry.note_delay_frames(48000), 0);

        let a = registry.register(noop(), -50.0);
        let b = registry.register(noop(), 20.0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.note_delay_frames(48000), 2400);

        let generation = registry.generation();
        assert!(registry.set_delay(a, 0.0));
        assert!(registry.generation() > generation);
        assert_eq!(registry.note_delay_frames(48000), 0);

        assert!(registry.unregister(b));
        assert!(!registry.unregister(b));
        assert!(!registry.set_delay(b, 1.0));
        assert_eq!(registry.delay(a), Some(0.0));
    }

    #[test]
    fn registering_same_listener_replaces_it() {
        let mut registry = ListenerRegistry::new();
        let listener = noop();
        let first = registry.register(listener.clone(), 10.0);
        let second = registry.register(listener, -10.0);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.delay(first), None);
        assert_eq!(registry.delay(second), Some(-10.0));
    }

    #[test]
    fn entries_are_in_registration_order_with_frame_delays() {
        let mut registry = ListenerRegistry::new();
        let ids: Vec<_> = [0.0, -10.0, 5.0].iter().map(|&d| registry.register(noop(), d)).collect();
        let entries = registry.entries(48000);
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
        assert_eq!(entries.iter().map(|e| e.delay_frames).collect::<Vec<_>>(), vec![0, -480, 240]);
    }
}
