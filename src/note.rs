//! Pattern data: notes, note lists and the shared pattern handle.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::ScheduleError;

/// Index of a sample in a [`SampleBank`](crate::SampleBank).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct NoteId(pub u32);

impl NoteId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NoteId {
    fn from(id: u32) -> Self {
        NoteId(id)
    }
}

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// One step of a pattern.
///
/// Clones keep the [`uid`](Self::uid), so a note can be matched across
/// pattern snapshots and in [`NoteStartedListener`](crate::NoteStartedListener)
/// callbacks even after it was edited.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteListItem {
    /// Sample to play
    pub note: NoteId,
    /// Linear gain, typically 0..1
    pub volume: f32,
    /// Time until the next step starts, in seconds
    /// ([`DURATION_UNSET`](Self::DURATION_UNSET) if not known yet)
    pub duration: f32,
    /// Free-form id for the owner's own bookkeeping
    pub tag: u64,
    uid: u64,
}

impl NoteListItem {
    /// Sentinel duration: the following step starts on the same frame.
    pub const DURATION_UNSET: f32 = -1.0;

    pub fn new(note: NoteId, volume: f32, duration: f32) -> Self {
        Self {
            note,
            volume,
            duration,
            tag: 0,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Stable identity of this note, shared by all of its clones.
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Frames until the next step, `round(max(0, duration) * sample_rate)`.
    #[inline]
    pub fn duration_frames(&self, sample_rate: u32) -> i64 {
        (f64::from(self.duration.max(0.0)) * f64::from(sample_rate)).round() as i64
    }
}

/// An ordered, looped sequence of notes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteList {
    items: Vec<NoteListItem>,
}

impl NoteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: NoteListItem) {
        self.items.push(item);
    }

    pub fn insert(&mut self, index: usize, item: NoteListItem) {
        self.items.insert(index, item);
    }

    pub fn remove(&mut self, index: usize) -> NoteListItem {
        self.items.remove(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Replace all notes.
    pub fn set(&mut self, items: impl IntoIterator<Item = NoteListItem>) {
        self.items.clear();
        self.items.extend(items);
    }

    /// Find a note by its [`uid`](NoteListItem::uid).
    pub fn position(&self, uid: u64) -> Option<usize> {
        self.items.iter().position(|n| n.uid() == uid)
    }

    /// Check that the scheduler can make progress on this list at `sample_rate`.
    ///
    /// A loop must advance by at least one frame, so durations that all round
    /// to zero frames are rejected as well.
    pub fn validate(&self, sample_rate: u32) -> Result<(), ScheduleError> {
        if self.items.is_empty() {
            return Err(ScheduleError::EmptyPattern);
        }
        if self.items.iter().any(|n| !n.duration.is_finite()) {
            return Err(ScheduleError::NonFiniteDuration);
        }
        if self.loop_frames(sample_rate) <= 0 {
            return Err(ScheduleError::NoPositiveDuration);
        }
        Ok(())
    }

    /// Frames for one full loop of the pattern, saturating at `i64::MAX`.
    pub fn loop_frames(&self, sample_rate: u32) -> i64 {
        self.items
            .iter()
            .fold(0i64, |sum, n| sum.saturating_add(n.duration_frames(sample_rate)))
    }
}

impl Deref for NoteList {
    type Target = [NoteListItem];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl DerefMut for NoteList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.items
    }
}

impl From<Vec<NoteListItem>> for NoteList {
    fn from(items: Vec<NoteListItem>) -> Self {
        Self { items }
    }
}

impl FromIterator<NoteListItem> for NoteList {
    fn from_iter<I: IntoIterator<Item = NoteListItem>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

/// A note list shared between its editor and the playback thread.
///
/// Editors lock it through [`edit`](Self::edit). The playback thread only
/// ever calls [`copy_if_unlocked`](Self::copy_if_unlocked), which gives up
/// instead of waiting when an edit is in progress.
#[derive(Clone, Debug, Default)]
pub struct Pattern {
    inner: Arc<Mutex<NoteList>>,
}

impl Pattern {
    pub fn new(notes: NoteList) -> Self {
        Self { inner: Arc::new(Mutex::new(notes)) }
    }

    /// Mutate the note list under the lock.
    pub fn edit<R>(&self, f: impl FnOnce(&mut NoteList) -> R) -> R {
        let mut notes = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut notes)
    }

    /// Blocking copy of the current note list.
    pub fn snapshot(&self) -> NoteList {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copy the note list into `target` unless someone holds the lock.
    ///
    /// Returns `false` and leaves `target` untouched if the lock is busy.
    pub fn copy_if_unlocked(&self, target: &mut NoteList) -> bool {
        match self.inner.try_lock() {
            Ok(notes) => {
                target.clone_from(&notes);
                true
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                target.clone_from(&poisoned.into_inner());
                true
            }
            Err(std::sync::TryLockError::WouldBlock) => false,
        }
    }

    /// Whether both handles refer to the same note list.
    pub fn ptr_eq(&self, other: &Pattern) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
