//! Phase synchronization to an external beat grid.
//!
//! A [`SyncRequest`] says "the pattern's first step should fall on
//! `reference_time + n * beat_duration`". The playback loop applies it by
//! moving the scheduler cursor's frame to the nearest point of that grid,
//! keeping every note that is already queued.

use alloc::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;

use crate::error::SyncError;
use crate::note::NoteList;
use crate::scheduler::SchedulerCursor;

/// Request to align the pattern to a beat grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncRequest {
    /// A moment at which the first step of the pattern should have played
    pub reference_time: Instant,
    /// Grid spacing in seconds
    pub beat_duration: f32,
}

impl SyncRequest {
    pub fn new(reference_time: Instant, beat_duration: f32) -> Self {
        Self { reference_time, beat_duration }
    }

    /// Beat duration in frames, rejecting beats that round to less than one frame.
    pub fn beat_frames(&self, sample_rate: u32) -> Result<i64, SyncError> {
        if !self.beat_duration.is_finite() || self.beat_duration <= 0.0 {
            return Err(SyncError::InvalidBeatDuration(self.beat_duration));
        }
        let frames = (f64::from(self.beat_duration) * f64::from(sample_rate)).round() as i64;
        if frames < 1 {
            return Err(SyncError::InvalidBeatDuration(self.beat_duration));
        }
        Ok(frames)
    }
}

/// A playback position sampled together with the wall clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceClock {
    /// Frames played by the sink at `now`
    pub frame: i64,
    pub now: Instant,
}

impl DeviceClock {
    pub fn new(frame: i64, now: Instant) -> Self {
        Self { frame, now }
    }

    /// Extrapolate the frame played at `time`.
    pub fn frame_at(&self, time: Instant, sample_rate: u32) -> i64 {
        let rate = f64::from(sample_rate);
        if time >= self.now {
            self.frame + ((time - self.now).as_secs_f64() * rate).round() as i64
        } else {
            self.frame - ((self.now - time).as_secs_f64() * rate).round() as i64
        }
    }
}

/// Single-slot mailbox for sync requests.
///
/// Posting never blocks and overwrites a request that was not taken yet:
/// an older phase target is stale by the time a newer one arrives.
///
/// ```
/// use std::time::Instant;
/// use metrum::{SyncMailbox, SyncRequest};
///
/// let mailbox = SyncMailbox::new();
/// let now = Instant::now();
/// mailbox.post(SyncRequest::new(now, 0.5));
/// mailbox.post(SyncRequest::new(now, 0.25));
///
/// assert_eq!(mailbox.take().map(|r| r.beat_duration), Some(0.25));
/// assert!(mailbox.take().is_none());
/// ```
#[derive(Default)]
pub struct SyncMailbox {
    slot: ArcSwapOption<SyncRequest>,
}

impl SyncMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, request: SyncRequest) {
        self.slot.store(Some(Arc::new(request)));
    }

    /// Take the latest request, leaving the mailbox empty.
    pub fn take(&self) -> Option<SyncRequest> {
        self.slot.swap(None).map(|request| *request)
    }

    /// Whether a request is waiting for the playback thread.
    pub fn is_pending(&self) -> bool {
        self.slot.load().is_some()
    }
}

/// Move the cursor's frame onto the beat grid of `request`.
///
/// The grid point for the cursor's step is `reference + sum(durations of
/// the steps before it)`, taken modulo the beat. The audible onset of the
/// next step (`next_note_frame + note_delay_frames`) is snapped to the
/// nearest point of that grid, and the note delay is subtracted again.
/// Snapping an already aligned cursor leaves it unchanged.
///
/// The pattern index is kept (wrapped to 0 if it points past the end). An
/// empty pattern leaves the cursor as it is.
///
/// ```
/// use std::time::{Duration, Instant};
/// use metrum::{
///     synchronize, DeviceClock, NoteId, NoteList, NoteListItem, SchedulerCursor, SyncRequest,
/// };
///
/// let pattern: NoteList = vec![NoteListItem::new(NoteId(0), 1.0, 0.5)].into();
/// let now = Instant::now();
/// let clock = DeviceClock::new(0, now);
/// let request = SyncRequest::new(now + Duration::from_millis(100), 0.5);
///
/// // beat grid is 4800 + n * 24000; 20000 is closest to 28800
/// let cursor = SchedulerCursor::new(1, 20000);
/// let cursor = synchronize(&request, &pattern, cursor, clock, 0, 48000)?;
/// assert_eq!(cursor, SchedulerCursor::new(0, 28800));
/// # Ok::<(), metrum::SyncError>(())
/// ```
pub fn synchronize(
    request: &SyncRequest,
    pattern: &NoteList,
    cursor: SchedulerCursor,
    clock: DeviceClock,
    note_delay_frames: i64,
    sample_rate: u32,
) -> Result<SchedulerCursor, SyncError> {
    let beat_frames = request.beat_frames(sample_rate)?;
    if pattern.is_empty() {
        return Ok(cursor);
    }

    let next_note_index =
        if cursor.next_note_index >= pattern.len() { 0 } else { cursor.next_note_index };

    let reference_frame = clock.frame_at(request.reference_time, sample_rate);
    let reference_for_next: i64 = reference_frame
        + pattern[..next_note_index]
            .iter()
            .map(|n| n.duration_frames(sample_rate))
            .sum::<i64>();

    let onset = cursor.next_note_frame + note_delay_frames;
    // largest grid point not after the onset
    let reduced = onset - (onset - reference_for_next).rem_euclid(beat_frames);
    debug_assert!(reduced <= onset, "reduced reference {reduced} after onset {onset}");

    let beats = ((onset - reduced) as f64 / beat_frames as f64).round() as i64;
    let corrected = reduced + beats * beat_frames;

    Ok(SchedulerCursor {
        next_note_index,
        next_note_frame: corrected - note_delay_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::{NoteId, NoteListItem};
    use core::time::Duration;

    fn halves() -> NoteList {
        vec![
            NoteListItem::new(NoteId(0), 1.0, 0.5),
            NoteListItem::new(NoteId(1), 1.0, 0.5),
        ]
        .into()
    }

    #[test]
    fn snaps_to_nearest_grid_point_for_cursor_step() {
        let now = Instant::now();
        let clock = DeviceClock::new(10_000, now);
        let request = SyncRequest::new(now + Duration::from_millis(100), 0.5);

        // reference frame 14800, step 1 is due one half-second later: grid 38800 + n * 24000
        let later =
            synchronize(&request, &halves(), SchedulerCursor::new(1, 30_000), clock, 0, 48000);
        assert_eq!(later, Ok(SchedulerCursor::new(1, 38_800)));

        let earlier =
            synchronize(&request, &halves(), SchedulerCursor::new(1, 16_000), clock, 0, 48000)
                .unwrap();
        assert_eq!(earlier, SchedulerCursor::new(1, 14_800));
    }

    #[test]
    fn note_delay_aligns_the_audible_onset() {
        let now = Instant::now();
        let clock = DeviceClock::new(10_000, now);
        let request = SyncRequest::new(now + Duration::from_millis(100), 0.5);

        let cursor =
            synchronize(&request, &halves(), SchedulerCursor::new(1, 30_000), clock, 2400, 48000)
                .unwrap();
        assert_eq!(cursor.next_note_frame + 2400, 38_800);
    }

    #[test]
    fn repeated_identical_requests_are_idempotent() {
        let now = Instant::now();
        let clock = DeviceClock::new(123_457, now);
        let request = SyncRequest::new(now - Duration::from_millis(3210), 0.437);
        let pattern: NoteList = vec![
            NoteListItem::new(NoteId(0), 1.0, 0.311),
            NoteListItem::new(NoteId(1), 1.0, NoteListItem::DURATION_UNSET),
            NoteListItem::new(NoteId(2), 1.0, 0.127),
        ]
        .into();

        for delay in [0, 1, 2400, 9999] {
            for frame in [130_000, 140_017, 500_001] {
                for index in 0..=3 {
                    let start = SchedulerCursor::new(index, frame);
                    let first =
                        synchronize(&request, &pattern, start, clock, delay, 44100).unwrap();
                    let second =
                        synchronize(&request, &pattern, first, clock, delay, 44100).unwrap();
                    assert_eq!(first, second, "delay {delay} frame {frame} index {index}");
                }
            }
        }
    }

    #[test]
    fn reference_in_the_past_works_like_future() {
        let now = Instant::now();
        let clock = DeviceClock::new(48_000, now);
        let past = SyncRequest::new(now - Duration::from_millis(500), 0.25);
        let cursor =
            synchronize(&past, &halves(), SchedulerCursor::new(0, 50_000), clock, 0, 48000)
                .unwrap();
        // reference frame 24000, grid every 12000
        assert_eq!(cursor.next_note_frame, 48_000);
    }

    #[test]
    fn index_past_end_wraps_to_first_step() {
        let now = Instant::now();
        let clock = DeviceClock::new(0, now);
        let request = SyncRequest::new(now, 0.5);
        let cursor =
            synchronize(&request, &halves(), SchedulerCursor::new(2, 47_000), clock, 0, 48000)
                .unwrap();
        assert_eq!(cursor, SchedulerCursor::new(0, 48_000));
    }

    #[test]
    fn invalid_beat_durations_are_rejected() {
        let now = Instant::now();
        let clock = DeviceClock::new(0, now);
        let cursor = SchedulerCursor::new(0, 100);
        for beat in [0.0, -0.5, f32::NAN, f32::INFINITY, 1e-7] {
            let request = SyncRequest::new(now, beat);
            assert!(matches!(
                synchronize(&request, &halves(), cursor, clock, 0, 48000),
                Err(SyncError::InvalidBeatDuration(_))
            ));
        }
    }

    #[test]
    fn empty_pattern_is_a_noop() {
        let now = Instant::now();
        let cursor = SchedulerCursor::new(3, 777);
        let request = SyncRequest::new(now, 0.5);
        let clock = DeviceClock::new(0, now);
        let result = synchronize(&request, &NoteList::new(), cursor, clock, 0, 48000);
        assert_eq!(result, Ok(cursor));
    }

    #[test]
    fn frame_at_extrapolates_both_directions() {
        let now = Instant::now();
        let clock = DeviceClock::new(1000, now);
        assert_eq!(clock.frame_at(now + Duration::from_millis(10), 48000), 1480);
        assert_eq!(clock.frame_at(now - Duration::from_millis(10), 48000), 520);
    }
}
