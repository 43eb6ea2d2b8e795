//! Look-ahead note scheduling.
//!
//! The scheduler walks the looped pattern and commits every note that
//! becomes due before the end of the next mixing buffer. Nothing beyond
//! that horizon is queued, which keeps the queue short and the latency of
//! pattern edits bounded by one buffer.

use alloc::vec::Vec;

use crate::error::ScheduleError;
use crate::listener::{ListenerEntry, PendingNotification};
use crate::note::NoteList;
use crate::queue::{QueuedNote, RingQueue};

/// Position of the scheduler in the pattern.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerCursor {
    /// Pattern step to queue next. May equal the pattern length, which wraps to 0.
    pub next_note_index: usize,
    /// Absolute frame at which that step is due (before the note delay)
    pub next_note_frame: i64,
}

impl SchedulerCursor {
    pub fn new(next_note_index: usize, next_note_frame: i64) -> Self {
        Self { next_note_index, next_note_frame }
    }
}

/// Per-sink parameters for [`queue_next_notes`].
#[derive(Clone, Copy, Debug)]
pub struct ScheduleContext<'a> {
    pub sample_rate: u32,
    /// Frames added to every note's start, see [`note_delay_frames`](crate::note_delay_frames)
    pub note_delay_frames: i64,
    /// Listeners to notify for each queued note
    pub listeners: &'a [ListenerEntry],
}

/// Queue all notes due before `already_queued_frames + frames_to_queue`.
///
/// Each queued note starts `next_note_frame - already_queued_frames + note_delay`
/// frames into the next mixing buffer (clamped to 0). For every listener a
/// notification is recorded at `next_note_frame + note_delay + listener delay`.
///
/// Returns the cursor for the next call. Fails without touching `queue` or
/// `notifications` if `pattern` is empty, has a non-finite duration, or one
/// loop of it is shorter than a frame at `ctx.sample_rate`.
///
/// ```
/// use metrum::{
///     queue_next_notes, NoteId, NoteList, NoteListItem, RingQueue, ScheduleContext,
///     SchedulerCursor,
/// };
///
/// let pattern: NoteList = vec![
///     NoteListItem::new(NoteId(0), 1.0, 0.5),
///     NoteListItem::new(NoteId(1), 1.0, 0.5),
/// ].into();
/// let ctx = ScheduleContext { sample_rate: 48000, note_delay_frames: 0, listeners: &[] };
/// let mut queue = RingQueue::default();
/// let mut pending = Vec::new();
///
/// let start = SchedulerCursor::default();
/// let cursor = queue_next_notes(start, &pattern, 0, 512, &ctx, &mut queue, &mut pending)?;
/// assert_eq!(cursor, SchedulerCursor::new(1, 24000));
/// assert_eq!(queue.len(), 1);
/// # Ok::<(), metrum::ScheduleError>(())
/// ```
pub fn queue_next_notes(
    cursor: SchedulerCursor,
    pattern: &NoteList,
    already_queued_frames: i64,
    frames_to_queue: i64,
    ctx: &ScheduleContext<'_>,
    queue: &mut RingQueue<QueuedNote>,
    notifications: &mut Vec<PendingNotification>,
) -> Result<SchedulerCursor, ScheduleError> {
    pattern.validate(ctx.sample_rate)?;

    let SchedulerCursor { mut next_note_index, mut next_note_frame } = cursor;
    let horizon = already_queued_frames.saturating_add(frames_to_queue);

    while next_note_frame < horizon {
        if next_note_index >= pattern.len() {
            next_note_index = 0;
        }
        let item = &pattern[next_note_index];

        let queued = queue.append();
        queued.note = item.note;
        let offset = next_note_frame - already_queued_frames + ctx.note_delay_frames;
        queued.start_delay = offset.max(0) as usize;
        queued.next_sample_to_mix = 0;
        queued.volume = item.volume;

        for entry in ctx.listeners {
            notifications.push(PendingNotification {
                frame: next_note_frame + ctx.note_delay_frames + entry.delay_frames,
                note: item.clone(),
                listener: entry.listener.clone(),
            });
        }

        // an unset duration (-1) advances by nothing: the next step starts on the same frame
        next_note_frame = next_note_frame.saturating_add(item.duration_frames(ctx.sample_rate));
        next_note_index += 1;
    }

    Ok(SchedulerCursor { next_note_index, next_note_frame })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenerId, NoteStartedListener};
    use crate::note::{NoteId, NoteListItem};
    use alloc::sync::Arc;

    fn two_halves() -> NoteList {
        vec![
            NoteListItem::new(NoteId(0), 1.0, 0.5),
            NoteListItem::new(NoteId(1), 0.8, 0.5),
        ]
        .into()
    }

    fn ctx(listeners: &[ListenerEntry], note_delay_frames: i64) -> ScheduleContext<'_> {
        ScheduleContext { sample_rate: 48000, note_delay_frames, listeners }
    }

    /// Schedule `pattern` from frame 0 in `buffer` sized windows until the cursor reaches
    /// `until`. Returns the final cursor and the absolute start frame of every queued note.
    fn run_until(
        pattern: &NoteList,
        ctx: &ScheduleContext<'_>,
        buffer: i64,
        until: i64,
    ) -> (SchedulerCursor, Vec<(NoteId, i64)>) {
        let mut queue = RingQueue::default();
        let mut pending = Vec::new();
        let mut cursor = SchedulerCursor::default();
        let mut queued = 0;
        let mut onsets = Vec::new();
        while cursor.next_note_frame < until {
            let before = queue.indices().end;
            cursor =
                queue_next_notes(cursor, pattern, queued, buffer, ctx, &mut queue, &mut pending)
                    .unwrap();
            onsets.extend(
                (before..queue.indices().end)
                    .map(|i| (queue[i].note, queued + queue[i].start_delay as i64)),
            );
            queued += buffer;
        }
        (cursor, onsets)
    }

    #[test]
    fn queues_exactly_the_notes_inside_the_window() {
        let pattern = two_halves();
        let mut queue = RingQueue::default();
        let mut pending = Vec::new();
        let mut cursor = SchedulerCursor::default();

        // first window [0, 1024)
        cursor =
            queue_next_notes(cursor, &pattern, 0, 1024, &ctx(&[], 0), &mut queue, &mut pending)
                .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_head().unwrap().start_delay, 0);
        assert_eq!(cursor, SchedulerCursor::new(1, 24000));

        // walk forward in 512 frame buffers until item 1 is due
        let mut queued_frames = 1024;
        while queue.len() < 2 {
            cursor = queue_next_notes(
                cursor,
                &pattern,
                queued_frames,
                512,
                &ctx(&[], 0),
                &mut queue,
                &mut pending,
            )
            .unwrap();
            queued_frames += 512;
        }
        let last = queued_frames - 512;
        let second = queue[queue.indices().end - 1];
        assert_eq!(second.note, NoteId(1));
        assert_eq!(second.volume, 0.8);
        assert_eq!(second.start_delay as i64, 24000 - last);
        assert_eq!(cursor, SchedulerCursor::new(2, 48000));
        assert!(pending.is_empty());
    }

    #[test]
    fn cursor_matches_cumulative_durations_over_loops() {
        let pattern: NoteList = vec![
            NoteListItem::new(NoteId(0), 1.0, 0.1),
            NoteListItem::new(NoteId(1), 1.0, 0.0375),
            NoteListItem::new(NoteId(2), 1.0, 0.21),
        ]
        .into();
        let loop_frames = pattern.loop_frames(48000);
        let loops = 7;

        let (cursor, onsets) = run_until(&pattern, &ctx(&[], 0), 512, loops * loop_frames);

        assert_eq!(onsets.len(), 3 * loops as usize);
        for (i, (id, _)) in onsets.iter().enumerate() {
            assert_eq!(id.index(), i % 3);
        }
        assert_eq!(cursor.next_note_frame, loops * loop_frames);
        assert_eq!(cursor.next_note_index, 3);
    }

    #[test]
    fn rounded_durations_accumulate_per_item() {
        // none of these is a whole number of frames at 44.1 kHz
        let durations = [1.0f32 / 3.0, 0.0123, 0.0771];
        let rounded = [14700i64, 542, 3400];
        let pattern: NoteList = durations
            .iter()
            .enumerate()
            .map(|(i, &d)| NoteListItem::new(NoteId(i as u32), 1.0, d))
            .collect();
        let ctx = ScheduleContext { sample_rate: 44100, note_delay_frames: 0, listeners: &[] };
        let loops = 9;
        let loop_frames: i64 = rounded.iter().sum();
        assert_eq!(pattern.loop_frames(44100), loop_frames);

        let (cursor, onsets) = run_until(&pattern, &ctx, 441, loops * loop_frames);
        assert_eq!(cursor.next_note_frame, loops * loop_frames);
        assert_eq!(onsets.len(), 3 * loops as usize);

        let mut expected_frame = 0;
        let mut exact_seconds = 0.0f64;
        for (k, (id, frame)) in onsets.iter().enumerate() {
            let step = k % 3;
            assert_eq!(id.index(), step);
            assert_eq!(*frame, expected_frame);
            // at most one frame of rounding error per item scheduled so far
            let drift = (*frame as f64 - exact_seconds * 44100.0).abs();
            assert!(drift <= k as f64 + 1.0, "note {k} drifted {drift} frames");
            expected_frame += rounded[step];
            exact_seconds += f64::from(durations[step]);
        }
    }

    #[test]
    fn unset_duration_schedules_next_note_on_same_frame() {
        let pattern: NoteList = vec![
            NoteListItem::new(NoteId(0), 1.0, NoteListItem::DURATION_UNSET),
            NoteListItem::new(NoteId(1), 1.0, 0.5),
        ]
        .into();
        let mut queue = RingQueue::default();
        let mut pending = Vec::new();
        let start = SchedulerCursor::new(0, 100);
        let cursor =
            queue_next_notes(start, &pattern, 0, 512, &ctx(&[], 0), &mut queue, &mut pending)
                .unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].start_delay, 100);
        assert_eq!(queue[1].start_delay, 100);
        assert_eq!(cursor, SchedulerCursor::new(2, 24100));
    }

    #[test]
    fn negative_listener_delay_shifts_notes_and_cancels_in_notification() {
        let listener: Arc<dyn NoteStartedListener> = Arc::new(|_note: NoteListItem| {});
        let entries = [ListenerEntry { id: ListenerId(0), listener, delay_frames: -2400 }];
        let note_delay = 2400;
        let pattern = two_halves();
        let start = SchedulerCursor::new(0, 300);

        let mut plain = RingQueue::default();
        let mut delayed = RingQueue::default();
        let mut pending = Vec::new();
        queue_next_notes(start, &pattern, 0, 512, &ctx(&[], 0), &mut plain, &mut Vec::new())
            .unwrap();
        queue_next_notes(
            start,
            &pattern,
            0,
            512,
            &ctx(&entries, note_delay),
            &mut delayed,
            &mut pending,
        )
        .unwrap();

        assert_eq!(delayed[0].start_delay, plain[0].start_delay + 2400);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].frame, 300);
        assert_eq!(pending[0].note.uid(), pattern[0].uid());
    }

    #[test]
    fn overdue_note_starts_immediately() {
        let pattern = two_halves();
        let mut queue = RingQueue::default();
        let start = SchedulerCursor::new(0, 1000);
        queue_next_notes(start, &pattern, 1200, 512, &ctx(&[], 0), &mut queue, &mut Vec::new())
            .unwrap();
        assert_eq!(queue[0].start_delay, 0);
    }

    #[test]
    fn unschedulable_patterns_leave_queue_untouched() {
        let mut queue = RingQueue::default();
        let mut pending = Vec::new();
        let cursor = SchedulerCursor::new(0, 0);
        let ctx = ctx(&[], 0);

        let empty = NoteList::new();
        let err = queue_next_notes(cursor, &empty, 0, 512, &ctx, &mut queue, &mut pending);
        assert_eq!(err, Err(ScheduleError::EmptyPattern));

        let zero: NoteList = vec![NoteListItem::new(NoteId(0), 1.0, 0.0)].into();
        let err = queue_next_notes(cursor, &zero, 0, 512, &ctx, &mut queue, &mut pending);
        assert_eq!(err, Err(ScheduleError::NoPositiveDuration));

        // positive, but rounds to zero frames at 48 kHz
        let sub_frame: NoteList = vec![NoteListItem::new(NoteId(0), 1.0, 0.000_005)].into();
        let err = queue_next_notes(cursor, &sub_frame, 0, 512, &ctx, &mut queue, &mut pending);
        assert_eq!(err, Err(ScheduleError::NoPositiveDuration));

        let endless: NoteList = vec![NoteListItem::new(NoteId(0), 1.0, f32::INFINITY)].into();
        let err = queue_next_notes(cursor, &endless, 0, 512, &ctx, &mut queue, &mut pending);
        assert_eq!(err, Err(ScheduleError::NonFiniteDuration));

        assert!(queue.is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn huge_duration_saturates_the_cursor() {
        let pattern: NoteList = vec![NoteListItem::new(NoteId(0), 1.0, 1.0e30)].into();
        let mut queue = RingQueue::default();
        let mut pending = Vec::new();
        let start = SchedulerCursor::new(0, 10);

        let cursor =
            queue_next_notes(start, &pattern, 0, 512, &ctx(&[], 0), &mut queue, &mut pending)
                .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(cursor, SchedulerCursor::new(1, i64::MAX));

        // nothing else is ever due
        let again =
            queue_next_notes(cursor, &pattern, 512, 512, &ctx(&[], 0), &mut queue, &mut pending)
                .unwrap();
        assert_eq!(again, cursor);
        assert_eq!(queue.len(), 1);
    }
}
