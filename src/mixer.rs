//! Mixer - sums queued notes into the output buffer

use crate::queue::{QueuedNote, RingQueue};

/// Render the next mixing buffer from the queued notes.
///
/// `buffer` is cleared, then every queued note adds
/// `volume * sample[next_sample_to_mix..]` starting `start_delay` frames in.
/// Notes starting beyond the end of this buffer contribute nothing yet; their
/// `start_delay` is reduced by the buffer length. No clipping is applied, so
/// many loud overlapping notes can exceed ±1.0.
///
/// Afterwards fully played notes are popped from the head of the queue. The
/// scan stops at the first note that still has samples left, so notes are
/// always retired in the order they were queued.
///
/// `samples[id]` is the PCM data for [`NoteId`](crate::NoteId) `id`; unknown
/// ids are treated as empty samples. Returns the number of retired notes.
///
/// ```
/// use metrum::{mix, NoteId, QueuedNote, RingQueue};
///
/// let samples = vec![vec![1.0f32; 6]];
/// let mut queue = RingQueue::default();
/// *queue.append() =
///     QueuedNote { note: NoteId(0), next_sample_to_mix: 0, start_delay: 2, volume: 0.5 };
///
/// let mut buffer = [9.0f32; 4];
/// mix(&mut buffer, &mut queue, &samples);
/// assert_eq!(buffer, [0.0, 0.0, 0.5, 0.5]);
///
/// let retired = mix(&mut buffer, &mut queue, &samples);
/// assert_eq!(buffer, [0.5, 0.5, 0.5, 0.5]);
/// assert_eq!(retired, 1);
/// assert!(queue.is_empty());
/// ```
pub fn mix<S: AsRef<[f32]>>(
    buffer: &mut [f32],
    queue: &mut RingQueue<QueuedNote>,
    samples: &[S],
) -> usize {
    buffer.iter_mut().for_each(|s| *s = 0.0);

    let buffer_len = buffer.len();
    for queued in queue.iter_mut() {
        let sample = note_samples(samples, queued);
        let sample_start = queued.next_sample_to_mix.min(sample.len());
        let room = buffer_len.saturating_sub(queued.start_delay);
        let num_to_write = (sample.len() - sample_start).min(room);
        let sample_end = sample_start + num_to_write;

        let volume = queued.volume;
        let out = &mut buffer[queued.start_delay.min(buffer_len)..];
        for (out_sample, &in_sample) in out.iter_mut().zip(&sample[sample_start..sample_end]) {
            *out_sample += volume * in_sample;
        }

        queued.start_delay = queued.start_delay.saturating_sub(buffer_len);
        queued.next_sample_to_mix = sample_end;
    }

    let mut retired = 0;
    while let Some(head) = queue.peek_head() {
        if head.next_sample_to_mix >= note_samples(samples, head).len() {
            queue.pop_head();
            retired += 1;
        } else {
            break;
        }
    }
    retired
}

#[inline]
fn note_samples<'a, S: AsRef<[f32]>>(samples: &'a [S], queued: &QueuedNote) -> &'a [f32] {
    samples.get(queued.note.index()).map(AsRef::as_ref).unwrap_or(&[])
}
