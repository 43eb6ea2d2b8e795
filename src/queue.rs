//! Growable FIFO ring of in-flight notes.

use alloc::vec::Vec;
use core::mem;
use core::ops::{Index, IndexMut, Range};

use crate::note::NoteId;

/// A scheduled instance of a note, waiting for or undergoing mixing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueuedNote {
    /// Sample to mix
    pub note: NoteId,
    /// Read cursor into the note's sample buffer
    pub next_sample_to_mix: usize,
    /// Frames to wait, from the start of the next mixing buffer, before the first sample
    pub start_delay: usize,
    /// Gain captured when the note was scheduled
    pub volume: f32,
}

/// A FIFO ring buffer that grows instead of rejecting pushes.
///
/// Items are appended at the tail and removed at the head. Every item keeps
/// the same absolute index from [`append`](Self::append) until it is popped,
/// so the live items can be addressed with `queue[i]` for `i` in
/// [`indices`](Self::indices), even across a growth.
///
/// Popped slots are kept and recycled by later appends.
///
/// ```
/// use metrum::RingQueue;
///
/// let mut queue = RingQueue::<u32>::with_capacity(2);
/// for i in 0..5 {
///     *queue.append() = i;
/// }
/// queue.pop_head();
///
/// assert_eq!(queue.len(), 4);
/// assert_eq!(queue.indices(), 1..5);
/// assert_eq!(queue[3], 3);
/// ```
#[derive(Clone, Debug)]
pub struct RingQueue<T> {
    slots: Vec<T>,
    mask: usize,
    start: usize,
    end: usize,
}

impl<T: Default> RingQueue<T> {
    /// Create a queue with room for `capacity` items before the first growth.
    ///
    /// The capacity is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        Self {
            slots,
            mask: capacity - 1,
            start: 0,
            end: 0,
        }
    }

    /// Append a default-initialized item at the tail and return it for filling in.
    pub fn append(&mut self) -> &mut T {
        if self.len() == self.slots.len() {
            self.grow();
        }
        let slot = self.end & self.mask;
        self.end += 1;
        let item = &mut self.slots[slot];
        *item = T::default();
        item
    }

    fn grow(&mut self) {
        let capacity = self.slots.len() * 2;
        let mask = capacity - 1;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        for i in self.start..self.end {
            slots[i & mask] = mem::take(&mut self.slots[i & self.mask]);
        }
        self.slots = slots;
        self.mask = mask;
    }
}

impl<T> RingQueue<T> {
    /// Oldest live item.
    #[inline]
    pub fn peek_head(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.start & self.mask])
        }
    }

    /// Drop the oldest live item. Does nothing on an empty queue.
    #[inline]
    pub fn pop_head(&mut self) {
        if !self.is_empty() {
            self.start += 1;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of items that fit before the next growth.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Absolute indices of the live items, head first.
    #[inline]
    pub fn indices(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Live items, head first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.indices().map(move |i| &self.slots[i & self.mask])
    }

    /// Mutable live items, head first.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        let mask = self.mask;
        let len = self.len();
        let head = self.start & mask;
        // the live range is at most two contiguous runs of the slot vector
        let (front, back) = self.slots.split_at_mut(head);
        let tail_len = len.min(back.len());
        back[..tail_len]
            .iter_mut()
            .chain(front[..len - tail_len].iter_mut())
    }
}

impl<T: Default> Default for RingQueue<T> {
    fn default() -> Self {
        Self::with_capacity(32)
    }
}

impl<T> Index<usize> for RingQueue<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(
            self.indices().contains(&index),
            "index {index} outside live range {:?}",
            self.indices()
        );
        &self.slots[index & self.mask]
    }
}

impl<T> IndexMut<usize> for RingQueue<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(
            self.indices().contains(&index),
            "index {index} outside live range {:?}",
            self.indices()
        );
        &mut self.slots[index & self.mask]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_zeroed_slot_even_when_recycled() {
        let mut queue = RingQueue::<QueuedNote>::with_capacity(2);
        let n = queue.append();
        n.next_sample_to_mix = 42;
        n.volume = 1.0;
        queue.pop_head();

        // slot 0 gets reused eventually; it must come back zeroed
        queue.append();
        queue.pop_head();
        let recycled = queue.append();
        assert_eq!(*recycled, QueuedNote::default());
    }

    #[test]
    fn fifo_order_survives_growth() {
        let mut queue = RingQueue::<usize>::with_capacity(4);
        for i in 0..3 {
            *queue.append() = i;
        }
        queue.pop_head();
        queue.pop_head();
        // head is now mid-buffer; force a wrap and then a growth
        for i in 3..20 {
            *queue.append() = i;
        }
        assert!(queue.capacity() >= 18);
        assert_eq!(queue.indices(), 2..20);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), (2..20).collect::<Vec<_>>());
        for i in queue.indices() {
            assert_eq!(queue[i], i);
        }

        let mut expected = 2;
        while let Some(&head) = queue.peek_head() {
            assert_eq!(head, expected);
            queue.pop_head();
            expected += 1;
        }
        assert_eq!(expected, 20);
        assert!(queue.is_empty());
    }

    #[test]
    fn iter_mut_visits_wrapped_range_in_order() {
        let mut queue = RingQueue::<usize>::with_capacity(4);
        for i in 0..4 {
            *queue.append() = i;
        }
        queue.pop_head();
        queue.pop_head();
        *queue.append() = 4;
        *queue.append() = 5;
        assert_eq!(queue.capacity(), 4);

        for item in queue.iter_mut() {
            *item *= 10;
        }
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![20, 30, 40, 50]);
    }

    #[test]
    fn pop_on_empty_is_noop() {
        let mut queue = RingQueue::<u8>::default();
        queue.pop_head();
        assert!(queue.peek_head().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    #[should_panic]
    fn indexing_a_retired_item_panics() {
        let mut queue = RingQueue::<u8>::default();
        queue.append();
        queue.pop_head();
        let _ = queue[0];
    }
}
