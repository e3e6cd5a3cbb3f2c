//! Bounded lock-free ring buffers (Vyukov-style).
//!
//! Both queues share the same cell/sequence algorithm: each cell carries a
//! sequence counter that tells producers and consumers whose turn the cell
//! is. Capacity is a compile-time power of two. `try_write` fails on full
//! and `try_read` fails on empty; neither end ever blocks or spins on a
//! contended cell.
//!
//! Sequences are stored *relative to the cell index* (stored = actual - idx,
//! wrapping). The all-zero state therefore decodes to `seq[i] == i`, which
//! is exactly the empty-queue state — so a zeroed mapping or a zero-filled
//! `static` is a valid empty queue with no initialization pass.
//!
//! [`BoundedMpmcQueue`] is atomic at both ends (global caches, per-arena
//! 1-span caches). [`BoundedMpscQueue`] has atomic producers but a plain
//! (non-atomic) consumer cursor; the single consumer is the arena owner
//! under its writer lock (per-arena large caches).

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

struct QueueCell<T> {
    seq: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer multi-consumer queue.
///
/// `N` must be a power of two.
#[repr(C)]
pub struct BoundedMpmcQueue<T, const N: usize> {
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    cells: [QueueCell<T>; N],
}

unsafe impl<T: Send, const N: usize> Send for BoundedMpmcQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedMpmcQueue<T, N> {}

impl<T, const N: usize> Default for BoundedMpmcQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BoundedMpmcQueue<T, N> {
    pub const fn new() -> Self {
        const { assert!(N.is_power_of_two() && N > 1) };
        Self {
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            cells: [const {
                QueueCell {
                    seq: AtomicUsize::new(0),
                    data: UnsafeCell::new(MaybeUninit::uninit()),
                }
            }; N],
        }
    }

    /// Enqueue a value. Safe from any thread. Returns false when full; the
    /// caller keeps ownership of `value` in that case.
    pub fn try_write(&self, value: T) -> bool
    where
        T: Copy,
    {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let idx = pos & (N - 1);
            let cell = &self.cells[idx];
            let seq = cell.seq.load(Ordering::Acquire).wrapping_add(idx);
            if seq == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*cell.data.get()).write(value) };
                        // Publish: consumers acquire-load the sequence.
                        cell.seq
                            .store(pos.wrapping_add(1).wrapping_sub(idx), Ordering::Release);
                        return true;
                    }
                    Err(cur) => pos = cur,
                }
            } else if (seq.wrapping_sub(pos) as isize) < 0 {
                // Cell still holds the previous lap's value: full.
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue a value, or `None` when empty.
    pub fn try_read(&self) -> Option<T>
    where
        T: Copy,
    {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let idx = pos & (N - 1);
            let cell = &self.cells[idx];
            let seq = cell.seq.load(Ordering::Acquire).wrapping_add(idx);
            let expected = pos.wrapping_add(1);
            if seq == expected {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.data.get()).assume_init_read() };
                        // Hand the cell to the producer lap N positions later.
                        cell.seq
                            .store(pos.wrapping_add(N).wrapping_sub(idx), Ordering::Release);
                        return Some(value);
                    }
                    Err(cur) => pos = cur,
                }
            } else if (seq.wrapping_sub(expected) as isize) < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

/// A bounded multi-producer single-consumer queue.
///
/// Producers are fully atomic; the consumer cursor is a plain cell. `N` must
/// be a power of two.
#[repr(C)]
pub struct BoundedMpscQueue<T, const N: usize> {
    enqueue_pos: AtomicUsize,
    dequeue_pos: UnsafeCell<usize>,
    cells: [QueueCell<T>; N],
}

unsafe impl<T: Send, const N: usize> Send for BoundedMpscQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedMpscQueue<T, N> {}

impl<T, const N: usize> Default for BoundedMpscQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BoundedMpscQueue<T, N> {
    pub const fn new() -> Self {
        const { assert!(N.is_power_of_two() && N > 1) };
        Self {
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: UnsafeCell::new(0),
            cells: [const {
                QueueCell {
                    seq: AtomicUsize::new(0),
                    data: UnsafeCell::new(MaybeUninit::uninit()),
                }
            }; N],
        }
    }

    /// Enqueue a value. Safe from any thread. Returns false when full.
    pub fn try_write(&self, value: T) -> bool
    where
        T: Copy,
    {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let idx = pos & (N - 1);
            let cell = &self.cells[idx];
            let seq = cell.seq.load(Ordering::Acquire).wrapping_add(idx);
            if seq == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*cell.data.get()).write(value) };
                        cell.seq
                            .store(pos.wrapping_add(1).wrapping_sub(idx), Ordering::Release);
                        return true;
                    }
                    Err(cur) => pos = cur,
                }
            } else if (seq.wrapping_sub(pos) as isize) < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue a value, or `None` when empty.
    ///
    /// # Safety
    ///
    /// Single consumer: the caller must hold whatever exclusion protects
    /// this queue's consumer end (the owning arena's writer lock). Two
    /// concurrent `try_read` calls are a data race on the cursor.
    pub unsafe fn try_read(&self) -> Option<T>
    where
        T: Copy,
    {
        let pos = unsafe { *self.dequeue_pos.get() };
        let idx = pos & (N - 1);
        let cell = &self.cells[idx];
        let seq = cell.seq.load(Ordering::Acquire).wrapping_add(idx);
        if seq != pos.wrapping_add(1) {
            // Empty, or a producer claimed the cell but hasn't published yet.
            return None;
        }
        unsafe { *self.dequeue_pos.get() = pos.wrapping_add(1) };
        let value = unsafe { (*cell.data.get()).assume_init_read() };
        cell.seq
            .store(pos.wrapping_add(N).wrapping_sub(idx), Ordering::Release);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn mpmc_fill_and_drain() {
        let q: BoundedMpmcQueue<usize, 8> = BoundedMpmcQueue::new();
        for i in 0..8 {
            assert!(q.try_write(i));
        }
        assert!(!q.try_write(99), "queue should be full");
        for i in 0..8 {
            assert_eq!(q.try_read(), Some(i));
        }
        assert_eq!(q.try_read(), None);
    }

    #[test]
    fn mpmc_wraps_many_laps() {
        let q: BoundedMpmcQueue<usize, 4> = BoundedMpmcQueue::new();
        for lap in 0..1000 {
            assert!(q.try_write(lap));
            assert_eq!(q.try_read(), Some(lap));
        }
        assert_eq!(q.try_read(), None);
    }

    #[test]
    fn mpmc_zeroed_is_valid_empty() {
        // The arena relies on zeroed backing memory decoding as an empty
        // queue; mirror that here through MaybeUninit::zeroed.
        let q: BoundedMpmcQueue<usize, 8> =
            unsafe { MaybeUninit::<BoundedMpmcQueue<usize, 8>>::zeroed().assume_init() };
        assert_eq!(q.try_read(), None);
        assert!(q.try_write(7));
        assert_eq!(q.try_read(), Some(7));
    }

    #[test]
    fn mpmc_concurrent_conservation() {
        let q: Arc<BoundedMpmcQueue<usize, 64>> = Arc::new(BoundedMpmcQueue::new());
        let producers = 4;
        let per_producer = 10_000;

        let mut handles = Vec::new();
        for p in 0..producers {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    let v = p * per_producer + i;
                    while !q.try_write(v) {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..producers {
            let q = Arc::clone(&q);
            consumers.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while got.len() < per_producer {
                    if let Some(v) = q.try_read() {
                        got.push(v);
                    } else {
                        std::thread::yield_now();
                    }
                }
                got
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {v} dequeued twice");
            }
        }
        assert_eq!(all.len(), producers * per_producer);
    }

    #[test]
    fn mpsc_fill_and_drain() {
        let q: BoundedMpscQueue<usize, 8> = BoundedMpscQueue::new();
        for i in 0..8 {
            assert!(q.try_write(i));
        }
        assert!(!q.try_write(99));
        unsafe {
            for i in 0..8 {
                assert_eq!(q.try_read(), Some(i));
            }
            assert_eq!(q.try_read(), None);
        }
    }

    #[test]
    fn mpsc_all_enqueued_dequeued_exactly_once() {
        // Many producers, one consumer: no loss, no duplication.
        let q: Arc<BoundedMpscQueue<usize, 32>> = Arc::new(BoundedMpscQueue::new());
        let producers = 8;
        let per_producer = 5_000;

        let mut handles = Vec::new();
        for p in 0..producers {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    let v = p * per_producer + i;
                    while !q.try_write(v) {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut seen = HashSet::new();
        while seen.len() < producers * per_producer {
            // SAFETY: this is the only consumer thread.
            if let Some(v) = unsafe { q.try_read() } {
                assert!(seen.insert(v), "value {v} dequeued twice");
            } else {
                std::thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { q.try_read() }, None);
    }
}
