//! Per-room bounded ordering queue.
//!
//! A multi-producer, single-consumer ring buffer. Producers (connection
//! tasks) claim a slot by CAS on the write cursor and never block: a full
//! ring fails fast with [`QueueFull`], handing the operation back so the
//! caller can surface backpressure to the offending client. The read cursor
//! is owned by the room's single consumer task, which drains in strict FIFO
//! order; sequence numbers are assigned there, at dequeue time, so dequeue
//! order is the room's one authoritative order.
//!
//! Each slot carries a stamp that encodes which lap of the ring it belongs
//! to, so producers can distinguish "free", "occupied" and "not yet
//! released" without touching the consumer's cursor.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returned by [`OrderingQueue::push`] when the ring is full. Carries the
/// rejected value back to the producer.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct OrderingQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl<T: Send> Send for OrderingQueue<T> {}
unsafe impl<T: Send> Sync for OrderingQueue<T> {}

impl<T> OrderingQueue<T> {
    /// Capacity is rounded up to the next power of two, minimum 2.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of queued items; exact when no producer is
    /// mid-push.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue from any producer task. Lock-free; never blocks.
    pub fn push(&self, value: T) -> Result<(), QueueFull<T>> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp as isize - pos as isize;
            if lag == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                // The slot one lap ahead is still occupied.
                return Err(QueueFull(value));
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue in FIFO order. Must only be called from the single consumer
    /// that owns the read cursor.
    pub fn pop(&self) -> Option<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let stamp = slot.stamp.load(Ordering::Acquire);
        let lag = stamp as isize - pos.wrapping_add(1) as isize;
        if lag == 0 {
            self.dequeue_pos.store(pos.wrapping_add(1), Ordering::Relaxed);
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            // Free the slot for the producer one lap ahead.
            slot.stamp
                .store(pos.wrapping_add(self.slots.len()), Ordering::Release);
            Some(value)
        } else {
            None
        }
    }
}

impl<T> Drop for OrderingQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drains_in_fifo_order() {
        let queue = OrderingQueue::with_capacity(8);
        for i in 0..5 {
            queue.push(i).expect("queue has room");
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        assert_eq!(OrderingQueue::<u8>::with_capacity(0).capacity(), 2);
        assert_eq!(OrderingQueue::<u8>::with_capacity(4).capacity(), 4);
        assert_eq!(OrderingQueue::<u8>::with_capacity(5).capacity(), 8);
    }

    #[test]
    fn full_ring_fails_fast_and_returns_the_value() {
        let queue = OrderingQueue::with_capacity(4);
        assert_eq!(queue.capacity(), 4);
        for i in 0..4 {
            queue.push(i).expect("queue has room");
        }
        assert_eq!(queue.push(99), Err(QueueFull(99)));
        // Dequeuing one slot makes room again.
        assert_eq!(queue.pop(), Some(0));
        assert!(queue.push(99).is_ok());
    }

    #[test]
    fn wraps_across_many_laps() {
        let queue = OrderingQueue::with_capacity(2);
        for i in 0..1000 {
            queue.push(i).expect("queue has room");
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let queue = Arc::new(OrderingQueue::with_capacity(64));
        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = (producer, i);
                    loop {
                        match queue.push(item) {
                            Ok(()) => break,
                            Err(QueueFull(v)) => {
                                item = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut seen = vec![Vec::new(); PRODUCERS];
        let mut drained = 0;
        while drained < PRODUCERS * PER_PRODUCER {
            match queue.pop() {
                Some((producer, i)) => {
                    seen[producer].push(i);
                    drained += 1;
                }
                None => thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().expect("producer must not panic");
        }

        for items in &seen {
            assert_eq!(items.len(), PER_PRODUCER);
            assert!(items.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(queue.pop(), None);
    }
}
