//! Single-producer/single-consumer circular index buffer.
//!
//! The ring hands out slot indices; slot contents live elsewhere. One
//! producer calls [`CircularIndexBuffer::get_index_for_write`] then
//! [`commit_write`](CircularIndexBuffer::commit_write); one consumer calls
//! [`get_index_for_read`](CircularIndexBuffer::get_index_for_read) then
//! [`commit_read`](CircularIndexBuffer::commit_read). No locks on this path.

use std::sync::atomic::{AtomicU32, Ordering};

/// Default number of slots per disk ring.
pub const DEFAULT_RING_DEPTH: u32 = 512;

#[derive(Debug)]
#[must_use]
pub struct CircularIndexBuffer {
    size: u32,
    /// Next slot the consumer will read.
    start: AtomicU32,
    /// Next slot the producer will write.
    end: AtomicU32,
}

impl CircularIndexBuffer {
    pub fn new(size: u32) -> Self {
        assert!(size >= 2, "ring needs at least two slots");
        CircularIndexBuffer {
            size,
            start: AtomicU32::new(0),
            end: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start.load(Ordering::Acquire) == self.end.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        (end + 1) % self.size == start
    }

    /// Slot index the producer may fill, or `None` if the ring is full.
    #[must_use]
    pub fn get_index_for_write(&self) -> Option<u32> {
        let end = self.end.load(Ordering::Relaxed);
        let start = self.start.load(Ordering::Acquire);
        if (end + 1) % self.size == start {
            None
        } else {
            Some(end)
        }
    }

    /// Publish the slot returned by the last `get_index_for_write`.
    pub fn commit_write(&self) {
        let end = self.end.load(Ordering::Relaxed);
        self.end.store((end + 1) % self.size, Ordering::Release);
    }

    /// Slot index the consumer may drain, or `None` if the ring is empty.
    #[must_use]
    pub fn get_index_for_read(&self) -> Option<u32> {
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Acquire);
        if start == end {
            None
        } else {
            Some(start)
        }
    }

    /// Release the slot returned by the last `get_index_for_read`.
    pub fn commit_read(&self) {
        let start = self.start.load(Ordering::Relaxed);
        self.start.store((start + 1) % self.size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_then_full() {
        let cb = CircularIndexBuffer::new(4);
        assert!(cb.is_empty());
        assert!(!cb.is_full());
        assert!(cb.get_index_for_read().is_none());

        // capacity is size - 1
        for expected in 0..3 {
            let idx = cb.get_index_for_write().unwrap();
            assert_eq!(idx, expected);
            cb.commit_write();
        }
        assert!(cb.is_full());
        assert!(cb.get_index_for_write().is_none());
    }

    #[test]
    fn test_read_follows_write_order() {
        let cb = CircularIndexBuffer::new(4);
        for _ in 0..3 {
            cb.get_index_for_write().unwrap();
            cb.commit_write();
        }
        for expected in 0..3 {
            let idx = cb.get_index_for_read().unwrap();
            assert_eq!(idx, expected);
            cb.commit_read();
        }
        assert!(cb.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let cb = CircularIndexBuffer::new(3);
        for i in 0..10u32 {
            let w = cb.get_index_for_write().unwrap();
            assert_eq!(w, i % 3);
            cb.commit_write();
            let r = cb.get_index_for_read().unwrap();
            assert_eq!(r, i % 3);
            cb.commit_read();
        }
    }

    #[test]
    fn test_spsc_threads() {
        use std::sync::Arc;

        let cb = Arc::new(CircularIndexBuffer::new(8));
        let values = Arc::new(
            (0..8)
                .map(|_| std::sync::atomic::AtomicU32::new(0))
                .collect::<Vec<_>>(),
        );

        const COUNT: u32 = 10_000;
        let producer = {
            let cb = Arc::clone(&cb);
            let values = Arc::clone(&values);
            std::thread::spawn(move || {
                for i in 0..COUNT {
                    loop {
                        if let Some(idx) = cb.get_index_for_write() {
                            values[idx as usize].store(i, Ordering::Release);
                            cb.commit_write();
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut seen = Vec::with_capacity(COUNT as usize);
        while seen.len() < COUNT as usize {
            if let Some(idx) = cb.get_index_for_read() {
                seen.push(values[idx as usize].load(Ordering::Acquire));
                cb.commit_read();
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();

        let expected: Vec<u32> = (0..COUNT).collect();
        assert_eq!(seen, expected, "consumer must observe producer order");
    }
}
