//! "Write latest, read latest" handoff between one producer and one consumer.
//!
//! Three slots rotate between three roles: the slot the producer is filling,
//! the most recently published slot, and the slot the consumer has locked.
//! The producer never touches the locked slot and the consumer never touches
//! the slot being filled, so neither side waits on the other. The index lock
//! is held only while the three indices are read or rotated.

use parking_lot::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug)]
struct Indices {
    write: usize,
    published: usize,
    locked: usize,
    fresh: bool,
}

/// Triple-buffered value with atomic publication.
///
/// Intended for a single writer thread and a single reader thread. Both sides
/// take `&self`, so the buffer can live inside an `Arc`.
#[derive(Debug)]
pub struct TripleBuffer<T> {
    slots: [Mutex<T>; 3],
    indices: Mutex<Indices>,
}

impl<T: Clone> TripleBuffer<T> {
    /// All three slots start out as copies of `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            slots: [
                Mutex::new(initial.clone()),
                Mutex::new(initial.clone()),
                Mutex::new(initial),
            ],
            indices: Mutex::new(Indices {
                write: 1,
                published: 0,
                locked: 0,
                fresh: false,
            }),
        }
    }

    /// Copy of the value the reader currently has locked.
    pub fn locked_value(&self) -> T {
        self.locked().clone()
    }
}

impl<T: Clone + Default> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TripleBuffer<T> {
    /// Access the slot the writer is currently filling.
    ///
    /// Changes become visible to the reader only after [`publish`](Self::publish).
    pub fn next_slot(&self) -> MutexGuard<'_, T> {
        let write = self.indices.lock().write;
        self.slots[write].lock()
    }

    /// Publish the slot filled through [`next_slot`](Self::next_slot) and
    /// rotate to a fresh write slot.
    pub fn publish(&self) {
        let mut idx = self.indices.lock();
        idx.published = idx.write;
        idx.fresh = true;
        let (published, locked) = (idx.published, idx.locked);
        idx.write = (0..3)
            .find(|&i| i != published && i != locked)
            .unwrap_or((published + 1) % 3);
    }

    /// Overwrite the write slot with `value` and publish it.
    pub fn write(&self, value: T) {
        *self.next_slot() = value;
        self.publish();
    }

    /// Lock the most recently published value for reading.
    ///
    /// Returns `true` if a value newer than the previously locked one was
    /// locked.
    pub fn lock_new_value(&self) -> bool {
        let mut idx = self.indices.lock();
        if !idx.fresh {
            return false;
        }
        idx.locked = idx.published;
        idx.fresh = false;
        true
    }

    /// Whether a value was published since the last [`lock_new_value`](Self::lock_new_value).
    pub fn has_new_value(&self) -> bool {
        self.indices.lock().fresh
    }

    /// Borrow the locked value.
    pub fn locked(&self) -> MutexGuard<'_, T> {
        let locked = self.indices.lock().locked;
        self.slots[locked].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reader_sees_latest_published_value() {
        let buf = TripleBuffer::new(0u32);
        assert!(!buf.lock_new_value());
        assert_eq!(buf.locked_value(), 0);

        buf.write(1);
        buf.write(2);
        assert!(buf.has_new_value());
        assert!(buf.lock_new_value());
        assert_eq!(buf.locked_value(), 2);
        assert!(!buf.lock_new_value());
    }

    #[test]
    fn unpublished_writes_stay_hidden() {
        let buf = TripleBuffer::new(String::from("a"));
        buf.write("b".to_string());
        assert!(buf.lock_new_value());

        buf.next_slot().push_str("partial");
        assert!(!buf.lock_new_value());
        assert_eq!(*buf.locked(), "b");

        buf.publish();
        assert!(buf.lock_new_value());
        assert!(buf.locked().ends_with("partial"));
    }

    #[test]
    fn writer_never_targets_locked_slot() {
        let buf = TripleBuffer::new(0usize);
        for round in 1..50usize {
            buf.write(round);
            if round % 3 == 0 {
                buf.lock_new_value();
            }
            let idx = *buf.indices.lock();
            assert_ne!(idx.write, idx.locked);
            assert_ne!(idx.write, idx.published);
        }
    }

    #[test]
    fn concurrent_reader_observes_monotonic_values() {
        let buf = Arc::new(TripleBuffer::new(vec![0u64; 16]));
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 1..=2000u64 {
                    buf.write(vec![i; 16]);
                }
            })
        };

        let mut last = 0u64;
        while last < 2000 {
            if buf.lock_new_value() {
                let v = buf.locked_value();
                // a torn write would show mixed values
                assert!(v.iter().all(|&x| x == v[0]));
                assert!(v[0] >= last);
                last = v[0];
            }
        }
        writer.join().expect("writer thread");
    }
}
