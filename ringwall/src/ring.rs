//! Bounded multi-producer/multi-consumer ring of packet buffers.

use crossbeam_queue::ArrayQueue;
use std::fmt;

use crate::error::{Error, Result};
use crate::mbuf::Mbuf;

pub struct RingQueue {
    name: String,
    queue: ArrayQueue<Mbuf>,
}

impl RingQueue {
    /// Create a ring. The capacity must be a non-zero power of two.
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::Resource(format!(
                "ring {} capacity {} is not a power of two",
                name, capacity
            )));
        }
        tracing::debug!(ring = %name, capacity, "ring created");
        Ok(Self {
            name,
            queue: ArrayQueue::new(capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Non-blocking push; hands the buffer back when the ring is full.
    #[inline]
    pub fn push(&self, mbuf: Mbuf) -> std::result::Result<(), Mbuf> {
        self.queue.push(mbuf)
    }

    /// Push, spinning while the ring is full. `wait` runs after every failed
    /// attempt; returning `false` gives up and hands the buffer back.
    ///
    /// This is the only back-pressure in the dataplane: a ring that never
    /// drains stalls its producer until `wait` says stop.
    #[inline]
    pub fn push_spin(
        &self,
        mut mbuf: Mbuf,
        mut wait: impl FnMut() -> bool,
    ) -> std::result::Result<(), Mbuf> {
        loop {
            match self.queue.push(mbuf) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    if !wait() {
                        return Err(back);
                    }
                    mbuf = back;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Non-blocking pop.
    #[inline]
    pub fn pop(&self) -> Option<Mbuf> {
        self.queue.pop()
    }

    /// Pop up to `max` buffers into `out`. Returns how many were taken.
    #[inline]
    pub fn pop_burst(&self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.queue.pop() {
                Some(mbuf) => {
                    out.push(mbuf);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }
}

impl fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbuf::PacketPool;
    use std::sync::Arc;

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(RingQueue::new("r", 0).is_err());
        assert!(RingQueue::new("r", 1000).is_err());
        assert_eq!(RingQueue::new("r", 1024).unwrap().capacity(), 1024);
    }

    #[test]
    fn test_fifo_and_full() {
        let pool = PacketPool::new("test", 8, 16).unwrap();
        let ring = RingQueue::new("r", 2).unwrap();

        ring.push(pool.alloc_frame(&[1]).unwrap()).unwrap();
        ring.push(pool.alloc_frame(&[2]).unwrap()).unwrap();
        let rejected = ring.push(pool.alloc_frame(&[3]).unwrap()).unwrap_err();
        assert_eq!(rejected.data(), &[3]);

        assert_eq!(ring.pop().unwrap().data(), &[1]);
        assert_eq!(ring.pop().unwrap().data(), &[2]);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_pop_burst_respects_max() {
        let pool = PacketPool::new("test", 8, 16).unwrap();
        let ring = RingQueue::new("r", 8).unwrap();
        for i in 0..5u8 {
            ring.push(pool.alloc_frame(&[i]).unwrap()).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(ring.pop_burst(&mut out, 3), 3);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop_burst(&mut out, 32), 2);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_push_spin_waits_for_consumer() {
        let pool = PacketPool::new("test", 8, 16).unwrap();
        let ring = Arc::new(RingQueue::new("r", 1).unwrap());
        ring.push(pool.alloc().unwrap()).unwrap();

        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                ring.pop()
            })
        };

        let mut spins = 0u64;
        let pushed = ring.push_spin(pool.alloc().unwrap(), || {
            spins += 1;
            true
        });
        assert!(pushed.is_ok());
        assert!(spins > 0);
        assert!(consumer.join().unwrap().is_some());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_push_spin_gives_up_when_told() {
        let pool = PacketPool::new("test", 8, 16).unwrap();
        let ring = RingQueue::new("r", 1).unwrap();
        ring.push(pool.alloc_frame(&[1]).unwrap()).unwrap();

        let mut calls = 0;
        let back = ring
            .push_spin(pool.alloc_frame(&[2]).unwrap(), || {
                calls += 1;
                calls < 3
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(back.data(), &[2]);
        assert_eq!(ring.len(), 1);
    }
}
