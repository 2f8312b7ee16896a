//! Packet buffers and the fixed-capacity pool they come from.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;

use ringwall_common::PacketMeta;

use crate::error::{Error, Result};
use crate::resource::ResourceTable;

/// Pool of packet buffers.
///
/// Capacity is fixed at creation. Slot accounting goes through a
/// [`ResourceTable`]; storage of returned buffers is recycled through a
/// lock-free free list so the hot path stops allocating once warm.
pub struct PacketPool {
    name: String,
    slots: ResourceTable,
    recycled: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl PacketPool {
    pub fn new(name: &str, capacity: usize, buffer_size: usize) -> Result<Arc<Self>> {
        if capacity == 0 || buffer_size == 0 {
            return Err(Error::Resource(format!(
                "pool {} needs non-zero capacity and buffer size",
                name
            )));
        }

        tracing::info!(
            pool = name,
            buffer_count = capacity,
            buffer_size,
            "packet pool created"
        );

        Ok(Arc::new(Self {
            name: name.to_string(),
            slots: ResourceTable::new(capacity),
            recycled: ArrayQueue::new(capacity),
            buffer_size,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.slots.in_use()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take an empty buffer. Returns `None` when the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<Mbuf> {
        let slot = self.slots.alloc()?;
        let data = self
            .recycled
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        Some(Mbuf {
            slot,
            data,
            meta: PacketMeta::default(),
            pool: Arc::clone(self),
        })
    }

    /// Take a buffer holding a copy of `frame`. Frames larger than the
    /// buffer size are refused.
    #[cfg(test)]
    pub fn alloc_frame(self: &Arc<Self>, frame: &[u8]) -> Option<Mbuf> {
        if frame.len() > self.buffer_size {
            return None;
        }
        let mut mbuf = self.alloc()?;
        mbuf.data.extend_from_slice(frame);
        Some(mbuf)
    }

    fn release(&self, slot: usize, mut data: Vec<u8>) {
        data.clear();
        // A full free list only means the storage is dropped instead of reused.
        let _ = self.recycled.push(data);
        self.slots.dereference(slot);
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// One packet: frame bytes plus its metadata record.
///
/// Ownership is the packet: whoever holds the `Mbuf` may touch it, and
/// dropping it returns the buffer to its pool.
pub struct Mbuf {
    slot: usize,
    data: Vec<u8>,
    meta: PacketMeta,
    pool: Arc<PacketPool>,
}

impl Mbuf {
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Read a frame into the buffer. `read` sees the full buffer size and
    /// returns how many bytes it wrote; the frame is cut to that length.
    /// On error the buffer is left empty.
    #[inline]
    pub fn fill<E>(
        &mut self,
        read: impl FnOnce(&mut [u8]) -> std::result::Result<usize, E>,
    ) -> std::result::Result<usize, E> {
        self.data.resize(self.pool.buffer_size, 0);
        let result = read(&mut self.data);
        let len = match &result {
            Ok(n) => (*n).min(self.data.len()),
            Err(_) => 0,
        };
        self.data.truncate(len);
        result
    }

    #[inline]
    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    #[inline]
    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(self.slot, data);
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("slot", &self.slot)
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_returns_buffer() {
        let pool = PacketPool::new("test", 2, 64).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.alloc().unwrap();
        assert!(c.data().is_empty());
        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_alloc_frame_copies_and_resets_meta() {
        let pool = PacketPool::new("test", 1, 16).unwrap();
        let mut mbuf = pool.alloc_frame(&[1, 2, 3]).unwrap();
        assert_eq!(mbuf.data(), &[1, 2, 3]);
        mbuf.meta_mut().port_in = 9;
        drop(mbuf);

        let reused = pool.alloc().unwrap();
        assert!(reused.data().is_empty());
        assert_eq!(reused.meta().port_in, 0);
    }

    #[test]
    fn test_fill_cuts_to_read_length() {
        let pool = PacketPool::new("test", 1, 16).unwrap();
        let mut mbuf = pool.alloc().unwrap();

        let n = mbuf.fill(|buf| -> std::io::Result<usize> {
            assert_eq!(buf.len(), 16);
            buf[..3].copy_from_slice(&[7, 8, 9]);
            Ok(3)
        });
        assert_eq!(n.unwrap(), 3);
        assert_eq!(mbuf.data(), &[7, 8, 9]);

        let failed = mbuf.fill(|_| Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        assert!(failed.is_err());
        assert!(mbuf.data().is_empty());
    }

    #[test]
    fn test_oversized_frame_refused() {
        let pool = PacketPool::new("test", 1, 4).unwrap();
        assert!(pool.alloc_frame(&[0; 5]).is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_zero_capacity_is_resource_error() {
        assert!(matches!(
            PacketPool::new("test", 0, 64),
            Err(Error::Resource(_))
        ));
    }
}
