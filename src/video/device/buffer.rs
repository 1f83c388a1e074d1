//! Device-visible buffer arena
//!
//! Buffer memory is allocated by the device backend (heap memory for the
//! simulated device, mmap'd planes for V4L2) and only ever touched through
//! [`DeviceBuffer::write`] / [`DeviceBuffer::read`]. Raw addresses never
//! leave the backend.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::ops::DerefMut;
use std::sync::Arc;

/// Backing memory of one device buffer
pub type BufferMemory = Box<dyn DerefMut<Target = [u8]> + Send>;

/// Handle to one slot of a device buffer queue.
///
/// Cloning the handle does not copy memory. Which party may touch the memory
/// is decided by the index ownership protocol, so the lock is never contended
/// in a correct session.
#[derive(Clone)]
pub struct DeviceBuffer {
    index: u32,
    len: usize,
    memory: Arc<Mutex<BufferMemory>>,
}

impl DeviceBuffer {
    pub fn new(index: u32, memory: BufferMemory) -> Self {
        Self {
            index,
            len: (*memory).len(),
            memory: Arc::new(Mutex::new(memory)),
        }
    }

    /// Heap-backed buffer of `size` zeroed bytes
    pub fn heap(index: u32, size: usize) -> Self {
        Self::new(index, Box::new(vec![0u8; size].into_boxed_slice()))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` with mutable access to the buffer contents
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = self.memory.lock();
        let data: &mut [u8] = &mut memory;
        f(data)
    }

    /// Run `f` with shared access to the buffer contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let memory = self.memory.lock();
        let data: &[u8] = &memory;
        f(data)
    }

    /// Copy the first `len` bytes out of the buffer
    pub fn copy_out(&self, len: usize) -> Bytes {
        self.read(|data| Bytes::copy_from_slice(&data[..len.min(data.len())]))
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed set of buffers allocated on one device queue, addressed by index
#[derive(Debug, Clone)]
pub struct BufferArena {
    buffers: Arc<[DeviceBuffer]>,
}

impl BufferArena {
    pub fn new(buffers: Vec<DeviceBuffer>) -> Self {
        Self {
            buffers: buffers.into(),
        }
    }

    pub fn get(&self, index: u32) -> Option<&DeviceBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceBuffer> {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_copy_out() {
        let buffer = DeviceBuffer::heap(3, 8);
        assert_eq!(buffer.index(), 3);
        assert_eq!(buffer.len(), 8);

        buffer.write(|data| data[..3].copy_from_slice(&[1, 2, 3]));
        assert_eq!(&buffer.copy_out(3)[..], &[1, 2, 3]);
        // Clamped to the buffer size
        assert_eq!(buffer.copy_out(100).len(), 8);
    }

    #[test]
    fn test_clone_shares_memory() {
        let buffer = DeviceBuffer::heap(0, 4);
        let other = buffer.clone();
        other.write(|data| data[0] = 42);
        assert_eq!(buffer.read(|data| data[0]), 42);
    }

    #[test]
    fn test_arena_lookup() {
        let arena = BufferArena::new((0..4).map(|i| DeviceBuffer::heap(i, 16)).collect());
        assert_eq!(arena.len(), 4);
        assert_eq!(arena.get(2).map(|b| b.index()), Some(2));
        assert!(arena.get(4).is_none());
    }
}
