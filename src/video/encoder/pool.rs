//! Raw-input buffer pool
//!
//! Tracks which raw-input buffer indices are owned by software. The
//! submitting thread takes an index before filling a buffer; the dequeue
//! worker gives it back once the device releases the buffer. The pool can
//! be poisoned so a blocked submitter wakes up when the session fails.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

use crate::error::{EncoderError, Result};

struct PoolState {
    free: VecDeque<u32>,
    poisoned: Option<String>,
}

/// Blocking pool of free raw-input buffer indices
pub struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: u32,
}

impl BufferPool {
    /// Create a pool with every index in `0..capacity` free
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: (0..capacity).collect(),
                poisoned: None,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of indices currently owned by software
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Take a free index, blocking until one is returned
    pub fn acquire(&self) -> Result<u32> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.poisoned {
                return Err(EncoderError::SessionFailed(reason.clone()));
            }
            if let Some(index) = state.free.pop_front() {
                return Ok(index);
            }
            self.available.wait(&mut state);
        }
    }

    /// Return an index to the pool
    pub fn release(&self, index: u32) -> Result<()> {
        if index >= self.capacity {
            return Err(EncoderError::device(
                "dqbuf",
                format!("raw-input index {} out of range", index),
            ));
        }
        let mut state = self.state.lock();
        if state.free.contains(&index) {
            return Err(EncoderError::device(
                "dqbuf",
                format!("raw-input index {} released twice", index),
            ));
        }
        state.free.push_back(index);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Wait until the device has released every buffer, then hand them all
    /// back. Used to flush in-flight frames before stopping the device.
    pub fn drain(&self) -> Result<()> {
        let mut taken = Vec::with_capacity(self.capacity as usize);
        for _ in 0..self.capacity {
            taken.push(self.acquire()?);
        }
        let mut state = self.state.lock();
        state.free.extend(taken);
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Fail every current and future `acquire`
    pub fn poison(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.poisoned.is_none() {
            state.poisoned = Some(reason.into());
        }
        drop(state);
        self.available.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_in_order() {
        let pool = BufferPool::new(3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.acquire().unwrap(), 0);
        assert_eq!(pool.acquire().unwrap(), 1);
        pool.release(0).unwrap();
        assert_eq!(pool.acquire().unwrap(), 2);
        assert_eq!(pool.acquire().unwrap(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_rejects_bad_index() {
        let pool = BufferPool::new(2);
        assert!(pool.release(5).is_err());
        // Index 1 is still free
        assert!(pool.release(1).is_err());
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(1));
        let index = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(index).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), index);
    }

    #[test]
    fn test_poison_wakes_waiters() {
        let pool = Arc::new(BufferPool::new(1));
        pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        pool.poison("device lost");

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, EncoderError::SessionFailed(_)));
        assert!(pool.is_poisoned());
    }

    #[test]
    fn test_drain_waits_for_all() {
        let pool = Arc::new(BufferPool::new(2));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();

        let releaser = {
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.release(a).unwrap();
                pool.release(b).unwrap();
            })
        };
        pool.drain().unwrap();
        releaser.join().unwrap();
        assert_eq!(pool.available(), 2);
    }
}
