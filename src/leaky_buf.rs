//! A bounded free-list of fixed-size buffers for copy loops.
use std::sync::{Mutex, PoisonError};

/// Recycles byte buffers of one size.
///
/// [`get`] hands out a pooled buffer, or a fresh one when the pool is empty;
/// [`put`] returns it, dropping it if the pool already holds `depth`
/// buffers.
///
/// [`get`]: LeakyBuf::get
/// [`put`]: LeakyBuf::put
#[derive(Debug)]
pub struct LeakyBuf {
    buf_size: usize,
    depth: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl LeakyBuf {
    /// Creates an empty pool keeping at most `depth` buffers of `buf_size`
    /// bytes.
    pub fn new(depth: usize, buf_size: usize) -> Self {
        Self {
            buf_size,
            depth,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer of [`buf_size`] bytes.
    ///
    /// [`buf_size`]: LeakyBuf::buf_size
    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    /// Returns a buffer to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not [`buf_size`] bytes long.
    ///
    /// [`buf_size`]: LeakyBuf::buf_size
    pub fn put(&self, buf: Vec<u8>) {
        assert_eq!(
            buf.len(),
            self.buf_size,
            "invalid buffer size that's put into leaky buffer"
        );
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.depth {
            free.push(buf);
        }
    }

    /// The size of every buffer.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers waiting in the pool.
    pub fn len(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no buffer is waiting in the pool.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
