//! Bounded byte ring buffer between the poll firing and the consumer.
//!
//! The poll firing is the single producer and pushes whole event records; the
//! consumer pops bytes. A push either writes the complete record or nothing, and it
//! never waits for space: a record that does not fit is rejected with
//! [`TdcError::Overflow`] so the caller can account for the loss.
//!
//! # Layout
//! ```text
//! [ data region of `capacity` bytes ]
//!
//!   out_pos: next byte to read      (advanced by the consumer)
//!   in_pos:  next byte to write     (advanced by the producer)
//!
//!   in use   = (capacity - out_pos + in_pos) % capacity
//!   free     = capacity - 1 - in use
//! ```
//!
//! One byte is always left unused so that `in_pos == out_pos` means empty and never
//! full.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, TdcError};

struct RingState {
    data: Box<[u8]>,
    in_pos: usize,
    out_pos: usize,
}

impl RingState {
    fn used(&self) -> usize {
        let capacity = self.data.len();
        (capacity - self.out_pos + self.in_pos) % capacity
    }

    fn free(&self) -> usize {
        self.data.len() - 1 - self.used()
    }
}

/// Fixed-capacity single-producer / single-consumer byte FIFO.
pub struct EventRingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

impl std::fmt::Debug for EventRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available_bytes())
            .finish()
    }
}

impl EventRingBuffer {
    /// Create a ring buffer of `capacity` bytes, of which `capacity - 1` are usable.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(TdcError::invalid(format!(
                "ring buffer capacity must be at least 2 bytes, got {}",
                capacity
            )));
        }
        Ok(Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                in_pos: 0,
                out_pos: 0,
            }),
            capacity,
        })
    }

    /// Total size of the data region in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a complete record.
    ///
    /// Fails with `Busy` if the buffer lock is not obtained within `lock_timeout`, and
    /// with `Overflow` if the record does not fit. In both cases nothing is written.
    pub fn push_record(&self, record: &[u8], lock_timeout: Duration) -> Result<()> {
        let Some(mut state) = self.state.try_lock_for(lock_timeout) else {
            return Err(TdcError::busy("event buffer is locked by the reader"));
        };

        let free = state.free();
        if record.len() > free {
            return Err(TdcError::Overflow {
                needed: record.len(),
                free,
            });
        }

        let capacity = self.capacity;
        let start = state.in_pos;
        // Split the copy when the record wraps past the end of the region
        let first = record.len().min(capacity - start);
        state.data[start..start + first].copy_from_slice(&record[..first]);
        let second = record.len() - first;
        state.data[..second].copy_from_slice(&record[first..]);

        state.in_pos = (start + record.len()) % capacity;
        Ok(())
    }

    /// Remove and return the oldest byte.
    pub fn pop_byte(&self) -> Result<u8> {
        let mut state = self.state.lock();
        if state.in_pos == state.out_pos {
            return Err(TdcError::Empty);
        }
        let byte = state.data[state.out_pos];
        state.out_pos = (state.out_pos + 1) % self.capacity;
        Ok(byte)
    }

    /// Move up to `buf.len()` bytes into `buf`; returns how many were copied.
    pub fn read_into(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let count = buf.len().min(state.used());
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity;
        let start = state.out_pos;
        let first = count.min(capacity - start);
        buf[..first].copy_from_slice(&state.data[start..start + first]);
        let second = count - first;
        buf[first..count].copy_from_slice(&state.data[..second]);

        state.out_pos = (start + count) % capacity;
        count
    }

    /// Bytes waiting to be read.
    pub fn available_bytes(&self) -> usize {
        self.state.lock().used()
    }

    /// Bytes that can still be written.
    pub fn free_bytes(&self) -> usize {
        self.state.lock().free()
    }

    /// Whether there is nothing to read.
    pub fn is_empty(&self) -> bool {
        self.available_bytes() == 0
    }

    /// Discard all contents.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.in_pos = 0;
        state.out_pos = 0;
    }
}
