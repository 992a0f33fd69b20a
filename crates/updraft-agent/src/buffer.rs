//! Fixed-capacity owned buffers.
//!
//! Every string and byte field the agent copies out of a job document lands in
//! a buffer allocated once at initialization. A write that does not fit is a
//! [`CapacityError`], never a truncation and never a reallocation.

use std::fmt;

/// Error returned when a write would exceed a buffer's fixed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value of {needed} bytes exceeds buffer capacity of {capacity}")]
pub struct CapacityError {
    /// Bytes the rejected write required.
    pub needed: usize,
    /// Fixed capacity of the buffer.
    pub capacity: usize,
}

/// An owned string with a byte capacity fixed at construction.
#[derive(Debug, Clone)]
pub struct BoundedString {
    buf: String,
    capacity: usize,
}

impl BoundedString {
    /// Create an empty string that will never hold more than `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            capacity,
        }
    }

    /// Replace the contents with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `value` does not fit; the buffer is left
    /// empty in that case.
    pub fn set(&mut self, value: &str) -> Result<(), CapacityError> {
        self.buf.clear();
        if value.len() > self.capacity {
            return Err(CapacityError {
                needed: value.len(),
                capacity: self.capacity,
            });
        }
        self.buf.push_str(value);
        Ok(())
    }

    /// Replace the contents with formatted text.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the rendered text does not fit; the buffer
    /// is left empty in that case.
    pub fn set_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), CapacityError> {
        self.buf.clear();
        let needed = {
            let mut sink = CountingSink {
                buf: &mut self.buf,
                capacity: self.capacity,
                needed: 0,
            };
            if fmt::write(&mut sink, args).is_err() {
                sink.needed = sink.capacity.saturating_add(1);
            }
            sink.needed
        };
        if needed > self.capacity {
            self.buf.clear();
            return Err(CapacityError {
                needed,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Empty the buffer, keeping its capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Current contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fixed capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// `fmt::Write` sink that counts every byte but only stores what fits.
struct CountingSink<'a> {
    buf: &'a mut String,
    capacity: usize,
    needed: usize,
}

impl fmt::Write for CountingSink<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.needed = self.needed.saturating_add(s.len());
        if self.needed <= self.capacity {
            self.buf.push_str(s);
        }
        Ok(())
    }
}

/// An owned byte buffer with a capacity fixed at construction.
#[derive(Debug, Clone)]
pub struct BoundedBytes {
    buf: Vec<u8>,
    capacity: usize,
}

impl BoundedBytes {
    /// Create an empty buffer that will never hold more than `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Replace the contents with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `value` does not fit; the buffer is left
    /// empty in that case.
    pub fn set(&mut self, value: &[u8]) -> Result<(), CapacityError> {
        self.buf.clear();
        if value.len() > self.capacity {
            return Err(CapacityError {
                needed: value.len(),
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Empty the buffer, keeping its capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Current contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fixed capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
