//! Block-reception bitmap.
//!
//! One bit per firmware block of the file being received. Storage is sized
//! once, at agent initialization, for the configured maximum block count; the
//! logical length is fixed per transfer by [`BlockBitmap::init`].

use crate::error::UpdateAgentError;

/// Outcome of marking a block as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First time this block was seen; the received count grew by one.
    First,
    /// The block was already marked; nothing changed.
    Duplicate,
}

/// Tracks which blocks of the current file have been received.
#[derive(Debug, Clone)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    capacity: u32,
    block_count: u32,
    received: u32,
}

impl BlockBitmap {
    /// Allocate storage for up to `capacity` blocks.
    #[must_use]
    pub fn with_capacity(capacity: u32) -> Self {
        let bytes = (capacity as usize).div_ceil(8);
        Self {
            bits: vec![0; bytes],
            capacity,
            block_count: 0,
            received: 0,
        }
    }

    /// Fix the logical length for a new transfer and clear all marks.
    ///
    /// # Errors
    ///
    /// Fails if `block_count` is zero or exceeds the storage capacity.
    pub fn init(&mut self, block_count: u32) -> Result<(), UpdateAgentError> {
        if block_count == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "bitmap block count must be at least 1".to_string(),
            ));
        }
        if block_count > self.capacity {
            return Err(UpdateAgentError::BitmapCapacityExceeded {
                requested: block_count,
                capacity: self.capacity,
            });
        }
        self.bits.fill(0);
        self.block_count = block_count;
        self.received = 0;
        Ok(())
    }

    /// Forget the current transfer. `is_complete` reads false afterwards.
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.block_count = 0;
        self.received = 0;
    }

    /// Mark `index` as received.
    ///
    /// The first mark of an index increments the received count; marking it
    /// again reports [`MarkOutcome::Duplicate`] and changes nothing.
    ///
    /// # Errors
    ///
    /// An index at or past the logical length is a protocol violation and is
    /// rejected, not ignored.
    pub fn mark_received(&mut self, index: u32) -> Result<MarkOutcome, UpdateAgentError> {
        if index >= self.block_count {
            return Err(UpdateAgentError::BlockOutOfRange {
                index,
                block_count: self.block_count,
            });
        }
        if self.is_set(index) {
            return Ok(MarkOutcome::Duplicate);
        }
        if let Some(byte) = self.bits.get_mut(index as usize / 8) {
            *byte |= 1 << (index % 8);
        }
        self.received = self.received.saturating_add(1);
        Ok(MarkOutcome::First)
    }

    /// Whether every block of the transfer has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.block_count > 0 && self.received == self.block_count
    }

    /// Up to `max_count` indices not yet received, in ascending order.
    pub fn next_missing(&self, max_count: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.block_count)
            .filter(move |index| !self.is_set(*index))
            .take(max_count)
    }

    /// Logical length of the current transfer, in blocks.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Blocks received so far.
    #[must_use]
    pub fn received_count(&self) -> u32 {
        self.received
    }

    /// Storage capacity in blocks.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn is_set(&self, index: u32) -> bool {
        self.bits
            .get(index as usize / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_over_capacity() {
        let mut bitmap = BlockBitmap::with_capacity(16);
        assert!(matches!(
            bitmap.init(17),
            Err(UpdateAgentError::BitmapCapacityExceeded {
                requested: 17,
                capacity: 16
            })
        ));
        assert!(bitmap.init(16).is_ok());
    }

    #[test]
    fn test_init_rejects_zero_blocks() {
        let mut bitmap = BlockBitmap::with_capacity(16);
        assert!(bitmap.init(0).is_err());
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut bitmap = BlockBitmap::with_capacity(8);
        bitmap.init(4).expect("init");

        assert_eq!(bitmap.mark_received(2).expect("mark"), MarkOutcome::First);
        assert_eq!(bitmap.received_count(), 1);
        assert_eq!(bitmap.mark_received(2).expect("mark"), MarkOutcome::Duplicate);
        assert_eq!(bitmap.received_count(), 1);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let mut bitmap = BlockBitmap::with_capacity(8);
        bitmap.init(4).expect("init");
        assert!(matches!(
            bitmap.mark_received(4),
            Err(UpdateAgentError::BlockOutOfRange {
                index: 4,
                block_count: 4
            })
        ));
    }

    #[test]
    fn test_completion_for_four_blocks() {
        // blockSize 256, fileSize 1000 => 4 blocks, last one short.
        let mut bitmap = BlockBitmap::with_capacity(64);
        bitmap.init(4).expect("init");

        for index in [3, 0, 2] {
            bitmap.mark_received(index).expect("mark");
            assert!(!bitmap.is_complete());
        }
        bitmap.mark_received(1).expect("mark");
        assert!(bitmap.is_complete());

        // Completeness holds until the context is discarded.
        assert_eq!(bitmap.mark_received(1).expect("mark"), MarkOutcome::Duplicate);
        assert!(bitmap.is_complete());
        bitmap.reset();
        assert!(!bitmap.is_complete());
    }

    #[test]
    fn test_next_missing_is_ascending_and_bounded() {
        let mut bitmap = BlockBitmap::with_capacity(16);
        bitmap.init(10).expect("init");
        for index in [1, 3, 5] {
            bitmap.mark_received(index).expect("mark");
        }

        let missing: Vec<u32> = bitmap.next_missing(4).collect();
        assert_eq!(missing, vec![0, 2, 4, 6]);

        let all_missing: Vec<u32> = bitmap.next_missing(usize::MAX).collect();
        assert_eq!(all_missing, vec![0, 2, 4, 6, 7, 8, 9]);
    }

    #[test]
    fn test_next_missing_empty_when_complete() {
        let mut bitmap = BlockBitmap::with_capacity(4);
        bitmap.init(2).expect("init");
        bitmap.mark_received(0).expect("mark");
        bitmap.mark_received(1).expect("mark");
        assert_eq!(bitmap.next_missing(8).count(), 0);
    }
}
