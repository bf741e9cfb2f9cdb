//! Bounded FIFO of downlinks queued while the broker is unreachable
//!
//! Overflow policy is "reject newest": a full buffer refuses the incoming
//! frame and never evicts what is already queued.

use bytes::Bytes;
use std::collections::VecDeque;

/// Frames buffered while offline before new ones are rejected
pub const OUTBOUND_BUFFER_CAPACITY: usize = 100;

/// A publish waiting for the connection to come back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct OutboundBuffer {
    frames: VecDeque<OutboundFrame>,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame; a full buffer hands it back untouched
    pub fn push(&mut self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        if self.frames.len() >= self.capacity {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<OutboundFrame> {
        self.frames.pop_front()
    }

    /// Put a frame that failed to send back at the head
    pub fn push_front(&mut self, frame: OutboundFrame) {
        self.frames.push_front(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for OutboundBuffer {
    fn default() -> Self {
        Self::new(OUTBOUND_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> OutboundFrame {
        OutboundFrame {
            topic: "app/devices/#".to_string(),
            payload: Bytes::from(n.to_string()),
        }
    }

    #[test]
    fn test_rejects_newest_when_full() {
        let mut buffer = OutboundBuffer::default();
        for n in 0..OUTBOUND_BUFFER_CAPACITY {
            assert!(buffer.push(frame(n)).is_ok());
        }
        assert_eq!(buffer.len(), 100);

        let rejected = buffer.push(frame(100)).unwrap_err();
        assert_eq!(rejected, frame(100));
        assert_eq!(buffer.len(), 100);

        // Oldest frame is still at the head
        assert_eq!(buffer.pop_front(), Some(frame(0)));
    }

    #[test]
    fn test_fifo_order() {
        let mut buffer = OutboundBuffer::new(3);
        buffer.push(frame(1)).unwrap();
        buffer.push(frame(2)).unwrap();
        buffer.push(frame(3)).unwrap();

        assert_eq!(buffer.pop_front(), Some(frame(1)));
        buffer.push_front(frame(1));
        assert_eq!(buffer.pop_front(), Some(frame(1)));
        assert_eq!(buffer.pop_front(), Some(frame(2)));
        assert_eq!(buffer.pop_front(), Some(frame(3)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = OutboundBuffer::new(2);
        buffer.push(frame(1)).unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);
    }
}
