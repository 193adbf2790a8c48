//! Payload accumulation across fragmented frames.

use bytes::{BufMut, Bytes, BytesMut};

/// An ordered list of independently owned payload blocks.
///
/// Each continuation frame appends one block; nothing already received is
/// copied again until the message completes. Dropping the chain releases
/// every block, which covers all early-exit paths of a decode.
#[derive(Debug, Default)]
pub struct PayloadChain {
    segments: Vec<Bytes>,
    len: usize,
}

impl PayloadChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one owned block to the chain.
    pub fn push(&mut self, block: Bytes) {
        self.len += block.len();
        self.segments.push(block);
    }

    /// Cumulative length of all blocks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Materializes the chain as one contiguous value, consuming it.
    ///
    /// A single-block chain is handed back without copying.
    pub fn into_bytes(mut self) -> Bytes {
        if self.segments.len() == 1 {
            return self.segments.remove(0);
        }
        let mut buf = BytesMut::with_capacity(self.len);
        for segment in &self.segments {
            buf.put_slice(segment);
        }
        buf.freeze()
    }
}
