//! Data transfer collaborator
//!
//! The session layer owns the wire. Engines call back into it to pull
//! Data-Out bytes and to push Data-In segments that span several buffers.

use std::io::{self, Cursor, Read};

/// Moves command payloads between the engine and the initiator
pub trait DataTransfer {
    /// Fill `buf` with Data-Out bytes from the initiator.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Send Data-In segments to the initiator, in order.
    fn send(&mut self, segments: &[&[u8]]) -> io::Result<()>;
}

/// In-memory transfer: Data-Out comes from a buffer, Data-In is recorded.
#[derive(Debug, Default)]
pub struct BufferedTransfer {
    incoming: Cursor<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl BufferedTransfer {
    pub fn new(incoming: Vec<u8>) -> Self {
        Self {
            incoming: Cursor::new(incoming),
            sent: Vec::new(),
        }
    }

    /// Data-Out bytes not yet consumed
    pub fn remaining(&self) -> usize {
        let consumed = self.incoming.position() as usize;
        self.incoming.get_ref().len().saturating_sub(consumed)
    }

    /// Segments sent so far
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// All Data-In bytes sent so far, concatenated
    pub fn sent(&self) -> Vec<u8> {
        self.sent.concat()
    }

    /// Take and clear the recorded Data-In segments.
    pub fn take_sent(&mut self) -> Vec<u8> {
        let data = self.sent.concat();
        self.sent.clear();
        data
    }
}

impl DataTransfer for BufferedTransfer {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.incoming.read_exact(buf)
    }

    fn send(&mut self, segments: &[&[u8]]) -> io::Result<()> {
        self.sent
            .extend(segments.iter().filter(|s| !s.is_empty()).map(|s| s.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_transfer() {
        let mut transfer = BufferedTransfer::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 3];
        transfer.receive(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transfer.remaining(), 1);
        assert!(transfer.receive(&mut buf).is_err());

        transfer.send(&[&b"ab"[..], &b""[..], &b"cd"[..]]).unwrap();
        assert_eq!(transfer.segments().len(), 2);
        assert_eq!(transfer.take_sent(), b"abcd");
        assert!(transfer.sent().is_empty());
    }
}
