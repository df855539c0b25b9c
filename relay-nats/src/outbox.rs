//! Outgoing buffer used while no socket is usable.
//!
//! Commands queue in FIFO order and are drained in one piece once a
//! connection is ready. Appending never blocks; with a byte cap configured
//! it fails fast instead of dropping.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use relay_core::error::{ClientError, Result};

#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Bytes>,
    pending_bytes: usize,
    limit: Option<usize>,
}

impl Outbox {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Queue an encoded command.
    ///
    /// # Errors
    ///
    /// [`ClientError::Backpressure`] when the cap would be exceeded. The
    /// command is not queued in that case.
    pub fn push(&mut self, cmd: Bytes) -> Result<()> {
        if let Some(limit) = self.limit {
            let pending = self.pending_bytes + cmd.len();
            if pending > limit {
                return Err(ClientError::Backpressure { pending, limit });
            }
        }
        self.pending_bytes += cmd.len();
        self.queue.push_back(cmd);
        Ok(())
    }

    /// Move the whole backlog, in order, to the end of `dst`.
    pub fn drain_into(&mut self, dst: &mut BytesMut) -> usize {
        let drained = self.pending_bytes;
        dst.reserve(drained);
        for cmd in self.queue.drain(..) {
            dst.extend_from_slice(&cmd);
        }
        self.pending_bytes = 0;
        drained
    }

    /// Discard the backlog.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_bytes = 0;
    }

    pub const fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_drain() {
        let mut outbox = Outbox::new(None);
        outbox.push(Bytes::from_static(b"PUB a 1\r\n1\r\n")).unwrap();
        outbox.push(Bytes::from_static(b"PUB a 1\r\n2\r\n")).unwrap();
        assert_eq!(outbox.len(), 2);

        let mut dst = BytesMut::from(&b"SUB a 1\r\n"[..]);
        let drained = outbox.drain_into(&mut dst);
        assert_eq!(drained, 24);
        assert_eq!(&dst[..], b"SUB a 1\r\nPUB a 1\r\n1\r\nPUB a 1\r\n2\r\n");
        assert!(outbox.is_empty());
        assert_eq!(outbox.pending_bytes(), 0);
    }

    #[test]
    fn test_cap_rejects_without_dropping() {
        let mut outbox = Outbox::new(Some(10));
        outbox.push(Bytes::from_static(b"12345678")).unwrap();

        let err = outbox.push(Bytes::from_static(b"abc")).unwrap_err();
        assert_eq!(err, ClientError::Backpressure { pending: 11, limit: 10 });
        assert_eq!(outbox.len(), 1);

        outbox.push(Bytes::from_static(b"ab")).unwrap();
        assert_eq!(outbox.pending_bytes(), 10);
    }

    #[test]
    fn test_clear() {
        let mut outbox = Outbox::new(None);
        outbox.push(Bytes::from_static(b"x")).unwrap();
        outbox.clear();
        assert!(outbox.is_empty());
        assert_eq!(outbox.pending_bytes(), 0);
    }
}
