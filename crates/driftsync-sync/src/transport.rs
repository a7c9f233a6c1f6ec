//! Transport abstraction for sync sessions.
//!
//! Any bidirectional, reliable, ordered, message-framed channel works: a
//! WebSocket in production, a channel pair in tests. The engine never
//! opens sockets itself; implementations live with the platform layer.
//!
//! Stream-oriented transports frame each padded message with a 4-byte
//! big-endian length prefix; the helpers at the bottom implement that
//! framing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, SyncError};

/// A message-framed duplex channel carrying padded protocol frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Receive with a deadline. A quiet peer is a
    /// [`SyncError::Timeout`]; `Ok(None)` still means closed.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "waiting {} ms for a frame",
                timeout.as_millis()
            ))),
        }
    }
}

/// In-memory transports for tests: a connected pair backed by channels.
pub mod memory {
    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// One end of an in-memory duplex channel.
    pub struct MemoryTransport {
        tx: mpsc::Sender<Bytes>,
        rx: Mutex<mpsc::Receiver<Bytes>>,
    }

    /// Create a connected transport pair.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            MemoryTransport {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            MemoryTransport {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, frame: Bytes) -> Result<()> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| SyncError::TransportClosed)
        }

        async fn recv(&self) -> Result<Option<Bytes>> {
            Ok(self.rx.lock().await.recv().await)
        }
    }
}

/// Prefix a padded frame with its 4-byte big-endian length for a stream
/// transport.
pub fn length_prefix(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + frame.len());
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// Split one length-prefixed frame off the front of a stream buffer.
///
/// Returns the frame and the unconsumed rest, or `None` when the buffer
/// does not yet hold a whole frame.
pub fn split_length_prefixed(buf: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > driftsync_core::codec::MAX_VAR_LEN {
        return Err(SyncError::Protocol(format!(
            "frame length {len} exceeds the maximum"
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let (frame, rest) = buf[4..].split_at(len);
    Ok(Some((frame, rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_send_recv() {
        let (a, b) = memory::pair(16);
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        let frame = b.recv().await.unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_close() {
        let (a, b) = memory::pair(16);
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout_expires() {
        let (_a, b) = memory::pair(16);
        let result = b.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
    }

    #[test]
    fn test_length_prefix_roundtrip() {
        let framed = length_prefix(b"abc");
        let (frame, rest) = split_length_prefixed(&framed).unwrap().unwrap();
        assert_eq!(frame, b"abc");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_split_waits_for_whole_frame() {
        let framed = length_prefix(b"abcdef");
        assert!(split_length_prefixed(&framed[..3]).unwrap().is_none());
        assert!(split_length_prefixed(&framed[..7]).unwrap().is_none());

        let mut two = framed.clone();
        two.extend_from_slice(&length_prefix(b"xy"));
        let (first, rest) = split_length_prefixed(&two).unwrap().unwrap();
        assert_eq!(first, b"abcdef");
        let (second, rest) = split_length_prefixed(rest).unwrap().unwrap();
        assert_eq!(second, b"xy");
        assert!(rest.is_empty());
    }
}
