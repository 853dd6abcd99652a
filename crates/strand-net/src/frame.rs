//! Length-prefixed framing: u32 little-endian length, then the payload,
//! capped at [`MAX_FRAME`] bytes. One response per request.

use strand_core::{Error, Result};

use crate::socket::FiberSocket;

/// Largest allowed payload.
pub const MAX_FRAME: usize = 1024;

const HEADER: usize = 4;

/// Frame a payload for the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_FRAME);
    let mut out = Vec::with_capacity(HEADER + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental decoder that survives short reads and coalesced
/// requests: feed whatever arrived, then drain complete frames in a
/// loop.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME {
            return Err(Error::Protocol(format!("frame of {} bytes exceeds {}", len, MAX_FRAME)));
        }
        if self.buf.len() < HEADER + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER..HEADER + len].to_vec();
        self.buf.drain(..HEADER + len);
        Ok(Some(payload))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Read one frame from the socket. `Err(Eof)` on orderly close at a
/// frame boundary.
pub async fn read_frame(sock: &FiberSocket) -> Result<Vec<u8>> {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        let n = match sock.read(&mut chunk).await {
            Ok(n) => n,
            Err(Error::Eof) if decoder.buffered() > 0 => {
                return Err(Error::Protocol("eof inside a frame".into()));
            }
            Err(e) => return Err(e),
        };
        decoder.feed(&chunk[..n]);
    }
}

/// Write one framed payload.
pub async fn write_frame(sock: &FiberSocket, payload: &[u8]) -> Result<()> {
    sock.write_all(&encode(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut d = FrameDecoder::new();
        d.feed(&encode(b"ping"));
        assert_eq!(d.next_frame().unwrap(), Some(b"ping".to_vec()));
        assert_eq!(d.next_frame().unwrap(), None);
    }

    #[test]
    fn test_short_read_then_rest() {
        let wire = encode(b"hello");
        let mut d = FrameDecoder::new();
        d.feed(&wire[..3]);
        assert_eq!(d.next_frame().unwrap(), None);
        d.feed(&wire[3..]);
        assert_eq!(d.next_frame().unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_pipelined_frames_decode_in_order() {
        let mut wire = encode(b"one");
        wire.extend_from_slice(&encode(b"two"));
        wire.extend_from_slice(&encode(b"three"));
        let mut d = FrameDecoder::new();
        d.feed(&wire);
        assert_eq!(d.next_frame().unwrap(), Some(b"one".to_vec()));
        assert_eq!(d.next_frame().unwrap(), Some(b"two".to_vec()));
        assert_eq!(d.next_frame().unwrap(), Some(b"three".to_vec()));
        assert_eq!(d.next_frame().unwrap(), None);
    }

    #[test]
    fn test_oversize_rejected() {
        let mut d = FrameDecoder::new();
        d.feed(&(4096u32).to_le_bytes());
        d.feed(&[0u8; 8]);
        assert!(d.next_frame().is_err());
    }
}
