//! # Wire Framing Codec
//!
//! Every byte exchanged between nodes travels inside a frame. The grammar
//! is deliberately minimal: a single tag byte gates the semantics of
//! everything that follows, which lets one reader task per connection
//! interleave control traffic and opaque byte streams without a second
//! socket or out-of-band signaling.
//!
//! ```text
//! frame := tag:u8
//!          ( tag == 0x01 )  len:u32_be  payload[len]     -- control (JSON)
//!          ( tag == 0x02 )  -- no further bytes           -- stream begins
//! ```
//!
//! A stream frame carries no inline payload; the bytes that follow it on
//! the connection belong to whichever consumer holds the peer's stream
//! gate (see [`crate::peer`]).
//!
//! Control payloads are bounded (default 1 MiB) to prevent a remote peer
//! from forcing unbounded allocations. Stream sizes are not subject to
//! this guard; they are delimited by their own length prefixes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame tag: a length-prefixed control payload follows.
pub const TAG_CONTROL: u8 = 0x01;

/// Frame tag: an opaque byte stream follows, outside the framing layer.
pub const TAG_STREAM: u8 = 0x02;

/// Default upper bound on a control frame payload.
pub const DEFAULT_MAX_CONTROL_PAYLOAD: u32 = 1024 * 1024;

/// Unrecoverable framing failures. Any of these closes the peer that
/// produced them; other peers are unaffected.
#[derive(Debug)]
pub enum FrameError {
    /// The tag byte was neither control nor stream.
    InvalidTag(u8),
    /// A control frame advertised a payload above the configured bound.
    OversizedPayload(u32),
    /// The connection ended cleanly in the middle of a frame.
    TruncatedFrame,
    /// Underlying transport failure.
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidTag(tag) => write!(f, "invalid frame tag: {:#04x}", tag),
            FrameError::OversizedPayload(len) => {
                write!(f, "control payload too large: {} bytes", len)
            }
            FrameError::TruncatedFrame => write!(f, "connection closed mid-frame"),
            FrameError::Io(e) => write!(f, "frame read failed: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// Result of pulling one frame off a byte source.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete control payload.
    Control(Vec<u8>),
    /// A stream frame; the caller must hand the socket to the stream
    /// consumer before decoding again.
    StreamBegin,
    /// Clean EOF before the first byte of a frame.
    ClosedCleanly,
    /// A non-blocking source had no bytes available yet.
    Retry,
    /// Framing violation or transport failure; close the peer.
    Fatal(FrameError),
}

/// Pull-based frame decoder, single-threaded per connection.
///
/// The decoder holds no state between frames; the only configuration is
/// the control-payload bound.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_control_payload: u32,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTROL_PAYLOAD)
    }
}

impl Decoder {
    pub fn new(max_control_payload: u32) -> Self {
        Self { max_control_payload }
    }

    /// Decode the next frame from `source`.
    ///
    /// Partial reads are retried internally while the source is live; a
    /// clean EOF before any byte of a frame yields
    /// [`DecodeOutcome::ClosedCleanly`], while EOF after the tag byte is
    /// a [`FrameError::TruncatedFrame`].
    pub async fn decode<R>(&self, source: &mut R) -> DecodeOutcome
    where
        R: AsyncRead + Unpin,
    {
        let tag = match source.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return DecodeOutcome::ClosedCleanly;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return DecodeOutcome::Retry;
            }
            Err(e) => return DecodeOutcome::Fatal(FrameError::Io(e)),
        };

        match tag {
            TAG_STREAM => DecodeOutcome::StreamBegin,
            TAG_CONTROL => self.decode_control(source).await,
            other => DecodeOutcome::Fatal(FrameError::InvalidTag(other)),
        }
    }

    async fn decode_control<R>(&self, source: &mut R) -> DecodeOutcome
    where
        R: AsyncRead + Unpin,
    {
        let len = match source.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return DecodeOutcome::Fatal(FrameError::TruncatedFrame);
            }
            Err(e) => return DecodeOutcome::Fatal(FrameError::Io(e)),
        };

        if len > self.max_control_payload {
            return DecodeOutcome::Fatal(FrameError::OversizedPayload(len));
        }

        let mut payload = vec![0u8; len as usize];
        match source.read_exact(&mut payload).await {
            Ok(_) => DecodeOutcome::Control(payload),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                DecodeOutcome::Fatal(FrameError::TruncatedFrame)
            }
            Err(e) => DecodeOutcome::Fatal(FrameError::Io(e)),
        }
    }
}

/// Compose a complete control frame: tag, big-endian length, payload.
pub fn encode_control(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(TAG_CONTROL);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[tokio::test]
    async fn decodes_control_frame() {
        let frame = encode_control(b"{\"type\":1}");
        let mut source = &frame[..];

        match Decoder::default().decode(&mut source).await {
            DecodeOutcome::Control(payload) => assert_eq!(payload, b"{\"type\":1}"),
            other => panic!("expected control, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn decodes_stream_frame_without_payload() {
        let frame = [TAG_STREAM];
        let mut source = &frame[..];

        assert!(matches!(
            Decoder::default().decode(&mut source).await,
            DecodeOutcome::StreamBegin
        ));
    }

    #[tokio::test]
    async fn empty_source_is_clean_close() {
        let mut source: &[u8] = &[];
        assert!(matches!(
            Decoder::default().decode(&mut source).await,
            DecodeOutcome::ClosedCleanly
        ));
    }

    #[tokio::test]
    async fn eof_after_tag_is_truncated_frame() {
        let frame = [TAG_CONTROL, 0x00, 0x00];
        let mut source = &frame[..];

        assert!(matches!(
            Decoder::default().decode(&mut source).await,
            DecodeOutcome::Fatal(FrameError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_truncated_frame() {
        let mut frame = encode_control(b"hello world");
        frame.truncate(frame.len() - 4);
        let mut source = &frame[..];

        assert!(matches!(
            Decoder::default().decode(&mut source).await,
            DecodeOutcome::Fatal(FrameError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_tag() {
        let frame = [0x7f];
        let mut source = &frame[..];

        match Decoder::default().decode(&mut source).await {
            DecodeOutcome::Fatal(FrameError::InvalidTag(tag)) => assert_eq!(tag, 0x7f),
            other => panic!("expected invalid tag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_control_payload() {
        let len = DEFAULT_MAX_CONTROL_PAYLOAD + 1;
        let mut frame = vec![TAG_CONTROL];
        frame.extend_from_slice(&len.to_be_bytes());
        let mut source = &frame[..];

        match Decoder::default().decode(&mut source).await {
            DecodeOutcome::Fatal(FrameError::OversizedPayload(n)) => assert_eq!(n, len),
            other => panic!("expected oversize rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn payload_exactly_at_limit_is_accepted() {
        let decoder = Decoder::new(16);
        let frame = encode_control(&[0xaa; 16]);
        let mut source = &frame[..];

        assert!(matches!(
            decoder.decode(&mut source).await,
            DecodeOutcome::Control(ref p) if p.len() == 16
        ));
    }

    #[tokio::test]
    async fn decodes_consecutive_frames_from_one_source() {
        let mut bytes = encode_control(b"first");
        bytes.push(TAG_STREAM);
        bytes.extend_from_slice(&encode_control(b"second"));
        let mut source = &bytes[..];
        let decoder = Decoder::default();

        assert!(matches!(
            decoder.decode(&mut source).await,
            DecodeOutcome::Control(ref p) if p == b"first"
        ));
        assert!(matches!(
            decoder.decode(&mut source).await,
            DecodeOutcome::StreamBegin
        ));
        assert!(matches!(
            decoder.decode(&mut source).await,
            DecodeOutcome::Control(ref p) if p == b"second"
        ));
        assert!(matches!(
            decoder.decode(&mut source).await,
            DecodeOutcome::ClosedCleanly
        ));
    }

    /// Source that reports would-block before the first frame byte.
    struct WouldBlockSource;

    impl AsyncRead for WouldBlockSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::WouldBlock)))
        }
    }

    #[tokio::test]
    async fn would_block_before_frame_is_retry() {
        let mut source = WouldBlockSource;
        assert!(matches!(
            Decoder::default().decode(&mut source).await,
            DecodeOutcome::Retry
        ));
    }
}
