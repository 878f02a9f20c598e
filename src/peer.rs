//! # Peer Connection
//!
//! One [`Peer`] owns one duplex TCP channel to a remote node. It moves
//! bytes and nothing else: it knows neither the control-message schema nor
//! the encryption layer.
//!
//! ## Stream Gate
//!
//! Control frames and opaque byte streams share the single connection, so
//! the per-peer reader task and the stream consumer must take turns on the
//! read half. The gate is a one-at-a-time handoff:
//!
//! ```text
//! IDLE --start_stream--> STREAMING --close_stream--> IDLE
//! ```
//!
//! The reader task calls [`Peer::start_stream`] followed by
//! [`Peer::wait_for_stream`] when it decodes a stream frame, parking until
//! the consumer has drained the stream bytes via [`Peer::read_stream`]
//! (which releases the gate). At most one stream is in progress per peer
//! at any instant; control frames from that peer are not decoded until
//! the gate is released.
//!
//! Outbound writes are serialized by a writer lock; concurrent senders
//! queue on it.

use std::io::{self, Write};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::debug;

use crate::decoder::{DecodeOutcome, Decoder};

/// Consecutive empty read windows tolerated inside [`Peer::read_stream`]
/// before the stream is failed.
const STREAM_RETRY_LIMIT: u32 = 50;

/// Length of one read window.
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Read buffer size for draining stream bytes.
const STREAM_CHUNK: usize = 8192;

/// Failures on a single peer connection.
#[derive(Debug)]
pub enum PeerError {
    /// Transport-level read or write failure.
    Io(io::Error),
    /// The connection ended before the expected stream bytes arrived.
    UnexpectedEof { expected: u64, got: u64 },
    /// The remote advertised a stream and then went silent.
    StreamStalled,
    /// Writing the blob bytes into the local sink failed.
    Sink(io::Error),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "peer I/O failed: {}", e),
            PeerError::UnexpectedEof { expected, got } => {
                write!(f, "connection closed after {} of {} stream bytes", got, expected)
            }
            PeerError::StreamStalled => write!(f, "stream stalled past the retry budget"),
            PeerError::Sink(e) => write!(f, "stream sink write failed: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        PeerError::Io(e)
    }
}

/// One-at-a-time handoff of the read half between the reader task and a
/// stream consumer.
struct StreamGate {
    streaming: StdMutex<bool>,
    started: Notify,
    released: Notify,
}

impl StreamGate {
    fn new() -> Self {
        Self {
            streaming: StdMutex::new(false),
            started: Notify::new(),
            released: Notify::new(),
        }
    }

    fn start(&self) {
        *self.streaming.lock().expect("stream gate poisoned") = true;
        self.started.notify_waiters();
    }

    fn close(&self) {
        *self.streaming.lock().expect("stream gate poisoned") = false;
        self.released.notify_waiters();
    }

    async fn wait_released(&self) {
        loop {
            let released = self.released.notified();
            if !*self.streaming.lock().expect("stream gate poisoned") {
                return;
            }
            released.await;
        }
    }

    async fn wait_started(&self) {
        loop {
            let started = self.started.notified();
            if *self.streaming.lock().expect("stream gate poisoned") {
                return;
            }
            started.await;
        }
    }
}

pub struct Peer {
    addr: String,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<OwnedReadHalf>,
    gate: StreamGate,
}

impl Peer {
    /// Wrap a connected socket. The remote endpoint string becomes the
    /// peer's identity in every peer table.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            gate: StreamGate::new(),
        })
    }

    /// Stable endpoint identifier (`ip:port`) of the remote side.
    pub fn remote_address(&self) -> &str {
        &self.addr
    }

    /// Write all bytes to the peer. Concurrent callers are serialized.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        Ok(())
    }

    /// Write a single tag byte.
    pub async fn send_tag(&self, tag: u8) -> Result<(), PeerError> {
        self.send(&[tag]).await
    }

    /// Write an in-memory buffer as one logical stream operation.
    pub async fn write_stream(&self, buffer: &[u8]) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buffer).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly `n` bytes from the connection into `sink`.
    ///
    /// Tolerates up to [`STREAM_RETRY_LIMIT`] consecutive empty read
    /// windows of [`STREAM_RETRY_DELAY`]; the counter resets whenever
    /// bytes arrive. Releases the stream gate on every exit path so the
    /// parked reader task can resume and observe the connection state.
    pub async fn read_stream<W>(&self, sink: &mut W, n: u64) -> Result<(), PeerError>
    where
        W: Write + ?Sized,
    {
        let result = self.read_exact_into(sink, n).await;
        self.close_stream();
        result
    }

    async fn read_exact_into<W>(&self, sink: &mut W, n: u64) -> Result<(), PeerError>
    where
        W: Write + ?Sized,
    {
        let mut reader = self.reader.lock().await;
        let mut buffer = [0u8; STREAM_CHUNK];
        let mut remaining = n;
        let mut stalls = 0u32;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            match timeout(STREAM_RETRY_DELAY, reader.read(&mut buffer[..want])).await {
                Ok(Ok(0)) => {
                    return Err(PeerError::UnexpectedEof {
                        expected: n,
                        got: n - remaining,
                    });
                }
                Ok(Ok(read)) => {
                    sink.write_all(&buffer[..read]).map_err(PeerError::Sink)?;
                    remaining -= read as u64;
                    stalls = 0;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls >= STREAM_RETRY_LIMIT {
                        return Err(PeerError::StreamStalled);
                    }
                }
                Ok(Err(e)) => return Err(PeerError::Io(e)),
                Err(_) => {
                    stalls += 1;
                    if stalls >= STREAM_RETRY_LIMIT {
                        debug!(peer = %self.addr, remaining, "stream retry budget exhausted");
                        return Err(PeerError::StreamStalled);
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode the next frame off the read half. Used by the transport's
    /// per-peer reader task; takes the reader lock only for the duration
    /// of one frame.
    pub(crate) async fn decode_next(&self, decoder: &Decoder) -> DecodeOutcome {
        let mut reader = self.reader.lock().await;
        decoder.decode(&mut *reader).await
    }

    /// Mark a stream as in progress. Called by the reader task before it
    /// parks on [`Peer::wait_for_stream`].
    pub fn start_stream(&self) {
        self.gate.start();
    }

    /// Release the stream gate. Idempotent.
    pub fn close_stream(&self) {
        self.gate.close();
    }

    /// Park until the in-progress stream is released.
    pub async fn wait_for_stream(&self) {
        self.gate.wait_released().await;
    }

    /// Park until the reader task has observed a stream frame and handed
    /// the socket over. Stream consumers call this before draining so they
    /// never race the reader for the frame tag.
    pub async fn wait_for_stream_start(&self) {
        self.gate.wait_started().await;
    }

    /// Shut down the write direction so the remote observes EOF and the
    /// connection winds down.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.addr, error = %e, "shutdown failed");
        }
    }
}
