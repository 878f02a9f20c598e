//! # TCP Transport
//!
//! Owns the listening endpoint and the table of active peers, and runs one
//! reader task per connection. Decoded control messages from every peer
//! funnel into a single bounded queue ([`crate::channel::Channel`]); the
//! consumer of that queue (the file server) never touches sockets for
//! control traffic.
//!
//! ## Reader Task
//!
//! Each peer's reader is a two-state machine:
//!
//! 1. **Expecting frame** — pull the next frame off the socket. Control
//!    payloads are tagged with the sender's endpoint and pushed to the
//!    queue (blocking: a full queue back-pressures the reader).
//! 2. **Streaming** — a stream frame hands the socket to whichever
//!    consumer is responsible for the bytes; the reader parks on the
//!    peer's stream gate until the consumer releases it.
//!
//! A fatal decode or EOF removes the peer from the table and ends the
//! task. One misbehaving peer never affects the others or the acceptor.
//!
//! ## Ownership
//!
//! The transport is the single owner of every [`Peer`]; other components
//! hold endpoint strings and look handles up on demand. When a reader task
//! exits, the peer leaves the table before any subsequent broadcast can
//! observe it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, DEFAULT_QUEUE_CAPACITY};
use crate::decoder::{DecodeOutcome, Decoder, DEFAULT_MAX_CONTROL_PAYLOAD};
use crate::peer::Peer;

/// Pause before re-polling a source that reported no bytes available.
const RETRY_POLL_DELAY: Duration = Duration::from_millis(10);

/// A decoded control payload tagged with the sender's endpoint.
#[derive(Debug)]
pub struct InboundMessage {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Predicate consulted before admitting an accepted connection. Denied
/// connections are closed before entering the peer table. Opaque to the
/// transport.
pub type AllowPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Callback fired once per newly registered peer.
pub type OnPeerCallback = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

pub struct TransportConfig {
    /// `host:port` to listen on; an empty host means loopback.
    pub listen_address: String,
    /// Capacity of the inbound control-message queue.
    pub queue_capacity: usize,
    /// Upper bound on a control frame payload.
    pub max_control_payload: u32,
    /// Optional allow-list consulted on accept.
    pub allow_predicate: Option<AllowPredicate>,
}

impl TransportConfig {
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_control_payload: DEFAULT_MAX_CONTROL_PAYLOAD,
            allow_predicate: None,
        }
    }
}

struct PeerEntry {
    peer: Arc<Peer>,
    reader: Option<JoinHandle<()>>,
}

pub struct TcpTransport {
    listen_address: String,
    decoder: Decoder,
    allow_predicate: Option<AllowPredicate>,
    queue: Arc<Channel<InboundMessage>>,
    peers: StdMutex<HashMap<String, PeerEntry>>,
    on_peer: StdMutex<Option<OnPeerCallback>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            listen_address: config.listen_address,
            decoder: Decoder::new(config.max_control_payload),
            allow_predicate: config.allow_predicate,
            queue: Arc::new(Channel::new(config.queue_capacity)),
            peers: StdMutex::new(HashMap::new()),
            on_peer: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            accept_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register the callback fired for each newly registered peer.
    pub fn set_on_peer(&self, callback: OnPeerCallback) {
        *self.on_peer.lock().expect("on_peer lock poisoned") = Some(callback);
    }

    /// Bind the listening endpoint and spawn the accept loop.
    pub async fn listen_and_accept(self: &Arc<Self>) -> io::Result<()> {
        let addr = normalize_listen_address(&self.listen_address)?;
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().expect("local_addr lock poisoned") = Some(local);
        info!(addr = %local, "transport listening");

        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if transport.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Some(allow) = &transport.allow_predicate {
                            let endpoint = remote.to_string();
                            if !allow(&endpoint) {
                                info!(peer = %endpoint, "connection denied by allow-list");
                                continue;
                            }
                        }
                        transport.register(stream, false);
                    }
                    Err(e) => {
                        if transport.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().expect("accept_task lock poisoned") = Some(task);
        Ok(())
    }

    /// Establish an outbound connection and register the peer.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        self.register(stream, true);
        Ok(())
    }

    fn register(self: &Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match Peer::new(stream) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                warn!(error = %e, "failed to set up peer connection");
                return;
            }
        };
        let addr = peer.remote_address().to_string();
        debug!(peer = %addr, outbound, "peer registered");

        self.peers
            .lock()
            .expect("peer table poisoned")
            .insert(addr.clone(), PeerEntry { peer: peer.clone(), reader: None });

        let callback = self.on_peer.lock().expect("on_peer lock poisoned").clone();
        if let Some(callback) = callback {
            callback(&peer);
        }

        let transport = Arc::clone(self);
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            transport.reader_loop(reader_peer).await;
        });

        let mut peers = self.peers.lock().expect("peer table poisoned");
        if let Some(entry) = peers.get_mut(&addr) {
            entry.reader = Some(reader);
        }
    }

    async fn reader_loop(&self, peer: Arc<Peer>) {
        let addr = peer.remote_address().to_string();
        loop {
            match peer.decode_next(&self.decoder).await {
                DecodeOutcome::Control(payload) => {
                    self.queue
                        .send(InboundMessage {
                            from: addr.clone(),
                            payload,
                        })
                        .await;
                }
                DecodeOutcome::StreamBegin => {
                    peer.start_stream();
                    debug!(peer = %addr, "incoming stream, reader parked");
                    peer.wait_for_stream().await;
                    debug!(peer = %addr, "stream released, reader resumed");
                }
                DecodeOutcome::Retry => {
                    tokio::time::sleep(RETRY_POLL_DELAY).await;
                }
                DecodeOutcome::ClosedCleanly => {
                    info!(peer = %addr, "peer closed connection");
                    break;
                }
                DecodeOutcome::Fatal(e) => {
                    warn!(peer = %addr, error = %e, "fatal decode, dropping peer");
                    break;
                }
            }
        }
        self.peers.lock().expect("peer table poisoned").remove(&addr);
    }

    /// Handle to the inbound control-message queue. The same queue is
    /// returned across calls.
    pub fn consume(&self) -> Arc<Channel<InboundMessage>> {
        self.queue.clone()
    }

    /// Look up an active peer by its endpoint string.
    pub fn peer(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .get(addr)
            .map(|entry| entry.peer.clone())
    }

    /// Snapshot of all active peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer table poisoned").len()
    }

    /// Actual bound address, available once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local_addr lock poisoned")
    }

    /// Forcibly drop one peer: used when a peer violates the protocol at a
    /// layer above framing.
    pub async fn close_peer(&self, addr: &str) {
        let entry = self.peers.lock().expect("peer table poisoned").remove(addr);
        if let Some(entry) = entry {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
            entry.peer.shutdown().await;
            info!(peer = %addr, "peer closed");
        }
    }

    /// Shut the transport down: stop accepting, drop every peer. Safe to
    /// call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().expect("accept_task lock poisoned").take() {
            task.abort();
        }

        let entries: Vec<PeerEntry> = {
            let mut peers = self.peers.lock().expect("peer table poisoned");
            peers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
            entry.peer.shutdown().await;
        }
        info!(addr = %self.listen_address, "transport closed");
    }
}

/// Expand a `host:port` listen address, defaulting an empty host to
/// loopback.
fn normalize_listen_address(addr: &str) -> io::Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "listen address must be host:port"))?;
    if port.parse::<u16>().is_err() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen port: {}", port),
        ));
    }
    if host.is_empty() {
        Ok(format!("127.0.0.1:{}", port))
    } else {
        Ok(addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{encode_control, TAG_STREAM};
    use std::collections::HashSet;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn listening_transport(config: TransportConfig) -> Arc<TcpTransport> {
        let transport = Arc::new(TcpTransport::new(config));
        transport.listen_and_accept().await.expect("listen failed");
        transport
    }

    async fn wait_for_peers(transport: &TcpTransport, count: usize) {
        timeout(TEST_TIMEOUT, async {
            while transport.peer_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer never registered");
    }

    #[test]
    fn normalizes_empty_host_to_loopback() {
        assert_eq!(normalize_listen_address(":9000").unwrap(), "127.0.0.1:9000");
        assert_eq!(
            normalize_listen_address("0.0.0.0:9000").unwrap(),
            "0.0.0.0:9000"
        );
        assert!(normalize_listen_address("no-port").is_err());
        assert!(normalize_listen_address("host:notaport").is_err());
    }

    #[tokio::test]
    async fn control_frames_reach_the_queue_tagged_with_sender() {
        let transport = listening_transport(TransportConfig::new(":0")).await;
        let addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&encode_control(b"payload-1")).await.unwrap();
        client.write_all(&encode_control(b"payload-2")).await.unwrap();

        let queue = transport.consume();
        let first = timeout(TEST_TIMEOUT, queue.receive()).await.unwrap();
        let second = timeout(TEST_TIMEOUT, queue.receive()).await.unwrap();

        assert_eq!(first.payload, b"payload-1");
        assert_eq!(second.payload, b"payload-2");
        assert_eq!(first.from, client.local_addr().unwrap().to_string());
        assert_eq!(first.from, second.from);

        transport.close().await;
    }

    #[tokio::test]
    async fn dial_registers_peer_on_both_sides() {
        let server = listening_transport(TransportConfig::new(":0")).await;
        let client = listening_transport(TransportConfig::new(":0")).await;

        client
            .dial(&server.local_addr().unwrap().to_string())
            .await
            .unwrap();

        wait_for_peers(&client, 1).await;
        wait_for_peers(&server, 1).await;

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn on_peer_callback_fires_per_connection() {
        let transport = listening_transport(TransportConfig::new(":0")).await;
        let seen: Arc<StdMutex<HashSet<String>>> = Arc::new(StdMutex::new(HashSet::new()));
        {
            let seen = seen.clone();
            transport.set_on_peer(Arc::new(move |peer| {
                seen.lock().unwrap().insert(peer.remote_address().to_string());
            }));
        }

        let addr = transport.local_addr().unwrap();
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&transport, 2).await;

        assert_eq!(seen.lock().unwrap().len(), 2);
        transport.close().await;
    }

    #[tokio::test]
    async fn oversized_control_drops_only_the_offender() {
        let mut config = TransportConfig::new(":0");
        config.max_control_payload = 64;
        let transport = listening_transport(config).await;
        let addr = transport.local_addr().unwrap();

        let mut offender = TcpStream::connect(addr).await.unwrap();
        let mut innocent = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&transport, 2).await;

        // Advertise a payload one byte over the limit.
        let mut frame = vec![crate::decoder::TAG_CONTROL];
        frame.extend_from_slice(&65u32.to_be_bytes());
        offender.write_all(&frame).await.unwrap();

        timeout(TEST_TIMEOUT, async {
            while transport.peer_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("offender was not dropped");

        // The surviving peer still delivers control traffic.
        innocent.write_all(&encode_control(b"still here")).await.unwrap();
        let msg = timeout(TEST_TIMEOUT, transport.consume().receive()).await.unwrap();
        assert_eq!(msg.payload, b"still here");

        transport.close().await;
    }

    #[tokio::test]
    async fn allow_list_rejects_unlisted_peers() {
        let mut config = TransportConfig::new(":0");
        config.allow_predicate = Some(Arc::new(|_addr: &str| false));
        let transport = listening_transport(config).await;
        let addr = transport.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.peer_count(), 0);

        transport.close().await;
    }

    #[tokio::test]
    async fn stream_frame_parks_reader_until_consumer_drains() {
        let transport = listening_transport(TransportConfig::new(":0")).await;
        let addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&transport, 1).await;
        let peer_addr = client.local_addr().unwrap().to_string();

        // Stream frame, raw stream bytes, then another control frame.
        client.write_all(&[TAG_STREAM]).await.unwrap();
        client.write_all(b"raw stream bytes").await.unwrap();
        client.write_all(&encode_control(b"after stream")).await.unwrap();

        // The control frame must not surface while the stream is gated.
        let queue = transport.consume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.is_empty(), "control decoded before stream was drained");

        let peer = transport.peer(&peer_addr).expect("peer missing");
        let mut sink = Vec::new();
        peer.read_stream(&mut sink, 16).await.unwrap();
        assert_eq!(sink, b"raw stream bytes");

        let msg = timeout(TEST_TIMEOUT, queue.receive()).await.unwrap();
        assert_eq!(msg.payload, b"after stream");

        transport.close().await;
    }

    #[tokio::test]
    async fn disconnected_peer_leaves_the_table() {
        let transport = listening_transport(TransportConfig::new(":0")).await;
        let addr = transport.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&transport, 1).await;

        drop(client);
        timeout(TEST_TIMEOUT, async {
            while transport.peer_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer not removed after disconnect");

        transport.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = listening_transport(TransportConfig::new(":0")).await;
        let addr = transport.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&transport, 1).await;

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.peer_count(), 0);
    }
}
