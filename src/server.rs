//! # File Server
//!
//! The orchestration layer joining transport, store, and crypto. A
//! [`FileServer`] accepts named inserts and fetches from a local client,
//! keeps blobs on the local content-addressed store, replicates inserts to
//! every connected peer, and answers peers' fetch requests.
//!
//! ## Control and Data Flow
//!
//! A local insert writes locally, broadcasts a `StoreFile` announcement,
//! then streams the encrypted body to each peer. A local fetch of a
//! missing key broadcasts `GetFile` and waits a bounded interval for any
//! peer holding the blob to stream it back.
//!
//! Replicas are filed under the **origin** node's id, so copies from
//! different producers never collide. A peer answering a fetch announces
//! the blob with the requester's own origin id, which lets the requester's
//! ordinary store-file path persist it where its local lookups will find
//! it.
//!
//! ## Stream Shapes
//!
//! Replication streams are prefixed with a big-endian u32 length; fetch
//! responses with a big-endian u64. The receiver picks the shape by the
//! origin id in the announcing control message: an echo of its own id
//! marks a fetch response, any other id marks replication. Both prefixes
//! must equal the `size` advertised in the announcement; a mismatch is a
//! protocol violation and drops the peer.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::crypto::{
    copy_decrypt, copy_encrypt, generate_node_id, hash_key, CryptoError, EncryptionKey, IV_SIZE,
};
use crate::decoder::{encode_control, DEFAULT_MAX_CONTROL_PAYLOAD, TAG_STREAM};
use crate::messages::{ControlMessage, MessageError};
use crate::peer::Peer;
use crate::store::{PathTransform, Store};
use crate::transport::{AllowPredicate, InboundMessage, TcpTransport, TransportConfig};
use crate::channel::DEFAULT_QUEUE_CAPACITY;

/// Pause between the replication announcement and the stream, giving
/// receivers time to pick the control frame off their sockets.
const BROADCAST_SETTLE_DELAY: Duration = Duration::from_millis(5);

/// How long a local fetch waits for a peer to stream a missing blob back.
const FETCH_WAIT: Duration = Duration::from_millis(500);

/// How long a store-file handler waits for the announced stream frame to
/// reach the reader before giving up on the blob.
const STREAM_START_WAIT: Duration = Duration::from_secs(1);

/// Grace period for the message loop to wind down on stop.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct FileServerConfig {
    /// Node identifier; generated when empty.
    pub node_id: String,
    /// Shared 32-byte symmetric key.
    pub encryption_key: EncryptionKey,
    /// Root directory for blob storage.
    pub storage_root: PathBuf,
    /// On-disk layout strategy.
    pub path_transform: PathTransform,
    /// `host:port` to listen on; empty host means loopback.
    pub listen_address: String,
    /// Endpoints dialed at startup.
    pub bootstrap_nodes: Vec<String>,
    /// Inbound control-message queue capacity.
    pub queue_capacity: usize,
    /// Upper bound on control frame payloads.
    pub max_control_payload: u32,
    /// Optional accept-time allow-list.
    pub allow_predicate: Option<AllowPredicate>,
}

impl FileServerConfig {
    pub fn new(
        listen_address: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        encryption_key: EncryptionKey,
    ) -> Self {
        Self {
            node_id: String::new(),
            encryption_key,
            storage_root: storage_root.into(),
            path_transform: PathTransform::ContentAddressed,
            listen_address: listen_address.into(),
            bootstrap_nodes: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_control_payload: DEFAULT_MAX_CONTROL_PAYLOAD,
            allow_predicate: None,
        }
    }
}

/// State shared between the public facade and the message loop.
struct ServerState {
    node_id: String,
    encryption_key: EncryptionKey,
    store: Store,
    transport: Arc<TcpTransport>,
    /// Hashed keys with an outstanding `GetFile` of ours, so completed
    /// fetch responses can wake the waiting `get` call.
    pending_fetches: StdMutex<HashSet<String>>,
    fetch_done: Notify,
}

pub struct FileServer {
    state: Arc<ServerState>,
    bootstrap_nodes: Vec<String>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    message_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    /// Build a server from configuration. Fails on invalid configuration
    /// before any task is spawned.
    pub fn new(mut config: FileServerConfig) -> Result<Self> {
        ensure!(
            config.encryption_key.iter().any(|&b| b != 0),
            "encryption key must be provisioned"
        );
        if config.node_id.is_empty() {
            config.node_id = generate_node_id();
        }

        let store = Store::new(&config.storage_root, config.path_transform)
            .context("failed to initialize storage root")?;

        let transport = Arc::new(TcpTransport::new(TransportConfig {
            listen_address: config.listen_address,
            queue_capacity: config.queue_capacity,
            max_control_payload: config.max_control_payload,
            allow_predicate: config.allow_predicate,
        }));
        transport.set_on_peer(Arc::new(|peer: &Arc<Peer>| {
            info!(peer = %peer.remote_address(), "connected with peer");
        }));

        Ok(Self {
            state: Arc::new(ServerState {
                node_id: config.node_id,
                encryption_key: config.encryption_key,
                store,
                transport,
                pending_fetches: StdMutex::new(HashSet::new()),
                fetch_done: Notify::new(),
            }),
            bootstrap_nodes: config.bootstrap_nodes,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            message_loop: StdMutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    /// Actual listening address, available after [`FileServer::start`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.state.transport.peer_count()
    }

    /// Start listening, spawn the message loop, and dial bootstrap nodes.
    pub async fn start(&self) -> Result<()> {
        ensure!(
            !self.running.swap(true, Ordering::SeqCst),
            "server already running"
        );

        if let Err(e) = self.state.transport.listen_and_accept().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(anyhow::Error::new(e).context("failed to start transport"));
        }
        info!(
            node = %short_id(&self.state.node_id),
            addr = ?self.state.transport.local_addr(),
            "file server started"
        );

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let queue = state.transport.consume();
            loop {
                tokio::select! {
                    msg = queue.receive() => state.dispatch(msg).await,
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.message_loop.lock().expect("message loop lock poisoned") = Some(handle);

        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }
            let transport = self.state.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                info!(bootstrap = %addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    warn!(bootstrap = %addr, error = %e, "bootstrap dial failed");
                }
            });
        }

        Ok(())
    }

    /// Stop the message loop and close the transport. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %short_id(&self.state.node_id), "stopping file server");

        self.shutdown.notify_waiters();
        let handle = self.message_loop.lock().expect("message loop lock poisoned").take();
        if let Some(mut handle) = handle {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("message loop did not stop in time, aborting");
                handle.abort();
            }
        }
        self.state.transport.close().await;
    }

    /// Insert a blob under `key`: write locally, then replicate to every
    /// connected peer. Succeeds when the local write lands and at least
    /// one peer (if any are connected) receives the replica.
    pub async fn store<R>(&self, key: &str, mut data: R) -> Result<()>
    where
        R: Read,
    {
        ensure!(!key.is_empty(), "user key must not be empty");

        let mut plaintext = Vec::new();
        data.read_to_end(&mut plaintext).context("failed to read input data")?;

        let hashed_key = hash_key(key);
        let written = self
            .state
            .store
            .hash_and_write(&self.state.node_id, key, &mut Cursor::new(&plaintext))
            .context("local store write failed")?;
        let cipher_bytes = written + IV_SIZE as u64;
        debug!(key, hashed_key = %hashed_key, bytes = written, "stored locally");

        self.state
            .broadcast(&ControlMessage::StoreFile {
                origin: self.state.node_id.clone(),
                hashed_key,
                cipher_bytes,
            })
            .await
            .context("failed to announce insert")?;

        tokio::time::sleep(BROADCAST_SETTLE_DELAY).await;
        let peers = self.state.transport.peers();

        let mut ciphertext = Vec::with_capacity(cipher_bytes as usize);
        copy_encrypt(
            &self.state.encryption_key,
            &mut Cursor::new(&plaintext),
            &mut ciphertext,
        )
        .context("encryption failed")?;

        let mut served = 0usize;
        for peer in &peers {
            match stream_replica(peer, &ciphertext).await {
                Ok(()) => served += 1,
                Err(e) => {
                    warn!(peer = %peer.remote_address(), error = %e, "replication failed");
                }
            }
        }
        info!(key, served, peers = peers.len(), "insert replicated");
        ensure!(
            served > 0 || peers.is_empty(),
            "failed to replicate to any of {} peers",
            peers.len()
        );
        Ok(())
    }

    /// Fetch a blob by key. Serves the local store when possible,
    /// otherwise asks the network and waits a bounded interval.
    pub async fn get(&self, key: &str) -> Result<Option<(u64, File)>> {
        ensure!(!key.is_empty(), "user key must not be empty");
        let state = &self.state;

        if state.store.has(&state.node_id, key) {
            return Ok(Some(state.store.read(&state.node_id, key)?));
        }

        // A replica pushed to us earlier lives under its producer's
        // prefix; serve it without a network round trip.
        let hashed_key = hash_key(key);
        if let Some(origin) = state.store.find_origin(&hashed_key) {
            debug!(key, origin = %short_id(&origin), "serving pushed replica");
            return Ok(Some(state.store.read_stored(&origin, &hashed_key)?));
        }

        debug!(key, "not held locally, asking the network");
        state
            .pending_fetches
            .lock()
            .expect("pending fetches poisoned")
            .insert(hashed_key.clone());

        let asked = state
            .broadcast(&ControlMessage::GetFile {
                origin: state.node_id.clone(),
                hashed_key: hashed_key.clone(),
            })
            .await;

        if asked.is_ok() {
            let deadline = Instant::now() + FETCH_WAIT;
            loop {
                if state.store.has(&state.node_id, key) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let _ = timeout(deadline - now, state.fetch_done.notified()).await;
            }
        }

        state
            .pending_fetches
            .lock()
            .expect("pending fetches poisoned")
            .remove(&hashed_key);

        if state.store.has(&state.node_id, key) {
            Ok(Some(state.store.read(&state.node_id, key)?))
        } else {
            debug!(key, "not found in the network");
            Ok(None)
        }
    }

    /// Whether the blob is held locally under this node's prefix.
    pub fn has(&self, key: &str) -> bool {
        self.state.store.has(&self.state.node_id, key)
    }

    /// Remove the local blob for `key`.
    pub fn delete(&self, key: &str) -> bool {
        self.state.store.delete(&self.state.node_id, key)
    }
}

impl ServerState {
    async fn dispatch(&self, msg: InboundMessage) {
        match ControlMessage::from_json(&msg.payload) {
            Ok(ControlMessage::StoreFile {
                origin,
                hashed_key,
                cipher_bytes,
            }) => {
                if let Err(e) = self
                    .handle_store_file(&msg.from, origin, hashed_key, cipher_bytes)
                    .await
                {
                    warn!(peer = %msg.from, error = %e, "store-file handling failed");
                }
            }
            Ok(ControlMessage::GetFile { origin, hashed_key }) => {
                if let Err(e) = self.handle_get_file(&msg.from, origin, hashed_key).await {
                    warn!(peer = %msg.from, error = %e, "get-file handling failed");
                }
            }
            Err(MessageError::UnknownType(code)) => {
                warn!(peer = %msg.from, code, "unknown control type, dropped");
            }
            Err(MessageError::Malformed(e)) => {
                warn!(peer = %msg.from, error = %e, "malformed control message, dropping peer");
                self.transport.close_peer(&msg.from).await;
            }
        }
    }

    /// Consume the stream announced by a `StoreFile`, decrypt it, and
    /// persist the blob under the announced origin id.
    async fn handle_store_file(
        &self,
        from: &str,
        origin: String,
        hashed_key: String,
        cipher_bytes: u64,
    ) -> Result<()> {
        let peer = self
            .transport
            .peer(from)
            .with_context(|| format!("store-file from unknown peer {}", from))?;

        // A fetch response echoes our own node id as the blob's origin;
        // replication announces always carry the producer's id. The echo
        // is what selects the u64 fetch shape over the u32 replication
        // shape, so the two can never be confused even when a replication
        // and a fetch for the same key are in flight together.
        let fetch_response = origin == self.node_id;
        let prefix_len: u64 = if fetch_response { 8 } else { 4 };

        // The reader task consumes the stream tag and parks on the gate;
        // only then may this handler touch the socket.
        timeout(STREAM_START_WAIT, peer.wait_for_stream_start())
            .await
            .context("announced stream never arrived")?;

        // One read covers the length prefix and the body, so the stream
        // gate is released exactly once, after the socket is drained.
        let mut framed = Vec::with_capacity((prefix_len + cipher_bytes) as usize);
        peer.read_stream(&mut framed, prefix_len + cipher_bytes)
            .await
            .context("failed to read replica stream")?;

        let advertised = if fetch_response {
            framed
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_be_bytes)
        } else {
            framed
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_be_bytes)
                .map(u64::from)
        };
        if advertised != Some(cipher_bytes) {
            warn!(
                peer = %from,
                expected = cipher_bytes,
                advertised = ?advertised,
                "stream length prefix disagrees with announcement, dropping peer"
            );
            self.transport.close_peer(from).await;
            bail!("stream length mismatch from {}", from);
        }

        let mut plaintext = Vec::new();
        match copy_decrypt(
            &self.encryption_key,
            &mut &framed[prefix_len as usize..],
            &mut plaintext,
        ) {
            Ok(size) => {
                debug!(peer = %from, hashed_key = %hashed_key, bytes = size, "replica decrypted");
            }
            Err(CryptoError::TruncatedIv(got)) => {
                // Undecryptable replica: drop the blob, keep the peer.
                debug!(peer = %from, got, "replica shorter than an IV, dropped");
                return Ok(());
            }
            Err(e) => {
                debug!(peer = %from, error = %e, "replica decryption failed, dropped");
                return Ok(());
            }
        }

        let written = self
            .store
            .write(&origin, &hashed_key, &mut Cursor::new(plaintext))
            .context("failed to persist replica")?;
        info!(peer = %from, origin = %short_id(&origin), hashed_key = %hashed_key, bytes = written, "replica stored");

        // The gate was released by read_stream; this keeps the paths
        // symmetric and is a no-op.
        peer.close_stream();

        if fetch_response {
            let was_pending = self
                .pending_fetches
                .lock()
                .expect("pending fetches poisoned")
                .remove(&hashed_key);
            if was_pending {
                self.fetch_done.notify_waiters();
            } else {
                debug!(hashed_key = %hashed_key, "fetch response arrived after the wait expired");
            }
        }
        Ok(())
    }

    /// Serve a peer's fetch request if any local prefix holds the blob.
    async fn handle_get_file(&self, from: &str, origin: String, hashed_key: String) -> Result<()> {
        let source_id = if self.store.has_stored(&origin, &hashed_key) {
            Some(origin.clone())
        } else if self.store.has_stored(&self.node_id, &hashed_key) {
            Some(self.node_id.clone())
        } else {
            self.store.find_origin(&hashed_key)
        };
        let Some(source_id) = source_id else {
            debug!(peer = %from, hashed_key = %hashed_key, "fetch miss");
            return Ok(());
        };

        let peer = self
            .transport
            .peer(from)
            .with_context(|| format!("get-file from unknown peer {}", from))?;

        let (size, mut file) = self
            .store
            .read_stored(&source_id, &hashed_key)
            .context("failed to open blob for serving")?;
        let mut ciphertext = Vec::with_capacity(size as usize + IV_SIZE);
        let cipher_bytes = copy_encrypt(&self.encryption_key, &mut file, &mut ciphertext)
            .context("failed to encrypt blob for serving")?;

        // Announce with the requester's origin id so their store-file path
        // files the blob where their own lookups resolve.
        let announce = ControlMessage::StoreFile {
            origin,
            hashed_key: hashed_key.clone(),
            cipher_bytes,
        };
        peer.send(&encode_control(&announce.to_json()?)).await?;

        peer.send_tag(TAG_STREAM).await?;
        peer.send(&cipher_bytes.to_be_bytes()).await?;
        peer.write_stream(&ciphertext).await?;
        peer.close_stream();

        info!(peer = %from, hashed_key = %hashed_key, bytes = cipher_bytes, "served fetch");
        Ok(())
    }

    /// Send a control message to every peer. Succeeds when at least one
    /// peer received it, or when there are no peers at all.
    async fn broadcast(&self, msg: &ControlMessage) -> Result<()> {
        let payload = msg.to_json().context("failed to serialize control message")?;
        let frame = encode_control(&payload);

        let peers = self.transport.peers();
        if peers.is_empty() {
            return Ok(());
        }

        let mut delivered = 0usize;
        for peer in &peers {
            match peer.send(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %peer.remote_address(), error = %e, "broadcast send failed");
                }
            }
        }
        ensure!(delivered > 0, "broadcast reached none of {} peers", peers.len());
        Ok(())
    }
}

/// Stream one replica: stream tag, u32 length prefix, ciphertext.
async fn stream_replica(peer: &Arc<Peer>, ciphertext: &[u8]) -> Result<()> {
    peer.send_tag(TAG_STREAM).await?;
    peer.send(&(ciphertext.len() as u32).to_be_bytes()).await?;
    peer.write_stream(ciphertext).await?;
    peer.close_stream();
    Ok(())
}

/// First characters of a node id, for log readability.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
