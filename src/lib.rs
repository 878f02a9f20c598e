//! # Driftfs - Peer-to-Peer Distributed File Store
//!
//! Driftfs is a small distributed file store. A node accepts named inserts
//! and fetches from a local client; every insert lands on the local
//! content-addressed store and is encrypted and streamed to each connected
//! peer, so peers retain replicas. A fetch of a missing key asks the
//! network and streams the blob back from any peer that holds it.
//!
//! ## Architecture
//!
//! All inter-node bytes share one TCP connection per peer, multiplexed by
//! a one-byte frame tag that distinguishes control JSON from opaque
//! encrypted streams:
//!
//! ```text
//! ┌────────────┐   control frames   ┌─────────────┐
//! │ FileServer │◄───────────────────│  Transport  │──► one reader
//! │ (dispatch) │    bounded queue   │ (peer table)│    task per peer
//! └─────┬──────┘                    └──────┬──────┘
//!       │ encrypt / decrypt               │ stream gate
//!       ▼                                 ▼
//! ┌────────────┐                    ┌─────────────┐
//! │   Store    │                    │    Peer     │──► TCP socket
//! │ (CAS disk) │                    │ (byte moves)│
//! └────────────┘                    └─────────────┘
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | High-level API joining transport, store, and crypto |
//! | `transport` | TCP listener, dialer, peer table, per-peer readers |
//! | `peer` | One duplex connection plus the stream gate |
//! | `decoder` | Wire framing: control frames and stream markers |
//! | `channel` | Bounded MPMC queue of inbound control messages |
//! | `messages` | JSON control-message schema |
//! | `store` | Content-addressed on-disk blob store |
//! | `crypto` | Node ids, key hashing, AES-CTR stream encryption |
//!
//! ## Security Model
//!
//! All nodes in a deployment share one 32-byte symmetric key; replicas are
//! streamed as AES-256-CTR ciphertext with a fresh IV per transfer. There
//! is no authentication tag, so the layer guarantees confidentiality
//! against non-keyholders but not integrity. An accept-time allow-list can
//! restrict which endpoints become peers.

pub mod channel;
pub mod crypto;
pub mod decoder;
pub mod messages;
pub mod peer;
pub mod server;
pub mod store;
pub mod transport;

pub use crypto::{generate_node_id, hash_key, new_encryption_key, parse_key_hex, EncryptionKey};
pub use server::{FileServer, FileServerConfig};
pub use store::{PathTransform, Store};
pub use transport::{TcpTransport, TransportConfig};
