//! # Cryptographic Utilities
//!
//! This module provides the crypto primitives the file store relies on:
//!
//! - **Node identifiers**: 32 random bytes rendered as 64 hex characters
//! - **Key hashing**: a fixed 128-bit digest (MD5) of user keys, shared by
//!   the wire protocol and the on-disk layout
//! - **Stream encryption**: AES-256 in CTR mode with a fresh 16-byte IV
//!   prepended to every ciphertext
//!
//! ## Security Model
//!
//! The key digest is used for short, uniformly distributed paths only;
//! collision resistance is not a security property here. Integrity relies
//! on the shared encryption key and the replication protocol, not on the
//! digest.
//!
//! CTR mode carries no authentication tag: a keyholder can forge
//! ciphertexts and an on-path attacker can flip bits undetected. Adding an
//! AEAD mode is a straightforward extension; until then the layer only
//! guarantees confidentiality against non-keyholders.

use std::io::{Read, Write};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;

/// Symmetric key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Initialization vector length in bytes (AES block size).
pub const IV_SIZE: usize = 16;

/// Chunk size for streaming encryption and decryption.
const CHUNK_SIZE: usize = 8192;

/// Shared symmetric key, provisioned out of band across a deployment.
pub type EncryptionKey = [u8; KEY_SIZE];

type Aes256Ctr = Ctr128BE<Aes256>;

/// Failures in the crypto layer.
#[derive(Debug)]
pub enum CryptoError {
    /// Fewer than [`IV_SIZE`] bytes were available before EOF.
    TruncatedIv(usize),
    /// A hex-encoded key did not decode to [`KEY_SIZE`] bytes.
    InvalidKeyLength(usize),
    /// A key string contained non-hex characters.
    InvalidKeyEncoding,
    /// Underlying reader or writer failure.
    Io(std::io::Error),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::TruncatedIv(got) => {
                write!(f, "ciphertext ended after {} of {} IV bytes", got, IV_SIZE)
            }
            CryptoError::InvalidKeyLength(got) => {
                write!(f, "encryption key must be {} bytes, got {}", KEY_SIZE, got)
            }
            CryptoError::InvalidKeyEncoding => write!(f, "encryption key is not valid hex"),
            CryptoError::Io(e) => write!(f, "crypto stream I/O failed: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        CryptoError::Io(e)
    }
}

/// Generate a fresh node identifier: 64 lowercase hex characters derived
/// from 32 cryptographically random bytes.
pub fn generate_node_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random 32-byte encryption key.
pub fn new_encryption_key() -> EncryptionKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Parse a 64-character hex string into an encryption key.
pub fn parse_key_hex(s: &str) -> Result<EncryptionKey, CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKeyEncoding)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(len))
}

/// Digest a user key into the 32-character lowercase hex string that both
/// the wire protocol and the on-disk layout address blobs by.
///
/// Deterministic and identical across all nodes; any observer holding the
/// user key can predict the resulting storage path.
pub fn hash_key(key: &str) -> String {
    hex::encode(Md5::digest(key.as_bytes()))
}

/// Encrypt `src` into `dst`: a fresh random IV first, then the CTR
/// keystream applied chunk by chunk. Returns the total bytes written,
/// which is always the plaintext length plus [`IV_SIZE`].
pub fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv)?;

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    let written = apply_stream(&mut cipher, src, dst)?;
    Ok(written + IV_SIZE as u64)
}

/// Decrypt `src` into `dst`: the 16-byte IV is read first, then the
/// remainder is decrypted. Returns the plaintext length. Fails with
/// [`CryptoError::TruncatedIv`] when fewer than 16 bytes precede EOF.
pub fn copy_decrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    let mut got = 0;
    while got < IV_SIZE {
        let n = src.read(&mut iv[got..])?;
        if n == 0 {
            return Err(CryptoError::TruncatedIv(got));
        }
        got += n;
    }

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    apply_stream(&mut cipher, src, dst)
}

fn apply_stream<R, W>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = src.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buffer[..n]);
        dst.write_all(&buffer[..n])?;
        total += n as u64;
    }
    Ok(total)
}
