//! Sealing of persisted queue state.
//!
//! A sealed blob is a fixed header followed by the XChaCha20-Poly1305
//! ciphertext and its tag:
//!
//! ```text
//! "MSYNSEAL" | format u32 LE | key_id u32 LE | nonce[24] | ciphertext | tag[16]
//! ```
//!
//! The header is authenticated through the AAD, so a blob cannot be replayed
//! under a different key id or format.

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use zeroize::Zeroize;

const MAGIC: &[u8; 8] = b"MSYNSEAL";
const FORMAT: u32 = 1;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 4 + 4 + NONCE_LEN;
pub const KEY_LEN: usize = 32;

/// Upper bound on a single sealed value. Matches the largest snapshot a
/// store will write.
pub const MAX_SEALED_BYTES: usize = 128 * 1024 * 1024;
const MAX_AAD_BYTES: usize = 4 * 1024;
const MAX_CONTEXT_FIELD: usize = 512;

/// Why a sealed blob could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Truncated,
    BadMagic,
    UnknownFormat(u32),
    UnknownKey(u32),
    /// Wrong key, wrong context, or tampered bytes.
    Authentication,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("key id 0 is reserved")]
    ReservedKeyId,

    #[error("key {0} is not in the ring")]
    UnknownKey(u32),

    #[error("key {0} is primary and cannot be removed")]
    PrimaryKeyInUse(u32),

    #[error("key ring is empty")]
    NoPrimaryKey,

    #[error("{what} of {size} bytes exceeds {max}")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    #[error("associated data must not be empty")]
    MissingContext,

    #[error("os randomness unavailable")]
    Randomness,

    #[error("seal failed")]
    Seal,

    #[error("cannot open sealed blob: {0:?}")]
    Open(OpenFailure),

    #[error("key ring lock poisoned")]
    LockPoisoned,
}

/// Seals and opens opaque blobs bound to caller-supplied associated data.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Nonce source. Swappable so tests can be deterministic.
pub trait NonceSource: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl NonceSource for OsRandom {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::Randomness)
    }
}

#[derive(Default)]
struct Keys {
    by_id: BTreeMap<u32, Secret<[u8; KEY_LEN]>>,
    primary: Option<u32>,
}

/// Symmetric keys by id. New blobs are sealed with the primary key; any key
/// still present can open older ones, which is how rotation works.
pub struct KeyRing<N: NonceSource = OsRandom> {
    keys: RwLock<Keys>,
    nonces: N,
    open_failures: AtomicU64,
}

impl KeyRing<OsRandom> {
    /// Ring holding one key with id 1.
    pub fn single(key: &[u8]) -> Result<Self, CryptoError> {
        let ring = Self::new(OsRandom);
        ring.add_key(1, key)?;
        Ok(ring)
    }
}

impl<N: NonceSource> KeyRing<N> {
    pub fn new(nonces: N) -> Self {
        Self {
            keys: RwLock::new(Keys::default()),
            nonces,
            open_failures: AtomicU64::new(0),
        }
    }

    /// The first key added becomes primary.
    pub fn add_key(&self, key_id: u32, key: &[u8]) -> Result<(), CryptoError> {
        if key_id == 0 {
            return Err(CryptoError::ReservedKeyId);
        }
        let mut bytes: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?;

        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        keys.by_id.insert(key_id, Secret::new(bytes));
        keys.primary.get_or_insert(key_id);
        bytes.zeroize();
        Ok(())
    }

    pub fn set_primary(&self, key_id: u32) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        if !keys.by_id.contains_key(&key_id) {
            return Err(CryptoError::UnknownKey(key_id));
        }
        keys.primary = Some(key_id);
        Ok(())
    }

    /// Drops a retired key. Blobs sealed with it become unreadable.
    pub fn remove_key(&self, key_id: u32) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        if keys.primary == Some(key_id) {
            return Err(CryptoError::PrimaryKeyInUse(key_id));
        }
        keys.by_id.remove(&key_id);
        Ok(())
    }

    /// Number of blobs that failed to open since construction.
    pub fn open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::Relaxed)
    }

    fn cipher(&self, key_id: Option<u32>) -> Result<(u32, XChaCha20Poly1305), CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockPoisoned)?;
        let key_id = key_id.or(keys.primary).ok_or(CryptoError::NoPrimaryKey)?;
        let secret = keys
            .by_id
            .get(&key_id)
            .ok_or(CryptoError::Open(OpenFailure::UnknownKey(key_id)))?;
        Ok((key_id, XChaCha20Poly1305::new(Key::from_slice(secret.expose_secret()))))
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        require_aad(aad)?;
        if sealed.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError::Open(OpenFailure::Truncated));
        }
        if sealed.len() > MAX_SEALED_BYTES + HEADER_LEN + TAG_LEN {
            return Err(CryptoError::TooLarge {
                what: "sealed blob",
                size: sealed.len(),
                max: MAX_SEALED_BYTES + HEADER_LEN + TAG_LEN,
            });
        }

        let (header, rest) = sealed.split_at(HEADER_LEN);
        if &header[..8] != MAGIC {
            return Err(CryptoError::Open(OpenFailure::BadMagic));
        }
        let format = read_u32(&header[8..12]);
        if format != FORMAT {
            return Err(CryptoError::Open(OpenFailure::UnknownFormat(format)));
        }
        let key_id = read_u32(&header[12..16]);
        let (_, cipher) = self.cipher(Some(key_id))?;

        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let mut plaintext = ciphertext.to_vec();
        let bound = bound_aad(header, aad);
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&header[16..]),
                &bound,
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Open(OpenFailure::Authentication))?;
        Ok(plaintext)
    }
}

impl<N: NonceSource> CryptoProvider for KeyRing<N> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        require_aad(aad)?;
        if plaintext.len() > MAX_SEALED_BYTES {
            return Err(CryptoError::TooLarge {
                what: "plaintext",
                size: plaintext.len(),
                max: MAX_SEALED_BYTES,
            });
        }
        let (key_id, cipher) = self.cipher(None)?;

        let mut nonce = [0u8; NONCE_LEN];
        self.nonces.fill(&mut nonce)?;

        let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT.to_le_bytes());
        out.extend_from_slice(&key_id.to_le_bytes());
        out.extend_from_slice(&nonce);
        let bound = bound_aad(&out, aad);

        let mut body = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), &bound, &mut body)
            .map_err(|_| CryptoError::Seal)?;
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open(sealed, aad).map_err(|e| {
            self.open_failures.fetch_add(1, Ordering::Relaxed);
            e
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn require_aad(aad: &[u8]) -> Result<(), CryptoError> {
    if aad.is_empty() {
        return Err(CryptoError::MissingContext);
    }
    if aad.len() > MAX_AAD_BYTES {
        return Err(CryptoError::TooLarge {
            what: "associated data",
            size: aad.len(),
            max: MAX_AAD_BYTES,
        });
    }
    Ok(())
}

fn bound_aad(header: &[u8], aad: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(header.len() + aad.len());
    bound.extend_from_slice(header);
    bound.extend_from_slice(aad);
    bound
}

/// Binds sealed state to the account and installation that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    user_id: String,
    device_id: String,
}

impl StoreContext {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// AAD for one store. Fields are length-prefixed so their boundaries
    /// cannot shift.
    pub fn aad(&self, store_name: &str, schema_version: u32) -> Result<Vec<u8>, CryptoError> {
        let mut aad = b"mutation-sync".to_vec();
        for field in [store_name, self.user_id.as_str(), self.device_id.as_str()] {
            let len = u16::try_from(field.len())
                .ok()
                .filter(|&n| usize::from(n) <= MAX_CONTEXT_FIELD)
                .ok_or(CryptoError::TooLarge {
                    what: "context field",
                    size: field.len(),
                    max: MAX_CONTEXT_FIELD,
                })?;
            aad.extend_from_slice(&len.to_le_bytes());
            aad.extend_from_slice(field.as_bytes());
        }
        aad.extend_from_slice(&schema_version.to_le_bytes());
        Ok(aad)
    }
}
