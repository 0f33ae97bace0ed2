//! End-to-end encryption of encoded media frames.
//!
//! Each frame keeps a short clear header so the packetizer can still read the
//! codec metadata; the rest is sealed with AES-256-GCM. The sealed frame is
//!
//! ```text
//! | clear header | ciphertext | tag (16) | nonce (12) |
//! ```
//!
//! so every encrypted frame is exactly [`FRAME_SUFFIX_LEN`] bytes longer than
//! the plaintext frame.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const FRAME_SUFFIX_LEN: usize = TAG_LEN + NONCE_LEN;
pub const KEY_FRAME_HEADER_LEN: usize = 10;
pub const DELTA_FRAME_HEADER_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameCryptoError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame too short: {len} bytes, need at least {required}")]
    TooShort { len: usize, required: usize },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("frame authentication failed")]
    Authentication,
    #[error("AES-GCM cipher operation failed")]
    Cipher,
    #[error("frame cryptor is detached")]
    Detached,
}

type Result<T> = std::result::Result<T, FrameCryptoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    Delta,
}

impl FrameKind {
    /// Classifies a frame by bit 0 of its first byte.
    pub fn classify(frame: &[u8]) -> Result<Self> {
        match frame.first() {
            None => Err(FrameCryptoError::EmptyFrame),
            Some(b) if b & 1 == 1 => Ok(Self::Key),
            Some(_) => Ok(Self::Delta),
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            Self::Key => KEY_FRAME_HEADER_LEN,
            Self::Delta => DELTA_FRAME_HEADER_LEN,
        }
    }
}

/// Symmetric key shared by both peers of a call.
#[derive(Clone)]
pub struct FrameKey {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl std::fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameKey")
            .field("key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl FrameKey {
    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(FrameCryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| FrameCryptoError::InvalidKey("bad key length".into()))?;
        let digest = Sha256::digest(key);
        Ok(Self {
            cipher,
            fingerprint: hex::encode(&digest[..6]),
        })
    }

    /// Parses the key string carried by `start`/`offer` commands.
    ///
    /// Accepts URL-safe and standard base64, with or without padding.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let bytes = [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD]
            .iter()
            .find_map(|engine| engine.decode(encoded).ok())
            .ok_or_else(|| FrameCryptoError::InvalidKey("not base64".into()))?;
        Self::from_bytes(&bytes)
    }

    /// Generates a fresh random key in the encoding [`Self::from_encoded`] accepts.
    pub fn generate_encoded() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        URL_SAFE_NO_PAD.encode(key)
    }

    /// Short, non-reversible identifier safe to print in logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.len() + FRAME_SUFFIX_LEN);
        encrypt_frame(self, frame, &mut out)?;
        Ok(out)
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.len());
        decrypt_frame(self, frame, &mut out)?;
        Ok(out)
    }
}

/// Encrypts `frame` into `out` with a fresh random nonce.
pub fn encrypt_frame(key: &FrameKey, frame: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_frame_with_nonce(key, &nonce, frame, out)
}

/// Deterministic form of [`encrypt_frame`]. `out` is cleared first and only
/// grows when its capacity is below `frame.len() + FRAME_SUFFIX_LEN`.
pub fn encrypt_frame_with_nonce(
    key: &FrameKey,
    nonce: &[u8; NONCE_LEN],
    frame: &[u8],
    out: &mut Vec<u8>,
) -> Result<()> {
    let header_len = FrameKind::classify(frame)?.header_len();
    if frame.len() < header_len {
        return Err(FrameCryptoError::TooShort {
            len: frame.len(),
            required: header_len,
        });
    }

    out.clear();
    out.reserve(frame.len() + FRAME_SUFFIX_LEN);
    out.extend_from_slice(frame);
    let tag = match key.cipher.encrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        &[],
        &mut out[header_len..],
    ) {
        Ok(tag) => tag,
        Err(_) => {
            out.clear();
            return Err(FrameCryptoError::Cipher);
        }
    };
    out.extend_from_slice(&tag);
    out.extend_from_slice(nonce);
    Ok(())
}

/// Decrypts a frame produced by [`encrypt_frame`] into `out`.
pub fn decrypt_frame(key: &FrameKey, frame: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let header_len = FrameKind::classify(frame)?.header_len();
    let required = header_len + FRAME_SUFFIX_LEN;
    if frame.len() < required {
        return Err(FrameCryptoError::TooShort {
            len: frame.len(),
            required,
        });
    }

    let body_end = frame.len() - FRAME_SUFFIX_LEN;
    let (body, suffix) = frame.split_at(body_end);
    let (tag, nonce) = suffix.split_at(TAG_LEN);

    out.clear();
    out.reserve(body.len());
    out.extend_from_slice(body);
    let opened = key.cipher.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        &[],
        &mut out[header_len..],
        GenericArray::from_slice(tag),
    );
    if opened.is_err() {
        out.clear();
        return Err(FrameCryptoError::Authentication);
    }
    Ok(())
}

/// Media-plane handle for one call's key.
///
/// The transport holds a clone of the `Arc` and calls into it from its media
/// threads. Once [`FrameCryptor::detach`] has run no new frame starts, and a
/// frame already in flight is discarded instead of returned. Refused calls
/// leave `out` empty and are not counted.
#[derive(Debug)]
pub struct FrameCryptor {
    key: FrameKey,
    attached: AtomicBool,
    encrypted: AtomicU64,
    decrypted: AtomicU64,
}

impl FrameCryptor {
    pub fn new(key: FrameKey) -> Self {
        Self {
            key,
            attached: AtomicBool::new(true),
            encrypted: AtomicU64::new(0),
            decrypted: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn encrypt(&self, frame: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.process(&self.encrypted, out, |out| {
            encrypt_frame(&self.key, frame, out)
        })
    }

    pub fn decrypt(&self, frame: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.process(&self.decrypted, out, |out| {
            decrypt_frame(&self.key, frame, out)
        })
    }

    fn process(
        &self,
        counter: &AtomicU64,
        out: &mut Vec<u8>,
        work: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        if !self.is_attached() {
            out.clear();
            return Err(FrameCryptoError::Detached);
        }
        work(out)?;
        // Detached while the frame was being processed.
        if !self.is_attached() {
            out.clear();
            return Err(FrameCryptoError::Detached);
        }
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of frames encrypted and decrypted so far.
    pub fn frame_counts(&self) -> (u64, u64) {
        (
            self.encrypted.load(Ordering::Relaxed),
            self.decrypted.load(Ordering::Relaxed),
        )
    }
}
