//! Compact text encoding for signaling payloads.
//!
//! A value is serialized to JSON, zlib-compressed and base64-encoded so it can
//! ride inside a chat message. [`decode`] reverses the three steps.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on the inflated size of a decoded payload.
pub const MAX_DECODED_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("zlib error: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("decoded payload exceeds {MAX_DECODED_LEN} bytes")]
    TooLarge,
}

type Result<T> = std::result::Result<T, CodecError>;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::best());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    let compressed = STANDARD.decode(text.trim())?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .take(MAX_DECODED_LEN as u64 + 1)
        .read_to_end(&mut json)?;
    if json.len() > MAX_DECODED_LEN {
        return Err(CodecError::TooLarge);
    }
    Ok(serde_json::from_slice(&json)?)
}
