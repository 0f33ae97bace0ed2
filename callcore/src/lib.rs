//! Runtime-agnostic building blocks for peer-to-peer calls: the signaling
//! wire types, the payload codec, media frame encryption and the transport
//! state taxonomy.

pub use aes_gcm;

pub mod candidate;
pub mod codec;
pub mod frame_crypto;
pub mod ice;
pub mod planar;
pub mod states;
pub mod types;
