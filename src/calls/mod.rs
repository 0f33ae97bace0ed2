//! Peer-to-peer call control.
//!
//! # Architecture
//!
//! - [`CallController`]: executes signaling commands against the single
//!   active call and reports transport events
//! - [`SignalingSession`]: offer/answer bookkeeping for one peer connection
//! - [`PeerConnection`] & [`PeerConnectionFactory`]: the media stack seam
//! - [`CallState`] & [`CallInfo`]: call lifecycle state machine
//! - [`memory`]: in-process transport for tests and demos
//!
//! Signaling payloads (session descriptions and candidate lists) are opaque
//! text produced by [`callcore::codec`]; carrying them to the peer is the
//! caller's job.

mod controller;
mod error;
pub mod memory;
mod session;
mod state;
mod transport;
mod wait;

pub use controller::CallController;
pub use error::{CallError, SessionError, TransportError};
pub use session::SignalingSession;
pub use state::{CallDirection, CallInfo, CallState, CallTransition, EndReason, InvalidTransition};
pub use transport::{
    PeerConnection, PeerConnectionFactory, SessionConfig, TransportEvent, TransportEventSender,
};
pub use wait::wait_with_timeout;
