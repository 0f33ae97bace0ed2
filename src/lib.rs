pub use callcore;
pub use callcore::{codec, frame_crypto, types};

pub mod calls;
pub mod config;

pub use calls::{CallController, CallError};
pub use config::CallControllerConfig;
