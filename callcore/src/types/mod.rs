pub mod api;
pub mod call;

pub use api::{CallMessage, CallRequest, Command, Response};
pub use call::{
    CallCapabilities, CallMediaType, CameraFacing, CandidateType, ConnectionInfo, ConnectionState,
    IceCandidate, IceServer, SdpType, SessionDescription,
};
