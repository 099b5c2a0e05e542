// sfurelay API Library
//
// HTTP router, signaling WebSocket gateway and signaling router

pub mod heartbeat;
pub mod http;
pub mod signaling;

// Re-export commonly used types
pub use http::{create_router, AppState, GatewaySettings};
pub use signaling::{ConnectionContext, SignalingRouter};
