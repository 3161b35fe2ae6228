//! Client-facing protocols and the encrypted tunnel.
//!
//! Local side: classify each accepted connection as SOCKS5 or HTTP proxy,
//! extract the target, perform the tunnel handshake, relay.
//! Remote side: read the tunnel handshake, dial the target, relay.

pub mod frame;
pub mod frontend;
pub mod http;
pub mod relay;
pub mod socks5;
pub mod tunnel;

pub use frame::{read_frame, write_frame, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use frontend::{read_request, ClientRequest, Protocol};
pub use relay::{CloseReason, FrameObserver, Relay, RelayOutcome};
pub use tunnel::{open_tunnel, read_handshake, write_handshake, TunnelTarget};
