//! Wire-level WebSocket (RFC 6455) protocol code shared by the server crates.
//!
//! Everything in this crate is pure: byte-order conversions, the frame
//! header codec, the message model, payload chaining, and the handshake
//! accept token. No I/O happens here.

pub mod chain;
pub mod constants;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod wire;

// Re-export primary types for convenience.
pub use chain::PayloadChain;
pub use frame::FrameHeader;
pub use message::Message;
pub use wire::WireError;
