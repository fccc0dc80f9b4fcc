//! Wire protocol spoken with Unity editor peers.
//!
//! # Architecture
//!
//! - **handshake**: banner read and framed/legacy negotiation
//! - **codec**: 8-byte length-prefixed framing with heartbeat frames
//! - **protocol**: request/response message types
//! - **legacy**: deprecated unframed JSON reader

pub mod codec;
pub mod handshake;
pub mod legacy;
pub mod protocol;
