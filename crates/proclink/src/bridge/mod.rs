//! Wire layer for parent-child communication.
//!
//! # Architecture
//!
//! - **protocol**: Envelope and request/reply payload shapes, reserved event names
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: the duplex byte channels a Link can sit on

pub mod codec;
pub mod protocol;
pub mod transport;
