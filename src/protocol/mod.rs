//! The datagram RPC protocol.
//!
//! Everything between the public [`Rpc`](crate::Rpc) handle and the UDP
//! socket lives here:
//!
//! - [`message`]: the wire format, a fixed 12 byte header in network order
//!   followed by an optional service name or data block.
//! - [`fragment`]: splitting payloads into fixed size fragments and putting
//!   them back together.
//! - [`Engine`]: the state machine. It owns the connection and service
//!   tables, handles every inbound datagram and retransmits on timer ticks.
//!   Its blocking client and server operations are implemented in the
//!   `client` and `server` modules.
//! - [`EngineThreads`]: the reader and timer threads that drive an engine.
//! - [`Transport`]: the outbound half of the socket.
//!
//! # Reliability
//!
//! Every request carries a sequence number and is answered by a matching
//! acknowledgement. Unacknowledged messages are resent with exponential
//! backoff until an attempt ceiling is reached, after which the connection
//! is marked `TIMEDOUT`. Idle connections are pinged and eventually purged
//! if the peer stops answering.
mod client;
mod engine;
pub mod fragment;
pub mod message;
mod server;
mod thread;
mod transport;

pub use engine::Engine;
pub use message::{Body, Command, Message, ProtocolError};
pub use thread::EngineThreads;
pub use transport::{Transport, TransportError, UdpTransport};
