//! A small RPC system over UDP.
//!
//! Clients open connections to named services offered by server processes,
//! issue blocking calls and receive byte-array responses. Reliability is
//! provided on top of plain datagrams with sequence numbers,
//! acknowledgements, retransmission with exponential backoff, liveness
//! pings and fragmentation of payloads larger than one fragment.
//!
//! Start with [`Rpc`].
pub mod cli;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod service;

pub use config::RpcConfig;
pub use error::RpcError;
pub use rpc::{Connection, Rpc, Suspended};
pub use service::Service;
