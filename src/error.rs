use thiserror::Error;

use crate::{
    config::ConfigError,
    connection::State,
    endpoint::Endpoint,
    protocol::{ProtocolError, TransportError},
};

/// Failures surfaced by the blocking RPC operations.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("operation on {0} timed out")]
    TimedOut(Endpoint),

    #[error("no connection to {0}")]
    UnknownConnection(Endpoint),

    #[error("connection {endpoint} is busy ({state})")]
    Busy { endpoint: Endpoint, state: State },

    #[error("payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("incomplete response from {0}")]
    IncompleteResponse(Endpoint),

    #[error("service '{0}' is already offered")]
    ServiceExists(String),

    #[error("connection {endpoint} does not belong to service '{service}'")]
    WrongService { endpoint: Endpoint, service: String },

    #[error("unable to resolve host '{0}'")]
    Resolve(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
