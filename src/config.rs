//! Tunable knobs of the RPC engine.
//!
//! The defaults reproduce the behaviour the protocol was designed around: a
//! 20ms timer tick, seven transmission attempts starting two ticks apart and
//! doubling on every retry, 1024 byte fragments, and an idle connection being
//! pinged once a minute and purged after three unanswered pings.
//!
//! # Example
//! ```rust
//! use srpc::config::RpcConfig;
//!
//! let config = RpcConfig {
//!     attempts: 3,
//!     ..RpcConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
use std::time::Duration;

use thiserror::Error;

/// Number of attempts before a connection is moved to `TIMEDOUT`.
pub const ATTEMPTS: u16 = 7;
/// Initial number of ticks before the first retry; doubled on each retry.
pub const TICKS: u16 = 2;
/// Max payload bytes carried by a single datagram before fragmentation.
pub const FRAGMENT_SIZE: usize = 1024;
/// One minute worth of ticks.
pub const TICKS_BETWEEN_PINGS: u16 = 60 * 50;
pub const PINGS_BEFORE_PURGE: u16 = 3;
/// Sequence numbers are reset through `SEQNO`/`SACK` once they reach this.
pub const SEQNO_LIMIT: u32 = 1_000_000_000;
pub const SEQNO_START: u32 = 0;
pub const TICK: Duration = Duration::from_millis(20);
pub const TABLE_BUCKETS: usize = 31;
pub const RECV_POLL: Duration = Duration::from_millis(50);

/// Largest datagram the reader accepts.
pub const MAX_DATAGRAM: usize = 65535;
/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65507;
/// Header (12) + data header (4).
const DATA_OVERHEAD: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("fragment size {0} does not fit in a single datagram")]
    FragmentTooLarge(usize),
}

/// Runtime configuration of an RPC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    /// Transmission attempts for an in-flight message.
    pub attempts: u16,
    /// Ticks before the first retransmission.
    pub initial_ticks: u16,
    /// Payload bytes per fragment; must match the peer.
    pub fragment_size: usize,
    /// Idle ticks between liveness pings.
    pub ticks_between_pings: u16,
    /// Pings sent (minus one) before an idle connection is purged.
    pub pings_before_purge: u16,
    /// Ceiling at which a client resynchronises its sequence number.
    pub seqno_limit: u32,
    /// Timer interval.
    pub tick: Duration,
    /// Buckets in the connection table.
    pub table_buckets: usize,
    /// Socket read timeout used by the reader to notice shutdown.
    pub recv_poll: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            attempts: ATTEMPTS,
            initial_ticks: TICKS,
            fragment_size: FRAGMENT_SIZE,
            ticks_between_pings: TICKS_BETWEEN_PINGS,
            pings_before_purge: PINGS_BEFORE_PURGE,
            seqno_limit: SEQNO_LIMIT,
            tick: TICK,
            table_buckets: TABLE_BUCKETS,
            recv_poll: RECV_POLL,
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::Zero("attempts"));
        }
        if self.initial_ticks == 0 {
            return Err(ConfigError::Zero("initial_ticks"));
        }
        if self.ticks_between_pings == 0 {
            return Err(ConfigError::Zero("ticks_between_pings"));
        }
        if self.pings_before_purge == 0 {
            return Err(ConfigError::Zero("pings_before_purge"));
        }
        if self.table_buckets == 0 {
            return Err(ConfigError::Zero("table_buckets"));
        }
        if self.fragment_size == 0 {
            return Err(ConfigError::Zero("fragment_size"));
        }
        if self.fragment_size + DATA_OVERHEAD > MAX_UDP_PAYLOAD {
            return Err(ConfigError::FragmentTooLarge(self.fragment_size));
        }
        Ok(())
    }

    /// Largest payload a single call or response may carry; bounded by the
    /// 16-bit total length and the 8-bit fragment count on the wire.
    pub fn max_payload(&self) -> usize {
        (u16::MAX as usize).min(self.fragment_size * u8::MAX as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RpcConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.attempts, 7);
        assert_eq!(config.initial_ticks, 2);
        assert_eq!(config.ticks_between_pings, 3000);
        assert_eq!(config.max_payload(), 65535);
    }

    #[test]
    fn rejects_zero_attempts() {
        let config = RpcConfig {
            attempts: 0,
            ..RpcConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("attempts")));
    }

    #[test]
    fn rejects_oversized_fragments() {
        let config = RpcConfig {
            fragment_size: 65500,
            ..RpcConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::FragmentTooLarge(65500))
        );
    }

    #[test]
    fn small_fragments_bound_max_payload() {
        let config = RpcConfig {
            fragment_size: 10,
            ..RpcConfig::default()
        };
        assert_eq!(config.max_payload(), 2550);
    }
}
