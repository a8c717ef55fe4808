//! Identity of one side of a logical connection.
//!
//! An [`Endpoint`] is a network address plus a subport. Subports let one
//! process hold several independent connections to the same peer address;
//! they are generated by [`ConnectionTable::new_subport`](crate::connection::ConnectionTable::new_subport).
use std::{fmt, net::SocketAddr};

/// Multiplier of the rolling bucket hash; relatively prime to the bucket count.
const SHIFT: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
    subport: u32,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, subport: u32) -> Self {
        Self { addr, subport }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn subport(&self) -> u32 {
        self.subport
    }

    /// Rolling hash over the address bytes and the subport, in `0..limit`.
    pub fn bucket(&self, limit: usize) -> usize {
        let limit = limit.max(1) as u64;
        let mut hash = 0_u64;

        let port = self.addr.port().to_be_bytes();
        let ip = match self.addr {
            SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
            SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
        };
        for byte in port.iter().chain(ip.iter()) {
            hash = (SHIFT * hash + u64::from(*byte)) % limit;
        }
        hash = (SHIFT * hash + u64::from(self.subport)) % limit;

        hash as usize
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.addr, self.subport)
    }
}
