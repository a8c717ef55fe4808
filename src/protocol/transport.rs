use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use thiserror::Error;

use super::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Outbound half of the datagram socket.
pub trait Transport: Send + Sync {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), TransportError>;
}

/// UDP socket bound on all IPv4 interfaces.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds to `port`, or to an ephemeral port when `port` is 0.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// A handle for the reader thread; reads time out after `poll` so the
    /// reader can notice shutdown.
    pub fn receiver(&self, poll: Duration) -> Result<UdpSocket, TransportError> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(poll))?;
        Ok(socket)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(bytes, addr)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::{
        net::SocketAddr,
        sync::{Mutex, PoisonError},
    };

    use crate::protocol::{Command, Message};

    use super::{Transport, TransportError};

    /// Keeps every sent datagram, decoded, for inspection.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, Message)>>,
    }

    impl RecordingTransport {
        pub(crate) fn take(&self) -> Vec<(SocketAddr, Message)> {
            std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
        }

        pub(crate) fn take_commands(&self) -> Vec<Command> {
            self.take().into_iter().map(|(_, m)| m.command).collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
            let message = Message::decode(bytes)?;
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((addr, message));
            Ok(())
        }
    }
}
