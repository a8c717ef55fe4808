//! The process-wide RPC handle.
//!
//! An [`Rpc`] owns one UDP socket, the engine state and the two threads
//! driving it. The same handle is used by clients (`connect`, `call`,
//! `disconnect`) and servers (`offer`, `query`, `response`); a process can
//! be both at once.
//!
//! ```no_run
//! use srpc::Rpc;
//!
//! # fn main() -> Result<(), srpc::RpcError> {
//! let rpc = Rpc::init(0)?;
//! let conn = rpc.connect("localhost", 20000, "HWDB", 1)?;
//! let reply = rpc.call(&conn, b"SQL:select * from Flows")?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! rpc.disconnect(conn)?;
//! # Ok(())
//! # }
//! ```
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::info;

use crate::{
    config::RpcConfig,
    connection::TableGuard,
    endpoint::Endpoint,
    error::RpcError,
    protocol::{Engine, EngineThreads, Transport, TransportError, UdpTransport},
    service::Service,
};

/// An established connection, as returned by [`Rpc::connect`] or
/// [`Rpc::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    endpoint: Endpoint,
}

impl Connection {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

pub struct Rpc {
    engine: Arc<Engine>,
    threads: Mutex<Option<EngineThreads>>,
    local: Mutex<SocketAddr>,
}

impl Rpc {
    /// Binds `port` (0 for any) and starts the engine with default settings.
    pub fn init(port: u16) -> Result<Self, RpcError> {
        Self::with_config(port, RpcConfig::default())
    }

    pub fn with_config(port: u16, config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let (transport, socket, local) = bind(port, &config)?;
        let engine = Arc::new(Engine::new(config, transport)?);
        let threads =
            EngineThreads::spawn(Arc::clone(&engine), socket).map_err(TransportError::from)?;
        info!("rpc engine listening on {local}");

        Ok(Self {
            engine,
            threads: Mutex::new(Some(threads)),
            local: Mutex::new(local),
        })
    }

    /// Address peers can reach this process at. An unspecified bind address
    /// is reported as the loopback address.
    pub fn details(&self) -> SocketAddr {
        let mut addr = *self.local.lock().unwrap_or_else(PoisonError::into_inner);
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        addr
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Connects to `service` on `host:port`. `seqno` is the first sequence
    /// number; each call advances it by one.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        service: &str,
        seqno: u32,
    ) -> Result<Connection, RpcError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| RpcError::Resolve(host.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| RpcError::Resolve(host.to_string()))?;
        let endpoint = self.engine.connect(addr, service, seqno)?;
        Ok(Connection { endpoint })
    }

    pub fn call(&self, connection: &Connection, query: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.engine.call(&connection.endpoint, query)
    }

    pub fn disconnect(&self, connection: Connection) -> Result<(), RpcError> {
        self.engine.disconnect(&connection.endpoint)
    }

    pub fn offer(&self, name: &str) -> Result<Arc<Service>, RpcError> {
        self.engine.offer(name)
    }

    pub fn withdraw(&self, service: &Service) {
        self.engine.withdraw(service)
    }

    /// Blocks until a query arrives for `service`.
    pub fn query(&self, service: &Service) -> (Connection, Vec<u8>) {
        let (endpoint, query) = service.pop();
        (Connection { endpoint }, query)
    }

    pub fn query_timeout(
        &self,
        service: &Service,
        timeout: Duration,
    ) -> Option<(Connection, Vec<u8>)> {
        service
            .pop_timeout(timeout)
            .map(|(endpoint, query)| (Connection { endpoint }, query))
    }

    pub fn response(
        &self,
        service: &Service,
        connection: &Connection,
        response: &[u8],
    ) -> Result<(), RpcError> {
        self.engine.respond(service, &connection.endpoint, response)
    }

    /// Holds the engine still until the guard is resumed, reinitialised or
    /// dropped.
    ///
    /// No datagram is processed and no timer tick runs while suspended.
    /// Calling any other method on this handle from the same thread before
    /// that deadlocks.
    pub fn suspend(&self) -> Suspended<'_> {
        Suspended {
            rpc: self,
            table: self.engine.table().lock(),
        }
    }

    /// Restarts the engine on `port`. Every connection is dropped and its
    /// waiters see a timeout; offered services are kept.
    pub fn reinit(&self, port: u16) -> Result<(), RpcError> {
        self.suspend().reinit(port)
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        let threads = self
            .threads
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(threads);
        info!("rpc engine stopped");
    }
}

/// Returned by [`Rpc::suspend`].
pub struct Suspended<'a> {
    rpc: &'a Rpc,
    table: TableGuard<'a>,
}

impl Suspended<'_> {
    pub fn resume(self) {}

    /// Restarts the suspended engine on `port`, e.g. in a freshly forked
    /// child, and resumes it.
    ///
    /// The old threads are parked on the table lock held by this guard, so
    /// they are only told to stop here and joined once the lock is released.
    pub fn reinit(self, port: u16) -> Result<(), RpcError> {
        let Suspended { rpc, mut table } = self;
        let mut threads = rpc.threads.lock().unwrap_or_else(PoisonError::into_inner);
        let old = threads.take();
        if let Some(old) = &old {
            old.request_stop();
        }

        let purged = table.purge_all();
        let bound = bind(port, rpc.engine.config());
        if let Ok((transport, _, _)) = &bound {
            rpc.engine.set_transport(Arc::clone(transport) as Arc<dyn Transport>);
        }
        drop(table);
        drop(old);

        let (_, socket, local) = bound?;
        *threads = Some(
            EngineThreads::spawn(Arc::clone(&rpc.engine), socket)
                .map_err(TransportError::from)?,
        );
        *rpc.local.lock().unwrap_or_else(PoisonError::into_inner) = local;

        info!("rpc engine reinitialised on {local}, {purged} connections dropped");
        Ok(())
    }
}

fn bind(
    port: u16,
    config: &RpcConfig,
) -> Result<(Arc<UdpTransport>, std::net::UdpSocket, SocketAddr), RpcError> {
    let transport = UdpTransport::bind(port)?;
    let socket = transport.receiver(config.recv_poll)?;
    let local = transport.local_addr()?;
    Ok((Arc::new(transport), socket, local))
}
