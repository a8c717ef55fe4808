use std::sync::Arc;

use log::info;

use crate::{connection::State, endpoint::Endpoint, error::RpcError, service::Service};

use super::{
    Command,
    engine::{Engine, record_mut},
};

impl Engine {
    /// Registers `name` so that `CONNECT`s for it are accepted.
    pub fn offer(&self, name: &str) -> Result<Arc<Service>, RpcError> {
        let service = self
            .services()
            .create(name)
            .ok_or_else(|| RpcError::ServiceExists(name.to_string()))?;
        info!("offering service '{name}'");
        Ok(service)
    }

    /// Stops accepting new connections for `service`. Established
    /// connections keep their handle until they are purged.
    pub fn withdraw(&self, service: &Service) {
        if self.services().remove(service.name()).is_some() {
            info!("withdrew service '{}'", service.name());
        }
    }

    /// Sends `response` for the query last delivered on `endpoint`.
    pub fn respond(
        &self,
        service: &Service,
        endpoint: &Endpoint,
        response: &[u8],
    ) -> Result<(), RpcError> {
        let mut ct = self.table().lock();
        let cr = record_mut(&mut ct, endpoint)?;
        match cr.service() {
            Some(owner) if owner.name() == service.name() => {}
            _ => {
                return Err(RpcError::WrongService {
                    endpoint: *endpoint,
                    service: service.name().to_string(),
                });
            }
        }
        if cr.state() != State::QackSent {
            return Err(RpcError::Busy {
                endpoint: *endpoint,
                state: cr.state(),
            });
        }

        let seqno = cr.seqno();
        self.send_fragmented(
            ct,
            endpoint,
            seqno,
            response,
            Command::Response,
            State::ResponseSent,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use crate::{
        config::RpcConfig,
        protocol::{Message, transport::recording::RecordingTransport},
    };

    use super::*;

    const SUBPORT: u32 = 0x0042_0001;

    fn client() -> SocketAddr {
        "127.0.0.1:41000".parse().unwrap()
    }

    fn feed(engine: &Engine, message: Message) {
        engine.handle_datagram(client(), &message.encode().unwrap());
    }

    fn engine() -> (Arc<RecordingTransport>, Engine) {
        let transport = Arc::new(RecordingTransport::default());
        let engine = Engine::new(RpcConfig::default(), transport.clone()).unwrap();
        (transport, engine)
    }

    #[test]
    fn offer_rejects_duplicates() {
        let (_, engine) = engine();
        let hwdb = engine.offer("HWDB").unwrap();
        assert_eq!(hwdb.name(), "HWDB");

        assert!(matches!(
            engine.offer("HWDB"),
            Err(RpcError::ServiceExists(name)) if name == "HWDB"
        ));

        engine.withdraw(&hwdb);
        assert!(engine.services().lookup("HWDB").is_none());
        engine.offer("HWDB").unwrap();
    }

    #[test]
    fn withdrawn_service_refuses_connects() {
        let (transport, engine) = engine();
        let hwdb = engine.offer("HWDB").unwrap();
        engine.withdraw(&hwdb);

        feed(&engine, Message::connect(SUBPORT, 1, "HWDB"));

        assert!(transport.take().is_empty());
        assert!(engine.table().lock().is_empty());
    }

    #[test]
    fn query_then_respond() {
        let (transport, engine) = engine();
        let hwdb = engine.offer("HWDB").unwrap();
        feed(&engine, Message::connect(SUBPORT, 1, "HWDB"));
        feed(
            &engine,
            Message::data(Command::Query, SUBPORT, 2, 1, 1, 4, b"ping".to_vec()),
        );
        transport.take();

        let (ep, query) = hwdb.pop();
        assert_eq!(query, b"ping");
        engine.respond(&hwdb, &ep, b"pong").unwrap();

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            Message::data(Command::Response, SUBPORT, 2, 1, 1, 4, b"pong".to_vec())
        );
        assert_eq!(
            engine.table().lock().lookup(&ep).unwrap().state(),
            State::ResponseSent
        );

        // a second response for the same query is refused
        assert!(matches!(
            engine.respond(&hwdb, &ep, b"again"),
            Err(RpcError::Busy { .. })
        ));

        feed(&engine, Message::control(Command::Rack, SUBPORT, 2, 1, 1));
        assert_eq!(
            engine.table().lock().lookup(&ep).unwrap().state(),
            State::Idle
        );
    }

    #[test]
    fn respond_on_other_service_is_refused() {
        let (_, engine) = engine();
        let hwdb = engine.offer("HWDB").unwrap();
        let other = engine.offer("OTHER").unwrap();
        feed(&engine, Message::connect(SUBPORT, 1, "HWDB"));
        feed(
            &engine,
            Message::data(Command::Query, SUBPORT, 2, 1, 1, 1, b"q".to_vec()),
        );
        let (ep, _) = hwdb.pop();

        assert!(matches!(
            engine.respond(&other, &ep, b"r"),
            Err(RpcError::WrongService { .. })
        ));
    }

    #[test]
    fn respond_to_unknown_connection() {
        let (_, engine) = engine();
        let hwdb = engine.offer("HWDB").unwrap();
        let ep = Endpoint::new(client(), SUBPORT);

        assert!(matches!(
            engine.respond(&hwdb, &ep, b"r"),
            Err(RpcError::UnknownConnection(_))
        ));
    }
}
