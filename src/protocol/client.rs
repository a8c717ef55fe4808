//! Blocking client operations: connect, call and disconnect.
use std::net::SocketAddr;

use log::debug;

use crate::{
    config::SEQNO_START,
    connection::{ConnectionRecord, State},
    endpoint::Endpoint,
    error::RpcError,
};

use super::{
    Command, Message,
    engine::{Engine, record_mut},
};

impl Engine {
    /// Opens a connection to `service` at `addr`, starting the sequence at
    /// `seqno`. Blocks until the server acknowledges or retries run out.
    pub fn connect(
        &self,
        addr: SocketAddr,
        service: &str,
        seqno: u32,
    ) -> Result<Endpoint, RpcError> {
        let endpoint = Endpoint::new(addr, self.table().new_subport());

        let mut ct = self.table().lock();
        let mut cr = ConnectionRecord::new(endpoint, seqno, self.config());
        self.arm(&mut cr, Message::connect(endpoint.subport(), seqno, service))?;
        cr.set_state(State::ConnectSent);
        ct.insert(cr);

        let (mut ct, state) =
            self.table()
                .wait_for_state(ct, &endpoint, &[State::Idle, State::TimedOut]);
        if state == State::TimedOut {
            ct.remove(&endpoint);
            return Err(RpcError::TimedOut(endpoint));
        }
        debug!("connected to '{service}' at {endpoint}");
        Ok(endpoint)
    }

    /// Sends `query` and blocks for the complete response.
    pub fn call(&self, endpoint: &Endpoint, query: &[u8]) -> Result<Vec<u8>, RpcError> {
        let max = self.config().max_payload();
        if query.len() > max {
            return Err(RpcError::PayloadTooLarge {
                len: query.len(),
                max,
            });
        }

        let mut ct = self.table().lock();
        let cr = record_mut(&mut ct, endpoint)?;
        if cr.state() != State::Idle {
            return Err(RpcError::Busy {
                endpoint: *endpoint,
                state: cr.state(),
            });
        }

        if cr.seqno() >= self.config().seqno_limit {
            debug!("resetting sequence numbers for {cr}");
            self.arm(
                cr,
                Message::control(Command::Seqno, endpoint.subport(), SEQNO_START, 1, 1),
            )?;
            cr.set_seqno(SEQNO_START);
            cr.set_state(State::SeqnoSent);

            let (guard, state) =
                self.table()
                    .wait_for_state(ct, endpoint, &[State::Idle, State::TimedOut]);
            ct = guard;
            if state == State::TimedOut {
                return Err(RpcError::TimedOut(*endpoint));
            }
        }

        let cr = record_mut(&mut ct, endpoint)?;
        let seqno = cr.seqno().wrapping_add(1);
        cr.set_seqno(seqno);
        cr.take_inbound();

        let ct =
            self.send_fragmented(ct, endpoint, seqno, query, Command::Query, State::QuerySent)?;
        let (mut ct, state) =
            self.table()
                .wait_for_state(ct, endpoint, &[State::Idle, State::TimedOut]);
        if state == State::TimedOut {
            return Err(RpcError::TimedOut(*endpoint));
        }

        match record_mut(&mut ct, endpoint)?.take_inbound() {
            Some(response) if response.is_complete() => Ok(response.into_bytes()),
            _ => Err(RpcError::IncompleteResponse(*endpoint)),
        }
    }

    /// Tears the connection down. Returns once the server acknowledged or
    /// retries ran out; either way the record is purged on the next tick.
    pub fn disconnect(&self, endpoint: &Endpoint) -> Result<(), RpcError> {
        let mut ct = self.table().lock();
        let cr = record_mut(&mut ct, endpoint)?;
        let seqno = cr.seqno();
        self.arm(
            cr,
            Message::control(Command::Disconnect, endpoint.subport(), seqno, 1, 1),
        )?;
        cr.set_state(State::DisconnectSent);

        let (_ct, state) = self.table().wait_for_state(ct, endpoint, &[State::TimedOut]);
        debug!("disconnected {endpoint} ({state})");
        Ok(())
    }
}
