//! The protocol state machine.
//!
//! [`Engine::handle_datagram`] is what the reader thread runs for every
//! datagram and [`Engine::tick`] is what the timer thread runs every tick.
//! Neither returns errors: protocol violations are logged and dropped, and
//! the only visible effect of anything the engine does is a state change
//! on some connection record, which wakes whoever is blocked on it.
//!
//! # Accepting messages
//!
//! Each data-bearing message is classified as
//!
//! - new work: strictly the next sequence number (or the next fragment of
//!   the payload being reassembled). It is accepted and acknowledged.
//! - a duplicate: an exact replay of what was last accepted. The cached
//!   acknowledgement is sent again and nothing else changes.
//! - anything else (stale, out of order, malformed) is dropped.
//!
//! Acknowledgements only move a record forward when both the sequence
//! number and the in-flight state match.
use std::{
    net::SocketAddr,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{Level, debug, error, log_enabled, trace, warn};

use crate::{
    config::RpcConfig,
    connection::{
        ConnectionRecord, ConnectionTable, Connections, Outbound, Scan, State, TableGuard,
    },
    endpoint::Endpoint,
    error::RpcError,
    service::ServiceTable,
};

use super::{
    Command, Message, ProtocolError, Transport,
    fragment::{self, Reassembly},
};

/// The connection table is dumped at trace level this often.
const TABLE_DUMP_TICKS: u64 = 500;

enum Accept {
    New,
    Duplicate,
    Reject,
}

pub struct Engine {
    config: RpcConfig,
    table: ConnectionTable,
    services: ServiceTable,
    transport: RwLock<Arc<dyn Transport>>,
    ticks: AtomicU64,
}

impl Engine {
    pub fn new(config: RpcConfig, transport: Arc<dyn Transport>) -> Result<Self, RpcError> {
        config.validate()?;
        Ok(Self {
            table: ConnectionTable::new(config.table_buckets),
            services: ServiceTable::new(),
            transport: RwLock::new(transport),
            ticks: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = transport;
    }

    fn send(&self, endpoint: &Endpoint, bytes: &[u8]) {
        let transport = Arc::clone(
            &self
                .transport
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let Err(e) = transport.send_to(bytes, endpoint.addr()) {
            warn!("send to {endpoint} failed: {e}");
        }
    }

    /// Sends a one-off message that is not retained for retransmission.
    fn send_message(&self, endpoint: &Endpoint, message: &Message) -> Result<(), ProtocolError> {
        let bytes = message.encode()?;
        trace!("send {endpoint}: {message}");
        self.send(endpoint, &bytes);
        Ok(())
    }

    /// Makes `message` the record's pending payload, restarting the retry
    /// countdown, and sends it.
    pub(crate) fn arm(
        &self,
        record: &mut ConnectionRecord,
        message: Message,
    ) -> Result<(), ProtocolError> {
        let bytes = message.encode()?;
        let endpoint = record.endpoint();
        trace!("send {endpoint}: {message}");
        self.send(&endpoint, &bytes);
        record.set_payload(
            Outbound {
                command: message.command,
                bytes,
            },
            self.config.attempts,
            self.config.initial_ticks,
        );
        Ok(())
    }

    /// Sends the retained payload again, byte for byte.
    fn resend(&self, record: &ConnectionRecord) {
        if let Some(pending) = record.pending() {
            let endpoint = record.endpoint();
            trace!("resend {endpoint}: {} ({} bytes)", pending.command, pending.bytes.len());
            self.send(&endpoint, &pending.bytes);
        }
    }

    /// Splits `payload` and sends it as `FRAGMENT`s followed by one `last`
    /// message, waiting for each `FACK` before sending the next fragment.
    /// Returns once the final message is armed and the record is in
    /// `last_state`.
    pub(crate) fn send_fragmented<'a>(
        &'a self,
        mut ct: TableGuard<'a>,
        endpoint: &Endpoint,
        seqno: u32,
        payload: &[u8],
        last: Command,
        last_state: State,
    ) -> Result<TableGuard<'a>, RpcError> {
        let max = self.config.max_payload();
        if payload.len() > max {
            return Err(RpcError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let total = payload.len() as u16;
        let fragments = fragment::split(payload, self.config.fragment_size);
        let Some((tail, init)) = fragments.split_last() else {
            return Ok(ct);
        };

        for f in init {
            let cr = record_mut(&mut ct, endpoint)?;
            cr.set_last_fragment(f.number);
            self.arm(
                cr,
                Message::data(
                    Command::Fragment,
                    endpoint.subport(),
                    seqno,
                    f.number,
                    f.count,
                    total,
                    f.bytes.to_vec(),
                ),
            )?;
            cr.set_state(State::FragmentSent);

            let (guard, state) = self.table.wait_for_state(
                ct,
                endpoint,
                &[State::FackReceived, State::TimedOut],
            );
            ct = guard;
            if state == State::TimedOut {
                return Err(RpcError::TimedOut(*endpoint));
            }
        }

        let cr = record_mut(&mut ct, endpoint)?;
        self.arm(
            cr,
            Message::data(
                last,
                endpoint.subport(),
                seqno,
                tail.number,
                tail.count,
                total,
                tail.bytes.to_vec(),
            ),
        )?;
        cr.set_state(last_state);
        Ok(ct)
    }

    /// Runs one received datagram through the state machine.
    pub fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let message = match Message::decode(buf) {
            Ok(message) => message,
            Err(ProtocolError::UnknownCommand(code)) => {
                error!("illegal command {code} received from {from}");
                return;
            }
            Err(e) => {
                debug!("dropping datagram from {from}: {e}");
                return;
            }
        };

        let endpoint = Endpoint::new(from, message.subport);
        trace!("recv {endpoint}: {message}");

        let mut ct = self.table.lock();
        if let Err(e) = self.dispatch(&mut ct, endpoint, &message) {
            warn!("failed to handle {} from {endpoint}: {e}", message.command);
        }
    }

    fn dispatch(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        match msg.command {
            Command::Connect => self.on_connect(ct, endpoint, msg),
            Command::Query => self.on_query(ct, endpoint, msg),
            Command::Response => self.on_response(ct, endpoint, msg),
            Command::Fragment => self.on_fragment(ct, endpoint, msg),
            Command::Disconnect => self.on_disconnect(ct, endpoint, msg),
            Command::Ping => self.on_ping(ct, endpoint, msg),
            Command::Seqno => self.on_seqno(ct, endpoint, msg),
            Command::Cack => {
                acknowledge(ct, &endpoint, msg, State::ConnectSent, State::Idle);
                Ok(())
            }
            Command::Qack => {
                acknowledge(ct, &endpoint, msg, State::QuerySent, State::AwaitingResponse);
                Ok(())
            }
            Command::Rack => {
                acknowledge(ct, &endpoint, msg, State::ResponseSent, State::Idle);
                Ok(())
            }
            Command::Dack => {
                acknowledge(ct, &endpoint, msg, State::DisconnectSent, State::TimedOut);
                Ok(())
            }
            Command::Sack => {
                acknowledge(ct, &endpoint, msg, State::SeqnoSent, State::Idle);
                Ok(())
            }
            Command::Fack => {
                if let Some(cr) = ct.lookup_mut(&endpoint) {
                    if cr.seqno() == msg.seqno
                        && cr.state() == State::FragmentSent
                        && cr.last_fragment() == msg.fragment
                    {
                        cr.set_state(State::FackReceived);
                    }
                }
                Ok(())
            }
            Command::Pack => {
                if let Some(cr) = ct.lookup_mut(&endpoint) {
                    let state = cr.state();
                    cr.set_state(state);
                }
                Ok(())
            }
        }
    }

    fn on_connect(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let name = msg.service().unwrap_or_default();
        let Some(service) = self.services.lookup(name) else {
            debug!("CONNECT from {endpoint} for unknown service '{name}'");
            return Ok(());
        };
        let cack = Message::control(Command::Cack, endpoint.subport(), msg.seqno, 1, 1);

        match ct.lookup_mut(&endpoint) {
            None => {
                let mut cr = ConnectionRecord::new(endpoint, msg.seqno, &self.config);
                cr.set_service(service);
                self.arm(&mut cr, cack)?;
                cr.set_state(State::Idle);
                debug!("accepted connection {cr} for '{name}'");
                ct.insert(cr);
            }
            Some(cr) if cr.state() == State::Idle => {
                cr.set_service(service);
                self.arm(cr, cack)?;
                cr.set_state(State::Idle);
            }
            Some(cr) => debug!("CONNECT from {endpoint} ignored in {}", cr.state()),
        }
        Ok(())
    }

    fn on_query(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let Some(cr) = ct.lookup_mut(&endpoint) else {
            return Ok(());
        };
        let Some(service) = cr.service().cloned() else {
            debug!("QUERY for {cr} without a service");
            return Ok(());
        };
        if !numbered_in_range(msg) {
            debug!(
                "QUERY from {endpoint} with bad fragment number {}/{}",
                msg.fragment, msg.fragments
            );
            return Ok(());
        }
        let state = cr.state();

        let mut query = None;
        let accept = if msg.seqno.wrapping_sub(cr.seqno()) == 1
            && matches!(state, State::Idle | State::ResponseSent)
        {
            if msg.bytes().len() == msg.total_len() {
                cr.set_seqno(msg.seqno);
                query = Some(msg.bytes().to_vec());
                Accept::New
            } else {
                Accept::Reject
            }
        } else if msg.seqno == cr.seqno()
            && state == State::FackSent
            && msg.fragment == msg.fragments
            && follows(cr.last_fragment(), msg.fragment)
        {
            query = finish_reassembly(cr, msg);
            if query.is_some() { Accept::New } else { Accept::Reject }
        } else if msg.seqno == cr.seqno()
            && matches!(state, State::QackSent | State::ResponseSent)
        {
            Accept::Duplicate
        } else {
            Accept::Reject
        };

        match (accept, query) {
            (Accept::New, Some(query)) => {
                self.arm(
                    cr,
                    Message::control(
                        Command::Qack,
                        endpoint.subport(),
                        msg.seqno,
                        msg.fragment,
                        msg.fragments,
                    ),
                )?;
                service.push(endpoint, query);
                cr.set_state(State::QackSent);
            }
            (Accept::Duplicate, _) => {
                self.resend(cr);
                cr.set_state(state);
            }
            _ => debug!("QUERY {} from {endpoint} dropped in {state}", msg.seqno),
        }
        Ok(())
    }

    fn on_response(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let Some(cr) = ct.lookup_mut(&endpoint) else {
            return Ok(());
        };
        if msg.seqno != cr.seqno() {
            return Ok(());
        }
        if !numbered_in_range(msg) {
            debug!(
                "RESPONSE from {endpoint} with bad fragment number {}/{}",
                msg.fragment, msg.fragments
            );
            return Ok(());
        }
        let state = cr.state();

        let accept = if matches!(state, State::QuerySent | State::AwaitingResponse) {
            if msg.bytes().len() == msg.total_len() {
                cr.set_inbound(Reassembly::whole(msg.bytes().to_vec()));
                Accept::New
            } else {
                Accept::Reject
            }
        } else if state == State::FackSent
            && msg.fragment == msg.fragments
            && follows(cr.last_fragment(), msg.fragment)
        {
            match cr.inbound().map(|r| r.accept(msg.fragment, msg.bytes())) {
                Some(Ok(())) => {
                    cr.set_last_fragment(msg.fragment);
                    Accept::New
                }
                Some(Err(e)) => {
                    debug!("final RESPONSE fragment from {endpoint} rejected: {e}");
                    Accept::Reject
                }
                None => Accept::Reject,
            }
        } else if state == State::Idle
            && cr.pending().map(|p| p.command) == Some(Command::Rack)
        {
            Accept::Duplicate
        } else {
            Accept::Reject
        };

        match accept {
            Accept::New => {
                self.arm(
                    cr,
                    Message::control(
                        Command::Rack,
                        endpoint.subport(),
                        msg.seqno,
                        msg.fragment,
                        msg.fragments,
                    ),
                )?;
                cr.set_state(State::Idle);
            }
            Accept::Duplicate => {
                self.resend(cr);
                cr.set_state(state);
            }
            Accept::Reject => debug!("RESPONSE {} from {endpoint} dropped in {state}", msg.seqno),
        }
        Ok(())
    }

    fn on_fragment(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let Some(cr) = ct.lookup_mut(&endpoint) else {
            return Ok(());
        };
        // the tail always travels as QUERY or RESPONSE
        if msg.fragment == 0 || msg.fragment >= msg.fragments {
            debug!(
                "FRAGMENT from {endpoint} with bad fragment number {}/{}",
                msg.fragment, msg.fragments
            );
            return Ok(());
        }
        let state = cr.state();

        let starts_query = matches!(state, State::Idle | State::ResponseSent)
            && msg.seqno.wrapping_sub(cr.seqno()) == 1
            && msg.fragment == 1;
        let starts_response = matches!(state, State::QuerySent | State::AwaitingResponse)
            && msg.seqno == cr.seqno()
            && msg.fragment == 1;

        let accept = if starts_query || starts_response {
            match Reassembly::start(msg.total_len(), self.config.fragment_size, msg.bytes()) {
                Ok(reassembly) => {
                    cr.set_seqno(msg.seqno);
                    cr.set_inbound(reassembly);
                    Accept::New
                }
                Err(e) => {
                    debug!("first FRAGMENT from {endpoint} rejected: {e}");
                    Accept::Reject
                }
            }
        } else if msg.seqno == cr.seqno()
            && state == State::FackSent
            && follows(cr.last_fragment(), msg.fragment)
        {
            match cr.inbound().map(|r| r.accept(msg.fragment, msg.bytes())) {
                Some(Ok(())) => Accept::New,
                Some(Err(e)) => {
                    debug!("FRAGMENT from {endpoint} rejected: {e}");
                    Accept::Reject
                }
                None => Accept::Reject,
            }
        } else if msg.seqno == cr.seqno()
            && state == State::FackSent
            && msg.fragment == cr.last_fragment()
        {
            Accept::Duplicate
        } else {
            Accept::Reject
        };

        match accept {
            Accept::New => {
                cr.set_last_fragment(msg.fragment);
                self.arm(
                    cr,
                    Message::control(
                        Command::Fack,
                        endpoint.subport(),
                        msg.seqno,
                        msg.fragment,
                        msg.fragments,
                    ),
                )?;
                cr.set_state(State::FackSent);
            }
            Accept::Duplicate => {
                self.resend(cr);
                cr.set_state(state);
            }
            Accept::Reject => debug!(
                "FRAGMENT {}/{} of {} from {endpoint} dropped in {state}",
                msg.fragment, msg.fragments, msg.seqno
            ),
        }
        Ok(())
    }

    fn on_disconnect(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        // a DACK goes out whether or not the connection is known
        let dack = Message::control(Command::Dack, endpoint.subport(), msg.seqno, 1, 1);
        self.send_message(&endpoint, &dack)?;
        if let Some(cr) = ct.lookup_mut(&endpoint) {
            debug!("disconnecting {cr}");
            cr.set_state(State::TimedOut);
        }
        Ok(())
    }

    fn on_ping(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        if let Some(cr) = ct.lookup_mut(&endpoint) {
            let pack = Message::control(Command::Pack, endpoint.subport(), msg.seqno, 1, 1);
            self.send_message(&endpoint, &pack)?;
            // refreshes liveness only
            let state = cr.state();
            cr.set_state(state);
        }
        Ok(())
    }

    fn on_seqno(
        &self,
        ct: &mut Connections,
        endpoint: Endpoint,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let Some(cr) = ct.lookup_mut(&endpoint) else {
            return Ok(());
        };
        if matches!(cr.state(), State::Idle | State::ResponseSent) {
            self.arm(
                cr,
                Message::control(Command::Sack, endpoint.subport(), msg.seqno, 1, 1),
            )?;
            cr.set_seqno(msg.seqno);
            cr.set_state(State::Idle);
        }
        Ok(())
    }

    /// One timer tick: purge dead records, time out exhausted ones, ping
    /// idle ones and retransmit the rest.
    pub fn tick(&self) -> Scan {
        let mut ct = self.table.lock();

        let count = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if count % TABLE_DUMP_TICKS == 0 && log_enabled!(Level::Trace) {
            for cr in ct.iter() {
                trace!("ctable: {cr}");
            }
        }

        let scan = ct.scan();
        for endpoint in &scan.purge {
            if let Some(cr) = ct.remove(endpoint) {
                debug!("purged {cr}");
            }
        }
        for endpoint in &scan.timed_out {
            if let Some(cr) = ct.lookup_mut(endpoint) {
                debug!("timed out {cr}");
                cr.set_state(State::TimedOut);
            }
        }
        for endpoint in &scan.ping {
            if let Some(cr) = ct.lookup(endpoint) {
                let ping = Message::control(Command::Ping, endpoint.subport(), cr.seqno(), 1, 1);
                if let Err(e) = self.send_message(endpoint, &ping) {
                    warn!("failed to ping {endpoint}: {e}");
                }
            }
        }
        for endpoint in &scan.retry {
            if let Some(cr) = ct.lookup(endpoint) {
                if cr.state().in_flight() {
                    self.resend(cr);
                }
            }
        }
        scan
    }
}

/// Moves a record from `expected` to `next` if the ack matches its seqno.
fn acknowledge(
    ct: &mut Connections,
    endpoint: &Endpoint,
    msg: &Message,
    expected: State,
    next: State,
) {
    if let Some(cr) = ct.lookup_mut(endpoint) {
        if cr.seqno() == msg.seqno && cr.state() == expected {
            cr.set_state(next);
        } else {
            debug!("stale {} {} for {cr}", msg.command, msg.seqno);
        }
    }
}

/// Fragment numbers run from 1 up to the declared count.
fn numbered_in_range(msg: &Message) -> bool {
    (1..=msg.fragments).contains(&msg.fragment)
}

/// Whether `number` directly follows `last`, without wrapping.
fn follows(last: u8, number: u8) -> bool {
    last.checked_add(1) == Some(number)
}

/// Writes the final fragment of an inbound query and hands back the
/// complete payload.
fn finish_reassembly(cr: &mut ConnectionRecord, msg: &Message) -> Option<Vec<u8>> {
    let reassembly = cr.inbound()?;
    if let Err(e) = reassembly.accept(msg.fragment, msg.bytes()) {
        debug!("final QUERY fragment for {} rejected: {e}", cr.endpoint());
        return None;
    }
    if !reassembly.is_complete() {
        debug!("QUERY for {} incomplete after last fragment", cr.endpoint());
        cr.take_inbound();
        return None;
    }
    cr.set_last_fragment(msg.fragment);
    cr.take_inbound().map(Reassembly::into_bytes)
}

pub(crate) fn record_mut<'a>(
    ct: &'a mut Connections,
    endpoint: &Endpoint,
) -> Result<&'a mut ConnectionRecord, RpcError> {
    ct.lookup_mut(endpoint)
        .ok_or(RpcError::UnknownConnection(*endpoint))
}
