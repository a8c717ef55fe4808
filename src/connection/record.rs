use std::{
    fmt,
    sync::{Arc, Condvar},
};

use crate::{
    config::RpcConfig,
    endpoint::Endpoint,
    protocol::{Command, fragment::Reassembly},
    service::Service,
};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    QackSent,
    ResponseSent,
    ConnectSent,
    QuerySent,
    AwaitingResponse,
    TimedOut,
    DisconnectSent,
    FragmentSent,
    FackReceived,
    FragmentReceived,
    FackSent,
    SeqnoSent,
}

impl State {
    /// States waiting on an acknowledgement; these are retransmitted.
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            State::ConnectSent
                | State::QuerySent
                | State::ResponseSent
                | State::DisconnectSent
                | State::FragmentSent
                | State::SeqnoSent
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::QackSent => "QACK_SENT",
            State::ResponseSent => "RESPONSE_SENT",
            State::ConnectSent => "CONNECT_SENT",
            State::QuerySent => "QUERY_SENT",
            State::AwaitingResponse => "AWAITING_RESPONSE",
            State::TimedOut => "TIMEDOUT",
            State::DisconnectSent => "DISCONNECT_SENT",
            State::FragmentSent => "FRAGMENT_SENT",
            State::FackReceived => "FACK_RECEIVED",
            State::FragmentReceived => "FRAGMENT_RECEIVED",
            State::FackSent => "FACK_SENT",
            State::SeqnoSent => "SEQNO_SENT",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An encoded message kept for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub command: Command,
    pub bytes: Vec<u8>,
}

/// What the timer should do with a record after one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Wait,
    Retry,
    TimedOut,
    Ping,
    Purge,
}

/// Per-connection protocol state plus retry and liveness bookkeeping.
///
/// Records live inside the [`Connections`](super::Connections) guarded by
/// the table lock; the condition variable is always waited on with that
/// same lock.
#[derive(Debug)]
pub struct ConnectionRecord {
    endpoint: Endpoint,
    seqno: u32,
    state: State,
    pending: Option<Outbound>,
    inbound: Option<Reassembly>,
    service: Option<Arc<Service>>,
    last_fragment: u8,

    attempts: u16,
    ticks: u16,
    ticks_left: u16,

    ticks_between_pings: u16,
    pings_before_purge: u16,
    ticks_until_ping: u16,
    pings_until_purge: u16,

    state_changed: Arc<Condvar>,
}

impl ConnectionRecord {
    pub fn new(endpoint: Endpoint, seqno: u32, config: &RpcConfig) -> Self {
        Self {
            endpoint,
            seqno,
            state: State::Idle,
            pending: None,
            inbound: None,
            service: None,
            last_fragment: 0,
            attempts: 0,
            ticks: 0,
            ticks_left: 0,
            ticks_between_pings: config.ticks_between_pings,
            pings_before_purge: config.pings_before_purge,
            ticks_until_ping: config.ticks_between_pings,
            pings_until_purge: config.pings_before_purge,
            state_changed: Arc::new(Condvar::new()),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn set_seqno(&mut self, seqno: u32) {
        self.seqno = seqno;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Moves to `state`, re-arms the liveness countdown and wakes every
    /// waiter. Setting the current state again only refreshes liveness.
    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.ticks_until_ping = self.ticks_between_pings;
        self.pings_until_purge = self.pings_before_purge;
        self.state_changed.notify_all();
    }

    /// Replaces the retained outbound message and restarts the backoff.
    pub fn set_payload(&mut self, payload: Outbound, attempts: u16, ticks: u16) {
        self.pending = Some(payload);
        self.attempts = attempts;
        self.ticks = ticks;
        self.ticks_left = ticks;
    }

    pub fn pending(&self) -> Option<&Outbound> {
        self.pending.as_ref()
    }

    pub fn inbound(&mut self) -> Option<&mut Reassembly> {
        self.inbound.as_mut()
    }

    pub fn set_inbound(&mut self, inbound: Reassembly) {
        self.inbound = Some(inbound);
    }

    pub fn take_inbound(&mut self) -> Option<Reassembly> {
        self.inbound.take()
    }

    pub fn service(&self) -> Option<&Arc<Service>> {
        self.service.as_ref()
    }

    pub fn set_service(&mut self, service: Arc<Service>) {
        self.service = Some(service);
    }

    pub fn last_fragment(&self) -> u8 {
        self.last_fragment
    }

    pub fn set_last_fragment(&mut self, number: u8) {
        self.last_fragment = number;
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn ticks(&self) -> u16 {
        self.ticks
    }

    pub(crate) fn notifier(&self) -> Arc<Condvar> {
        Arc::clone(&self.state_changed)
    }

    /// Advances the retry or liveness countdown by one timer tick.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state == State::TimedOut {
            return TickOutcome::Purge;
        }

        if self.state.in_flight() {
            self.ticks_left = self.ticks_left.saturating_sub(1);
            if self.ticks_left > 0 {
                return TickOutcome::Wait;
            }
            self.attempts = self.attempts.saturating_sub(1);
            if self.attempts == 0 {
                return TickOutcome::TimedOut;
            }
            self.ticks = self.ticks.saturating_mul(2);
            self.ticks_left = self.ticks;
            return TickOutcome::Retry;
        }

        self.ticks_until_ping = self.ticks_until_ping.saturating_sub(1);
        if self.ticks_until_ping > 0 {
            return TickOutcome::Wait;
        }
        self.pings_until_purge = self.pings_until_purge.saturating_sub(1);
        if self.pings_until_purge == 0 {
            return TickOutcome::TimedOut;
        }
        self.ticks_until_ping = self.ticks_between_pings;
        TickOutcome::Ping
    }
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seqno: {}, state: {}",
            self.endpoint, self.seqno, self.state
        )
    }
}
