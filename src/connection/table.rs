use std::{
    process,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU16, Ordering},
    },
};

use log::trace;

use crate::endpoint::Endpoint;

use super::record::{ConnectionRecord, State, TickOutcome};

/// Subport counters wrap back to 1 past this value.
const SUBPORT_COUNTER_MAX: u16 = 0x7fff;

/// Guard over the locked connection table.
pub type TableGuard<'a> = MutexGuard<'a, Connections>;

/// Records classified by one timer scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Scan {
    pub retry: Vec<Endpoint>,
    pub timed_out: Vec<Endpoint>,
    pub ping: Vec<Endpoint>,
    pub purge: Vec<Endpoint>,
}

/// Bucketed store of connection records. Only reachable through a
/// [`TableGuard`], so every method runs with the table lock held.
#[derive(Debug)]
pub struct Connections {
    buckets: Vec<Vec<ConnectionRecord>>,
}

impl Connections {
    fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket(&self, endpoint: &Endpoint) -> usize {
        endpoint.bucket(self.buckets.len())
    }

    /// Adds a record; the caller makes sure its endpoint is not present.
    pub fn insert(&mut self, record: ConnectionRecord) {
        trace!("ctable insert: {record}");
        let hash = self.bucket(&record.endpoint());
        self.buckets[hash].push(record);
    }

    pub fn lookup(&self, endpoint: &Endpoint) -> Option<&ConnectionRecord> {
        self.buckets[self.bucket(endpoint)]
            .iter()
            .find(|r| r.endpoint() == *endpoint)
    }

    pub fn lookup_mut(&mut self, endpoint: &Endpoint) -> Option<&mut ConnectionRecord> {
        let hash = self.bucket(endpoint);
        self.buckets[hash]
            .iter_mut()
            .find(|r| r.endpoint() == *endpoint)
    }

    /// Unlinks the record and hands it back; dropping it destroys it.
    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<ConnectionRecord> {
        let hash = self.bucket(endpoint);
        let bucket = &mut self.buckets[hash];
        let pos = bucket.iter().position(|r| r.endpoint() == *endpoint)?;
        let record = bucket.remove(pos);
        trace!("ctable remove: {record}");
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.buckets.iter().flatten()
    }

    /// Advances every record by one tick and sorts the ones needing action
    /// into retry, timed-out, ping and purge lists. Buckets are untouched.
    pub fn scan(&mut self) -> Scan {
        let mut scan = Scan::default();
        for record in self.buckets.iter_mut().flatten() {
            let endpoint = record.endpoint();
            match record.tick() {
                TickOutcome::Wait => {}
                TickOutcome::Retry => scan.retry.push(endpoint),
                TickOutcome::TimedOut => scan.timed_out.push(endpoint),
                TickOutcome::Ping => scan.ping.push(endpoint),
                TickOutcome::Purge => scan.purge.push(endpoint),
            }
        }
        scan
    }

    /// Destroys every record, waking waiters with `TIMEDOUT` first.
    pub fn purge_all(&mut self) -> usize {
        let mut purged = 0;
        for bucket in self.buckets.iter_mut() {
            for mut record in bucket.drain(..) {
                record.set_state(State::TimedOut);
                purged += 1;
            }
        }
        purged
    }
}

/// The connection table: a single lock over all records plus the
/// per-process subport generator.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: Mutex<Connections>,
    counter: AtomicU16,
    pid: u32,
}

impl ConnectionTable {
    pub fn new(buckets: usize) -> Self {
        Self {
            connections: Mutex::new(Connections::new(buckets)),
            counter: AtomicU16::new(0),
            pid: process::id(),
        }
    }

    pub fn lock(&self) -> TableGuard<'_> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a new subport: low 16 bits of the pid over a 15-bit counter.
    /// Does not need the table lock.
    pub fn new_subport(&self) -> u32 {
        let next = |c: u16| if c >= SUBPORT_COUNTER_MAX { 1 } else { c + 1 };
        let prev = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(next(c)))
            .unwrap_or_else(|c| c);
        ((self.pid & 0xffff) << 16) | u32::from(next(prev))
    }

    /// Parks the caller until the record for `endpoint` reaches one of
    /// `states`, releasing the table lock while parked. Returns the matched
    /// state. A record that disappears while waiting reads as `TIMEDOUT`.
    pub fn wait_for_state<'a>(
        &'a self,
        mut guard: TableGuard<'a>,
        endpoint: &Endpoint,
        states: &[State],
    ) -> (TableGuard<'a>, State) {
        loop {
            let Some(record) = guard.lookup(endpoint) else {
                return (guard, State::TimedOut);
            };
            let current = record.state();
            if let Some(state) = states.iter().find(|s| **s == current) {
                return (guard, *state);
            }
            let notifier = record.notifier();
            guard = notifier
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use crate::config::RpcConfig;

    use super::*;

    fn endpoint(subport: u32) -> Endpoint {
        Endpoint::new("127.0.0.1:987".parse().unwrap(), subport)
    }

    fn record(subport: u32, config: &RpcConfig) -> ConnectionRecord {
        ConnectionRecord::new(endpoint(subport), 1, config)
    }

    #[test]
    fn insert_lookup_remove() {
        let config = RpcConfig::default();
        let table = ConnectionTable::new(config.table_buckets);
        let mut ct = table.lock();

        for subport in 1..=100 {
            ct.insert(record(subport, &config));
        }
        assert_eq!(ct.len(), 100);
        assert_eq!(ct.lookup(&endpoint(42)).unwrap().endpoint(), endpoint(42));
        assert!(ct.lookup(&endpoint(101)).is_none());

        let removed = ct.remove(&endpoint(42)).unwrap();
        assert_eq!(removed.endpoint(), endpoint(42));
        assert!(ct.lookup(&endpoint(42)).is_none());
        assert!(ct.remove(&endpoint(42)).is_none());
        assert_eq!(ct.len(), 99);
    }

    #[test]
    fn subports_carry_pid_and_counter() {
        let table = ConnectionTable::new(31);
        let first = table.new_subport();
        let second = table.new_subport();

        assert_eq!(first >> 16, process::id() & 0xffff);
        assert_eq!(first & 0xffff, 1);
        assert_eq!(second & 0xffff, 2);
    }

    #[test]
    fn subport_counter_wraps() {
        let table = ConnectionTable::new(31);
        table.counter.store(SUBPORT_COUNTER_MAX, Ordering::Relaxed);

        assert_eq!(table.new_subport() & 0xffff, 1);
        assert_eq!(table.new_subport() & 0xffff, 2);
    }

    #[test]
    fn scan_classifies_records() {
        let config = RpcConfig {
            ticks_between_pings: 1,
            pings_before_purge: 2,
            ..RpcConfig::default()
        };
        let table = ConnectionTable::new(config.table_buckets);
        let mut ct = table.lock();

        let mut retrying = record(1, &config);
        retrying.set_payload(
            crate::connection::Outbound {
                command: crate::protocol::Command::Query,
                bytes: vec![],
            },
            3,
            1,
        );
        retrying.set_state(State::QuerySent);
        ct.insert(retrying);

        let mut exhausted = record(2, &config);
        exhausted.set_payload(
            crate::connection::Outbound {
                command: crate::protocol::Command::Connect,
                bytes: vec![],
            },
            1,
            1,
        );
        exhausted.set_state(State::ConnectSent);
        ct.insert(exhausted);

        let mut dead = record(3, &config);
        dead.set_state(State::TimedOut);
        ct.insert(dead);

        ct.insert(record(4, &config));

        let scan = ct.scan();
        assert_eq!(scan.retry, vec![endpoint(1)]);
        assert_eq!(scan.timed_out, vec![endpoint(2)]);
        assert_eq!(scan.purge, vec![endpoint(3)]);
        assert_eq!(scan.ping, vec![endpoint(4)]);
        assert_eq!(ct.len(), 4);
    }

    #[test]
    fn purge_all_empties_table() {
        let config = RpcConfig::default();
        let table = ConnectionTable::new(config.table_buckets);
        let mut ct = table.lock();
        for subport in 1..=5 {
            ct.insert(record(subport, &config));
        }

        assert_eq!(ct.purge_all(), 5);
        assert!(ct.is_empty());
    }

    #[test]
    fn wait_returns_matching_state() {
        let config = RpcConfig::default();
        let table = Arc::new(ConnectionTable::new(config.table_buckets));
        {
            let mut ct = table.lock();
            let mut cr = record(1, &config);
            cr.set_state(State::QuerySent);
            ct.insert(cr);
        }

        let setter = Arc::clone(&table);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut ct = setter.lock();
            let cr = ct.lookup_mut(&endpoint(1)).unwrap();
            cr.set_state(State::AwaitingResponse);
            drop(ct);

            thread::sleep(Duration::from_millis(20));
            let mut ct = setter.lock();
            let cr = ct.lookup_mut(&endpoint(1)).unwrap();
            cr.set_state(State::Idle);
        });

        let guard = table.lock();
        let (guard, state) =
            table.wait_for_state(guard, &endpoint(1), &[State::Idle, State::TimedOut]);
        assert_eq!(state, State::Idle);
        assert_eq!(guard.lookup(&endpoint(1)).unwrap().state(), State::Idle);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn wait_on_missing_record_times_out() {
        let table = ConnectionTable::new(31);
        let guard = table.lock();
        let (_guard, state) = table.wait_for_state(guard, &endpoint(9), &[State::Idle]);

        assert_eq!(state, State::TimedOut);
    }

    #[test]
    fn purge_wakes_waiters() {
        let config = RpcConfig::default();
        let table = Arc::new(ConnectionTable::new(config.table_buckets));
        {
            let mut cr = record(1, &config);
            cr.set_state(State::ConnectSent);
            table.lock().insert(cr);
        }

        let purger = Arc::clone(&table);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            purger.lock().purge_all();
        });

        let guard = table.lock();
        let (_guard, state) = table.wait_for_state(guard, &endpoint(1), &[State::Idle]);
        assert_eq!(state, State::TimedOut);
        handle.join().unwrap();
    }
}
