//! Connection records and the table holding them.
//!
//! Every logical connection, client-initiated or server-accepted, is
//! represented by one [`ConnectionRecord`] keyed by its peer [`Endpoint`](crate::endpoint::Endpoint).
//! All records live in a single [`ConnectionTable`] behind one lock: the
//! reader thread, the timer thread and every application thread calling
//! the blocking API serialize on it. A record's condition variable is
//! always waited on with that same lock, so a caller parked in
//! [`ConnectionTable::wait_for_state`] lets the engine threads in to
//! advance the state machine.
//!
//! # Lifecycle
//!
//! A record is created by `connect` (client) or the first `CONNECT` for an
//! offered service (server). It leaves the table only through the timer:
//! once it reaches `TIMEDOUT`, either by exhausting its retries, by going
//! unanswered for too many pings, or by a disconnect, the next scan
//! purges it.
mod record;
mod table;

pub use record::{ConnectionRecord, Outbound, State, TickOutcome};
pub use table::{ConnectionTable, Connections, Scan, TableGuard};
