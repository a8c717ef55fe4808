//! Offered services and the queues feeding their worker threads.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use log::debug;

use crate::endpoint::Endpoint;

/// A query waiting for a worker: who sent it and the reassembled bytes.
pub type Query = (Endpoint, Vec<u8>);

/// A named service and its FIFO of received queries.
#[derive(Debug)]
pub struct Service {
    name: String,
    queue: Mutex<VecDeque<Query>>,
    available: Condvar,
}

impl Service {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, sender: Endpoint, query: Vec<u8>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back((sender, query));
        self.available.notify_one();
    }

    /// Removes the oldest query, blocking until one arrives.
    pub fn pop(&self) -> Query {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(query) = queue.pop_front() {
                return query;
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Service::pop`] but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Query> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(query) = queue.pop_front() {
                return Some(query);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queue = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of offered services keyed by name.
#[derive(Debug, Default)]
pub struct ServiceTable {
    services: Mutex<HashMap<String, Arc<Service>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`; returns `None` if it is already offered.
    pub fn create(&self, name: &str) -> Option<Arc<Service>> {
        let mut services = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(name) {
            return None;
        }

        let service = Arc::new(Service::new(name));
        services.insert(name.to_string(), Arc::clone(&service));
        debug!("service '{name}' offered");
        Some(service)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Service>> {
        let removed = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            debug!("service '{name}' withdrawn");
        }
        removed
    }
}
