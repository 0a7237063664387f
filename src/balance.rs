//! Backend ordering selectors.
//!
//! A selector returns the full candidate list in the order connections
//! should be attempted, so callers can walk it when earlier entries fail to
//! dial.

use crate::backend::Backend;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balance {
    RoundRobin,
    LeastConn,
}

impl Balance {
    /// Parse the wire name. Empty means round-robin; unknown is `None`.
    pub fn parse(name: &str) -> Option<Balance> {
        match name {
            "" | "RR" => Some(Balance::RoundRobin),
            "LC" => Some(Balance::LeastConn),
            _ => None,
        }
    }
}

/// Produces the ordered candidate list for the next connection.
pub struct Balancer {
    strategy: Balance,
    cursor: Mutex<usize>,
}

impl Balancer {
    pub fn new(strategy: Balance) -> Balancer {
        Balancer {
            strategy,
            cursor: Mutex::new(0),
        }
    }

    /// Order `backends` for the next attempt. Backends marked down are
    /// filtered out unless none are up, in which case the full ordering is
    /// returned so callers can still try everything.
    pub fn next(&self, backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        if backends.is_empty() {
            return Vec::new();
        }
        let ordered = match self.strategy {
            Balance::RoundRobin => self.round_robin(backends),
            Balance::LeastConn => least_conn(backends),
        };
        let up: Vec<Arc<Backend>> = ordered.iter().filter(|b| b.up()).cloned().collect();
        if up.is_empty() {
            ordered
        } else {
            up
        }
    }

    /// Insertion order rotated one further each call, so the previously
    /// first backend moves to the back of the list.
    fn round_robin(&self, backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        let mut cursor = self.cursor.lock();
        let start = (*cursor + 1) % backends.len();
        *cursor = start;
        (0..backends.len())
            .map(|i| backends[(start + i) % backends.len()].clone())
            .collect()
    }
}

/// Ascending by active connection count; insertion order breaks ties.
fn least_conn(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    let mut ordered = backends.to_vec();
    ordered.sort_by_key(|b| b.active());
    ordered
}
