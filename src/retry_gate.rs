//! Per-address backoff after association failures.
//!
//! After an association to an address fails, the gate for that address closes for a fixed duration and
//! further attempts fail fast with [`TransportError::GatedAddress`](crate::error::TransportError::GatedAddress).
//! Closed gates reopen lazily when queried after the duration has elapsed, and
//! [`RetryGate::prune_expired`] drops stale records in bulk.
//!
//! Time is read from [`tokio::time::Instant`], so paused-time tests can advance through the gate.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::address::Address;

/// The gate state of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Associations are allowed.
    Open,
    /// Associations are refused until the instant.
    Closed {
        /// When the gate reopens.
        until: Instant,
    },
}

/// Tracks closed gates per remote address.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RetryGate {
    closed_for: Duration,
    records: Arc<Mutex<HashMap<Address, Instant>>>,
}

impl RetryGate {
    /// Creates a gate that stays closed for `closed_for` after each failure.
    pub fn new(closed_for: Duration) -> Self {
        RetryGate {
            closed_for,
            records: Arc::default(),
        }
    }

    /// How long a gate stays closed after a failure.
    pub fn closed_for(&self) -> Duration {
        self.closed_for
    }

    /// Returns `true` if associations to `address` should fail fast.
    pub fn should_gate(&self, address: &Address) -> bool {
        self.gated_until(address).is_some()
    }

    /// The state of the gate for `address`.
    pub fn state(&self, address: &Address) -> GateState {
        match self.gated_until(address) {
            Some(until) => GateState::Closed { until },
            None => GateState::Open,
        }
    }

    /// When the gate for `address` reopens, or `None` if it is open.
    pub fn gated_until(&self, address: &Address) -> Option<Instant> {
        let mut records = self.records.lock();
        let failed_at = *records.get(address)?;
        let until = failed_at + self.closed_for;
        if Instant::now() < until {
            Some(until)
        } else {
            records.remove(address);
            None
        }
    }

    /// Closes the gate for `address`, starting now.
    pub fn record_failure(&self, address: &Address) {
        self.records.lock().insert(address.clone(), Instant::now());
    }

    /// Opens the gate for `address`.
    pub fn record_success(&self, address: &Address) {
        self.records.lock().remove(address);
    }

    /// Drops every record whose gate has reopened, returning how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, failed_at| now < *failed_at + self.closed_for);
        before - records.len()
    }

    /// The number of addresses with a record.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if no address has a record.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl fmt::Debug for RetryGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryGate")
            .field("closed_for", &self.closed_for)
            .field("records", &self.len())
            .finish()
    }
}
