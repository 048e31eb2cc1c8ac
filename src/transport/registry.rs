//! Process-wide routing table and activity log shared by [`TestTransport`]s.
//!
//! Every [`TestTransport`] created against the same [`AssociationRegistry`] can reach every other one. The
//! registry also records each listen, associate and shutdown attempt in order, which tests inspect through
//! [`AssociationRegistry::log_snapshot`].

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    address::Address,
    error::{TransportError, TransportResult},
};

use super::test::TestTransport;

const FIRST_ASSIGNED_PORT: u16 = 10000;

/// An operation attempted on a [`TestTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activity {
    /// [`Transport::listen`](crate::transport::Transport::listen) was called.
    ListenAttempt {
        /// The address that was bound.
        bound_address: Address,
    },
    /// [`Transport::associate`](crate::transport::Transport::associate) was called. Logged whether or not
    /// the attempt succeeds.
    AssociateAttempt {
        /// The associating transport's address.
        local_address: Address,
        /// The target address.
        remote_address: Address,
    },
    /// [`Transport::shutdown`](crate::transport::Transport::shutdown) was called.
    ShutdownAttempt {
        /// The address that was released.
        bound_address: Address,
    },
}

/// Routing table and activity log for in-process transports.
///
/// Cheap to clone; clones share state. A fresh registry, or one that has been [cleared](Self::clear), is
/// required per test.
#[derive(Clone)]
pub struct AssociationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

struct RegistryState {
    transports: HashMap<Address, TestTransport>,
    activity: Vec<Activity>,
    next_port: u16,
}

impl AssociationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        AssociationRegistry {
            state: Arc::new(Mutex::new(RegistryState {
                transports: HashMap::new(),
                activity: Vec::new(),
                next_port: FIRST_ASSIGNED_PORT,
            })),
        }
    }

    /// Records `transport` as listening on `address`, replacing any earlier registration.
    pub fn register_transport(&self, address: Address, transport: &TestTransport) {
        self.state
            .lock()
            .transports
            .insert(address, transport.clone());
    }

    /// Registers `transport` on `address` unless another live transport already owns it.
    pub(crate) fn try_register(
        &self,
        address: &Address,
        transport: &TestTransport,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        match state.transports.get(address) {
            Some(owner) if !owner.same_instance(transport) => Err(TransportError::Bind {
                address: address.clone(),
            }),
            _ => {
                state.transports.insert(address.clone(), transport.clone());
                Ok(())
            }
        }
    }

    /// Removes the registration of `address` if it belongs to `transport`.
    pub fn deregister_transport(&self, address: &Address, transport: &TestTransport) -> bool {
        let mut state = self.state.lock();
        match state.transports.get(address) {
            Some(owner) if owner.same_instance(transport) => {
                state.transports.remove(address);
                true
            }
            _ => false,
        }
    }

    /// The transport listening on `address`, if any.
    pub fn transport_for(&self, address: &Address) -> Option<TestTransport> {
        self.state.lock().transports.get(address).cloned()
    }

    /// Returns `true` if every address is registered and its inbound listener has been provided.
    pub fn transports_ready<'a, I>(&self, addresses: I) -> bool
    where
        I: IntoIterator<Item = &'a Address>,
    {
        let state = self.state.lock();
        addresses.into_iter().all(|address| {
            state
                .transports
                .get(address)
                .is_some_and(TestTransport::is_listener_ready)
        })
    }

    /// Appends an entry to the activity log.
    pub fn log_activity(&self, activity: Activity) {
        self.state.lock().activity.push(activity);
    }

    /// A copy of the activity log, in insertion order.
    pub fn log_snapshot(&self) -> Vec<Activity> {
        self.state.lock().activity.clone()
    }

    /// Removes every registration and log entry.
    ///
    /// Transports registered here must already be shut down; associating through a cleared registry fails
    /// as if nothing were listening.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.transports.clear();
        state.activity.clear();
        state.next_port = FIRST_ASSIGNED_PORT;
    }

    /// Returns a port, counting up from 10000, on which `template` is not registered yet.
    pub fn next_free_port(&self, template: &Address) -> u16 {
        let mut state = self.state.lock();
        loop {
            let port = state.next_port;
            state.next_port = port.checked_add(1).unwrap_or(FIRST_ASSIGNED_PORT);
            if !state.transports.contains_key(&template.with_port(port)) {
                return port;
            }
        }
    }
}

impl Default for AssociationRegistry {
    fn default() -> Self {
        AssociationRegistry::new()
    }
}

impl fmt::Debug for AssociationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AssociationRegistry")
            .field("transports", &state.transports.keys().collect::<Vec<_>>())
            .field("activity", &state.activity.len())
            .finish()
    }
}
