//! A deterministic in-process transport.
//!
//! [`TestTransport`]s sharing an [`AssociationRegistry`] associate with each other without any I/O. Every
//! operation is logged in the registry so tests can assert on the exact sequence of attempts, and failures
//! can be injected with [`TestTransport::fail_next_associate`] and [`TestTransport::set_associate_delay`].

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    address::Address,
    config::TransportSettings,
    error::{TransportError, TransportResult},
};

use super::{
    quarantine::QuarantineTable,
    registry::{Activity, AssociationRegistry},
    AssociationEvent, AssociationHandle, BoxFuture, DisassociateInfo, Direction, HandleIo,
    ListenerPromise, ListenerSlot, Transport, WeakAssociationHandle,
};

/// The default scheme identifier of [`TestTransport`].
pub const TEST_SCHEME: &str = "test";

/// An in-process transport routed through an [`AssociationRegistry`].
///
/// Cheap to clone; clones refer to the same transport instance.
#[derive(Clone)]
pub struct TestTransport {
    inner: Arc<TestTransportInner>,
}

struct TestTransportInner {
    uid: u64,
    scheme: String,
    registry: AssociationRegistry,
    maximum_payload_bytes: usize,
    send_buffer_size: usize,
    state: Mutex<TestTransportState>,
    quarantine: QuarantineTable,
}

struct TestTransportState {
    address: Address,
    listener: Option<ListenerPromise>,
    listening: bool,
    handles: Vec<WeakAssociationHandle>,
    associate_failures: VecDeque<TransportError>,
    associate_delay: Option<Duration>,
}

impl TestTransport {
    /// Creates a transport for `address` with default settings.
    ///
    /// If `address` has no port, one is assigned on [`listen`](Transport::listen).
    pub fn new(address: Address, registry: AssociationRegistry) -> Self {
        let defaults = TransportSettings::test(address);
        TestTransport::from_settings(&defaults, registry)
    }

    /// Creates a transport from configuration.
    pub fn from_settings(settings: &TransportSettings, registry: AssociationRegistry) -> Self {
        TestTransport {
            inner: Arc::new(TestTransportInner {
                uid: rand::random(),
                scheme: settings.scheme_identifier.clone(),
                registry,
                maximum_payload_bytes: settings.maximum_payload_bytes,
                send_buffer_size: settings.send_buffer_size,
                state: Mutex::new(TestTransportState {
                    address: settings.local_address.clone(),
                    listener: None,
                    listening: false,
                    handles: Vec::new(),
                    associate_failures: VecDeque::new(),
                    associate_delay: None,
                }),
                quarantine: QuarantineTable::new(),
            }),
        }
    }

    /// Sets the largest payload this transport accepts.
    ///
    /// Only takes effect before the transport is cloned or starts listening.
    pub fn with_maximum_payload_bytes(mut self, maximum_payload_bytes: usize) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.maximum_payload_bytes = maximum_payload_bytes,
            None => warn!("maximum payload size of a shared test transport cannot change"),
        }
        self
    }

    /// The incarnation uid of this transport.
    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    /// The registry this transport is routed through.
    pub fn registry(&self) -> &AssociationRegistry {
        &self.inner.registry
    }

    /// The local address, with its port once bound.
    pub fn local_address(&self) -> Address {
        self.inner.state.lock().address.clone()
    }

    /// Makes the next [`associate`](Transport::associate) call fail with `err`.
    ///
    /// Calls queue up; each one fails a single attempt.
    pub fn fail_next_associate(&self, err: TransportError) {
        self.inner.state.lock().associate_failures.push_back(err);
    }

    /// Delays every [`associate`](Transport::associate) call by `delay`, or removes the delay.
    pub fn set_associate_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().associate_delay = delay;
    }

    /// Returns `true` if both handles belong to the same transport instance.
    pub fn same_instance(&self, other: &TestTransport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_listener_ready(&self) -> bool {
        self.inner
            .state
            .lock()
            .listener
            .as_ref()
            .is_some_and(ListenerPromise::is_ready)
    }

    fn listener_promise(&self) -> Option<ListenerPromise> {
        self.inner.state.lock().listener.clone()
    }

    fn track(&self, handle: &AssociationHandle) {
        let mut state = self.inner.state.lock();
        state
            .handles
            .retain(|handle| handle.upgrade().is_some_and(|h| !h.is_disassociated()));
        state.handles.push(handle.downgrade());
    }

    fn live_handles(&self) -> Vec<AssociationHandle> {
        self.inner
            .state
            .lock()
            .handles
            .iter()
            .filter_map(WeakAssociationHandle::upgrade)
            .collect()
    }

    async fn listen_inner(&self) -> TransportResult<(Address, ListenerSlot)> {
        let mut address = self.local_address();
        if address.port().is_none() {
            // The registry lock is never taken while holding the state lock.
            let port = self.inner.registry.next_free_port(&address);
            address = address.with_port(port);
            self.inner.state.lock().address = address.clone();
        }

        self.inner.registry.log_activity(Activity::ListenAttempt {
            bound_address: address.clone(),
        });
        self.inner.registry.try_register(&address, self)?;

        let slot = {
            let mut state = self.inner.state.lock();
            state.listening = true;
            match state.listener.as_ref().map(ListenerPromise::reissue) {
                Some(slot) => slot,
                None => {
                    let (slot, promise) = ListenerSlot::new();
                    state.listener = Some(promise);
                    slot
                }
            }
        };
        debug!(address = %address, uid = self.inner.uid, "test transport listening");

        Ok((address, slot))
    }

    async fn associate_inner(&self, remote: Address) -> TransportResult<AssociationHandle> {
        let local = self.local_address();
        self.inner.registry.log_activity(Activity::AssociateAttempt {
            local_address: local.clone(),
            remote_address: remote.clone(),
        });

        let (failure, delay, listening) = {
            let mut state = self.inner.state.lock();
            (
                state.associate_failures.pop_front(),
                state.associate_delay,
                state.listening,
            )
        };
        if let Some(err) = failure {
            return Err(err);
        }
        if !listening {
            return Err(TransportError::InvalidOperation(
                "transport must listen before associating",
            ));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let Some(peer) = self.inner.registry.transport_for(&remote) else {
            return Err(TransportError::InvalidAssociation { local, remote });
        };
        if self.inner.quarantine.is_quarantined(&remote, peer.uid()) {
            return Err(TransportError::Quarantined {
                remote,
                uid: Some(peer.uid()),
            });
        }
        if peer.inner.quarantine.is_quarantined(&local, self.uid()) {
            return Err(TransportError::Quarantined {
                remote: local,
                uid: Some(self.uid()),
            });
        }
        let Some(peer_listener) = peer.listener_promise() else {
            return Err(TransportError::InvalidAssociation { local, remote });
        };
        let peer_listener = peer_listener.wait().await;

        let (local_handle, local_io) = AssociationHandle::new(
            local.clone(),
            remote.clone(),
            Direction::Outbound,
            peer.uid(),
            peer.inner.maximum_payload_bytes,
            self.inner.send_buffer_size,
        );
        let (remote_handle, remote_io) = AssociationHandle::new(
            remote.clone(),
            local.clone(),
            Direction::Inbound,
            self.uid(),
            self.inner.maximum_payload_bytes,
            peer.inner.send_buffer_size,
        );
        link(&local_handle, local_io, &remote_handle, remote_io);
        self.track(&local_handle);
        peer.track(&remote_handle);

        debug!(local = %local, remote = %remote, "test transport associated");
        peer_listener.notify(AssociationEvent::InboundAssociation(remote_handle));

        Ok(local_handle)
    }

    async fn shutdown_inner(&self) {
        let address = {
            let mut state = self.inner.state.lock();
            state.listening = false;
            state.listener = None;
            state.address.clone()
        };
        self.inner.registry.log_activity(Activity::ShutdownAttempt {
            bound_address: address.clone(),
        });
        self.inner.registry.deregister_transport(&address, self);

        for handle in self.live_handles() {
            handle.disassociate_with(DisassociateInfo::Shutdown);
        }
        self.inner.state.lock().handles.clear();
        debug!(address = %address, "test transport shut down");
    }
}

/// Wires two handles together so that writes to one are delivered to the other.
fn link(a: &AssociationHandle, a_io: HandleIo, b: &AssociationHandle, b_io: HandleIo) {
    for (this, peer) in [(a, b), (b, a)] {
        let peer_ref = peer.downgrade();
        this.on_disassociate(move |info| {
            if let Some(peer) = peer_ref.upgrade() {
                peer.disassociate_with(info);
            }
        });
        let this_ref = this.downgrade();
        peer.on_listener_registered(move || {
            if let Some(this) = this_ref.upgrade() {
                this.set_peer_listening();
            }
        });
    }
    tokio::spawn(pump(a_io, b.downgrade()));
    tokio::spawn(pump(b_io, a.downgrade()));
}

async fn pump(mut io: HandleIo, peer: WeakAssociationHandle) {
    while let Some(payload) = io.next_outbound().await {
        let Some(peer) = peer.upgrade() else {
            break;
        };
        if peer.deliver(payload).await.is_err() {
            break;
        }
    }
}

impl Transport for TestTransport {
    fn scheme_identifier(&self) -> &str {
        &self.inner.scheme
    }

    fn maximum_payload_bytes(&self) -> usize {
        self.inner.maximum_payload_bytes
    }

    fn listen(&self) -> BoxFuture<'_, TransportResult<(Address, ListenerSlot)>> {
        Box::pin(self.listen_inner())
    }

    fn associate(&self, remote: Address) -> BoxFuture<'_, TransportResult<AssociationHandle>> {
        Box::pin(self.associate_inner(remote))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown_inner())
    }

    fn quarantine(&self, remote: &Address, uid: Option<u64>) {
        self.inner.quarantine.insert(remote, uid);
        for handle in self.live_handles() {
            if handle.remote_address() == remote
                && QuarantineTable::matches(uid, handle.remote_uid())
            {
                handle.disassociate_with(DisassociateInfo::Quarantined);
            }
        }
    }

    fn lift_quarantine(&self, remote: &Address) {
        self.inner.quarantine.remove(remote);
    }

    fn is_quarantined(&self, remote: &Address, uid: u64) -> bool {
        self.inner.quarantine.is_quarantined(remote, uid)
    }
}

impl fmt::Debug for TestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TestTransport")
            .field("address", &state.address)
            .field("uid", &self.inner.uid)
            .field("listening", &state.listening)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{HandleEvent, HandleState};

    fn address_a() -> Address {
        "test://sysA@localhost:1".parse().unwrap()
    }

    fn address_b() -> Address {
        "test://sysB@localhost:2".parse().unwrap()
    }

    async fn listening(
        address: Address,
        registry: &AssociationRegistry,
    ) -> (TestTransport, mpsc::UnboundedReceiver<AssociationEvent>) {
        let transport = TestTransport::new(address, registry.clone());
        let (_, slot) = transport.listen().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        slot.fill(tx);
        (transport, rx)
    }

    #[tokio::test]
    async fn assigns_port_when_unbound() {
        let registry = AssociationRegistry::new();
        let transport = TestTransport::new("test://sysA@localhost".parse().unwrap(), registry.clone());
        let (bound, _slot) = transport.listen().await.unwrap();
        assert_eq!(bound.port(), Some(10000));
        assert_eq!(transport.local_address(), bound);
    }

    #[tokio::test]
    async fn relisten_is_idempotent_but_other_instances_conflict() {
        let registry = AssociationRegistry::new();
        let transport = TestTransport::new(address_a(), registry.clone());
        transport.listen().await.unwrap();
        transport.listen().await.unwrap();

        let other = TestTransport::new(address_a(), registry.clone());
        assert!(matches!(
            other.listen().await,
            Err(TransportError::Bind { .. })
        ));

        transport.shutdown().await;
        other.listen().await.unwrap();
    }

    #[tokio::test]
    async fn relisten_keeps_the_registered_listener() {
        let registry = AssociationRegistry::new();
        let (a, _a_events) = listening(address_a(), &registry).await;
        let (b, mut b_events) = listening(address_b(), &registry).await;

        let (bound, slot) = b.listen().await.unwrap();
        assert_eq!(bound, address_b());
        let (tx, mut ignored) = mpsc::unbounded_channel();
        slot.fill(tx);
        assert!(registry.transports_ready([&address_b()]));

        tokio::time::timeout(std::time::Duration::from_secs(1), a.associate(address_b()))
            .await
            .expect("associate must not wait for a new listener")
            .unwrap();
        assert!(matches!(
            b_events.recv().await,
            Some(AssociationEvent::InboundAssociation(_))
        ));
        assert!(ignored.try_recv().is_err());

        let listens = registry
            .log_snapshot()
            .into_iter()
            .filter(|activity| matches!(activity, Activity::ListenAttempt { .. }))
            .count();
        assert_eq!(listens, 3);
    }

    #[tokio::test]
    async fn handles_open_once_both_sides_register() {
        let registry = AssociationRegistry::new();
        let (a, _a_events) = listening(address_a(), &registry).await;
        let (_b, mut b_events) = listening(address_b(), &registry).await;

        let outbound = a.associate(address_b()).await.unwrap();
        let Some(AssociationEvent::InboundAssociation(inbound)) = b_events.recv().await else {
            panic!("expected inbound association");
        };
        assert_eq!(outbound.state(), HandleState::Initializing);

        let (a_tx, _a_rx) = mpsc::unbounded_channel::<HandleEvent>();
        let (b_tx, _b_rx) = mpsc::unbounded_channel::<HandleEvent>();
        outbound.register_listener(a_tx).unwrap();
        assert_eq!(outbound.state(), HandleState::Initializing);
        inbound.register_listener(b_tx).unwrap();
        assert_eq!(outbound.state(), HandleState::Open);
        assert_eq!(inbound.state(), HandleState::Open);
    }

    #[tokio::test]
    async fn payload_limit_is_the_receivers_maximum() {
        let registry = AssociationRegistry::new();
        let a = TestTransport::new(address_a(), registry.clone()).with_maximum_payload_bytes(32000);
        let (_, slot) = a.listen().await.unwrap();
        slot.fill(mpsc::unbounded_channel::<AssociationEvent>().0);
        let b = TestTransport::new(address_b(), registry.clone()).with_maximum_payload_bytes(48000);
        let (_, slot) = b.listen().await.unwrap();
        let (tx, mut b_events) = mpsc::unbounded_channel();
        slot.fill(tx);

        let outbound = a.associate(address_b()).await.unwrap();
        let Some(AssociationEvent::InboundAssociation(inbound)) = b_events.recv().await else {
            panic!("expected inbound association");
        };
        assert_eq!(outbound.payload_limit(), 48000);
        assert_eq!(inbound.payload_limit(), 32000);
        assert_eq!(outbound.remote_uid(), b.uid());
        assert_eq!(inbound.remote_uid(), a.uid());
    }

    #[tokio::test]
    async fn injected_failure_fails_one_attempt() {
        let registry = AssociationRegistry::new();
        let (a, _) = listening(address_a(), &registry).await;
        let (_b, _b_events) = listening(address_b(), &registry).await;

        a.fail_next_associate(TransportError::Shutdown);
        assert!(matches!(
            a.associate(address_b()).await,
            Err(TransportError::Shutdown)
        ));
        a.associate(address_b()).await.unwrap();
    }

    #[tokio::test]
    async fn quarantine_disassociates_and_refuses() {
        let registry = AssociationRegistry::new();
        let (a, _) = listening(address_a(), &registry).await;
        let (b, _b_events) = listening(address_b(), &registry).await;

        let outbound = a.associate(address_b()).await.unwrap();
        a.quarantine(&address_b(), Some(b.uid()));
        assert_eq!(
            outbound.disassociate_info(),
            Some(DisassociateInfo::Quarantined)
        );
        assert!(a.is_quarantined(&address_b(), b.uid()));
        assert!(matches!(
            a.associate(address_b()).await,
            Err(TransportError::Quarantined { .. })
        ));

        a.lift_quarantine(&address_b());
        a.associate(address_b()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_disassociates_live_handles() {
        let registry = AssociationRegistry::new();
        let (a, _) = listening(address_a(), &registry).await;
        let (b, mut b_events) = listening(address_b(), &registry).await;

        let outbound = a.associate(address_b()).await.unwrap();
        let Some(AssociationEvent::InboundAssociation(inbound)) = b_events.recv().await else {
            panic!("expected inbound association");
        };
        b.shutdown().await;
        assert_eq!(inbound.disassociate_info(), Some(DisassociateInfo::Shutdown));
        assert_eq!(outbound.disassociate_info(), Some(DisassociateInfo::Shutdown));
        assert!(registry.transport_for(&address_b()).is_none());
        assert_eq!(
            registry.log_snapshot().last(),
            Some(&Activity::ShutdownAttempt {
                bound_address: address_b()
            })
        );
    }
}
