//! Remoting ties transports, the retry gate and the event stream together.
//!
//! [`Remoting`] starts every configured [`Transport`], accepts inbound associations, and keeps one cached
//! association per remote address for outbound sends. Every payload exchanged over an association is a
//! single envelope naming its recipient path; inbound envelopes are handed to the embedding actor system
//! through the [`LocalDelivery`] trait.
//!
//! Outbound associations are subject to the [`RetryGate`]: after a failure, further attempts to the same
//! address fail fast with [`TransportError::GatedAddress`] until the gate reopens. Failures are returned to
//! the caller and also published on the [`EventStream`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    address::Address,
    config::RemoteSettings,
    error::{DeliveryError, RemoteError, TransportError, TransportResult},
    event_stream::{EventStream, RemotingEvent},
    path::ActorPath,
    retry_gate::RetryGate,
    transport::{
        registry::AssociationRegistry, AssociationEvent, AssociationHandle, Direction,
        DisassociateInfo, HandleEvent, Transport,
    },
};

pub(crate) use envelope::RemoteEnvelope;

mod envelope;

/// The local actor system, as seen by remoting.
///
/// Implementations route inbound messages to local actors and create actors deployed here by other nodes.
pub trait LocalDelivery: Send + Sync + 'static {
    /// Delivers a message to the local actor at `recipient`.
    ///
    /// Returns [`DeliveryError::UnknownRecipient`] if no such actor exists; for asks the error is sent back
    /// to the asking node.
    fn deliver(&self, recipient: &ActorPath, message: InboundMessage) -> Result<(), DeliveryError>;

    /// Creates the actor at `path`, supervised by `supervisor`.
    ///
    /// Called for actors deployed here by another node, in which case `supervisor` lives on that node, and
    /// for local deployments made through the provider.
    fn create_child(&self, path: &ActorPath, supervisor: &ActorPath) -> Result<(), DeliveryError>;

    /// Called when the association to the node hosting `supervisor` is lost for an actor created on its
    /// behalf.
    fn supervisor_lost(&self, child: &ActorPath, supervisor: &ActorPath) {
        let _ = (child, supervisor);
    }
}

/// A message for a local actor.
#[derive(Debug)]
pub enum InboundMessage {
    /// A fire-and-forget message.
    Tell {
        /// The opaque message payload.
        payload: Bytes,
        /// The sending actor, if known.
        sender: Option<ActorPath>,
    },
    /// A request expecting a reply through `reply_to`.
    Ask {
        /// The opaque message payload.
        payload: Bytes,
        /// Where to send the reply.
        reply_to: ReplyTo,
    },
}

/// Completes an ask.
pub struct ReplyTo(ReplyTarget);

enum ReplyTarget {
    Remote {
        handle: AssociationHandle,
        correlation_id: u64,
    },
    Local(oneshot::Sender<Result<Bytes, DeliveryError>>),
}

impl ReplyTo {
    pub(crate) fn local(tx: oneshot::Sender<Result<Bytes, DeliveryError>>) -> Self {
        ReplyTo(ReplyTarget::Local(tx))
    }

    fn remote(handle: AssociationHandle, correlation_id: u64) -> Self {
        ReplyTo(ReplyTarget::Remote {
            handle,
            correlation_id,
        })
    }

    /// Sends the reply payload to the asker.
    pub async fn reply(self, payload: Bytes) -> Result<(), RemoteError> {
        self.complete(Ok(payload)).await
    }

    /// Fails the ask.
    pub async fn fail(self, err: DeliveryError) -> Result<(), RemoteError> {
        self.complete(Err(err)).await
    }

    /// Returns `true` if the asker is on another node.
    pub fn is_remote(&self) -> bool {
        matches!(self.0, ReplyTarget::Remote { .. })
    }

    async fn complete(self, result: Result<Bytes, DeliveryError>) -> Result<(), RemoteError> {
        match self.0 {
            ReplyTarget::Remote {
                handle,
                correlation_id,
            } => {
                write_envelope(
                    &handle,
                    &RemoteEnvelope::Reply {
                        correlation_id,
                        result,
                    },
                )
                .await
            }
            ReplyTarget::Local(tx) => {
                // The asker may have timed out already.
                let _ = tx.send(result);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ReplyTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ReplyTarget::Remote {
                handle,
                correlation_id,
            } => f
                .debug_struct("ReplyTo")
                .field("remote", handle.remote_address())
                .field("correlation_id", correlation_id)
                .finish(),
            ReplyTarget::Local(_) => f.debug_struct("ReplyTo").field("remote", &false).finish(),
        }
    }
}

async fn write_envelope(
    handle: &AssociationHandle,
    envelope: &RemoteEnvelope,
) -> Result<(), RemoteError> {
    let bytes = envelope.encode()?;
    trace!(remote = %handle.remote_address(), kind = envelope.kind(), len = bytes.len(), "writing envelope");
    handle.write(bytes).await?;
    Ok(())
}

type PendingAssociation = Shared<BoxFuture<'static, Result<AssociationHandle, RemoteError>>>;

/// The remoting service of a node.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Remoting {
    inner: Arc<RemotingInner>,
}

struct RemotingInner {
    settings: RemoteSettings,
    transports: Vec<BoundTransport>,
    local: Arc<dyn LocalDelivery>,
    events: EventStream,
    retry_gate: RetryGate,
    endpoints: Mutex<HashMap<Address, AssociationHandle>>,
    pending_associations: Mutex<HashMap<Address, PendingAssociation>>,
    pending_asks: Mutex<HashMap<u64, PendingAsk>>,
    next_correlation_id: AtomicU64,
    remote_children: Mutex<HashMap<Address, Vec<RemoteChild>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct BoundTransport {
    address: Address,
    transport: Arc<dyn Transport>,
}

struct PendingAsk {
    remote: Address,
    tx: oneshot::Sender<Result<Bytes, DeliveryError>>,
}

struct RemoteChild {
    path: ActorPath,
    supervisor: ActorPath,
}

impl Remoting {
    /// Starts listening on every transport.
    ///
    /// If any transport fails to listen, the ones already listening are shut down again.
    pub async fn start(
        settings: RemoteSettings,
        transports: Vec<Arc<dyn Transport>>,
        local: Arc<dyn LocalDelivery>,
    ) -> Result<Remoting, RemoteError> {
        if transports.is_empty() {
            return Err(RemoteError::NoTransports);
        }

        let mut bound = Vec::with_capacity(transports.len());
        let mut slots = Vec::with_capacity(transports.len());
        for transport in transports {
            match transport.listen().await {
                Ok((address, slot)) => {
                    info!(address = %address, scheme = transport.scheme_identifier(), "remoting listening");
                    bound.push(BoundTransport { address, transport });
                    slots.push(slot);
                }
                Err(err) => {
                    for BoundTransport { transport, .. } in &bound {
                        transport.shutdown().await;
                    }
                    return Err(err.into());
                }
            }
        }

        let closed_for = settings.retry_gate_closed_for;
        let remoting = Remoting {
            inner: Arc::new(RemotingInner {
                retry_gate: RetryGate::new(closed_for),
                settings,
                transports: bound,
                local,
                events: EventStream::new(),
                endpoints: Mutex::default(),
                pending_associations: Mutex::default(),
                pending_asks: Mutex::default(),
                next_correlation_id: AtomicU64::new(0),
                remote_children: Mutex::default(),
                tasks: Mutex::default(),
            }),
        };

        let mut tasks = Vec::with_capacity(slots.len() + 1);
        for slot in slots {
            let (tx, rx) = mpsc::unbounded_channel();
            slot.fill(tx);
            tasks.push(tokio::spawn(accept_inbound(remoting.downgrade(), rx)));
        }
        tasks.push(tokio::spawn(sweep_retry_gate(
            Arc::downgrade(&remoting.inner),
            closed_for,
        )));
        *remoting.inner.tasks.lock() = tasks;

        Ok(remoting)
    }

    /// Builds the transports described by `settings` and starts them.
    pub async fn from_settings(
        settings: RemoteSettings,
        registry: &AssociationRegistry,
        local: Arc<dyn LocalDelivery>,
    ) -> Result<Remoting, RemoteError> {
        let transports = settings.build_transports(registry)?;
        Remoting::start(settings, transports, local).await
    }

    /// The bound address of every transport, in configuration order.
    pub fn addresses(&self) -> Vec<Address> {
        self.inner
            .transports
            .iter()
            .map(|bound| bound.address.clone())
            .collect()
    }

    /// The bound address of the first transport.
    pub fn default_address(&self) -> &Address {
        // `start` refuses to run without transports.
        &self.inner.transports[0].address
    }

    /// The local address used to talk to `remote`, if any transport handles its scheme.
    pub fn local_address_for(&self, remote: &Address) -> Option<Address> {
        self.transport_for(remote)
            .ok()
            .map(|bound| bound.address.clone())
    }

    /// Returns `true` if `address` is one of this node's bound addresses.
    pub fn is_local(&self, address: &Address) -> bool {
        self.inner
            .transports
            .iter()
            .any(|bound| &bound.address == address)
    }

    /// The lifecycle event stream.
    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    /// The retry gate consulted before associating.
    pub fn retry_gate(&self) -> &RetryGate {
        &self.inner.retry_gate
    }

    /// The settings remoting was started with.
    pub fn settings(&self) -> &RemoteSettings {
        &self.inner.settings
    }

    pub(crate) fn local(&self) -> &Arc<dyn LocalDelivery> {
        &self.inner.local
    }

    /// Returns the association to `remote`, establishing one if needed.
    ///
    /// Uses the configured associate timeout. See [`Remoting::associate_within`].
    pub async fn associate(&self, remote: &Address) -> Result<AssociationHandle, RemoteError> {
        self.associate_within(remote, self.inner.settings.associate_timeout)
            .await
    }

    /// Returns the association to `remote`, establishing one within `deadline` if needed.
    ///
    /// Concurrent calls for the same address share one attempt, and each caller waits at most its own
    /// `deadline` for it. Fails fast with
    /// [`TransportError::GatedAddress`] while the retry gate for `remote` is closed. An association that
    /// completes after the deadline is disassociated instead of being returned.
    pub async fn associate_within(
        &self,
        remote: &Address,
        deadline: Duration,
    ) -> Result<AssociationHandle, RemoteError> {
        if let Some(handle) = self.cached_endpoint(remote) {
            return Ok(handle);
        }
        if let Some(until) = self.inner.retry_gate.gated_until(remote) {
            let remaining = until.saturating_duration_since(Instant::now());
            debug!(remote = %remote, ?remaining, "association gated");
            return Err(TransportError::GatedAddress {
                remote: remote.clone(),
                remaining,
            }
            .into());
        }

        let (attempt, joined) = {
            let mut pending = self.inner.pending_associations.lock();
            match pending.get(remote) {
                Some(attempt) => (attempt.clone(), true),
                None => {
                    let attempt = self.start_association(remote, deadline)?;
                    pending.insert(remote.clone(), attempt.clone());
                    (attempt, false)
                }
            }
        };
        if !joined {
            return attempt.await;
        }

        // A joined attempt runs under the deadline of the caller which started it.
        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => {
                debug!(remote = %remote, ?deadline, "gave up waiting for a shared association attempt");
                Err(TransportError::Timeout {
                    remote: remote.clone(),
                }
                .into())
            }
        }
    }

    /// Quarantines `remote` on every responsible transport and drops the association to it.
    pub fn quarantine(&self, remote: &Address, uid: Option<u64>) {
        for bound in &self.inner.transports {
            if bound.transport.is_responsible_for(remote) {
                bound.transport.quarantine(remote, uid);
            }
        }
        let evicted = {
            let mut endpoints = self.inner.endpoints.lock();
            match endpoints.get(remote) {
                Some(handle) if uid.map_or(true, |uid| uid == handle.remote_uid()) => {
                    endpoints.remove(remote)
                }
                _ => None,
            }
        };
        if let Some(handle) = evicted {
            handle.disassociate_with(DisassociateInfo::Quarantined);
        }
        warn!(remote = %remote, uid = ?uid, "remote address quarantined");
        self.inner.events.publish(RemotingEvent::Quarantined {
            address: remote.clone(),
            uid,
        });
    }

    /// Lifts the quarantine of `remote` on every responsible transport.
    pub fn lift_quarantine(&self, remote: &Address) {
        for bound in &self.inner.transports {
            if bound.transport.is_responsible_for(remote) {
                bound.transport.lift_quarantine(remote);
            }
        }
        info!(remote = %remote, "quarantine lifted");
    }

    /// Stops accepting associations, closes every association and shuts the transports down.
    ///
    /// Pending asks fail with [`TransportError::Shutdown`].
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let endpoints: Vec<_> = self
            .inner
            .endpoints
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in endpoints {
            handle.disassociate_with(DisassociateInfo::Shutdown);
        }
        for bound in &self.inner.transports {
            bound.transport.shutdown().await;
        }
        self.inner.pending_asks.lock().clear();
        let addresses = self
            .inner
            .transports
            .iter()
            .map(|bound| &bound.address)
            .join(", ");
        info!(%addresses, "remoting shut down");
    }

    /// Encodes `envelope` and writes it on the association to `remote`.
    pub(crate) async fn send_envelope(
        &self,
        remote: &Address,
        envelope: RemoteEnvelope,
    ) -> Result<(), RemoteError> {
        let handle = self.associate(remote).await?;
        write_envelope(&handle, &envelope).await
    }

    /// Sends an ask to `recipient` and waits up to `timeout` for the reply.
    pub(crate) async fn ask(
        &self,
        recipient: &ActorPath,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RemoteError> {
        let correlation_id = self.inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_asks.lock().insert(
            correlation_id,
            PendingAsk {
                remote: recipient.address().clone(),
                tx,
            },
        );
        let _guard = PendingAskGuard {
            remoting: self,
            correlation_id,
        };

        let exchange = async {
            self.send_envelope(
                recipient.address(),
                RemoteEnvelope::Ask {
                    recipient: recipient.clone(),
                    correlation_id,
                    payload,
                },
            )
            .await?;
            match rx.await {
                Ok(result) => result.map_err(RemoteError::from),
                Err(_) => Err(TransportError::Shutdown.into()),
            }
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                recipient: recipient.clone(),
                timeout,
            }),
        }
    }

    fn downgrade(&self) -> Weak<RemotingInner> {
        Arc::downgrade(&self.inner)
    }

    fn transport_for(&self, remote: &Address) -> Result<&BoundTransport, RemoteError> {
        self.inner
            .transports
            .iter()
            .find(|bound| bound.transport.is_responsible_for(remote))
            .ok_or_else(|| RemoteError::UnsupportedScheme(remote.protocol().to_string()))
    }

    fn cached_endpoint(&self, remote: &Address) -> Option<AssociationHandle> {
        let mut endpoints = self.inner.endpoints.lock();
        match endpoints.get(remote) {
            Some(handle) if !handle.is_disassociated() => Some(handle.clone()),
            Some(_) => {
                endpoints.remove(remote);
                None
            }
            None => None,
        }
    }

    fn start_association(
        &self,
        remote: &Address,
        deadline: Duration,
    ) -> Result<PendingAssociation, RemoteError> {
        let bound = self.transport_for(remote)?;
        let transport = bound.transport.clone();
        let local = bound.address.clone();
        let remote = remote.clone();
        let remoting = self.clone();

        let task = tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            tokio::spawn({
                let remote = remote.clone();
                async move {
                    let result = transport.associate(remote).await;
                    if let Err(Ok(handle)) = tx.send(result) {
                        debug!(remote = %handle.remote_address(), "discarding association completed after its deadline");
                        handle.disassociate();
                    }
                }
            });
            let result = match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::Shutdown),
                Err(_) => Err(TransportError::Timeout {
                    remote: remote.clone(),
                }),
            };
            remoting.finish_association(&local, &remote, result)
        });

        Ok(async move {
            task.await
                .unwrap_or_else(|_| Err(RemoteError::Transport(TransportError::Shutdown)))
        }
        .boxed()
        .shared())
    }

    fn finish_association(
        &self,
        local: &Address,
        remote: &Address,
        result: TransportResult<AssociationHandle>,
    ) -> Result<AssociationHandle, RemoteError> {
        let result = match result {
            Ok(handle) => {
                self.inner.retry_gate.record_success(remote);
                self.register_endpoint(handle.clone());
                Ok(handle)
            }
            Err(err) => {
                if !matches!(err, TransportError::Quarantined { .. }) {
                    self.inner.retry_gate.record_failure(remote);
                }
                let event = RemotingEvent::AssociationError {
                    local: local.clone(),
                    remote: remote.clone(),
                    cause: err.clone(),
                };
                self.log_lifecycle(&event);
                self.inner.events.publish(event);
                Err(err.into())
            }
        };
        self.inner.pending_associations.lock().remove(remote);
        result
    }

    fn register_endpoint(&self, handle: AssociationHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(err) = handle.register_listener(tx) {
            warn!(remote = %handle.remote_address(), "cannot read from association: {err}");
            return;
        }

        let inbound = handle.direction() == Direction::Inbound;
        {
            let mut endpoints = self.inner.endpoints.lock();
            let keep_existing = inbound
                && endpoints
                    .get(handle.remote_address())
                    .is_some_and(|existing| !existing.is_disassociated());
            if !keep_existing {
                endpoints.insert(handle.remote_address().clone(), handle.clone());
            }
        }

        let event = RemotingEvent::Associated {
            local: handle.local_address().clone(),
            remote: handle.remote_address().clone(),
            inbound,
        };
        self.log_lifecycle(&event);
        self.inner.events.publish(event);

        tokio::spawn(read_endpoint(self.downgrade(), handle, rx));
    }

    async fn dispatch(&self, handle: &AssociationHandle, payload: Bytes) {
        let envelope = match RemoteEnvelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(remote = %handle.remote_address(), "dropping undecodable payload: {err}");
                return;
            }
        };
        trace!(remote = %handle.remote_address(), kind = envelope.kind(), "received envelope");

        match envelope {
            RemoteEnvelope::Tell {
                recipient,
                sender,
                payload,
            } => {
                if let Err(err) =
                    self.deliver_local(&recipient, InboundMessage::Tell { payload, sender })
                {
                    warn!(recipient = %recipient, "dropping message: {err}");
                }
            }
            RemoteEnvelope::Ask {
                recipient,
                correlation_id,
                payload,
            } => {
                let reply_to = ReplyTo::remote(handle.clone(), correlation_id);
                if let Err(err) =
                    self.deliver_local(&recipient, InboundMessage::Ask { payload, reply_to })
                {
                    debug!(recipient = %recipient, correlation_id, "failing ask: {err}");
                    let reply = RemoteEnvelope::Reply {
                        correlation_id,
                        result: Err(err),
                    };
                    if let Err(err) = write_envelope(handle, &reply).await {
                        warn!(remote = %handle.remote_address(), "failed to send ask failure: {err}");
                    }
                }
            }
            RemoteEnvelope::Reply {
                correlation_id,
                result,
            } => {
                let pending = {
                    let mut pending_asks = self.inner.pending_asks.lock();
                    let asked = pending_asks
                        .get(&correlation_id)
                        .map(|ask| ask.remote.clone());
                    match asked {
                        Some(asked) if &asked == handle.remote_address() => {
                            pending_asks.remove(&correlation_id)
                        }
                        Some(asked) => {
                            warn!(
                                remote = %handle.remote_address(),
                                asked = %asked,
                                correlation_id,
                                "discarding reply from a node which was not asked"
                            );
                            return;
                        }
                        None => None,
                    }
                };
                match pending {
                    Some(ask) => {
                        let _ = ask.tx.send(result);
                    }
                    None => debug!(correlation_id, "discarding reply to an abandoned ask"),
                }
            }
            RemoteEnvelope::CreateChild { path, supervisor } => {
                if !self.is_local(path.address()) {
                    warn!(path = %path, "refusing to create an actor for another node");
                    return;
                }
                match self.inner.local.create_child(&path, &supervisor) {
                    Ok(()) => {
                        debug!(path = %path, supervisor = %supervisor, "created remotely deployed actor");
                        self.inner
                            .remote_children
                            .lock()
                            .entry(handle.remote_address().clone())
                            .or_default()
                            .push(RemoteChild { path, supervisor });
                    }
                    Err(err) => warn!(path = %path, "failed to create remotely deployed actor: {err}"),
                }
            }
        }
    }

    fn deliver_local(
        &self,
        recipient: &ActorPath,
        message: InboundMessage,
    ) -> Result<(), DeliveryError> {
        if !self.is_local(recipient.address()) {
            return Err(DeliveryError::UnknownRecipient(recipient.to_string()));
        }
        self.inner.local.deliver(recipient, message)
    }

    fn endpoint_closed(&self, handle: &AssociationHandle, info: DisassociateInfo) {
        let remote = handle.remote_address();
        let still_associated = {
            let mut endpoints = self.inner.endpoints.lock();
            if endpoints
                .get(remote)
                .is_some_and(|cached| cached.same_endpoint(handle))
            {
                endpoints.remove(remote);
            }
            endpoints
                .get(remote)
                .is_some_and(|cached| !cached.is_disassociated())
        };
        if info == DisassociateInfo::Unknown {
            self.inner.retry_gate.record_failure(remote);
        }

        let event = RemotingEvent::Disassociated {
            local: handle.local_address().clone(),
            remote: remote.clone(),
            inbound: handle.direction() == Direction::Inbound,
        };
        self.log_lifecycle(&event);
        self.inner.events.publish(event);

        if still_associated {
            return;
        }
        let children = self.inner.remote_children.lock().remove(remote);
        for child in children.into_iter().flatten() {
            debug!(child = %child.path, supervisor = %child.supervisor, "supervisor association lost");
            self.inner
                .local
                .supervisor_lost(&child.path, &child.supervisor);
        }
    }

    fn log_lifecycle(&self, event: &RemotingEvent) {
        let remote = event.remote_address();
        if !self.inner.settings.log_remote_lifecycle_events {
            debug!(remote = %remote, "{event}");
            return;
        }
        match event {
            RemotingEvent::AssociationError { .. } => warn!(remote = %remote, "{event}"),
            _ => info!(remote = %remote, "{event}"),
        }
    }
}

impl fmt::Debug for Remoting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remoting")
            .field("addresses", &self.addresses())
            .field("endpoints", &self.inner.endpoints.lock().len())
            .field("pending_asks", &self.inner.pending_asks.lock().len())
            .finish()
    }
}

struct PendingAskGuard<'a> {
    remoting: &'a Remoting,
    correlation_id: u64,
}

impl Drop for PendingAskGuard<'_> {
    fn drop(&mut self) {
        self.remoting
            .inner
            .pending_asks
            .lock()
            .remove(&self.correlation_id);
    }
}

async fn accept_inbound(
    remoting: Weak<RemotingInner>,
    mut events: mpsc::UnboundedReceiver<AssociationEvent>,
) {
    while let Some(AssociationEvent::InboundAssociation(handle)) = events.recv().await {
        let Some(inner) = remoting.upgrade() else {
            handle.disassociate_with(DisassociateInfo::Shutdown);
            break;
        };
        let remoting = Remoting { inner };
        remoting
            .inner
            .events
            .publish(RemotingEvent::InboundAssociation {
                handle: handle.clone(),
            });
        remoting.register_endpoint(handle);
    }
}

async fn read_endpoint(
    remoting: Weak<RemotingInner>,
    handle: AssociationHandle,
    mut events: mpsc::UnboundedReceiver<HandleEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = remoting.upgrade() else {
            handle.disassociate_with(DisassociateInfo::Shutdown);
            break;
        };
        let remoting = Remoting { inner };
        match event {
            HandleEvent::InboundPayload(payload) => remoting.dispatch(&handle, payload).await,
            HandleEvent::Disassociated(info) => {
                remoting.endpoint_closed(&handle, info);
                break;
            }
        }
    }
}

async fn sweep_retry_gate(remoting: Weak<RemotingInner>, period: Duration) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = remoting.upgrade() else {
            break;
        };
        let pruned = inner.retry_gate.prune_expired();
        if pruned > 0 {
            trace!(pruned, "pruned expired retry gates");
        }
    }
}
