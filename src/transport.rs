//! The pluggable transport layer.
//!
//! A [`Transport`] binds to a local address, establishes associations to remote addresses, and announces
//! associations initiated by peers. Associations are represented by [`AssociationHandle`]s, which are
//! bidirectional, ordered, best-effort payload channels.
//!
//! Listening and associating follow a two-phase protocol. [`Transport::listen`] returns the bound
//! [`Address`] together with a [`ListenerSlot`], and no inbound association is announced until the slot is
//! filled. Likewise each [`AssociationHandle`] buffers inbound payloads until a [`HandleEventListener`] is
//! registered on it, so nothing is lost between association and registration.
//!
//! Implementations provided by this crate:
//!
//! - [`TestTransport`](test::TestTransport): an in-process transport routed through a shared
//!   [`AssociationRegistry`](registry::AssociationRegistry), used for deterministic testing.
//! - [`TcpTransport`](tcp::TcpTransport): a network transport over tokio TCP streams.
//! - [`AdaptedTransport`](adapter::AdaptedTransport): wraps another transport and transforms payloads.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{address::Address, error::TransportResult};

pub use handle::*;

pub mod adapter;
mod handle;
pub mod quarantine;
pub mod registry;
pub mod tcp;
pub mod test;

/// A transport which can listen for and establish associations with remote nodes.
///
/// Implementations must be thread-safe; every method may be called concurrently.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// The protocol scheme this transport handles, e.g. `test` or `tcp`.
    fn scheme_identifier(&self) -> &str;

    /// The largest payload this transport accepts for delivery to itself.
    fn maximum_payload_bytes(&self) -> usize;

    /// Returns `true` if this transport can associate with `remote`.
    fn is_responsible_for(&self, remote: &Address) -> bool {
        remote.protocol() == self.scheme_identifier()
    }

    /// Binds to the configured local address.
    ///
    /// Returns the concrete bound address and a single-assignment slot for the listener of inbound
    /// associations. Inbound associations are not announced until the slot is filled.
    fn listen(&self) -> BoxFuture<'_, TransportResult<(Address, ListenerSlot)>>;

    /// Establishes an association with `remote`.
    ///
    /// Fails with [`TransportError::InvalidAssociation`](crate::error::TransportError::InvalidAssociation)
    /// if nothing is listening on `remote`.
    fn associate(&self, remote: Address) -> BoxFuture<'_, TransportResult<AssociationHandle>>;

    /// Releases the bound address and disassociates every live handle.
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    /// Refuses associations with `remote`.
    ///
    /// With `Some(uid)` only that incarnation is refused, with `None` every incarnation is. Live handles to
    /// matching peers are disassociated.
    fn quarantine(&self, remote: &Address, uid: Option<u64>);

    /// Lifts every quarantine entry for `remote`.
    fn lift_quarantine(&self, remote: &Address);

    /// Returns `true` if the `uid` incarnation of `remote` is quarantined.
    fn is_quarantined(&self, remote: &Address, uid: u64) -> bool;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn scheme_identifier(&self) -> &str {
        T::scheme_identifier(self)
    }

    fn maximum_payload_bytes(&self) -> usize {
        T::maximum_payload_bytes(self)
    }

    fn is_responsible_for(&self, remote: &Address) -> bool {
        T::is_responsible_for(self, remote)
    }

    fn listen(&self) -> BoxFuture<'_, TransportResult<(Address, ListenerSlot)>> {
        T::listen(self)
    }

    fn associate(&self, remote: Address) -> BoxFuture<'_, TransportResult<AssociationHandle>> {
        T::associate(self, remote)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        T::shutdown(self)
    }

    fn quarantine(&self, remote: &Address, uid: Option<u64>) {
        T::quarantine(self, remote, uid)
    }

    fn lift_quarantine(&self, remote: &Address) {
        T::lift_quarantine(self, remote)
    }

    fn is_quarantined(&self, remote: &Address, uid: u64) -> bool {
        T::is_quarantined(self, remote, uid)
    }
}

/// An event delivered to the listener of a transport.
#[derive(Debug)]
pub enum AssociationEvent {
    /// A peer associated with this transport.
    InboundAssociation(AssociationHandle),
}

/// Receives [`AssociationEvent`]s from a transport.
pub trait AssociationEventListener: Send + Sync + 'static {
    /// Called once per event, in the order the events occurred.
    fn notify(&self, event: AssociationEvent);
}

impl AssociationEventListener for mpsc::UnboundedSender<AssociationEvent> {
    fn notify(&self, event: AssociationEvent) {
        let _ = self.send(event);
    }
}

/// Adapts a closure into an [`AssociationEventListener`] or a [`HandleEventListener`].
pub struct FnListener<F>(pub F);

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener").finish_non_exhaustive()
    }
}

impl<F> AssociationEventListener for FnListener<F>
where
    F: Fn(AssociationEvent) + Send + Sync + 'static,
{
    fn notify(&self, event: AssociationEvent) {
        (self.0)(event)
    }
}

impl<F> HandleEventListener for FnListener<F>
where
    F: Fn(HandleEvent) + Send + Sync + 'static,
{
    fn notify(&self, event: HandleEvent) {
        (self.0)(event)
    }
}

/// A single-assignment slot for the listener of inbound associations, returned by [`Transport::listen`].
///
/// Filling the slot consumes it, so a listener can be provided at most once.
pub struct ListenerSlot {
    cell: Arc<SetOnce<Arc<dyn AssociationEventListener>>>,
}

impl ListenerSlot {
    /// Creates an empty slot, along with the promise a transport waits on.
    pub fn new() -> (ListenerSlot, ListenerPromise) {
        let cell = Arc::new(SetOnce::new());
        (
            ListenerSlot { cell: cell.clone() },
            ListenerPromise { cell },
        )
    }

    /// Provides the listener, releasing any inbound association waiting for it.
    pub fn fill<L: AssociationEventListener>(self, listener: L) {
        self.fill_arc(Arc::new(listener));
    }

    /// Provides a shared listener.
    ///
    /// A slot reissued by a repeated [`Transport::listen`] keeps the listener filled in first.
    pub fn fill_arc(self, listener: Arc<dyn AssociationEventListener>) {
        if self.cell.set(listener).is_err() {
            debug!("listener slot already filled, keeping the first listener");
        }
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("filled", &self.cell.get().is_some())
            .finish()
    }
}

/// The transport side of a [`ListenerSlot`].
#[derive(Clone)]
pub struct ListenerPromise {
    cell: Arc<SetOnce<Arc<dyn AssociationEventListener>>>,
}

impl ListenerPromise {
    /// Returns the listener if the slot has been filled.
    pub fn get(&self) -> Option<Arc<dyn AssociationEventListener>> {
        self.cell.get().cloned()
    }

    /// Returns `true` if the slot has been filled.
    pub fn is_ready(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Waits until the slot is filled.
    pub async fn wait(&self) -> Arc<dyn AssociationEventListener> {
        self.cell.wait().await.clone()
    }

    /// Returns another slot for the same listener, for a transport asked to listen again.
    ///
    /// Filling it has no effect once the original slot was filled.
    pub(crate) fn reissue(&self) -> ListenerSlot {
        ListenerSlot {
            cell: self.cell.clone(),
        }
    }
}

impl fmt::Debug for ListenerPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerPromise")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A write-once cell that can be awaited.
pub(crate) struct SetOnce<T> {
    cell: OnceCell<T>,
    ready: watch::Sender<bool>,
}

impl<T> SetOnce<T> {
    pub(crate) fn new() -> Self {
        let (ready, _) = watch::channel(false);
        SetOnce {
            cell: OnceCell::new(),
            ready,
        }
    }

    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        self.cell.set(value)?;
        self.ready.send_replace(true);
        Ok(())
    }

    pub(crate) fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub(crate) async fn wait(&self) -> &T {
        let mut ready = self.ready.subscribe();
        loop {
            if let Some(value) = self.cell.get() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            let _ = ready.changed().await;
        }
    }
}
