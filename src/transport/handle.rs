use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{
    address::Address,
    error::{TransportError, TransportResult},
};

use super::SetOnce;

/// Which side initiated an association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A peer associated with us.
    Inbound,
    /// We associated with a peer.
    Outbound,
}

/// The lifecycle state of an [`AssociationHandle`].
///
/// `Initializing -> Open -> Disassociated`, where `Initializing` may also move straight to `Disassociated`.
/// `Disassociated` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// The handle exists but one of the endpoints has not registered a listener yet.
    Initializing,
    /// Both endpoints registered listeners.
    Open,
    /// The association is closed.
    Disassociated,
}

/// Why an association was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisassociateInfo {
    /// Closed on request.
    Normal,
    /// The association failed, e.g. the connection dropped.
    Unknown,
    /// The transport was shut down.
    Shutdown,
    /// The peer was quarantined.
    Quarantined,
}

impl DisassociateInfo {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            DisassociateInfo::Normal => 0,
            DisassociateInfo::Unknown => 1,
            DisassociateInfo::Shutdown => 2,
            DisassociateInfo::Quarantined => 3,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Self {
        match byte {
            0 => DisassociateInfo::Normal,
            2 => DisassociateInfo::Shutdown,
            3 => DisassociateInfo::Quarantined,
            _ => DisassociateInfo::Unknown,
        }
    }
}

/// An event delivered to the listener of an [`AssociationHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleEvent {
    /// A payload written by the peer.
    InboundPayload(Bytes),
    /// The association was closed. Delivered exactly once, after every payload.
    Disassociated(DisassociateInfo),
}

/// Receives [`HandleEvent`]s from an [`AssociationHandle`].
pub trait HandleEventListener: Send + Sync + 'static {
    /// Called once per event, in the order the events occurred.
    fn notify(&self, event: HandleEvent);
}

impl HandleEventListener for mpsc::UnboundedSender<HandleEvent> {
    fn notify(&self, event: HandleEvent) {
        let _ = self.send(event);
    }
}

type DisassociateHook = Box<dyn FnOnce(DisassociateInfo) + Send>;
type RegisteredHook = Box<dyn FnOnce() + Send>;

/// One endpoint of an association.
///
/// Handles are cheap to clone; all clones refer to the same endpoint. Writes are delivered to the peer in
/// order. Inbound payloads are buffered until a listener is registered with
/// [`register_listener`](AssociationHandle::register_listener).
///
/// Transports create handles with [`AssociationHandle::new`] and move outbound payloads from the returned
/// [`HandleIo`] to the peer, feeding inbound payloads back with [`deliver`](AssociationHandle::deliver).
#[derive(Clone)]
pub struct AssociationHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    local_address: Address,
    remote_address: Address,
    direction: Direction,
    remote_uid: u64,
    payload_limit: usize,
    outbound: mpsc::Sender<Bytes>,
    listener: SetOnce<Arc<dyn HandleEventListener>>,
    peer_listening: AtomicBool,
    closed: watch::Sender<Option<DisassociateInfo>>,
    notified: Mutex<bool>,
    on_disassociate: Mutex<Option<DisassociateHook>>,
    on_listener_registered: Mutex<Option<RegisteredHook>>,
    on_peer_listening: Mutex<Option<RegisteredHook>>,
}

/// A weak reference to an [`AssociationHandle`].
#[derive(Clone, Debug)]
pub struct WeakAssociationHandle {
    inner: Weak<HandleInner>,
}

impl WeakAssociationHandle {
    /// Upgrades to a handle if any strong reference is left.
    pub fn upgrade(&self) -> Option<AssociationHandle> {
        self.inner.upgrade().map(|inner| AssociationHandle { inner })
    }
}

/// The transport side of an [`AssociationHandle`].
#[derive(Debug)]
pub struct HandleIo {
    outbound: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<Option<DisassociateInfo>>,
}

impl HandleIo {
    /// Returns the next payload written to the handle.
    ///
    /// Returns `None` once the handle is disassociated or every clone of it has been dropped.
    pub async fn next_outbound(&mut self) -> Option<Bytes> {
        loop {
            if self.closed.borrow_and_update().is_some() {
                return None;
            }
            tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        // Every handle is gone; drain what was queued.
                        return self.outbound.recv().await;
                    }
                }
                payload = self.outbound.recv() => return payload,
            }
        }
    }
}

impl AssociationHandle {
    /// Creates a handle for a transport.
    ///
    /// `payload_limit` is the largest payload the peer accepts, and `buffer_size` bounds the number of
    /// outbound payloads queued before [`write`](AssociationHandle::write) applies backpressure.
    pub fn new(
        local_address: Address,
        remote_address: Address,
        direction: Direction,
        remote_uid: u64,
        payload_limit: usize,
        buffer_size: usize,
    ) -> (AssociationHandle, HandleIo) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size.max(1));
        let (closed_tx, closed_rx) = watch::channel(None);
        let handle = AssociationHandle {
            inner: Arc::new(HandleInner {
                local_address,
                remote_address,
                direction,
                remote_uid,
                payload_limit,
                outbound: outbound_tx,
                listener: SetOnce::new(),
                peer_listening: AtomicBool::new(false),
                closed: closed_tx,
                notified: Mutex::new(false),
                on_disassociate: Mutex::new(None),
                on_listener_registered: Mutex::new(None),
                on_peer_listening: Mutex::new(None),
            }),
        };
        let io = HandleIo {
            outbound: outbound_rx,
            closed: closed_rx,
        };
        (handle, io)
    }

    /// The local address of the association.
    pub fn local_address(&self) -> &Address {
        &self.inner.local_address
    }

    /// The remote address of the association.
    pub fn remote_address(&self) -> &Address {
        &self.inner.remote_address
    }

    /// Which side initiated the association.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The incarnation uid of the peer transport.
    pub fn remote_uid(&self) -> u64 {
        self.inner.remote_uid
    }

    /// The largest payload the peer accepts.
    pub fn payload_limit(&self) -> usize {
        self.inner.payload_limit
    }

    /// The current lifecycle state.
    pub fn state(&self) -> HandleState {
        if self.is_disassociated() {
            HandleState::Disassociated
        } else if self.inner.listener.get().is_some()
            && self.inner.peer_listening.load(Ordering::Acquire)
        {
            HandleState::Open
        } else {
            HandleState::Initializing
        }
    }

    /// Returns `true` once a listener has been registered.
    pub fn has_listener(&self) -> bool {
        self.inner.listener.get().is_some()
    }

    /// Returns `true` once the handle has been disassociated.
    pub fn is_disassociated(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    /// The reason the handle was disassociated, if it has been.
    pub fn disassociate_info(&self) -> Option<DisassociateInfo> {
        *self.inner.closed.borrow()
    }

    /// Waits until the handle is disassociated and returns the reason.
    pub async fn disassociated(&self) -> DisassociateInfo {
        let mut closed = self.inner.closed.subscribe();
        loop {
            let state = *closed.borrow_and_update();
            if let Some(info) = state {
                return info;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            let _ = closed.changed().await;
        }
    }

    /// Queues `payload` for delivery to the peer.
    ///
    /// Fails with [`TransportError::PayloadTooLarge`] if the payload exceeds
    /// [`payload_limit`](AssociationHandle::payload_limit), in which case the handle stays open.
    /// Waits for buffer space if the outbound queue is full.
    pub async fn write(&self, payload: Bytes) -> TransportResult<()> {
        if payload.len() > self.inner.payload_limit {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.inner.payload_limit,
            });
        }
        if self.is_disassociated() {
            return Err(self.disassociated_error());
        }
        tokio::select! {
            biased;
            _ = self.disassociated() => Err(self.disassociated_error()),
            res = self.inner.outbound.send(payload) => res.map_err(|_| self.disassociated_error()),
        }
    }

    /// Registers the listener for inbound payloads and the disassociation notice.
    ///
    /// May be called once. Payloads that arrived earlier are delivered once the listener is registered, and
    /// a handle that was already disassociated notifies the new listener immediately.
    pub fn register_listener<L: HandleEventListener>(&self, listener: L) -> TransportResult<()> {
        self.inner
            .listener
            .set(Arc::new(listener))
            .map_err(|_| TransportError::InvalidOperation("handle listener is already registered"))?;
        let hook = self.inner.on_listener_registered.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(info) = self.disassociate_info() {
            self.notify_disassociated(info);
        }
        Ok(())
    }

    /// Closes the association with [`DisassociateInfo::Normal`].
    ///
    /// Idempotent; the peer is notified exactly once.
    pub fn disassociate(&self) {
        self.disassociate_with(DisassociateInfo::Normal);
    }

    /// Closes the association with the given reason. Calls after the first have no effect.
    pub fn disassociate_with(&self, info: DisassociateInfo) {
        let first = self.inner.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(info);
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        self.notify_disassociated(info);
        let hook = self.inner.on_disassociate.lock().take();
        if let Some(hook) = hook {
            hook(info);
        }
    }

    /// Hands a payload from the peer to the listener, waiting for a listener to be registered.
    ///
    /// Fails if the handle is disassociated first.
    pub async fn deliver(&self, payload: Bytes) -> TransportResult<()> {
        let listener = tokio::select! {
            biased;
            _ = self.disassociated() => return Err(self.disassociated_error()),
            listener = self.inner.listener.wait() => listener.clone(),
        };
        // Holding the notification lock orders payloads before the disassociation notice.
        let notified = self.inner.notified.lock();
        if *notified || self.is_disassociated() {
            return Err(self.disassociated_error());
        }
        listener.notify(HandleEvent::InboundPayload(payload));
        drop(notified);
        Ok(())
    }

    /// Waits until a listener is registered on this handle.
    pub async fn listener_registered(&self) {
        self.inner.listener.wait().await;
    }

    /// Marks the peer endpoint as having registered its listener.
    pub fn set_peer_listening(&self) {
        self.inner.peer_listening.store(true, Ordering::Release);
        let hook = self.inner.on_peer_listening.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Sets the hook invoked once the peer endpoint has registered its listener.
    pub fn on_peer_listening<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.on_peer_listening.lock();
        if self.inner.peer_listening.load(Ordering::Acquire) {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Sets the hook invoked once when this handle is disassociated, typically to close the peer.
    pub fn on_disassociate<F>(&self, hook: F)
    where
        F: FnOnce(DisassociateInfo) + Send + 'static,
    {
        *self.inner.on_disassociate.lock() = Some(Box::new(hook));
    }

    /// Sets the hook invoked once when a listener is registered on this handle.
    pub fn on_listener_registered<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.on_listener_registered.lock();
        if self.inner.listener.get().is_some() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Returns a weak reference to this handle.
    pub fn downgrade(&self) -> WeakAssociationHandle {
        WeakAssociationHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if both handles refer to the same endpoint.
    pub fn same_endpoint(&self, other: &AssociationHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify_disassociated(&self, info: DisassociateInfo) {
        let mut notified = self.inner.notified.lock();
        if *notified {
            return;
        }
        if let Some(listener) = self.inner.listener.get() {
            *notified = true;
            listener.notify(HandleEvent::Disassociated(info));
        }
    }

    fn disassociated_error(&self) -> TransportError {
        TransportError::Disassociated {
            local: self.inner.local_address.clone(),
            remote: self.inner.remote_address.clone(),
        }
    }
}

impl fmt::Debug for AssociationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationHandle")
            .field("local_address", &self.inner.local_address)
            .field("remote_address", &self.inner.remote_address)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (AssociationHandle, HandleIo) {
        AssociationHandle::new(
            "test://sysA@localhost:1".parse().unwrap(),
            "test://sysB@localhost:2".parse().unwrap(),
            Direction::Outbound,
            7,
            16,
            4,
        )
    }

    #[tokio::test]
    async fn write_rejects_oversized_payload_and_stays_open() {
        let (handle, mut io) = pair();
        let err = handle.write(Bytes::from(vec![0; 17])).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { size: 17, max: 16 }));
        assert!(!handle.is_disassociated());

        handle.write(Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(io.next_outbound().await, Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn deliver_waits_for_listener() {
        let (handle, _io) = pair();
        let delivery = tokio::spawn({
            let handle = handle.clone();
            async move { handle.deliver(Bytes::from_static(b"early")).await }
        });
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.register_listener(tx).unwrap();
        delivery.await.unwrap().unwrap();
        assert_eq!(
            rx.recv().await,
            Some(HandleEvent::InboundPayload(Bytes::from_static(b"early")))
        );
    }

    #[tokio::test]
    async fn disassociate_is_idempotent() {
        let (handle, mut io) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.register_listener(tx).unwrap();

        handle.disassociate();
        handle.disassociate_with(DisassociateInfo::Unknown);
        assert_eq!(handle.state(), HandleState::Disassociated);
        assert_eq!(handle.disassociate_info(), Some(DisassociateInfo::Normal));
        assert_eq!(
            rx.recv().await,
            Some(HandleEvent::Disassociated(DisassociateInfo::Normal))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(io.next_outbound().await, None);
        assert!(matches!(
            handle.write(Bytes::from_static(b"late")).await,
            Err(TransportError::Disassociated { .. })
        ));
    }

    #[tokio::test]
    async fn late_listener_is_told_about_disassociation() {
        let (handle, _io) = pair();
        handle.disassociate_with(DisassociateInfo::Shutdown);

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.register_listener(tx).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(HandleEvent::Disassociated(DisassociateInfo::Shutdown))
        );
    }

    #[tokio::test]
    async fn second_listener_is_rejected() {
        let (handle, _io) = pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.register_listener(tx.clone()).unwrap();
        assert!(matches!(
            handle.register_listener(tx),
            Err(TransportError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn state_opens_once_both_sides_listen() {
        let (handle, _io) = pair();
        assert_eq!(handle.state(), HandleState::Initializing);
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.register_listener(tx).unwrap();
        assert_eq!(handle.state(), HandleState::Initializing);
        handle.set_peer_listening();
        assert_eq!(handle.state(), HandleState::Open);
    }

    #[tokio::test]
    async fn disassociate_hook_runs_once() {
        let (handle, _io) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on_disassociate(move |info| {
            let _ = tx.send(info);
        });
        handle.disassociate_with(DisassociateInfo::Quarantined);
        handle.disassociate();
        assert_eq!(rx.recv().await, Some(DisassociateInfo::Quarantined));
        assert_eq!(rx.recv().await, None);
    }
}
