//! Broadcast of remoting lifecycle events.
//!
//! Subscribers register interest in one or more [`EventKind`]s and receive matching [`RemotingEvent`]s in
//! publication order. Each subscriber has its own unbounded queue, so a slow subscriber never causes events
//! to be dropped for others. Subscriptions end when the [`EventSubscription`] is dropped.

use std::{
    collections::HashSet,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{address::Address, error::TransportError, transport::AssociationHandle};

/// A remoting lifecycle event.
#[derive(Clone, Debug)]
pub enum RemotingEvent {
    /// Associating with a remote address failed.
    AssociationError {
        /// The local address.
        local: Address,
        /// The remote address.
        remote: Address,
        /// What went wrong.
        cause: TransportError,
    },
    /// An association was established.
    Associated {
        /// The local address.
        local: Address,
        /// The remote address.
        remote: Address,
        /// `true` if the peer initiated it.
        inbound: bool,
    },
    /// An association was closed.
    Disassociated {
        /// The local address.
        local: Address,
        /// The remote address.
        remote: Address,
        /// `true` if the peer initiated it.
        inbound: bool,
    },
    /// A peer associated with this node.
    InboundAssociation {
        /// The new association.
        handle: AssociationHandle,
    },
    /// A remote address was quarantined.
    Quarantined {
        /// The quarantined address.
        address: Address,
        /// The quarantined incarnation, or `None` for every incarnation.
        uid: Option<u64>,
    },
}

impl RemotingEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RemotingEvent::AssociationError { .. } => EventKind::AssociationError,
            RemotingEvent::Associated { .. } => EventKind::Associated,
            RemotingEvent::Disassociated { .. } => EventKind::Disassociated,
            RemotingEvent::InboundAssociation { .. } => EventKind::InboundAssociation,
            RemotingEvent::Quarantined { .. } => EventKind::Quarantined,
        }
    }

    /// The remote address the event is about.
    pub fn remote_address(&self) -> &Address {
        match self {
            RemotingEvent::AssociationError { remote, .. }
            | RemotingEvent::Associated { remote, .. }
            | RemotingEvent::Disassociated { remote, .. } => remote,
            RemotingEvent::InboundAssociation { handle } => handle.remote_address(),
            RemotingEvent::Quarantined { address, .. } => address,
        }
    }
}

impl fmt::Display for RemotingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemotingEvent::AssociationError {
                local,
                remote,
                cause,
            } => write!(f, "association error [{local}] -> [{remote}]: {cause}"),
            RemotingEvent::Associated {
                local,
                remote,
                inbound,
            } => write!(f, "associated [{local}] {} [{remote}]", arrow(*inbound)),
            RemotingEvent::Disassociated {
                local,
                remote,
                inbound,
            } => write!(f, "disassociated [{local}] {} [{remote}]", arrow(*inbound)),
            RemotingEvent::InboundAssociation { handle } => write!(
                f,
                "inbound association [{}] <- [{}]",
                handle.local_address(),
                handle.remote_address()
            ),
            RemotingEvent::Quarantined { address, uid } => match uid {
                Some(uid) => write!(f, "quarantined [{address}#{uid}]"),
                None => write!(f, "quarantined [{address}]"),
            },
        }
    }
}

fn arrow(inbound: bool) -> &'static str {
    if inbound {
        "<-"
    } else {
        "->"
    }
}

/// Discriminant of [`RemotingEvent`], used to filter subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`RemotingEvent::AssociationError`].
    AssociationError,
    /// [`RemotingEvent::Associated`].
    Associated,
    /// [`RemotingEvent::Disassociated`].
    Disassociated,
    /// [`RemotingEvent::InboundAssociation`].
    InboundAssociation,
    /// [`RemotingEvent::Quarantined`].
    Quarantined,
}

/// Broadcasts [`RemotingEvent`]s to subscribers.
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventStream {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

struct Subscriber {
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<RemotingEvent>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

impl EventStream {
    /// Creates a stream without subscribers.
    pub fn new() -> Self {
        EventStream::default()
    }

    /// Delivers `event` to every interested subscriber.
    pub fn publish(&self, event: RemotingEvent) {
        let kind = event.kind();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if subscriber.wants(kind) {
                subscriber.tx.send(event.clone()).is_ok()
            } else {
                !subscriber.tx.is_closed()
            }
        });
    }

    /// Subscribes to events of the given kinds.
    pub fn subscribe<I>(&self, kinds: I) -> EventSubscription
    where
        I: IntoIterator<Item = EventKind>,
    {
        self.add_subscriber(Some(kinds.into_iter().collect()))
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> EventSubscription {
        self.add_subscriber(None)
    }

    /// The number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        subscribers.len()
    }

    fn add_subscriber(&self, kinds: Option<HashSet<EventKind>>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { kinds, tx });
        EventSubscription { rx }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// A subscription to an [`EventStream`].
///
/// Also a [`Stream`] of events.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<RemotingEvent>,
}

impl EventSubscription {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<RemotingEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<RemotingEvent> {
        self.rx.try_recv().ok()
    }

    /// Converts the subscription into a tokio stream.
    pub fn into_stream(self) -> UnboundedReceiverStream<RemotingEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl Stream for EventSubscription {
    type Item = RemotingEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
