//! Defines error handling constructs for the remoting layer.
//!
//! Failures are split by the layer that produces them. [`TransportError`] covers everything a
//! [`Transport`](crate::transport::Transport) or an [`AssociationHandle`](crate::transport::AssociationHandle)
//! can report, and is cheap to clone so the same failure can be returned to the caller and broadcast on the
//! [`EventStream`](crate::event_stream::EventStream). [`RemoteError`] is what callers of the provider and of
//! remote actor references see. [`DeliveryError`] is reported by the local delivery collaborator.

use std::{io, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{address::Address, path::ActorPath};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur during transport and association operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    /// Listening failed because the address is already owned by another listener.
    #[error("address {address} is already bound")]
    Bind {
        /// The contested address.
        address: Address,
    },
    /// No transport is listening on the remote address.
    ///
    /// This is terminal for the attempt and is never retried automatically.
    #[error("no transport is listening on {remote} (associating from {local})")]
    InvalidAssociation {
        /// The address the association was initiated from.
        local: Address,
        /// The address nobody is listening on.
        remote: Address,
    },
    /// The retry gate is closed for the remote address.
    #[error("associations to {remote} are gated for another {remaining:?}")]
    GatedAddress {
        /// The gated address.
        remote: Address,
        /// Time left until the gate opens again.
        remaining: Duration,
    },
    /// A payload exceeded the maximum size accepted by the receiving side.
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// The effective maximum payload size.
        max: usize,
    },
    /// Associating did not complete before its deadline.
    #[error("association to {remote} timed out")]
    Timeout {
        /// The address that could not be reached in time.
        remote: Address,
    },
    /// The peer is quarantined.
    #[error("{remote} is quarantined")]
    Quarantined {
        /// The quarantined address.
        remote: Address,
        /// The quarantined incarnation, or `None` for every incarnation.
        uid: Option<u64>,
    },
    /// The association handle has been disassociated.
    #[error("association between {local} and {remote} is disassociated")]
    Disassociated {
        /// Local side of the association.
        local: Address,
        /// Remote side of the association.
        remote: Address,
    },
    /// An operation was used in a way its contract forbids.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The association handshake failed.
    #[error("handshake with {peer} failed: {reason}")]
    Handshake {
        /// The peer the handshake was performed with.
        peer: String,
        /// Why the handshake failed.
        reason: String,
    },
    /// A transport adapter rejected a payload.
    #[error("adapter {adapter} rejected payload: {reason}")]
    Adapter {
        /// Name of the adapter.
        adapter: &'static str,
        /// Why the payload was rejected.
        reason: String,
    },
    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
    /// An IO failure in a network transport.
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

/// Errors reported by the local delivery collaborator.
///
/// These travel over the wire when an ask cannot be delivered on the remote node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DeliveryError {
    /// No actor lives at the given path.
    #[error("no actor at {0}")]
    UnknownRecipient(String),
    /// The recipient exists but refused the message.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Errors that can occur when parsing an [`Address`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// The `protocol://` prefix is missing.
    #[error("missing protocol in address '{0}'")]
    MissingProtocol(String),
    /// The system name is empty.
    #[error("missing system name in address '{0}'")]
    MissingSystem(String),
    /// A port was given without the `@` separating system and host.
    #[error("port without host in address '{0}'")]
    PortWithoutHost(String),
    /// The port is not a valid `u16`.
    #[error("invalid port in address '{0}'")]
    InvalidPort(String),
}

/// Errors that can occur when parsing an [`ActorPath`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathParseError {
    /// The address part of the path is invalid.
    #[error(transparent)]
    Address(#[from] AddressParseError),
    /// An element is empty or contains a reserved character.
    #[error("invalid path element '{element}' in '{path}'")]
    InvalidElement {
        /// The full path.
        path: String,
        /// The offending element.
        element: String,
    },
    /// A relative path does not start with `/` or has empty elements.
    #[error("invalid relative path '{0}'")]
    InvalidRelative(String),
}

/// Errors in configuration consumed by this crate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An address string could not be parsed.
    #[error(transparent)]
    Address(#[from] AddressParseError),
    /// A deployment path could not be parsed.
    #[error("invalid deployment path '{0}'")]
    InvalidDeploymentPath(String),
    /// A deployment key has a suffix this crate does not understand.
    #[error("unknown deployment key '{0}'")]
    UnknownDeploymentKey(String),
    /// The local address protocol does not match the transport scheme.
    #[error("local address {address} does not use the '{scheme}' scheme")]
    SchemeMismatch {
        /// The configured scheme identifier.
        scheme: String,
        /// The configured local address.
        address: Address,
    },
}

/// Errors surfaced to callers of the provider and of remote actor references.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RemoteError {
    /// The transport or association failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// No reply arrived within the deadline.
    ///
    /// This does not imply the remote side failed.
    #[error("no reply from {recipient} within {timeout:?}")]
    Timeout {
        /// The asked actor.
        recipient: ActorPath,
        /// The deadline that elapsed.
        timeout: Duration,
    },
    /// No transport handles the address protocol.
    #[error("no transport handles the '{0}' scheme")]
    UnsupportedScheme(String),
    /// A path could not be parsed.
    #[error(transparent)]
    InvalidPath(#[from] PathParseError),
    /// The parent of a new actor does not live on this node.
    #[error("{0} is not a local actor")]
    NonLocalParent(ActorPath),
    /// The message could not be delivered.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    /// A wire envelope could not be encoded or decoded.
    #[error("envelope codec failed: {0}")]
    Codec(String),
    /// Remoting was started without any transport.
    #[error("remoting requires at least one transport")]
    NoTransports,
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
