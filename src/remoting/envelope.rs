use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeliveryError, RemoteError},
    path::ActorPath,
};

/// The message carried by a single transport payload between two remoting nodes.
///
/// Application payloads are opaque bytes; only the routing information is interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RemoteEnvelope {
    Tell {
        recipient: ActorPath,
        sender: Option<ActorPath>,
        payload: Bytes,
    },
    Ask {
        recipient: ActorPath,
        correlation_id: u64,
        payload: Bytes,
    },
    Reply {
        correlation_id: u64,
        result: Result<Bytes, DeliveryError>,
    },
    CreateChild {
        path: ActorPath,
        supervisor: ActorPath,
    },
}

impl RemoteEnvelope {
    pub(crate) fn encode(&self) -> Result<Bytes, RemoteError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(|err| RemoteError::Codec(err.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        rmp_serde::from_slice(bytes).map_err(|err| RemoteError::Codec(err.to_string()))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            RemoteEnvelope::Tell { .. } => "tell",
            RemoteEnvelope::Ask { .. } => "ask",
            RemoteEnvelope::Reply { .. } => "reply",
            RemoteEnvelope::CreateChild { .. } => "create_child",
        }
    }
}
