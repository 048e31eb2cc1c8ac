//! Transport adapters.
//!
//! An [`AdaptedTransport`] wraps another [`Transport`] and passes every payload through a
//! [`PayloadCodec`] on its way out and back in. The scheme identifier is unchanged, so adapted and plain
//! transports of the same scheme can only talk to each other if both apply the same adapters.

use std::{fmt, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    address::Address,
    error::{TransportError, TransportResult},
};

use super::{
    AssociationEvent, AssociationEventListener, AssociationHandle, BoxFuture, DisassociateInfo,
    HandleEvent, ListenerSlot, Transport,
};

/// Transforms payloads passing through an [`AdaptedTransport`].
pub trait PayloadCodec: fmt::Debug + Send + Sync + 'static {
    /// A short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// The number of bytes [`encode`](PayloadCodec::encode) adds.
    fn overhead(&self) -> usize;

    /// Transforms an outbound payload.
    fn encode(&self, payload: Bytes) -> Bytes;

    /// Reverses [`encode`](PayloadCodec::encode) for an inbound payload.
    fn decode(&self, payload: Bytes) -> TransportResult<Bytes>;
}

/// Appends a big-endian CRC32 checksum to every payload and verifies it on receipt.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32Codec;

const CRC_LEN: usize = 4;

impl PayloadCodec for Crc32Codec {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn overhead(&self) -> usize {
        CRC_LEN
    }

    fn encode(&self, payload: Bytes) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + CRC_LEN);
        buf.put_slice(&payload);
        buf.put_u32(crc32fast::hash(&payload));
        buf.freeze()
    }

    fn decode(&self, mut payload: Bytes) -> TransportResult<Bytes> {
        if payload.len() < CRC_LEN {
            return Err(TransportError::Adapter {
                adapter: self.name(),
                reason: format!("payload of {} bytes has no checksum", payload.len()),
            });
        }
        let mut checksum = payload.split_off(payload.len() - CRC_LEN);
        let expected = checksum.get_u32();
        let actual = crc32fast::hash(&payload);
        if expected != actual {
            return Err(TransportError::Adapter {
                adapter: self.name(),
                reason: format!("checksum mismatch: expected {expected:#010x}, got {actual:#010x}"),
            });
        }
        Ok(payload)
    }
}

/// A [`Transport`] whose payloads pass through a [`PayloadCodec`].
#[derive(Clone)]
pub struct AdaptedTransport {
    inner: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    send_buffer_size: usize,
}

impl AdaptedTransport {
    /// Wraps `inner` with `codec`.
    pub fn new(
        inner: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
        send_buffer_size: usize,
    ) -> Self {
        AdaptedTransport {
            inner,
            codec,
            send_buffer_size,
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.inner
    }

    async fn listen_inner(&self) -> TransportResult<(Address, ListenerSlot)> {
        let (address, inner_slot) = self.inner.listen().await?;
        let (slot, promise) = ListenerSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        inner_slot.fill(tx);

        let adapter = self.clone();
        tokio::spawn(async move {
            let listener = promise.wait().await;
            while let Some(AssociationEvent::InboundAssociation(handle)) = rx.recv().await {
                match adapter.wrap(handle.clone()) {
                    Ok(wrapped) => listener.notify(AssociationEvent::InboundAssociation(wrapped)),
                    Err(err) => {
                        warn!(
                            remote = %handle.remote_address(),
                            adapter = adapter.codec.name(),
                            "failed to adapt inbound association: {err}"
                        );
                        handle.disassociate_with(DisassociateInfo::Unknown);
                    }
                }
            }
        });

        Ok((address, slot))
    }

    async fn associate_inner(&self, remote: Address) -> TransportResult<AssociationHandle> {
        let handle = self.inner.associate(remote).await?;
        self.wrap(handle.clone()).map_err(|err| {
            handle.disassociate_with(DisassociateInfo::Unknown);
            err
        })
    }

    /// Puts an adapted handle in front of `inner`.
    fn wrap(&self, inner: AssociationHandle) -> TransportResult<AssociationHandle> {
        let (outer, mut io) = AssociationHandle::new(
            inner.local_address().clone(),
            inner.remote_address().clone(),
            inner.direction(),
            inner.remote_uid(),
            inner.payload_limit().saturating_sub(self.codec.overhead()),
            self.send_buffer_size,
        );
        if inner.has_listener() {
            return Err(TransportError::InvalidOperation(
                "handle listener is already registered",
            ));
        }
        // The inner handle only reads once the outer one has a listener, so the peer opens in step.
        let (tx, mut rx) = mpsc::unbounded_channel();
        outer.on_listener_registered({
            let inner = inner.clone();
            move || {
                if let Err(err) = inner.register_listener(tx) {
                    warn!(remote = %inner.remote_address(), "cannot read from adapted association: {err}");
                    inner.disassociate_with(DisassociateInfo::Unknown);
                }
            }
        });
        inner.on_peer_listening({
            let outer = outer.downgrade();
            move || {
                if let Some(outer) = outer.upgrade() {
                    outer.set_peer_listening();
                }
            }
        });
        outer.on_disassociate({
            let inner = inner.clone();
            move |info| inner.disassociate_with(info)
        });

        let codec = self.codec.clone();
        let writer = inner.clone();
        tokio::spawn(async move {
            while let Some(payload) = io.next_outbound().await {
                if writer.write(codec.encode(payload)).await.is_err() {
                    break;
                }
            }
        });

        let codec = self.codec.clone();
        let reader = outer.downgrade();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(outer) = reader.upgrade() else {
                    inner.disassociate();
                    break;
                };
                match event {
                    HandleEvent::InboundPayload(payload) => match codec.decode(payload) {
                        Ok(payload) => {
                            if outer.deliver(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(remote = %inner.remote_address(), "dropping association: {err}");
                            outer.disassociate_with(DisassociateInfo::Unknown);
                            break;
                        }
                    },
                    HandleEvent::Disassociated(info) => {
                        outer.disassociate_with(info);
                        break;
                    }
                }
            }
        });

        Ok(outer)
    }
}

impl Transport for AdaptedTransport {
    fn scheme_identifier(&self) -> &str {
        self.inner.scheme_identifier()
    }

    fn maximum_payload_bytes(&self) -> usize {
        self.inner
            .maximum_payload_bytes()
            .saturating_sub(self.codec.overhead())
    }

    fn is_responsible_for(&self, remote: &Address) -> bool {
        self.inner.is_responsible_for(remote)
    }

    fn listen(&self) -> BoxFuture<'_, TransportResult<(Address, ListenerSlot)>> {
        Box::pin(self.listen_inner())
    }

    fn associate(&self, remote: Address) -> BoxFuture<'_, TransportResult<AssociationHandle>> {
        Box::pin(self.associate_inner(remote))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn quarantine(&self, remote: &Address, uid: Option<u64>) {
        self.inner.quarantine(remote, uid)
    }

    fn lift_quarantine(&self, remote: &Address) {
        self.inner.lift_quarantine(remote)
    }

    fn is_quarantined(&self, remote: &Address, uid: u64) -> bool {
        self.inner.is_quarantined(remote, uid)
    }
}

impl fmt::Debug for AdaptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptedTransport")
            .field("inner", &self.inner)
            .field("codec", &self.codec)
            .finish()
    }
}
