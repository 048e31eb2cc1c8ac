//! A network transport over TCP.
//!
//! Each association is a single TCP stream. Both sides start by exchanging a handshake frame carrying their
//! listen address, incarnation uid and maximum payload size. Every frame afterwards is
//!
//! ```text
//! | length: u32 BE | kind: u8 | body: length - 1 bytes |
//! ```
//!
//! where kind `0` carries a payload and kind `1` announces a disassociation with a one byte reason.

use std::{fmt, io, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    address::Address,
    config::TransportSettings,
    error::{TransportError, TransportResult},
};

use super::{
    quarantine::QuarantineTable, AssociationEvent, AssociationHandle, BoxFuture, Direction,
    DisassociateInfo, HandleIo, ListenerPromise, ListenerSlot, Transport, WeakAssociationHandle,
};

/// The default scheme identifier of [`TcpTransport`].
pub const TCP_SCHEME: &str = "tcp";

const FRAME_PAYLOAD: u8 = 0;
const FRAME_DISASSOCIATE: u8 = 1;
const FRAME_HANDSHAKE: u8 = 2;
const MAX_HANDSHAKE_BYTES: usize = 4096;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct Handshake {
    address: Address,
    uid: u64,
    maximum_payload_bytes: u64,
}

/// A transport carrying associations over TCP streams.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    uid: u64,
    scheme: String,
    requested_address: Address,
    maximum_payload_bytes: usize,
    send_buffer_size: usize,
    quarantine: QuarantineTable,
    state: Mutex<TcpTransportState>,
}

#[derive(Default)]
struct TcpTransportState {
    bound_address: Option<Address>,
    listener: Option<ListenerPromise>,
    accept_task: Option<JoinHandle<()>>,
    handles: Vec<WeakAssociationHandle>,
}

impl TcpTransport {
    /// Creates a transport from configuration.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        TcpTransport {
            inner: Arc::new(TcpTransportInner {
                uid: rand::random(),
                scheme: settings.scheme_identifier.clone(),
                requested_address: settings.local_address.clone(),
                maximum_payload_bytes: settings.maximum_payload_bytes,
                send_buffer_size: settings.send_buffer_size,
                quarantine: QuarantineTable::new(),
                state: Mutex::new(TcpTransportState::default()),
            }),
        }
    }

    /// Creates a transport bound to `address` with default settings.
    pub fn new(address: Address) -> Self {
        TcpTransport::from_settings(&TransportSettings::tcp(address))
    }

    /// The incarnation uid of this transport.
    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    /// The bound address, once listening.
    pub fn bound_address(&self) -> Option<Address> {
        self.inner.state.lock().bound_address.clone()
    }

    fn handshake(&self, address: Address) -> Handshake {
        Handshake {
            address,
            uid: self.inner.uid,
            maximum_payload_bytes: self.inner.maximum_payload_bytes as u64,
        }
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
        {
            let mut state = self.inner.state.lock();
            if let Some(bound) = state.bound_address.clone() {
                let slot = match state.listener.as_ref().map(ListenerPromise::reissue) {
                    Some(slot) => slot,
                    None => {
                        let (slot, promise) = ListenerSlot::new();
                        state.listener = Some(promise);
                        slot
                    }
                };
                return Ok((bound, slot));
            }
        }

        let requested = &self.inner.requested_address;
        let listener = TcpListener::bind((requested.host(), requested.port().unwrap_or(0)))
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::AddrInUse => TransportError::Bind {
                    address: requested.clone(),
                },
                _ => TransportError::from(err),
            })?;
        let port = listener.local_addr()?.port();
        let bound = requested.with_port(port);

        let (slot, promise) = ListenerSlot::new();
        let accept_task = tokio::spawn(accept_loop(self.clone(), listener, bound.clone()));
        {
            let mut state = self.inner.state.lock();
            state.bound_address = Some(bound.clone());
            state.listener = Some(promise);
            state.accept_task = Some(accept_task);
        }
        debug!(address = %bound, uid = self.inner.uid, "tcp transport listening");

        Ok((bound, slot))
    }

    async fn associate_inner(&self, remote: Address) -> TransportResult<AssociationHandle> {
        let Some(local) = self.bound_address() else {
            return Err(TransportError::InvalidOperation(
                "transport must listen before associating",
            ));
        };
        if self.inner.quarantine.is_fully_quarantined(&remote) {
            return Err(TransportError::Quarantined { remote, uid: None });
        }
        let Some(port) = remote.port() else {
            return Err(TransportError::InvalidAssociation { local, remote });
        };

        let mut stream = TcpStream::connect((remote.host(), port))
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::ConnectionRefused => TransportError::InvalidAssociation {
                    local: local.clone(),
                    remote: remote.clone(),
                },
                _ => TransportError::from(err),
            })?;
        stream.set_nodelay(true)?;

        write_handshake(&mut stream, &self.handshake(local.clone())).await?;
        let peer = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream, &remote))
            .await
            .map_err(|_| TransportError::Timeout {
                remote: remote.clone(),
            })??;
        if peer.address != remote {
            warn!(expected = %remote, actual = %peer.address, "peer advertised a different address");
        }
        if self.inner.quarantine.is_quarantined(&peer.address, peer.uid) {
            let _ = write_disassociate(&mut stream, DisassociateInfo::Quarantined).await;
            return Err(TransportError::Quarantined {
                remote: peer.address,
                uid: Some(peer.uid),
            });
        }

        let (handle, io) = AssociationHandle::new(
            local,
            peer.address,
            Direction::Outbound,
            peer.uid,
            peer.maximum_payload_bytes as usize,
            self.inner.send_buffer_size,
        );
        // A remote listener is guaranteed once the peer completed its side of the handshake.
        handle.set_peer_listening();
        self.track(&handle);
        spawn_io(stream, handle.clone(), io, self.inner.maximum_payload_bytes);

        Ok(handle)
    }

    async fn accept(&self, mut stream: TcpStream, local: Address) -> TransportResult<()> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let peer = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_handshake(&mut stream, &peer_addr),
        )
        .await
        .map_err(|_| TransportError::Handshake {
            peer: peer_addr.to_string(),
            reason: "timed out".to_string(),
        })??;

        if self.inner.quarantine.is_quarantined(&peer.address, peer.uid) {
            debug!(remote = %peer.address, "refusing quarantined peer");
            let _ = write_disassociate(&mut stream, DisassociateInfo::Quarantined).await;
            return Ok(());
        }
        let Some(listener) = self.inner.state.lock().listener.clone() else {
            return Err(TransportError::Shutdown);
        };
        let listener = listener.wait().await;
        write_handshake(&mut stream, &self.handshake(local.clone())).await?;

        let (handle, io) = AssociationHandle::new(
            local,
            peer.address,
            Direction::Inbound,
            peer.uid,
            peer.maximum_payload_bytes as usize,
            self.inner.send_buffer_size,
        );
        handle.set_peer_listening();
        self.track(&handle);
        spawn_io(stream, handle.clone(), io, self.inner.maximum_payload_bytes);
        listener.notify(AssociationEvent::InboundAssociation(handle));

        Ok(())
    }

    async fn shutdown_inner(&self) {
        let (accept_task, address) = {
            let mut state = self.inner.state.lock();
            state.listener = None;
            (state.accept_task.take(), state.bound_address.take())
        };
        if let Some(task) = accept_task {
            task.abort();
        }
        for handle in self.live_handles() {
            handle.disassociate_with(DisassociateInfo::Shutdown);
        }
        self.inner.state.lock().handles.clear();
        if let Some(address) = address {
            debug!(address = %address, "tcp transport shut down");
        }
    }
}

async fn accept_loop(transport: TcpTransport, listener: TcpListener, local: Address) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(address = %local, "failed to accept tcp connection: {err}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        trace!(peer_addr = %peer_addr, "accepted tcp connection");
        let transport = transport.clone();
        let local = local.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.accept(stream, local).await {
                warn!(peer_addr = %peer_addr, "inbound association failed: {err}");
            }
        });
    }
}

fn spawn_io(stream: TcpStream, handle: AssociationHandle, mut io: HandleIo, max_inbound: usize) {
    let (mut reader, mut writer) = stream.into_split();

    let write_handle = handle.downgrade();
    tokio::spawn(async move {
        while let Some(payload) = io.next_outbound().await {
            if let Err(err) = write_frame(&mut writer, FRAME_PAYLOAD, &payload).await {
                debug!("tcp write failed: {err}");
                if let Some(handle) = write_handle.upgrade() {
                    handle.disassociate_with(DisassociateInfo::Unknown);
                }
                return;
            }
        }
        let info = write_handle
            .upgrade()
            .and_then(|handle| handle.disassociate_info())
            .unwrap_or(DisassociateInfo::Normal);
        let _ = write_disassociate(&mut writer, info).await;
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                _ = handle.disassociated() => return,
                frame = read_frame(&mut reader, max_inbound + 1) => frame,
            };
            match frame {
                Ok(Some((FRAME_PAYLOAD, body))) => {
                    if handle.deliver(body).await.is_err() {
                        return;
                    }
                }
                Ok(Some((FRAME_DISASSOCIATE, body))) => {
                    let info = body
                        .first()
                        .map_or(DisassociateInfo::Unknown, |byte| DisassociateInfo::from_byte(*byte));
                    handle.disassociate_with(info);
                    return;
                }
                Ok(Some((kind, _))) => {
                    warn!(remote = %handle.remote_address(), kind, "unexpected tcp frame");
                    handle.disassociate_with(DisassociateInfo::Unknown);
                    return;
                }
                Ok(None) => {
                    handle.disassociate_with(DisassociateInfo::Unknown);
                    return;
                }
                Err(err) => {
                    debug!(remote = %handle.remote_address(), "tcp read failed: {err}");
                    handle.disassociate_with(DisassociateInfo::Unknown);
                    return;
                }
            }
        }
    });
}

async fn write_frame<W>(writer: &mut W, kind: u8, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len() + 1)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_u8(kind).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Reads one frame, returning `None` on a clean end of stream.
async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<(u8, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len == 0 || len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit of {max_len}"),
        ));
    }
    let kind = reader.read_u8().await?;
    let mut body = vec![0; len - 1];
    reader.read_exact(&mut body).await?;
    Ok(Some((kind, Bytes::from(body))))
}

async fn write_disassociate<W>(writer: &mut W, info: DisassociateInfo) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, FRAME_DISASSOCIATE, &[info.to_byte()]).await
}

async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = rmp_serde::to_vec(handshake).map_err(|err| TransportError::Handshake {
        peer: handshake.address.to_string(),
        reason: err.to_string(),
    })?;
    write_frame(writer, FRAME_HANDSHAKE, &body).await?;
    Ok(())
}

async fn read_handshake<R, P>(reader: &mut R, peer: &P) -> TransportResult<Handshake>
where
    R: AsyncRead + Unpin,
    P: fmt::Display + ?Sized,
{
    let failed = |reason: String| TransportError::Handshake {
        peer: peer.to_string(),
        reason,
    };
    match read_frame(reader, MAX_HANDSHAKE_BYTES).await? {
        Some((FRAME_HANDSHAKE, body)) => {
            rmp_serde::from_slice(&body).map_err(|err| failed(err.to_string()))
        }
        Some((FRAME_DISASSOCIATE, body)) => {
            let info = body
                .first()
                .map_or(DisassociateInfo::Unknown, |byte| DisassociateInfo::from_byte(*byte));
            Err(failed(format!("peer refused association ({info:?})")))
        }
        Some((kind, _)) => Err(failed(format!("unexpected frame kind {kind}"))),
        None => Err(failed("connection closed during handshake".to_string())),
    }
}

impl Transport for TcpTransport {
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

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("requested_address", &self.inner.requested_address)
            .field("bound_address", &self.bound_address())
            .field("uid", &self.inner.uid)
            .finish()
    }
}
