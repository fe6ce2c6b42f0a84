//! Per-peer connection state and framing.
//!
//! One `Connection` represents one peer, whether it arrived over a TCP
//! accept or was registered as a logical UDP session. The connection owns
//! the write side of its transport; reads happen in the per-connection
//! task (TCP) or are injected by the datagram loop (UDP). Within one
//! connection, inbound packets run through the pipeline in arrival order
//! and outbound writes complete in issue order, serialized by the writer
//! lock.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use gatewire_core::{DispatchResult, PeerInfo, Pipeline};
use gatewire_crypto::CipherSuite;
use gatewire_proto::{
    BufferPool, ControlAction, ControlFlags, ControlFrame, ControlReason, ControlType, HEADER_SIZE,
    Identifier, Packet, PacketHeader, Transport,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// Total encoded size under which sends use a stack buffer.
const STACK_ENCODE_LIMIT: usize = 512;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted but not yet ready for application traffic.
    Handshaking = 0,
    /// Serving application packets.
    Ready = 1,
    /// Close in progress.
    Closing = 2,
    /// Fully closed; no further sends.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Ready,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

enum Writer {
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
    Udp { socket: Arc<UdpSocket>, target: SocketAddr },
}

type CloseHook = Box<dyn FnOnce() + Send>;
type PacketHook = Box<dyn Fn(&Packet) + Send + Sync>;

struct Security {
    key: Vec<u8>,
    suite: CipherSuite,
}

/// One peer: identity, negotiated security, write side, and hooks.
pub struct Connection {
    id: Identifier,
    remote: SocketAddr,
    transport: Transport,
    state: AtomicU8,
    permission_level: AtomicU8,
    security: std::sync::Mutex<Security>,
    writer: Writer,
    pipeline: Arc<Pipeline>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_close: std::sync::Mutex<Vec<CloseHook>>,
    on_process: std::sync::Mutex<Vec<PacketHook>>,
    on_post_process: std::sync::Mutex<Vec<PacketHook>>,
    release_slot: std::sync::Mutex<Option<CloseHook>>,
}

impl Connection {
    /// Connection over an accepted TCP stream's write half.
    #[must_use]
    pub fn tcp(
        id: Identifier,
        remote: SocketAddr,
        write_half: OwnedWriteHalf,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
    ) -> Self {
        let pool = Arc::clone(pipeline.pool());
        Self::new(id, remote, Transport::Tcp, Writer::Tcp(tokio::sync::Mutex::new(write_half)), pipeline, pool, cancel)
    }

    /// Logical UDP session writing through the shared datagram socket.
    #[must_use]
    pub fn udp(
        id: Identifier,
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
    ) -> Self {
        let pool = Arc::clone(pipeline.pool());
        Self::new(id, remote, Transport::Udp, Writer::Udp { socket, target: remote }, pipeline, pool, cancel)
    }

    fn new(
        id: Identifier,
        remote: SocketAddr,
        transport: Transport,
        writer: Writer,
        pipeline: Arc<Pipeline>,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote,
            transport,
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            permission_level: AtomicU8::new(0),
            security: std::sync::Mutex::new(Security { key: Vec::new(), suite: CipherSuite::default() }),
            writer,
            pipeline,
            pool,
            cancel,
            closed: AtomicBool::new(false),
            on_close: std::sync::Mutex::new(Vec::new()),
            on_process: std::sync::Mutex::new(Vec::new()),
            on_post_process: std::sync::Mutex::new(Vec::new()),
            release_slot: std::sync::Mutex::new(None),
        }
    }

    /// Stable identity of this connection.
    #[must_use]
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Peer IP and port.
    #[must_use]
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    /// Transport this connection rides on.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Permission level granted to this peer.
    #[must_use]
    pub fn permission_level(&self) -> u8 {
        self.permission_level.load(Ordering::Acquire)
    }

    /// Cancellation token scoped to this connection.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Promote to `Ready` with negotiated permission and key material.
    pub fn set_ready(&self, permission_level: u8, key: Vec<u8>, suite: CipherSuite) {
        self.permission_level.store(permission_level, Ordering::Release);
        {
            let mut security =
                self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            security.key = key;
            security.suite = suite;
        }
        self.state.store(ConnectionState::Ready as u8, Ordering::Release);
    }

    /// Register a hook fired exactly once when the connection closes.
    pub fn on_close(&self, hook: CloseHook) {
        self.on_close.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(hook);
    }

    /// Register a hook fired before each inbound packet enters the
    /// pipeline.
    pub fn on_process(&self, hook: PacketHook) {
        self.on_process.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(hook);
    }

    /// Register a hook fired after each inbound packet's dispatch
    /// completes.
    pub fn on_post_process(&self, hook: PacketHook) {
        self.on_post_process.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(hook);
    }

    /// Install the closure that returns this connection's hub entry and
    /// per-IP slot. Run once, at close.
    pub fn set_release_slot(&self, release: CloseHook) {
        *self.release_slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(release);
    }

    /// Peer facts snapshot for dispatch.
    #[must_use]
    pub fn peer_info(&self) -> PeerInfo {
        let security = self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        PeerInfo {
            endpoint: self.remote,
            permission_level: self.permission_level(),
            encryption_key: security.key.clone(),
            cipher_suite: security.suite,
        }
    }

    /// Emit a canonical control frame.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_control(
        &self,
        control_type: ControlType,
        reason: ControlReason,
        action: ControlAction,
        sequence_id: u32,
        flags: ControlFlags,
        arg0: u32,
        arg1: u32,
        arg2: u32,
    ) -> Result<(), ServerError> {
        let frame = ControlFrame::new(control_type, reason, action)
            .with_sequence_id(sequence_id)
            .with_flags(flags)
            .with_args(arg0, arg1, arg2);
        self.send_frame(frame).await
    }

    /// Emit a prepared control frame.
    pub async fn send_frame(&self, frame: ControlFrame) -> Result<(), ServerError> {
        let packet = frame.into_packet(self.transport, &self.pool)?;
        self.write_raw(&packet).await
    }

    /// Emit a user packet through the outbound chain.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), ServerError> {
        let attributes = self.pipeline.attributes_for(packet.op_code());
        let sequence_id = packet.sequence_id().unwrap_or(0);
        match self.pipeline.wrap_outbound(packet, &attributes, &self.peer_info(), sequence_id) {
            Ok(wrapped) => self.write_raw(&wrapped).await,
            Err(frame) => self.send_frame(frame).await,
        }
    }

    /// Feed raw packet bytes into the inbound pipeline.
    ///
    /// The UDP loop calls this with the identity suffix already
    /// stripped; the TCP reader calls it once a full frame is buffered.
    pub async fn inject_incoming(&self, bytes: &[u8]) -> Result<(), ServerError> {
        let packet = Packet::decode(bytes, &self.pool)?;

        {
            let hooks = self.on_process.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for hook in hooks.iter() {
                hook(&packet);
            }
        }

        // Only clone for the post hook when someone is listening
        let post_copy = {
            let hooks =
                self.on_post_process.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if hooks.is_empty() { None } else { Some(packet.clone()) }
        };

        let peer = self.peer_info();
        match self.pipeline.dispatch(packet, &peer, &self.cancel).await {
            DispatchResult::Handled(outputs) => {
                for output in outputs {
                    self.write_raw(&output).await?;
                }
            },
            DispatchResult::Denied(frame) => self.send_frame(frame).await?,
            DispatchResult::Cancelled => {},
        }

        if let Some(packet) = post_copy {
            let hooks =
                self.on_post_process.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for hook in hooks.iter() {
                hook(&packet);
            }
        }
        Ok(())
    }

    /// Read length-prefixed packets off a TCP stream until the peer
    /// disconnects, the token fires, or a framing violation closes the
    /// connection.
    pub async fn run_tcp_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut header = [0u8; HEADER_SIZE];
        let mut frame = Vec::with_capacity(4096);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                read = read_half.read_exact(&mut header) => match read {
                    Ok(_) => {},
                    Err(err) => {
                        log_read_exit(&err, self.remote);
                        break;
                    },
                },
            }

            let length = match PacketHeader::from_bytes(&header) {
                Ok(parsed) => parsed.length(),
                Err(err) => {
                    tracing::warn!(remote = %self.remote, %err, "malformed packet header");
                    let _ = self
                        .send_control(
                            ControlType::Fail,
                            ControlReason::MalformedPacket,
                            ControlAction::None,
                            0,
                            ControlFlags::empty(),
                            0,
                            0,
                            0,
                        )
                        .await;
                    break;
                },
            };

            frame.clear();
            frame.extend_from_slice(&header);
            frame.resize(length, 0);
            if length > HEADER_SIZE {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    read = read_half.read_exact(&mut frame[HEADER_SIZE..]) => {
                        if let Err(err) = read {
                            log_read_exit(&err, self.remote);
                            break;
                        }
                    },
                }
            }

            if let Err(err) = self.inject_incoming(&frame).await {
                tracing::warn!(remote = %self.remote, %err, "closing on malformed packet");
                let _ = self
                    .send_control(
                        ControlType::Fail,
                        ControlReason::MalformedPacket,
                        ControlAction::None,
                        0,
                        ControlFlags::empty(),
                        0,
                        0,
                        0,
                    )
                    .await;
                break;
            }
        }

        self.close().await;
    }

    /// Close the connection.
    ///
    /// Idempotent: the first call cancels the connection token, fires the
    /// close hooks once, releases the hub entry and per-IP slot, and
    /// shuts down the writer. Later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(ConnectionState::Closing as u8, Ordering::Release);
        tracing::debug!(remote = %self.remote, id = %self.id, "closing connection");

        self.cancel.cancel();

        let hooks = {
            let mut guard =
                self.on_close.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for hook in hooks {
            hook();
        }

        let release = self
            .release_slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release();
        }

        if let Writer::Tcp(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        }

        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    async fn write_raw(&self, packet: &Packet) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let total = packet.encoded_len();
        if total <= STACK_ENCODE_LIMIT {
            let mut buf = [0u8; STACK_ENCODE_LIMIT];
            let written = packet.try_encode_into(&mut buf)?;
            self.write_bytes(&buf[..written]).await
        } else {
            let buf = packet.encode()?;
            self.write_bytes(&buf).await
        }
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), ServerError> {
        match &self.writer {
            Writer::Tcp(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(bytes).await?;
            },
            Writer::Udp { socket, target } => {
                socket.send_to(bytes, *target).await?;
            },
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id.to_string())
            .field("remote", &self.remote)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

fn log_read_exit(err: &std::io::Error, remote: SocketAddr) {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset => {
            tracing::debug!(remote = %remote, "peer disconnected");
        },
        _ => {
            tracing::warn!(remote = %remote, %err, "read error");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectionState::Handshaking,
            ConnectionState::Ready,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }
}
