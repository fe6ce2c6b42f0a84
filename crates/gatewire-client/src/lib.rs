//! Minimal gatewire protocol client.
//!
//! Speaks the wire format from [`gatewire_proto`] over either transport:
//! [`TcpClient`] handles length-prefixed stream framing, [`UdpClient`]
//! appends the trailing session identifier to each datagram. Used by the
//! server's end-to-end tests and as a starting point for real peers.

#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use gatewire_proto::{
    BufferPool, CONTROL_OP, ControlFrame, HEADER_SIZE, IDENTIFIER_SIZE, Identifier,
    MAX_PACKET_SIZE, Packet, PacketHeader, PayloadBuf, ProtocolError, Transport,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};

/// Client-side errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server sent bytes that do not parse as a packet.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stream closed mid-frame.
    #[error("connection closed by server")]
    Closed,
}

/// A reply from the server: either an application packet or a control
/// frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Application packet.
    Packet(Packet),
    /// Protocol-level status frame.
    Control(ControlFrame),
}

impl Reply {
    fn classify(packet: Packet) -> Result<Self, ClientError> {
        if packet.op_code() == CONTROL_OP {
            Ok(Self::Control(ControlFrame::from_packet(&packet)?))
        } else {
            Ok(Self::Packet(packet))
        }
    }

    /// The application packet, if this reply is one.
    #[must_use]
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Self::Packet(packet) => Some(packet),
            Self::Control(_) => None,
        }
    }

    /// The control frame, if this reply is one.
    #[must_use]
    pub fn into_control(self) -> Option<ControlFrame> {
        match self {
            Self::Control(frame) => Some(frame),
            Self::Packet(_) => None,
        }
    }
}

/// TCP client with length-prefixed framing.
pub struct TcpClient {
    stream: TcpStream,
    pool: Arc<BufferPool>,
}

impl TcpClient {
    /// Connect to a gatewire TCP listener.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "connected");
        Ok(Self { stream, pool: BufferPool::with_defaults() })
    }

    /// Buffer pool for building payloads.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Build a TCP packet from a payload slice.
    pub fn packet(&self, op_code: u16, payload: &[u8]) -> Result<Packet, ClientError> {
        Ok(Packet::new(op_code, Transport::Tcp, PayloadBuf::copy_from(payload, &self.pool)?))
    }

    /// Send one packet.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let wire = packet.encode()?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Receive the next reply, blocking until a full frame arrives.
    pub async fn recv(&mut self) -> Result<Reply, ClientError> {
        let mut header = [0u8; HEADER_SIZE];
        read_all(&mut self.stream, &mut header).await?;

        let length = PacketHeader::from_bytes(&header)?.length();
        let mut frame = header.to_vec();
        frame.resize(length, 0);
        if length > HEADER_SIZE {
            read_all(&mut self.stream, &mut frame[HEADER_SIZE..]).await?;
        }

        Reply::classify(Packet::decode(&frame, &self.pool)?)
    }

    /// Send a request and wait for its reply.
    pub async fn round_trip(&mut self, packet: &Packet) -> Result<Reply, ClientError> {
        self.send(packet).await?;
        self.recv().await
    }
}

async fn read_all(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ClientError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
        Err(err) => Err(err.into()),
    }
}

/// UDP client for one logical session.
pub struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
    identity: Identifier,
    pool: Arc<BufferPool>,
}

impl UdpClient {
    /// Bind an ephemeral socket for a session with the given identity.
    pub async fn bind(server: SocketAddr, identity: Identifier) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        tracing::debug!(%server, id = %identity, "udp session bound");
        Ok(Self { socket, server, identity, pool: BufferPool::with_defaults() })
    }

    /// Local address, for registering the session server-side.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Buffer pool for building payloads.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Build a UDP packet from a payload slice.
    pub fn packet(&self, op_code: u16, payload: &[u8]) -> Result<Packet, ClientError> {
        Ok(Packet::new(op_code, Transport::Udp, PayloadBuf::copy_from(payload, &self.pool)?))
    }

    /// Send one packet with the session identity appended.
    pub async fn send(&self, packet: &Packet) -> Result<(), ClientError> {
        let mut datagram = packet.encode()?;
        datagram.extend_from_slice(self.identity.as_bytes());
        self.socket.send_to(&datagram, self.server).await?;
        Ok(())
    }

    /// Receive the next reply datagram.
    pub async fn recv(&self) -> Result<Reply, ClientError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + IDENTIFIER_SIZE];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        Reply::classify(Packet::decode(&buf[..len], &self.pool)?)
    }
}
