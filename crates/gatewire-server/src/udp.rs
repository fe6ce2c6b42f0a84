//! UDP ingress: datagram loop, identity extraction, session lookup.
//!
//! Datagrams carry their logical connection identity as the trailing
//! seven bytes; the payload ahead of the suffix is an ordinary packet.
//! Sessions are registered out of band (for example by a TCP-side
//! handshake), so an unknown identity is dropped, not created. Receive
//! work is dispatched fire-and-forget; no ordering holds across
//! datagrams.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use gatewire_core::Pipeline;
use gatewire_proto::{HEADER_SIZE, IDENTIFIER_SIZE, Identifier, MAX_PACKET_SIZE};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{connection::Connection, error::ServerError, hub::ConnectionHub};

/// Smallest datagram that can carry a packet and an identity.
pub const MIN_DATAGRAM_SIZE: usize = HEADER_SIZE + IDENTIFIER_SIZE;

/// Authentication hook: approve or drop a resolved session's datagram.
pub type AuthHook = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// UDP listener configuration.
#[derive(Debug, Clone)]
pub struct UdpListenerConfig {
    /// Address and port to bind.
    pub bind: SocketAddr,
    /// Datagrams shorter than this are dropped without parsing. Clamped
    /// to at least [`MIN_DATAGRAM_SIZE`].
    pub min_datagram_size: usize,
}

impl Default for UdpListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 7401),
            min_datagram_size: MIN_DATAGRAM_SIZE,
        }
    }
}

/// The UDP receive engine.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    config: UdpListenerConfig,
    pipeline: Arc<Pipeline>,
    hub: Arc<ConnectionHub>,
    cancel: CancellationToken,
    is_authenticated: AuthHook,
}

impl UdpListener {
    /// Bind the datagram socket.
    pub async fn bind(
        mut config: UdpListenerConfig,
        pipeline: Arc<Pipeline>,
        hub: Arc<ConnectionHub>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self, ServerError> {
        config.min_datagram_size = config.min_datagram_size.max(MIN_DATAGRAM_SIZE);

        let socket = UdpSocket::bind(config.bind).await?;
        tracing::info!(addr = %socket.local_addr()?, "udp listener bound");

        Ok(Self {
            socket: Arc::new(socket),
            config,
            pipeline,
            hub,
            cancel: parent_cancel.child_token(),
            is_authenticated: Arc::new(|_| true),
        })
    }

    /// Replace the default allow-all authentication hook.
    pub fn set_auth_hook(&mut self, hook: AuthHook) {
        self.is_authenticated = hook;
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared datagram socket, for registering reply-capable sessions.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Register a logical UDP session replying to `remote`.
    ///
    /// Returns the connection, already in the hub. Idempotent per
    /// identifier: a second registration returns the existing session.
    #[must_use]
    pub fn register_session(&self, id: Identifier, remote: SocketAddr) -> Arc<Connection> {
        if let Some(existing) = self.hub.get(&id) {
            return existing;
        }

        let connection = Arc::new(Connection::udp(
            id,
            remote,
            self.socket(),
            Arc::clone(&self.pipeline),
            self.cancel.child_token(),
        ));
        {
            let hub = Arc::clone(&self.hub);
            connection.set_release_slot(Box::new(move || {
                hub.deregister(&id);
            }));
        }
        self.hub.register(Arc::clone(&connection));
        connection
    }

    /// Run the receive loop until cancelled.
    pub async fn run(&self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + IDENTIFIER_SIZE];

        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(err) => {
                    use std::io::ErrorKind;
                    match err.kind() {
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted => {
                            tracing::debug!(%err, "udp loop exiting");
                            break;
                        },
                        _ => {
                            tracing::warn!(%err, "udp receive error");
                            continue;
                        },
                    }
                },
            };

            if len < self.config.min_datagram_size {
                tracing::debug!(from = %from, len, "datagram below minimum size");
                continue;
            }

            let Some(id) = Identifier::from_trailing(&buf[..len]) else {
                continue;
            };
            let Some(connection) = self.hub.get(&id) else {
                tracing::debug!(from = %from, id = %id, "datagram for unknown session");
                continue;
            };

            if !(self.is_authenticated)(&connection) {
                tracing::debug!(from = %from, id = %id, "unauthenticated datagram dropped");
                continue;
            }

            // Fire and forget: later datagrams never wait on this one
            let packet_bytes = buf[..len - IDENTIFIER_SIZE].to_vec();
            tokio::spawn(async move {
                if let Err(err) = connection.inject_incoming(&packet_bytes).await {
                    tracing::debug!(%err, "udp packet rejected");
                }
            });
        }
    }
}

impl std::fmt::Debug for UdpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpListener").field("bind", &self.config.bind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_size_covers_header_and_identity() {
        assert_eq!(MIN_DATAGRAM_SIZE, 18);
        let config = UdpListenerConfig { min_datagram_size: 4, ..UdpListenerConfig::default() };
        // Clamp happens in bind(); the constant is the floor
        assert!(config.min_datagram_size < MIN_DATAGRAM_SIZE);
    }
}
