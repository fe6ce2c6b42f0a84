//! TCP ingress: tuned listener, parallel accepts, per-IP admission.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use gatewire_core::Pipeline;
use gatewire_proto::{IDENTIFIER_SIZE, Identifier};
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    error::ServerError,
    hub::{ConnectionHub, ConnectionLimiter},
};

/// Backoff after an unexpected accept error, to keep a failing listener
/// from spinning the CPU.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    /// Address and port to bind.
    pub bind: SocketAddr,
    /// Set `SO_REUSEADDR` before binding.
    pub reuse_address: bool,
    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,
    /// Send/receive buffer size for accepted sockets; 0 keeps the OS
    /// default.
    pub buffer_size: usize,
    /// Enable TCP keepalive probes (3 s idle, 1 s interval).
    pub keep_alive: bool,
    /// Listen backlog.
    pub backlog: u32,
    /// Parallel accept loops sharing the listener.
    pub max_simultaneous_accepts: usize,
    /// Floor for the runtime's worker thread count; consumed by the
    /// binary when building the runtime.
    pub min_worker_threads: usize,
    /// Permission level granted to fresh connections until a handshake
    /// promotes them.
    pub default_permission_level: u8,
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 7400),
            reuse_address: true,
            no_delay: true,
            buffer_size: 64 * 1024,
            keep_alive: true,
            backlog: 100,
            max_simultaneous_accepts: 32,
            min_worker_threads: 4,
            default_permission_level: 0,
        }
    }
}

/// Accept counters exposed for logging.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Connections accepted and registered.
    pub accepted: AtomicU64,
    /// Connections refused by per-IP admission.
    pub rejected: AtomicU64,
}

/// The TCP accept engine.
pub struct TcpListener {
    listener: Arc<tokio::net::TcpListener>,
    config: TcpListenerConfig,
    pipeline: Arc<Pipeline>,
    hub: Arc<ConnectionHub>,
    limiter: Arc<ConnectionLimiter>,
    cancel: CancellationToken,
    listening: AtomicBool,
    stats: Arc<ListenerStats>,
}

impl TcpListener {
    /// Bind and tune the listening socket.
    ///
    /// The listener's cancellation token is a child of `parent_cancel`;
    /// cancelling either drains every accept loop.
    pub fn bind(
        config: TcpListenerConfig,
        pipeline: Arc<Pipeline>,
        hub: Arc<ConnectionHub>,
        limiter: Arc<ConnectionLimiter>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self, ServerError> {
        let domain = Domain::for_address(config.bind);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        if config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if config.keep_alive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_millis(3000))
                .with_interval(Duration::from_millis(1000));
            socket.set_tcp_keepalive(&keepalive)?;
        }
        if config.buffer_size > 0 {
            socket.set_recv_buffer_size(config.buffer_size)?;
            socket.set_send_buffer_size(config.buffer_size)?;
        }

        socket.bind(&config.bind.into())?;
        socket.listen(config.backlog as i32)?;
        socket.set_nonblocking(true)?;

        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, backlog = config.backlog, "tcp listener bound");

        Ok(Self {
            listener: Arc::new(listener),
            config,
            pipeline,
            hub,
            limiter,
            cancel: parent_cancel.child_token(),
            listening: AtomicBool::new(false),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Whether accept loops are running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Accept counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Spawn the parallel accept loops. Idempotent.
    pub fn start(&self) {
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }

        for worker in 0..self.config.max_simultaneous_accepts.max(1) {
            let listener = Arc::clone(&self.listener);
            let pipeline = Arc::clone(&self.pipeline);
            let hub = Arc::clone(&self.hub);
            let limiter = Arc::clone(&self.limiter);
            let cancel = self.cancel.clone();
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();

            tokio::spawn(async move {
                accept_loop(worker, listener, config, pipeline, hub, limiter, cancel, stats).await;
            });
        }
    }

    /// Stop accepting. Idempotent and safe to call when not listening.
    pub fn stop(&self) {
        if !self.listening.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("tcp listener stopping");
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("bind", &self.config.bind)
            .field("listening", &self.is_listening())
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    worker: usize,
    listener: Arc<tokio::net::TcpListener>,
    config: TcpListenerConfig,
    pipeline: Arc<Pipeline>,
    hub: Arc<ConnectionHub>,
    limiter: Arc<ConnectionLimiter>,
    cancel: CancellationToken,
    stats: Arc<ListenerStats>,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                if !limiter.try_acquire(remote.ip()) {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(remote = %remote, "per-ip connection cap reached");
                    drop(stream);
                    continue;
                }

                if let Err(err) = setup_connection(
                    stream, remote, &config, &pipeline, &hub, &limiter, &cancel,
                ) {
                    tracing::warn!(remote = %remote, %err, "failed to set up connection");
                    limiter.release(remote.ip());
                    continue;
                }
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            },
            Err(err) => {
                use std::io::ErrorKind;
                match err.kind() {
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted => {
                        tracing::debug!(worker, %err, "accept loop exiting");
                        break;
                    },
                    _ => {
                        tracing::warn!(worker, %err, "accept error, backing off");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    },
                }
            },
        }
    }
}

fn setup_connection(
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
    config: &TcpListenerConfig,
    pipeline: &Arc<Pipeline>,
    hub: &Arc<ConnectionHub>,
    limiter: &Arc<ConnectionLimiter>,
    cancel: &CancellationToken,
) -> Result<(), ServerError> {
    if config.no_delay {
        stream.set_nodelay(true)?;
    }

    let id = fresh_identifier();
    let (read_half, write_half) = stream.into_split();

    let connection = Arc::new(Connection::tcp(
        id,
        remote,
        write_half,
        Arc::clone(pipeline),
        cancel.child_token(),
    ));
    connection.set_ready(
        config.default_permission_level,
        Vec::new(),
        gatewire_crypto::CipherSuite::default(),
    );

    {
        let hub = Arc::clone(hub);
        let limiter = Arc::clone(limiter);
        let ip = remote.ip();
        connection.set_release_slot(Box::new(move || {
            hub.deregister(&id);
            limiter.release(ip);
        }));
    }

    if !hub.register(Arc::clone(&connection)) {
        // Identifier collision: astronomically unlikely, treat as setup
        // failure so the slot is released by the caller
        return Err(ServerError::Internal(format!("identifier collision for {id}")));
    }

    tracing::debug!(remote = %remote, id = %id, "connection accepted");
    tokio::spawn(connection.run_tcp_reader(read_half));
    Ok(())
}

fn fresh_identifier() -> Identifier {
    let mut bytes = [0u8; IDENTIFIER_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Identifier(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_contract() {
        let config = TcpListenerConfig::default();
        assert_eq!(config.backlog, 100);
        assert_eq!(config.max_simultaneous_accepts, 32);
        assert_eq!(config.min_worker_threads, 4);
        assert!(config.reuse_address);
    }

    #[test]
    fn identifiers_are_unique_enough() {
        let a = fresh_identifier();
        let b = fresh_identifier();
        assert_ne!(a, b);
    }
}
