//! Gatewire production server.
//!
//! Thin I/O shell around [`gatewire_core`]: the [`TcpListener`] and
//! [`UdpListener`] own sockets and framing, the [`ConnectionHub`] and
//! [`ConnectionLimiter`] own identity and admission, and every decision
//! in between belongs to the shared [`Pipeline`]. A single root
//! cancellation token fans out to listeners and connections, so shutdown
//! is one `cancel()` followed by a drain.
//!
//! # Components
//!
//! - [`Connection`]: per-peer send/receive state and close lifecycle
//! - [`TcpListener`]: tuned accept engine with per-IP admission
//! - [`UdpListener`]: datagram loop with trailing-identity lookup
//! - [`ConnectionHub`] / [`ConnectionLimiter`]: identity map and per-IP
//!   caps
//! - [`Server`]: assembles the above and runs them to completion

#![forbid(unsafe_code)]

mod connection;
mod error;
mod hub;
mod tcp;
mod udp;

use std::sync::Arc;

use gatewire_core::Pipeline;
pub use connection::{Connection, ConnectionState};
pub use error::ServerError;
pub use hub::{ConnectionHub, ConnectionLimiter, IpLimiterConfig};
pub use tcp::{ListenerStats, TcpListener, TcpListenerConfig};
pub use udp::{AuthHook, MIN_DATAGRAM_SIZE, UdpListener, UdpListenerConfig};
use tokio_util::sync::CancellationToken;

/// Top-level server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// TCP listener settings.
    pub tcp: TcpListenerConfig,
    /// UDP listener settings; `None` disables the datagram path.
    pub udp: Option<UdpListenerConfig>,
    /// Per-IP admission limits shared by both listeners.
    pub ip_limits: IpLimiterConfig,
}

/// The assembled server.
pub struct Server {
    pipeline: Arc<Pipeline>,
    hub: Arc<ConnectionHub>,
    limiter: Arc<ConnectionLimiter>,
    tcp: TcpListener,
    udp: Option<UdpListener>,
    cancel: CancellationToken,
}

impl Server {
    /// Bind both listeners and wire up the shared services.
    ///
    /// Handlers must already be registered on `pipeline`; it is shared
    /// immutably from here on.
    pub async fn bind(config: ServerConfig, pipeline: Pipeline) -> Result<Self, ServerError> {
        let pipeline = Arc::new(pipeline);
        let hub = Arc::new(ConnectionHub::new());
        let limiter = Arc::new(ConnectionLimiter::new(config.ip_limits));
        let cancel = CancellationToken::new();

        let tcp = TcpListener::bind(
            config.tcp,
            Arc::clone(&pipeline),
            Arc::clone(&hub),
            Arc::clone(&limiter),
            &cancel,
        )?;

        let udp = match config.udp {
            Some(udp_config) => Some(
                UdpListener::bind(udp_config, Arc::clone(&pipeline), Arc::clone(&hub), &cancel)
                    .await?,
            ),
            None => None,
        };

        Ok(Self { pipeline, hub, limiter, tcp, udp, cancel })
    }

    /// The shared pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// The connection hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// The TCP listener.
    #[must_use]
    pub fn tcp(&self) -> &TcpListener {
        &self.tcp
    }

    /// The UDP listener, when enabled.
    #[must_use]
    pub fn udp(&self) -> Option<&UdpListener> {
        self.udp.as_ref()
    }

    /// Root cancellation token; cancelling it shuts the server down.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until shut down, then drain.
    ///
    /// Starts the accept loops and the limiter cleanup task, drives the
    /// UDP receive loop on this task, and on cancellation stops the
    /// listeners, denies further rate-limited traffic, and closes every
    /// connection.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.tcp.start();

        let cleanup = tokio::spawn(
            Arc::clone(&self.limiter).run_cleanup(self.cancel.child_token()),
        );

        match &self.udp {
            Some(udp) => udp.run().await,
            None => self.cancel.cancelled().await,
        }

        // Shutdown path: stop ingress, then drain
        tracing::info!("server shutting down");
        self.tcp.stop();
        self.pipeline.shutdown();
        self.hub.close_all().await;
        let _ = cleanup.await;

        let stats = self.tcp.stats();
        tracing::info!(
            accepted = stats.accepted.load(std::sync::atomic::Ordering::Relaxed),
            rejected = stats.rejected.load(std::sync::atomic::Ordering::Relaxed),
            "server stopped"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tcp", &self.tcp)
            .field("udp", &self.udp)
            .field("connections", &self.hub.len())
            .finish()
    }
}
