//! Connection hub and per-IP admission limiter.
//!
//! The hub is the process-wide identity map: UDP datagrams resolve their
//! trailing identifier here, and TCP connections register on accept.
//! The limiter counts live connections per source IP and backs the
//! accept-time admission decision; a periodic cleanup drops counters for
//! addresses that have gone quiet.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use gatewire_proto::Identifier;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Identifier-keyed registry of live connections.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<Identifier, Arc<Connection>>,
}

impl ConnectionHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its identifier.
    ///
    /// Idempotent: returns `false` without replacing when the identifier
    /// is already registered.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        match self.connections.entry(connection.id()) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            },
        }
    }

    /// Remove a connection. Idempotent.
    pub fn deregister(&self, id: &Identifier) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Look up a connection by identifier.
    #[must_use]
    pub fn get(&self, id: &Identifier) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the hub is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and deregister every connection.
    pub async fn close_all(&self) {
        let all: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        self.connections.clear();
        for connection in all {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub").field("connections", &self.len()).finish()
    }
}

/// Per-IP admission limits.
#[derive(Debug, Clone)]
pub struct IpLimiterConfig {
    /// Concurrent connections allowed from one source address.
    pub max_connections_per_ip: u32,
    /// Idle time before a zero-count entry is dropped. Clamped to at
    /// least one second.
    pub inactivity_threshold_ms: u64,
    /// Spacing of cleanup runs. Clamped to at least one second.
    pub cleanup_interval_ms: u64,
}

impl Default for IpLimiterConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 32,
            inactivity_threshold_ms: 60_000,
            cleanup_interval_ms: 10_000,
        }
    }
}

struct IpEntry {
    count: AtomicU32,
    last_seen_ms: AtomicU64,
}

/// Per-IP connection counter with periodic cleanup.
pub struct ConnectionLimiter {
    config: IpLimiterConfig,
    entries: DashMap<IpAddr, IpEntry>,
    started: Instant,
}

impl ConnectionLimiter {
    /// Create a limiter; sub-second intervals are clamped up.
    #[must_use]
    pub fn new(mut config: IpLimiterConfig) -> Self {
        config.inactivity_threshold_ms = config.inactivity_threshold_ms.max(1000);
        config.cleanup_interval_ms = config.cleanup_interval_ms.max(1000);
        Self { config, entries: DashMap::new(), started: Instant::now() }
    }

    /// Whether another connection from `ip` would be admitted.
    #[must_use]
    pub fn is_connection_allowed(&self, ip: IpAddr) -> bool {
        self.entries
            .get(&ip)
            .is_none_or(|e| e.count.load(Ordering::Acquire) < self.config.max_connections_per_ip)
    }

    /// Claim a connection slot for `ip`. Returns `false` at the cap.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let now = self.elapsed_ms();
        let entry = self.entries.entry(ip).or_insert_with(|| IpEntry {
            count: AtomicU32::new(0),
            last_seen_ms: AtomicU64::new(now),
        });
        entry.last_seen_ms.store(now, Ordering::Relaxed);

        // CAS loop so concurrent accepts cannot overshoot the cap
        let mut current = entry.count.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_connections_per_ip {
                return false;
            }
            match entry.count.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a slot claimed by [`ConnectionLimiter::try_acquire`].
    pub fn release(&self, ip: IpAddr) {
        if let Some(entry) = self.entries.get(&ip) {
            let prior = entry.count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prior > 0, "per-IP count released below zero");
            entry.last_seen_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        }
    }

    /// Live connection count for `ip`.
    #[must_use]
    pub fn count(&self, ip: IpAddr) -> u32 {
        self.entries.get(&ip).map_or(0, |e| e.count.load(Ordering::Acquire))
    }

    /// Drop idle zero-count entries.
    pub fn cleanup(&self) {
        let now = self.elapsed_ms();
        let threshold = self.config.inactivity_threshold_ms;
        self.entries.retain(|_, entry| {
            entry.count.load(Ordering::Acquire) > 0
                || now.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) < threshold
        });
    }

    /// Run periodic cleanup until cancelled. Owned by the listener.
    pub async fn run_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config.cleanup_interval_ms);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => self.cleanup(),
            }
        }
    }

    /// Tracked source addresses, for diagnostics.
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.entries.len()
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for ConnectionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLimiter")
            .field("tracked_ips", &self.tracked_ips())
            .field("max_per_ip", &self.config.max_connections_per_ip)
            .finish()
    }
}
