//! Per-opcode bounded concurrency gate.
//!
//! Each opcode gets a counter and, when queueing is enabled, a FIFO of
//! waiters. A waiter is a oneshot completion plus an abandoned flag:
//! cancellation and queue timeout mark the waiter abandoned without
//! touching the counter, and the release path skips abandoned waiters
//! when handing the freed slot to the next one in line. Slots transfer
//! directly from releaser to waiter, so the active count never dips and
//! re-fills during a handoff.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Concurrency limits for one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Maximum concurrent executions of the opcode.
    pub max_concurrent: u32,
    /// Queue for a slot instead of rejecting immediately.
    pub queue: bool,
    /// How long a queued waiter may wait; `None` waits until
    /// cancellation.
    pub queue_timeout: Option<Duration>,
}

impl GateConfig {
    /// Non-queueing gate with the given width.
    #[must_use]
    pub const fn reject_above(max_concurrent: u32) -> Self {
        Self { max_concurrent, queue: false, queue_timeout: None }
    }

    /// Queueing gate with the given width and wait bound.
    #[must_use]
    pub const fn queue_above(max_concurrent: u32, queue_timeout: Option<Duration>) -> Self {
        Self { max_concurrent, queue: true, queue_timeout }
    }
}

/// Errors from entering the gate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// No slot was available (or the queue wait timed out).
    #[error("concurrency limit reached")]
    Rejected,

    /// The caller's cancellation token fired while waiting.
    #[error("cancelled while waiting for a slot")]
    Cancelled,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    abandoned: Arc<AtomicBool>,
}

#[derive(Default)]
struct OpState {
    active: u32,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct GateInner {
    states: Mutex<HashMap<u16, OpState>>,
}

impl GateInner {
    fn release(&self, op_code: u16) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(state) = states.get_mut(&op_code) else {
            debug_assert!(false, "release for untracked opcode");
            return;
        };

        // Hand the slot to the first live waiter; the counter is
        // untouched because the slot changes owner, not state.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.abandoned.load(Ordering::Acquire) {
                continue;
            }
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }

        state.active -= 1;
        if state.active == 0 && state.waiters.is_empty() {
            states.remove(&op_code);
        }
    }
}

/// Bounded per-opcode concurrency with optional FIFO queueing.
#[derive(Clone, Default)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    /// New gate with no opcodes tracked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking entry. Returns a lease when a slot is free.
    #[must_use]
    pub fn try_enter(&self, op_code: u16, config: GateConfig) -> Option<Lease> {
        let mut states =
            self.inner.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(op_code).or_default();

        if state.active < config.max_concurrent {
            state.active += 1;
            drop(states);
            Some(Lease { inner: Arc::clone(&self.inner), op_code })
        } else {
            None
        }
    }

    /// Enter the gate, waiting FIFO for a slot when `config.queue` is
    /// set.
    ///
    /// # Errors
    ///
    /// - `GateError::Rejected` when no slot is free and queueing is off,
    ///   or the queue wait exceeds `config.queue_timeout`
    /// - `GateError::Cancelled` when `cancel` fires first
    pub async fn enter(
        &self,
        op_code: u16,
        config: GateConfig,
        cancel: &CancellationToken,
    ) -> Result<Lease, GateError> {
        let (mut rx, abandoned) = {
            let mut states =
                self.inner.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = states.entry(op_code).or_default();

            if state.active < config.max_concurrent {
                state.active += 1;
                drop(states);
                return Ok(Lease { inner: Arc::clone(&self.inner), op_code });
            }

            if !config.queue {
                return Err(GateError::Rejected);
            }

            let (tx, rx) = oneshot::channel();
            let abandoned = Arc::new(AtomicBool::new(false));
            state.waiters.push_back(Waiter { tx, abandoned: Arc::clone(&abandoned) });
            (rx, abandoned)
        };

        let grant_raced_in = |rx: &mut oneshot::Receiver<()>| {
            // A release may have sent the grant between the wakeup we
            // lost and the abandoned flag becoming visible; give the
            // slot back rather than leak it.
            matches!(rx.try_recv(), Ok(()))
        };

        match config.queue_timeout {
            Some(timeout) => tokio::select! {
                granted = &mut rx => match granted {
                    Ok(()) => Ok(Lease { inner: Arc::clone(&self.inner), op_code }),
                    Err(_) => Err(GateError::Rejected),
                },
                () = cancel.cancelled() => {
                    abandoned.store(true, Ordering::Release);
                    if grant_raced_in(&mut rx) {
                        self.inner.release(op_code);
                    }
                    Err(GateError::Cancelled)
                },
                () = tokio::time::sleep(timeout) => {
                    abandoned.store(true, Ordering::Release);
                    if grant_raced_in(&mut rx) {
                        self.inner.release(op_code);
                    }
                    Err(GateError::Rejected)
                },
            },
            None => tokio::select! {
                granted = &mut rx => match granted {
                    Ok(()) => Ok(Lease { inner: Arc::clone(&self.inner), op_code }),
                    Err(_) => Err(GateError::Rejected),
                },
                () = cancel.cancelled() => {
                    abandoned.store(true, Ordering::Release);
                    if grant_raced_in(&mut rx) {
                        self.inner.release(op_code);
                    }
                    Err(GateError::Cancelled)
                },
            },
        }
    }

    /// Active leases for an opcode.
    #[must_use]
    pub fn active(&self, op_code: u16) -> u32 {
        let states = self.inner.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.get(&op_code).map_or(0, |s| s.active)
    }

    /// Waiters queued for an opcode, abandoned ones included until the
    /// release path reaps them.
    #[must_use]
    pub fn queued(&self, op_code: u16) -> usize {
        let states = self.inner.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.get(&op_code).map_or(0, |s| s.waiters.len())
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states = self.inner.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("ConcurrencyGate").field("opcodes", &states.len()).finish()
    }
}

/// A held concurrency slot; dropping it releases the slot.
#[must_use = "dropping the lease releases the slot"]
pub struct Lease {
    inner: Arc<GateInner>,
    op_code: u16,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release(self.op_code);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("op_code", &self.op_code).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP: u16 = 0x42;

    #[test]
    fn try_enter_respects_the_bound() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::reject_above(2);

        let a = gate.try_enter(OP, config).unwrap();
        let _b = gate.try_enter(OP, config).unwrap();
        assert!(gate.try_enter(OP, config).is_none());
        assert_eq!(gate.active(OP), 2);

        drop(a);
        assert_eq!(gate.active(OP), 1);
        assert!(gate.try_enter(OP, config).is_some());
    }

    #[test]
    fn opcodes_are_independent() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::reject_above(1);

        let _a = gate.try_enter(1, config).unwrap();
        assert!(gate.try_enter(1, config).is_none());
        assert!(gate.try_enter(2, config).is_some());
    }

    #[test]
    fn state_is_reclaimed_when_idle() {
        let gate = ConcurrencyGate::new();
        let lease = gate.try_enter(OP, GateConfig::reject_above(1)).unwrap();
        drop(lease);

        let states = gate.inner.states.lock().unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn enter_without_queue_rejects_when_full() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::reject_above(1);
        let cancel = CancellationToken::new();

        let _held = gate.enter(OP, config, &cancel).await.unwrap();
        assert_eq!(gate.enter(OP, config, &cancel).await.unwrap_err(), GateError::Rejected);
    }

    #[tokio::test]
    async fn queued_waiters_are_served_fifo() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::queue_above(1, None);
        let cancel = CancellationToken::new();

        let held = gate.enter(OP, config, &cancel).await.unwrap();

        let mut order = Vec::new();
        let mut tasks = Vec::new();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let done = done_tx.clone();
            tasks.push(tokio::spawn(async move {
                let lease = gate.enter(OP, config, &cancel).await.unwrap();
                done.send(i).unwrap();
                drop(lease);
            }));
            // Give each task time to enqueue before the next, fixing the
            // FIFO order under test
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(gate.queued(OP), 3);
        drop(held);

        for _ in 0..3 {
            order.push(done_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(gate.active(OP), 0);
    }

    #[tokio::test]
    async fn active_leases_never_exceed_the_bound() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::queue_above(4, None);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let _lease = gate.enter(OP, config, &cancel).await.unwrap();
                assert!(gate.active(OP) <= 4);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(gate.active(OP), 0);
    }

    #[tokio::test]
    async fn cancellation_removes_waiter_without_touching_others() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::queue_above(1, None);
        let cancel = CancellationToken::new();

        let held = gate.enter(OP, config, &cancel).await.unwrap();

        // First waiter will be cancelled, second should still get the slot
        let doomed_cancel = CancellationToken::new();
        let doomed = {
            let gate = gate.clone();
            let token = doomed_cancel.clone();
            tokio::spawn(async move { gate.enter(OP, config, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let survivor = {
            let gate = gate.clone();
            let token = cancel.clone();
            tokio::spawn(async move { gate.enter(OP, config, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        doomed_cancel.cancel();
        assert_eq!(doomed.await.unwrap().unwrap_err(), GateError::Cancelled);

        // Counter untouched by the cancellation
        assert_eq!(gate.active(OP), 1);

        drop(held);
        let lease = survivor.await.unwrap().unwrap();
        assert_eq!(gate.active(OP), 1);
        drop(lease);
        assert_eq!(gate.active(OP), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_waiter() {
        let gate = ConcurrencyGate::new();
        let config = GateConfig::queue_above(1, Some(Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        let _held = gate.enter(OP, config, &cancel).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = gate.enter(OP, config, &cancel).await;
        assert_eq!(result.unwrap_err(), GateError::Rejected);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(gate.active(OP), 1);
    }
}
