// The matching engine.
//
// `acquire` is a pure point-of-arrival check: it scans the idle set once
// under the lock and otherwise parks a waiter. Parked waiters are paired
// with sessions by the sweeper, which runs on a fixed tick and is nudged on
// every insert and release. Waiter cleanup lives in a guard's `Drop` so that
// timeouts, explicit cancellation and plain future-drop all leave the pool
// consistent: the waiter entry disappears, and a session already delivered
// into its slot is returned to the idle set.
//
// Fairness: waiters are scanned FIFO and each takes the first matching idle
// session. A waiter with strict predicates can be skipped while a later,
// looser waiter is served; strict predicates simply wait longer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::models::proxy::ProxyTags;
use crate::session::ProxySession;

use super::AcquireOptions;

struct Waiter {
    id: u64,
    task_key: String,
    min_age: Duration,
    predicates: ProxyTags,
    slot: oneshot::Sender<ProxySession>,
}

impl Waiter {
    fn matches(&self, session: &ProxySession) -> bool {
        session.matches_tags(&self.predicates) && session.cool_down_ok(&self.task_key, self.min_age)
    }
}

#[derive(Default)]
struct PoolInner {
    // Insertion order is a fairness hint, not a strict FIFO.
    idle: Vec<ProxySession>,
    // Strict FIFO by arrival.
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct PoolShared {
    inner: Mutex<PoolInner>,
    wakeup: Notify,
    next_waiter_id: AtomicU64,
}

impl PoolShared {
    /// One pairing pass: drop dead waiters, then hand each remaining waiter
    /// (FIFO) the first idle session it matches.
    fn sweep(&self) {
        let mut inner = self.inner.lock();
        let PoolInner { idle, waiters } = &mut *inner;

        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].slot.is_closed() {
                waiters.remove(i);
                continue;
            }
            match idle.iter().position(|s| waiters[i].matches(s)) {
                Some(j) => {
                    let session = idle.remove(j);
                    let waiter = waiters.remove(i).expect("waiter index in bounds");
                    if let Err(session) = waiter.slot.send(session) {
                        // Receiver vanished between the liveness check and
                        // the send; keep the session where it was.
                        idle.insert(j, session);
                    }
                }
                None => i += 1,
            }
        }
    }
}

/// Removes the waiter on the way out, whatever the way out was, and rescues
/// a session delivered after the waiter stopped listening.
struct WaiterGuard {
    shared: Arc<PoolShared>,
    id: u64,
    slot: Option<oneshot::Receiver<ProxySession>>,
}

impl WaiterGuard {
    fn disarm(&mut self) {
        self.slot = None;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(pos);
        }
        if let Some(slot) = self.slot.as_mut() {
            // The sender may have fired just before we took the lock; that
            // session must not leak.
            if let Ok(session) = slot.try_recv() {
                tracing::debug!(
                    "[Pool] Re-queueing session {} delivered to a dead waiter",
                    session.id()
                );
                inner.idle.push(session);
                drop(inner);
                self.shared.wakeup.notify_one();
            }
        }
    }
}

enum WaitOutcome {
    Delivered(Result<ProxySession, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

pub struct TaggedPool {
    shared: Arc<PoolShared>,
    sweep_interval: Duration,
    stop: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TaggedPool {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared::default()),
            sweep_interval,
            stop: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the sweeper. Idempotent.
    pub fn start(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let interval = self.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            tracing::debug!("[Pool] Sweeper running every {:?}", interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = shared.wakeup.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                shared.sweep();
            }
            tracing::debug!("[Pool] Sweeper stopped");
        }));
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn insert(&self, session: ProxySession) {
        let mut inner = self.shared.inner.lock();
        inner.idle.push(session);
        drop(inner);
        self.shared.wakeup.notify_one();
    }

    /// First matching idle session, or park until the sweeper delivers one.
    pub async fn acquire(&self, opts: &AcquireOptions) -> Result<ProxySession, BrokerError> {
        let mut guard = {
            let mut inner = self.shared.inner.lock();
            if let Some(pos) = inner.idle.iter().position(|s| {
                s.matches_tags(&opts.predicates) && s.cool_down_ok(&opts.task_key, opts.min_age)
            }) {
                return Ok(inner.idle.remove(pos));
            }

            let (tx, rx) = oneshot::channel();
            let id = self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            inner.waiters.push_back(Waiter {
                id,
                task_key: opts.task_key.clone(),
                min_age: opts.min_age,
                predicates: opts.predicates.clone(),
                slot: tx,
            });
            WaiterGuard {
                shared: self.shared.clone(),
                id,
                slot: Some(rx),
            }
        };

        let deadline = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let cancelled = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);

        let outcome = {
            let slot = guard.slot.as_mut().expect("waiter slot present");
            tokio::select! {
                delivered = slot => WaitOutcome::Delivered(delivered),
                _ = &mut deadline => WaitOutcome::TimedOut,
                _ = &mut cancelled => WaitOutcome::Cancelled,
            }
        };

        match outcome {
            WaitOutcome::Delivered(Ok(session)) => {
                guard.disarm();
                Ok(session)
            }
            // Sender dropped without a delivery: the pool discarded its
            // waiters (drain during shutdown).
            WaitOutcome::Delivered(Err(_)) => Err(BrokerError::Cancelled),
            WaitOutcome::TimedOut => Err(BrokerError::AcquireTimeout),
            WaitOutcome::Cancelled => Err(BrokerError::Cancelled),
        }
    }

    /// Stamp last-used for `task_key` and put the session back. The session
    /// is visible to matching before this returns.
    pub fn release(&self, mut session: ProxySession, task_key: &str) -> Result<(), BrokerError> {
        session.mark_used(task_key);
        let mut inner = self.shared.inner.lock();
        if inner.idle.iter().any(|s| s.id() == session.id()) {
            tracing::warn!(
                "[Pool] Session {} for {} released twice",
                session.id(),
                session.endpoint()
            );
            return Err(BrokerError::DoubleRelease);
        }
        inner.idle.push(session);
        drop(inner);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Empty the idle set; drops all parked waiters, waking them with
    /// `Cancelled`.
    pub fn drain(&self) -> Vec<ProxySession> {
        let mut inner = self.shared.inner.lock();
        inner.waiters.clear();
        inner.idle.drain(..).collect()
    }

    pub fn idle_len(&self) -> usize {
        self.shared.inner.lock().idle.len()
    }

    pub fn waiter_len(&self) -> usize {
        self.shared.inner.lock().waiters.len()
    }
}

impl Drop for TaggedPool {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
