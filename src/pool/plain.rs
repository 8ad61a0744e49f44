// Degenerate pool for callers that never constrain their acquires.
//
// An unbounded FIFO bag: `acquire` takes the oldest available session or
// waits until one arrives. Predicates, task keys and cool-downs are accepted
// and ignored, and release does not stamp last-used; the matching engine's
// overhead buys nothing in the null-predicate case. Waiters queue FIFO on
// the receiver lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::BrokerError;
use crate::session::ProxySession;

use super::AcquireOptions;

pub struct PlainPool {
    tx: mpsc::UnboundedSender<ProxySession>,
    rx: Mutex<mpsc::UnboundedReceiver<ProxySession>>,
    len: AtomicUsize,
}

impl PlainPool {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            len: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, session: ProxySession) {
        self.len.fetch_add(1, Ordering::Relaxed);
        // The receiver lives as long as the pool; the send cannot fail.
        let _ = self.tx.send(session);
    }

    pub async fn acquire(&self, opts: &AcquireOptions) -> Result<ProxySession, BrokerError> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(BrokerError::Cancelled)
        };
        tokio::pin!(recv);

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

        let session = tokio::select! {
            received = &mut recv => received?,
            _ = &mut deadline => return Err(BrokerError::AcquireTimeout),
            _ = &mut cancelled => return Err(BrokerError::Cancelled),
        };
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Put the session back. No last-used stamping and no double-release
    /// detection: the bag cannot be inspected, so a stray release degrades
    /// to a silent re-append.
    pub fn release(&self, session: ProxySession, _task_key: &str) -> Result<(), BrokerError> {
        self.insert(session);
        Ok(())
    }

    pub async fn drain(&self) -> Vec<ProxySession> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(session) = rx.try_recv() {
            drained.push(session);
        }
        self.len.store(0, Ordering::Relaxed);
        drained
    }

    pub fn idle_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl Default for PlainPool {
    fn default() -> Self {
        Self::new()
    }
}
