// Session pools.
//
// Two variants behind one enum, chosen at construction: `TaggedPool` runs
// the full matching engine (tag predicates, per-task cool-downs, parked
// waiters, background sweeper); `PlainPool` is the degenerate FIFO bag for
// callers that never constrain their acquires.

pub mod plain;
pub mod tagged;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::models::proxy::ProxyTags;
use crate::session::ProxySession;

pub use plain::PlainPool;
pub use tagged::TaggedPool;

/// Default task key when the caller does not scope the cool-down.
pub const DEFAULT_TASK_KEY: &str = "default";
/// Default cool-down between uses of one session for the same task key.
pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(5);
/// Default deadline on an acquire.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(100);

/// Constraints on one acquire.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Caller-chosen string scoping the cool-down timer, so distinct call
    /// sites do not throttle one another.
    pub task_key: String,
    /// Minimum time since this session was last released for `task_key`.
    pub min_age: Duration,
    /// How long to wait for a match; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Tags the session must carry, matched by value equality.
    pub predicates: ProxyTags,
    /// Optional external cancellation of the wait.
    pub cancel: Option<CancellationToken>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            task_key: DEFAULT_TASK_KEY.to_string(),
            min_age: DEFAULT_MIN_AGE,
            timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            predicates: ProxyTags::new(),
            cancel: None,
        }
    }
}

impl AcquireOptions {
    pub fn task_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = key.into();
        self
    }

    pub fn min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait indefinitely; cancellation still wakes the waiter.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn predicate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.insert(key.into(), value.into());
        self
    }

    pub fn predicates(mut self, predicates: ProxyTags) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Which pool variant a controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Predicate and cool-down matching with parked waiters.
    Matching,
    /// Unbounded FIFO bag; predicates and cool-downs are ignored.
    Fifo,
}

pub enum SessionPool {
    Matching(TaggedPool),
    Fifo(PlainPool),
}

impl SessionPool {
    pub fn new(mode: PoolMode, sweep_interval: Duration) -> Self {
        match mode {
            PoolMode::Matching => SessionPool::Matching(TaggedPool::new(sweep_interval)),
            PoolMode::Fifo => SessionPool::Fifo(PlainPool::new()),
        }
    }

    /// Make a session available. Used for admission, checker readmission and
    /// cancellation re-queues; does not stamp last-used.
    pub fn insert(&self, session: ProxySession) {
        match self {
            SessionPool::Matching(p) => p.insert(session),
            SessionPool::Fifo(p) => p.insert(session),
        }
    }

    pub async fn acquire(&self, opts: &AcquireOptions) -> Result<ProxySession, BrokerError> {
        match self {
            SessionPool::Matching(p) => p.acquire(opts).await,
            SessionPool::Fifo(p) => p.acquire(opts).await,
        }
    }

    /// Return a session after use, stamping its last-used time for
    /// `task_key` (matching pool only) before it becomes visible again.
    pub fn release(&self, session: ProxySession, task_key: &str) -> Result<(), BrokerError> {
        match self {
            SessionPool::Matching(p) => p.release(session, task_key),
            SessionPool::Fifo(p) => p.release(session, task_key),
        }
    }

    /// Start background machinery (the matching pool's sweeper).
    pub fn start(&self) {
        if let SessionPool::Matching(p) = self {
            p.start();
        }
    }

    pub async fn stop(&self) {
        if let SessionPool::Matching(p) = self {
            p.stop().await;
        }
    }

    /// Remove and return every idle session. Pending waiters are cancelled.
    pub async fn drain(&self) -> Vec<ProxySession> {
        match self {
            SessionPool::Matching(p) => p.drain(),
            SessionPool::Fifo(p) => p.drain().await,
        }
    }

    pub fn idle_len(&self) -> usize {
        match self {
            SessionPool::Matching(p) => p.idle_len(),
            SessionPool::Fifo(p) => p.idle_len(),
        }
    }
}
