// The broker's front door.
//
// Owns the registry, the connector, the pool and the quarantine table.
// Callers admit proxies and run work inside scoped leases; the controller
// attributes failures, quarantines proxies the registry no longer trusts,
// and runs the background checker that rehabilitates or evicts them.
//
// Lock discipline: the quarantine table sits behind an async mutex. The
// background checker never probes under it - it snapshots, probes off-lock,
// then reacquires and re-checks membership before integrating each result,
// because the table may have changed while the probes ran. `manual_check` is
// the one deliberate exception and holds the lock across its single probe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, TransportError};
use crate::health::probe_endpoint;
use crate::models::proxy::{ProxyEndpoint, ProxyTags};
use crate::pool::{AcquireOptions, PoolMode, SessionPool};
use crate::registry::{ProxyRegistry, ProxyStats};
use crate::session::{LeasedSession, ProxySession};
use crate::transport::{Connector, Transport};

/// Concurrent probes per checker pass.
const PROBE_CONCURRENCY: usize = 20;

struct QuarantineEntry {
    session: ProxySession,
    strikes: u32,
}

pub struct ProxyController {
    config: BrokerConfig,
    registry: ProxyRegistry,
    connector: Arc<dyn Connector>,
    pool: Arc<SessionPool>,
    quarantine: AsyncMutex<HashMap<u64, QuarantineEntry>>,
    shutdown: CancellationToken,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyController {
    /// Build a controller and start its background machinery (the pool
    /// sweeper, and the checker loop unless `background_checks` is off).
    /// Must be called inside a tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        mode: PoolMode,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(SessionPool::new(mode, config.sweep_interval()));
        pool.start();

        let controller = Arc::new(Self {
            registry: ProxyRegistry::new(config.max_error_count),
            connector,
            pool,
            quarantine: AsyncMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            checker: Mutex::new(None),
            config,
        });
        if controller.config.background_checks {
            Self::spawn_checker(&controller);
        }
        controller
    }

    fn spawn_checker(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let stop = this.shutdown.clone();
        let interval = this.config.check_interval();
        let handle = tokio::spawn(async move {
            tracing::debug!("[Checker] Loop running every {:?}", interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(controller) = weak.upgrade() else { break };
                controller.run_health_checks().await;
            }
            tracing::debug!("[Checker] Loop stopped");
        });
        *this.checker.lock() = Some(handle);
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Parse and register a proxy, open a transport for it, and make the
    /// session available. Re-admitting a known `(ip, port)` keeps the
    /// existing registry counters and adds another session.
    pub fn admit(&self, proxy: &str, tags: ProxyTags) -> Result<Arc<ProxyEndpoint>, BrokerError> {
        let endpoint: Arc<ProxyEndpoint> = Arc::new(proxy.parse()?);
        self.registry.admit(&endpoint);

        let transport = self.connector.open(&endpoint)?;
        let session = ProxySession::new(endpoint.clone(), tags, transport);
        tracing::info!("[Controller] Admitted {} as session {}", endpoint, session.id());
        self.pool.insert(session);
        Ok(endpoint)
    }

    // ========================================================================
    // Leasing
    // ========================================================================

    /// Acquire a session and run `work` against it under the lease-execution
    /// deadline. Exactly one of release or close-and-quarantine happens on
    /// the way out:
    ///
    /// - `Ok`: success recorded, session released.
    /// - recognised transport error (or deadline overrun): failure recorded;
    ///   the session is quarantined if the registry now reports the proxy
    ///   invalid, released otherwise; surfaced as [`BrokerError::ProxyFailed`]
    ///   so the caller knows to retry with a fresh acquire.
    /// - any other error: released, re-raised untouched; not proxy evidence.
    ///
    /// Dropping the returned future mid-use re-queues the session without
    /// recording anything.
    pub async fn lease<T, F, Fut>(&self, opts: AcquireOptions, work: F) -> Result<T, BrokerError>
    where
        F: FnOnce(LeasedSession) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let session = self.pool.acquire(&opts).await?;
        let endpoint = session.endpoint().clone();
        let handle = session.handle();
        let mut active = ActiveLease {
            session: Some(session),
            pool: self.pool.clone(),
        };

        let outcome = tokio::time::timeout(self.config.lease_deadline(), work(handle)).await;

        let session = active.session.take().expect("lease still armed");
        drop(active);

        match outcome {
            Ok(Ok(value)) => {
                self.registry.record(&endpoint, &opts.task_key, true);
                self.give_back(session, &opts.task_key);
                Ok(value)
            }
            Ok(Err(BrokerError::Transport(cause))) => {
                self.attribute_failure(session, &endpoint, &opts.task_key).await;
                Err(BrokerError::ProxyFailed {
                    endpoint: endpoint.to_string(),
                    cause,
                })
            }
            Ok(Err(other)) => {
                self.give_back(session, &opts.task_key);
                Err(other)
            }
            Err(_) => {
                self.attribute_failure(session, &endpoint, &opts.task_key).await;
                Err(BrokerError::ProxyFailed {
                    endpoint: endpoint.to_string(),
                    cause: TransportError::LeaseDeadline(self.config.lease_deadline()),
                })
            }
        }
    }

    fn give_back(&self, session: ProxySession, task_key: &str) {
        if self.shutdown.is_cancelled() {
            // The pool is being torn down; this session is ours to close.
            session.close();
            return;
        }
        if let Err(e) = self.pool.release(session, task_key) {
            tracing::warn!("[Controller] Release failed: {e}");
        }
    }

    /// Record the failure and route the session: back to the pool while the
    /// registry still trusts the proxy, otherwise closed and quarantined.
    async fn attribute_failure(
        &self,
        session: ProxySession,
        endpoint: &Arc<ProxyEndpoint>,
        task_key: &str,
    ) {
        self.registry.record(endpoint, task_key, false);
        if self.registry.is_valid(endpoint) {
            self.give_back(session, task_key);
            return;
        }

        tracing::warn!(
            "[Controller] {} invalid after {} consecutive errors, quarantining session {}",
            endpoint,
            self.registry.error_count(endpoint),
            session.id()
        );
        session.close();
        let mut quarantine = self.quarantine.lock().await;
        quarantine.insert(
            session.id(),
            QuarantineEntry {
                session,
                strikes: 0,
            },
        );
    }

    // ========================================================================
    // Health checking
    // ========================================================================

    /// One rehabilitation pass over the quarantine table. Called by the
    /// background loop; exposed so operators can force a pass.
    pub async fn run_health_checks(&self) {
        // Phase 1: snapshot the probe candidates under the lock.
        let targets: Vec<(u64, Arc<ProxyEndpoint>)> = {
            let quarantine = self.quarantine.lock().await;
            quarantine
                .iter()
                .filter(|(_, e)| e.strikes <= self.config.max_probe_attempts)
                .map(|(id, e)| (*id, e.session.endpoint().clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        tracing::debug!("[Checker] Probing {} quarantined session(s)", targets.len());

        // Phase 2: probe everything off-lock.
        let config = &self.config;
        let connector = self.connector.clone();
        let results: Vec<(u64, Option<Arc<dyn Transport>>)> = stream::iter(targets)
            .map(|(id, endpoint)| {
                let connector = connector.clone();
                async move {
                    (
                        id,
                        probe_endpoint(connector.as_ref(), &endpoint, config).await,
                    )
                }
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        // Phase 3: integrate. Entries may have been removed while probing
        // (manual check, shutdown), so membership is re-checked per result.
        let mut quarantine = self.quarantine.lock().await;
        for (id, outcome) in results {
            if !quarantine.contains_key(&id) {
                continue;
            }
            match outcome {
                Some(transport) => {
                    let mut entry = quarantine.remove(&id).expect("membership checked");
                    entry.session.set_transport(transport);
                    self.registry.mark_recovered(entry.session.endpoint());
                    tracing::info!(
                        "[Checker] {} recovered, session {} back in pool",
                        entry.session.endpoint(),
                        entry.session.id()
                    );
                    self.pool.insert(entry.session);
                }
                None => self.strike(&mut quarantine, id),
            }
        }
    }

    fn strike(&self, quarantine: &mut HashMap<u64, QuarantineEntry>, id: u64) {
        let Some(entry) = quarantine.get_mut(&id) else {
            return;
        };
        entry.strikes += 1;
        if entry.strikes > self.config.max_probe_attempts {
            let entry = quarantine.remove(&id).expect("entry present");
            tracing::warn!(
                "[Checker] Evicting {} after {} failed probes",
                entry.session.endpoint(),
                entry.strikes
            );
            entry.session.close();
        }
    }

    /// Probe one quarantined proxy right now, matched by its full admission
    /// string. `Ok(true)` means it recovered and is back in the pool;
    /// `Ok(false)` means the probe failed (a strike) or the proxy is not
    /// quarantined.
    pub async fn manual_check(&self, proxy: &str) -> Result<bool, BrokerError> {
        let parsed: ProxyEndpoint = proxy.parse()?;

        let mut quarantine = self.quarantine.lock().await;
        let found = quarantine
            .iter()
            .find(|(_, e)| e.session.endpoint().admission_string() == proxy)
            .map(|(id, _)| *id);
        let Some(id) = found else {
            tracing::debug!("[Controller] Manual check: {} is not quarantined", parsed);
            return Ok(false);
        };

        let endpoint = quarantine
            .get(&id)
            .expect("entry present")
            .session
            .endpoint()
            .clone();
        // Held across the probe on purpose: manual checks are rare and must
        // not race the background integration for the same entry.
        match probe_endpoint(self.connector.as_ref(), &endpoint, &self.config).await {
            Some(transport) => {
                let mut entry = quarantine.remove(&id).expect("entry present");
                entry.session.set_transport(transport);
                self.registry.mark_recovered(&endpoint);
                tracing::info!("[Controller] Manual check recovered {}", endpoint);
                self.pool.insert(entry.session);
                Ok(true)
            }
            None => {
                self.strike(&mut quarantine, id);
                Ok(false)
            }
        }
    }

    // ========================================================================
    // Lifecycle & introspection
    // ========================================================================

    /// Stop the checker and the sweeper, then close every session this
    /// controller owns. Sessions out on a lease are closed when their lease
    /// ends. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("[Controller] Shutting down");
        self.shutdown.cancel();

        let checker = self.checker.lock().take();
        if let Some(handle) = checker {
            let _ = handle.await;
        }

        self.pool.stop().await;
        for session in self.pool.drain().await {
            session.close();
        }
        let mut quarantine = self.quarantine.lock().await;
        for (_, entry) in quarantine.drain() {
            entry.session.close();
        }
    }

    pub fn is_valid(&self, endpoint: &ProxyEndpoint) -> bool {
        self.registry.is_valid(endpoint)
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn stats(&self) -> Vec<ProxyStats> {
        self.registry.snapshot()
    }

    pub fn idle_sessions(&self) -> usize {
        self.pool.idle_len()
    }

    pub async fn quarantined(&self) -> usize {
        self.quarantine.lock().await.len()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.checker.lock().take() {
            handle.abort();
        }
    }
}

/// Holds the owned session while the caller's work runs. If the lease
/// future is dropped mid-use the session goes straight back to the pool,
/// with no registry update.
struct ActiveLease {
    session: Option<ProxySession>,
    pool: Arc<SessionPool>,
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(
                "[Controller] Lease dropped mid-use, re-queueing session {}",
                session.id()
            );
            self.pool.insert(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const PROXY: &str = "10.0.0.1:1080:user:pass";

    fn quick_config() -> BrokerConfig {
        BrokerConfig {
            sweep_interval_ms: 20,
            background_checks: false,
            ..BrokerConfig::default()
        }
    }

    fn controller_with(
        config: BrokerConfig,
    ) -> (Arc<ProxyController>, Arc<crate::transport::mock::MockState>) {
        let connector = MockConnector::healthy();
        let state = connector.state.clone();
        let controller = ProxyController::new(Arc::new(connector), PoolMode::Matching, config);
        (controller, state)
    }

    fn opts() -> AcquireOptions {
        AcquireOptions::default()
            .min_age(Duration::ZERO)
            .timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn admit_registers_and_pools() {
        let (controller, _) = controller_with(quick_config());
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.1:1080");
        assert!(controller.is_valid(&endpoint));
        assert_eq!(controller.idle_sessions(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn admit_rejects_malformed_strings() {
        let (controller, _) = controller_with(quick_config());
        let err = controller.admit("not-a-proxy", ProxyTags::new()).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidProxyString(_)));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn readmission_keeps_counters_and_adds_a_session() {
        let (controller, _) = controller_with(quick_config());
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();
        controller.registry().record(&endpoint, "crawl", false);

        controller.admit(PROXY, ProxyTags::new()).unwrap();
        assert_eq!(controller.registry().error_count(&endpoint), 1);
        assert_eq!(controller.registry().len(), 1);
        assert_eq!(controller.idle_sessions(), 2);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn successful_lease_records_and_releases() {
        let (controller, _) = controller_with(quick_config());
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        let got = controller
            .lease(opts(), |leased| async move {
                Ok(leased.endpoint().to_string())
            })
            .await
            .unwrap();
        assert_eq!(got, "10.0.0.1:1080");
        assert_eq!(controller.idle_sessions(), 1);

        let stats = controller.stats().pop().unwrap();
        assert_eq!(stats.tasks["default"].success, 1);
        assert_eq!(controller.registry().error_count(&endpoint), 0);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn transport_failure_below_threshold_repools() {
        let (controller, _) = controller_with(quick_config());
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        let err = controller
            .lease(opts(), |_| async move {
                Err::<(), _>(TransportError::Connect("refused".into()).into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ProxyFailed { .. }));
        assert_eq!(controller.registry().error_count(&endpoint), 1);
        assert!(controller.is_valid(&endpoint));
        assert_eq!(controller.idle_sessions(), 1);
        assert_eq!(controller.quarantined().await, 0);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn failure_at_threshold_quarantines_and_closes() {
        let config = BrokerConfig {
            max_error_count: 1,
            ..quick_config()
        };
        let (controller, state) = controller_with(config);
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        let _ = controller
            .lease(opts(), |_| async move {
                Err::<(), _>(TransportError::Timeout.into())
            })
            .await;

        assert!(!controller.is_valid(&endpoint));
        assert_eq!(controller.idle_sessions(), 0);
        assert_eq!(controller.quarantined().await, 1);
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_error_leaves_registry_untouched() {
        let (controller, _) = controller_with(quick_config());
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        let err = controller
            .lease(opts(), |_| async move {
                Err::<(), BrokerError>(anyhow::anyhow!("caller bug").into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Other(_)));
        assert_eq!(controller.registry().error_count(&endpoint), 0);
        let stats = controller.stats().pop().unwrap();
        assert!(stats.tasks.get("default").map_or(true, |t| t.error == 0));
        assert_eq!(controller.idle_sessions(), 1);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_deadline_counts_as_transport_failure() {
        let config = BrokerConfig {
            lease_deadline_secs: 1,
            ..quick_config()
        };
        let (controller, _) = controller_with(config);
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        let err = controller
            .lease(opts().no_timeout(), |_| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::ProxyFailed {
                cause: TransportError::LeaseDeadline(_),
                ..
            }
        ));
        assert_eq!(controller.registry().error_count(&endpoint), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn checker_pass_recovers_a_quarantined_session() {
        let config = BrokerConfig {
            max_error_count: 1,
            ..quick_config()
        };
        let connector = MockConnector::healthy();
        let probe_flag = connector.state.clone();
        let controller = ProxyController::new(Arc::new(connector), PoolMode::Matching, config);
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        probe_flag.probe_ok.store(false, Ordering::SeqCst);
        let _ = controller
            .lease(opts(), |_| async move {
                Err::<(), _>(TransportError::Timeout.into())
            })
            .await;
        assert_eq!(controller.quarantined().await, 1);

        // Still failing: a pass strikes but keeps the entry.
        controller.run_health_checks().await;
        assert_eq!(controller.quarantined().await, 1);

        probe_flag.probe_ok.store(true, Ordering::SeqCst);
        controller.run_health_checks().await;
        assert_eq!(controller.quarantined().await, 0);
        assert_eq!(controller.idle_sessions(), 1);
        assert!(controller.is_valid(&endpoint));
        assert_eq!(controller.registry().error_count(&endpoint), 0);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_probe_failures_evict() {
        let config = BrokerConfig {
            max_error_count: 1,
            max_probe_attempts: 3,
            ..quick_config()
        };
        let connector = MockConnector::default(); // probes fail
        let state = connector.state.clone();
        let controller = ProxyController::new(Arc::new(connector), PoolMode::Matching, config);
        controller.admit(PROXY, ProxyTags::new()).unwrap();

        let _ = controller
            .lease(opts(), |_| async move {
                Err::<(), _>(TransportError::Timeout.into())
            })
            .await;
        assert_eq!(controller.quarantined().await, 1);

        // Strikes 1..=3 keep the entry; the fourth failed probe evicts.
        for _ in 0..3 {
            controller.run_health_checks().await;
            assert_eq!(controller.quarantined().await, 1);
        }
        controller.run_health_checks().await;
        assert_eq!(controller.quarantined().await, 0);
        assert_eq!(controller.idle_sessions(), 0, "evicted sessions never return");

        // Further passes find nothing to probe.
        let opened_before = state.opened.load(Ordering::SeqCst);
        controller.run_health_checks().await;
        assert_eq!(state.opened.load(Ordering::SeqCst), opened_before);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn manual_check_recovers_and_reports() {
        let config = BrokerConfig {
            max_error_count: 1,
            ..quick_config()
        };
        let connector = MockConnector::healthy();
        let flag = connector.state.clone();
        let controller = ProxyController::new(Arc::new(connector), PoolMode::Matching, config);
        let endpoint = controller.admit(PROXY, ProxyTags::new()).unwrap();

        // Nothing quarantined yet.
        assert!(!controller.manual_check(PROXY).await.unwrap());

        flag.probe_ok.store(false, Ordering::SeqCst);
        let _ = controller
            .lease(opts(), |_| async move {
                Err::<(), _>(TransportError::Timeout.into())
            })
            .await;
        assert_eq!(controller.quarantined().await, 1);

        // Probe still failing: strike, stays quarantined.
        assert!(!controller.manual_check(PROXY).await.unwrap());
        assert_eq!(controller.quarantined().await, 1);

        flag.probe_ok.store(true, Ordering::SeqCst);
        assert!(controller.manual_check(PROXY).await.unwrap());
        assert_eq!(controller.quarantined().await, 0);
        assert_eq!(controller.idle_sessions(), 1);
        assert!(controller.is_valid(&endpoint));

        let err = controller.manual_check("garbage").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidProxyString(_)));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_lease_requeues_the_session() {
        let (controller, _) = controller_with(quick_config());
        controller.admit(PROXY, ProxyTags::new()).unwrap();

        {
            let fut = controller.lease(opts(), |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });
            tokio::pin!(fut);
            // Poll once so the acquire completes, then drop mid-use.
            let _ = futures::poll!(fut.as_mut());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.idle_sessions(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything_it_owns() {
        let config = BrokerConfig {
            max_error_count: 1,
            ..quick_config()
        };
        let (controller, state) = controller_with(config);
        controller.admit(PROXY, ProxyTags::new()).unwrap();
        controller.admit("10.0.0.2:1080:u:p", ProxyTags::new()).unwrap();

        // Quarantine one of the two.
        let _ = controller
            .lease(
                opts().predicates(ProxyTags::new()),
                |_| async move { Err::<(), _>(TransportError::Timeout.into()) },
            )
            .await;
        assert_eq!(controller.quarantined().await, 1);

        controller.shutdown().await;
        assert_eq!(controller.idle_sessions(), 0);
        assert_eq!(controller.quarantined().await, 0);
        assert_eq!(state.closed.load(Ordering::SeqCst), 2);
        controller.shutdown().await; // idempotent
    }
}
