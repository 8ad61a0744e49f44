// A live transport bound to one proxy, with static tags and per-task
// last-used timestamps.
//
// A session is owned by exactly one of: the pool's idle set, an active
// lease, or the controller's quarantine table. It moves by value between
// the three; nothing else may hold it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::proxy::{ProxyEndpoint, ProxyTags};
use crate::transport::Transport;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct ProxySession {
    id: u64,
    endpoint: Arc<ProxyEndpoint>,
    tags: Arc<ProxyTags>,
    transport: Arc<dyn Transport>,
    last_used: HashMap<String, Instant>,
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("tags", &self.tags)
            .field("last_used", &self.last_used)
            .finish()
    }
}

impl ProxySession {
    pub fn new(
        endpoint: Arc<ProxyEndpoint>,
        tags: ProxyTags,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            tags: Arc::new(tags),
            transport,
            last_used: HashMap::new(),
        }
    }

    /// Unique per-instance id. Distinguishes sessions even when two sessions
    /// point at the same endpoint.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<ProxyEndpoint> {
        &self.endpoint
    }

    pub fn tags(&self) -> &ProxyTags {
        &self.tags
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True iff every key in `required` is present with the identical value.
    /// An empty query matches everything; extra session tags never penalise.
    pub fn matches_tags(&self, required: &ProxyTags) -> bool {
        required
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }

    /// True iff this session has never been used for `task_key`, or was last
    /// used at least `min_age` ago.
    pub fn cool_down_ok(&self, task_key: &str, min_age: Duration) -> bool {
        match self.last_used.get(task_key) {
            Some(at) => at.elapsed() >= min_age,
            None => true,
        }
    }

    /// Stamp `task_key` with the current monotonic time. Timestamps only
    /// advance.
    pub fn mark_used(&mut self, task_key: &str) {
        self.last_used.insert(task_key.to_string(), Instant::now());
    }

    /// Swap in a fresh transport (quarantine recovery installs the probe's
    /// transport here).
    pub(crate) fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = transport;
    }

    /// Close the underlying transport. Idempotent.
    pub fn close(&self) {
        self.transport.close();
    }

    /// The cheap view handed to a lease caller; the broker keeps the owned
    /// session.
    pub fn handle(&self) -> LeasedSession {
        LeasedSession {
            endpoint: self.endpoint.clone(),
            tags: self.tags.clone(),
            transport: self.transport.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn duplicate_for_tests(&self) -> Self {
        Self {
            id: self.id,
            endpoint: self.endpoint.clone(),
            tags: self.tags.clone(),
            transport: self.transport.clone(),
            last_used: HashMap::new(),
        }
    }
}

/// What a lease caller sees: the endpoint, its tags, and the transport to
/// run requests through. Clone is cheap; the session itself stays with the
/// broker.
#[derive(Clone)]
pub struct LeasedSession {
    endpoint: Arc<ProxyEndpoint>,
    tags: Arc<ProxyTags>,
    transport: Arc<dyn Transport>,
}

impl LeasedSession {
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn tags(&self) -> &ProxyTags {
        &self.tags
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Shortcut to the transport's HTTP client, if it exposes one.
    pub fn http_client(&self) -> Option<reqwest::Client> {
        self.transport.http_client()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use crate::transport::Connector;

    fn session_with_tags(tags: &[(&str, &str)]) -> ProxySession {
        let endpoint = Arc::new(ProxyEndpoint::new("10.0.0.1", 1080, "u", "p"));
        let connector = MockConnector::healthy();
        let transport = connector.open(&endpoint).unwrap();
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxySession::new(endpoint, tags, transport)
    }

    fn tags(pairs: &[(&str, &str)]) -> ProxyTags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_query_matches_everything() {
        let session = session_with_tags(&[("country", "US")]);
        assert!(session.matches_tags(&ProxyTags::new()));
    }

    #[test]
    fn subset_match_on_values() {
        let session = session_with_tags(&[("country", "US"), ("provider", "aws")]);
        assert!(session.matches_tags(&tags(&[("country", "US")])));
        assert!(session.matches_tags(&tags(&[("country", "US"), ("provider", "aws")])));
        assert!(!session.matches_tags(&tags(&[("country", "DE")])));
        assert!(!session.matches_tags(&tags(&[("asn", "13335")])));
    }

    #[test]
    fn cool_down_passes_for_unseen_task() {
        let session = session_with_tags(&[]);
        assert!(session.cool_down_ok("crawl", Duration::from_secs(3600)));
    }

    #[test]
    fn cool_down_blocks_recent_use() {
        let mut session = session_with_tags(&[]);
        session.mark_used("crawl");
        assert!(!session.cool_down_ok("crawl", Duration::from_millis(200)));
        // Other task keys are unaffected.
        assert!(session.cool_down_ok("scrape", Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn cool_down_clears_after_min_age() {
        let mut session = session_with_tags(&[]);
        session.mark_used("crawl");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.cool_down_ok("crawl", Duration::from_millis(20)));
    }

    #[test]
    fn zero_min_age_is_always_eligible() {
        let mut session = session_with_tags(&[]);
        session.mark_used("crawl");
        assert!(session.cool_down_ok("crawl", Duration::ZERO));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = session_with_tags(&[]);
        let b = session_with_tags(&[]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn close_is_idempotent() {
        let session = session_with_tags(&[]);
        session.close();
        session.close();
        assert!(session.transport().is_closed());
    }

    #[test]
    fn handle_shares_the_transport() {
        let session = session_with_tags(&[("country", "US")]);
        let handle = session.handle();
        assert_eq!(handle.endpoint(), session.endpoint().as_ref());
        assert_eq!(handle.tags().get("country").unwrap(), "US");
        handle.transport().close();
        assert!(session.transport().is_closed());
    }
}
