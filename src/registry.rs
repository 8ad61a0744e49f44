// Authoritative health accounting per proxy identity.
//
// A proxy is valid while its consecutive-failure counter stays below
// `max_error_count`; any success or health-check recovery resets it.
// Per-task success/error counters are monotonic and lazily initialised.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::models::proxy::ProxyEndpoint;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TaskStats {
    pub success: u64,
    pub error: u64,
}

#[derive(Debug)]
struct RegistryEntry {
    error_sequence: u32,
    per_task: HashMap<String, TaskStats>,
    admitted_at: DateTime<Utc>,
    last_error_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            error_sequence: 0,
            per_task: HashMap::new(),
            admitted_at: Utc::now(),
            last_error_at: None,
        }
    }
}

/// Point-in-time view of one proxy's accounting, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub endpoint: String,
    pub error_sequence: u32,
    pub valid: bool,
    pub admitted_at: DateTime<Utc>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub tasks: HashMap<String, TaskStats>,
}

pub struct ProxyRegistry {
    entries: DashMap<ProxyEndpoint, RegistryEntry>,
    max_error_count: u32,
}

impl ProxyRegistry {
    pub fn new(max_error_count: u32) -> Self {
        Self {
            entries: DashMap::new(),
            max_error_count,
        }
    }

    /// Register an endpoint. Idempotent: re-admitting the same `(ip, port)`
    /// keeps the existing entry and its counters.
    pub fn admit(&self, endpoint: &ProxyEndpoint) {
        self.entries
            .entry(endpoint.clone())
            .or_insert_with(RegistryEntry::new);
    }

    /// Record a lease outcome. Success resets the consecutive-failure
    /// counter; failure advances it. The per-task counters are created on
    /// first observation of a task key.
    pub fn record(&self, endpoint: &ProxyEndpoint, task_key: &str, ok: bool) {
        let mut entry = self
            .entries
            .entry(endpoint.clone())
            .or_insert_with(RegistryEntry::new);
        let stats = entry.per_task.entry(task_key.to_string()).or_default();
        if ok {
            stats.success += 1;
            entry.error_sequence = 0;
        } else {
            stats.error += 1;
            entry.error_sequence += 1;
            entry.last_error_at = Some(Utc::now());
        }
    }

    /// A proxy is valid iff it is registered and its consecutive-failure
    /// counter is below the limit.
    pub fn is_valid(&self, endpoint: &ProxyEndpoint) -> bool {
        self.entries
            .get(endpoint)
            .map(|e| e.error_sequence < self.max_error_count)
            .unwrap_or(false)
    }

    /// Reset the consecutive-failure counter after a successful health
    /// probe.
    pub fn mark_recovered(&self, endpoint: &ProxyEndpoint) {
        if let Some(mut entry) = self.entries.get_mut(endpoint) {
            entry.error_sequence = 0;
        }
    }

    pub fn error_count(&self, endpoint: &ProxyEndpoint) -> u32 {
        self.entries
            .get(endpoint)
            .map(|e| e.error_sequence)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every registered proxy's accounting.
    pub fn snapshot(&self) -> Vec<ProxyStats> {
        self.entries
            .iter()
            .map(|kv| ProxyStats {
                endpoint: kv.key().to_string(),
                error_sequence: kv.value().error_sequence,
                valid: kv.value().error_sequence < self.max_error_count,
                admitted_at: kv.value().admitted_at,
                last_error_at: kv.value().last_error_at,
                tasks: kv.value().per_task.clone(),
            })
            .collect()
    }
}
