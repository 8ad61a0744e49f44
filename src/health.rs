// Health probing for quarantined endpoints.
//
// A probe never reuses the quarantined session's transport (it was closed on
// the way into quarantine): it opens a fresh one, issues a single GET against
// the canonical URL, and on success hands the fresh transport back so the
// recovered session can be rewired to it.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::models::proxy::ProxyEndpoint;
use crate::transport::{Connector, Transport};

/// Probe `endpoint` through a freshly opened transport. The per-request
/// deadline applies to the GET itself; the outer deadline bounds open plus
/// probe. Returns the fresh transport on success; on any failure the
/// transport is closed and `None` is returned.
pub(crate) async fn probe_endpoint(
    connector: &dyn Connector,
    endpoint: &ProxyEndpoint,
    config: &BrokerConfig,
) -> Option<Arc<dyn Transport>> {
    let attempt = async {
        let transport = match connector.open(endpoint) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("[Checker] Open failed for {}: {}", endpoint, e);
                return None;
            }
        };
        match transport.probe(&config.probe_url, config.probe_timeout()).await {
            Ok(()) => Some(transport),
            Err(e) => {
                tracing::debug!("[Checker] Probe failed for {}: {}", endpoint, e);
                transport.close();
                None
            }
        }
    };

    match tokio::time::timeout(config.probe_outer_timeout(), attempt).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::debug!(
                "[Checker] Probe for {} exceeded the outer deadline ({:?})",
                endpoint,
                config.probe_outer_timeout()
            );
            None
        }
    }
}
