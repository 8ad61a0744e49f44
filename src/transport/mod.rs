// Transport seam.
//
// The broker never talks to the network directly: it opens, probes and closes
// `Transport`s through a `Connector`. The default implementation tunnels a
// reqwest client through SOCKS5 (`socks.rs`); tests plug in mocks.

pub mod socks;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::models::proxy::ProxyEndpoint;

pub use socks::SocksConnector;

/// One live tunnel bound to a single proxy endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a single GET against `url`. Any HTTP response received within
    /// `deadline` counts as success; status codes are not inspected.
    async fn probe(&self, url: &str, deadline: Duration) -> Result<(), TransportError>;

    /// The underlying HTTP client, for callers that run real requests
    /// through the lease. `None` once closed, or for transports that do not
    /// expose one.
    fn http_client(&self) -> Option<reqwest::Client> {
        None
    }

    /// Release the underlying sockets. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Builds transports; the construction-time choice of implementation is the
/// only place transport variants exist.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &ProxyEndpoint) -> Result<Arc<dyn Transport>, TransportError>;
}
