// SOCKS5 transport over reqwest.
//
// Each endpoint gets its own `reqwest::Client` tunneled through
// `socks5://user:pass@ip:port`. The URL is built with the `url` crate so
// credentials with reserved characters survive percent-encoding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::error::TransportError;
use crate::models::proxy::ProxyEndpoint;

use super::{Connector, Transport};

const USER_AGENT: &str = concat!("proxy-broker/", env!("CARGO_PKG_VERSION"));

/// Builds SOCKS5-tunneled reqwest clients.
pub struct SocksConnector {
    connect_timeout: Duration,
}

impl SocksConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn socks_url(endpoint: &ProxyEndpoint) -> Result<Url, TransportError> {
        let mut url = Url::parse(&format!("socks5://{}:{}", endpoint.ip(), endpoint.port()))
            .map_err(|e| TransportError::BadEndpoint(e.to_string()))?;
        url.set_username(endpoint.username())
            .map_err(|_| TransportError::BadEndpoint("unusable username".into()))?;
        url.set_password(Some(endpoint.password()))
            .map_err(|_| TransportError::BadEndpoint("unusable password".into()))?;
        Ok(url)
    }
}

impl Default for SocksConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

impl Connector for SocksConnector {
    fn open(&self, endpoint: &ProxyEndpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let url = Self::socks_url(endpoint)?;
        let proxy = reqwest::Proxy::all(url.as_str())
            .map_err(|e| TransportError::Socks(e.to_string()))?;

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::BadEndpoint(e.to_string()))?;

        tracing::debug!("[Transport] Opened socks5 client for {}", endpoint);
        Ok(Arc::new(SocksTransport {
            client: Mutex::new(Some(client)),
        }))
    }
}

/// A live reqwest client behind one SOCKS5 tunnel.
pub struct SocksTransport {
    client: Mutex<Option<reqwest::Client>>,
}

#[async_trait]
impl Transport for SocksTransport {
    async fn probe(&self, url: &str, deadline: Duration) -> Result<(), TransportError> {
        let client = self.http_client().ok_or(TransportError::Closed)?;
        client
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    fn http_client(&self) -> Option<reqwest::Client> {
        self.client.lock().clone()
    }

    fn close(&self) {
        self.client.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.client.lock().is_none()
    }
}
