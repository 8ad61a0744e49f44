//! A shared, in-process pool of SOCKS5 outbound HTTP client sessions.
//!
//! Worker tasks borrow a session that satisfies their tag predicates and
//! per-task cool-down, use it for one upstream request, and return it. The
//! broker tracks per-proxy health: consecutive transport failures push a
//! proxy past its error limit, its sessions are closed and quarantined, and
//! a background checker probes quarantined proxies until they recover or
//! are evicted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use proxy_broker::{
//!     AcquireOptions, BrokerConfig, PoolMode, ProxyController, ProxyTags, SocksConnector,
//! };
//!
//! # async fn run() -> Result<(), proxy_broker::BrokerError> {
//! let controller = ProxyController::new(
//!     Arc::new(SocksConnector::default()),
//!     PoolMode::Matching,
//!     BrokerConfig::default(),
//! );
//!
//! let mut tags = ProxyTags::new();
//! tags.insert("country".into(), "US".into());
//! controller.admit("203.0.113.7:1080:user:password", tags)?;
//!
//! let opts = AcquireOptions::default()
//!     .task_key("crawl")
//!     .min_age(Duration::from_secs(2))
//!     .predicate("country", "US");
//! let body = controller
//!     .lease(opts, |session| async move {
//!         let client = session.http_client().expect("live client");
//!         let response = client.get("https://example.com/api").send().await?;
//!         Ok(response.text().await?)
//!     })
//!     .await?;
//! # let _ = body;
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
mod health;
pub mod models;
pub mod pool;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::BrokerConfig;
pub use controller::ProxyController;
pub use error::{BrokerError, TransportError};
pub use models::proxy::{ProxyEndpoint, ProxyTags};
pub use pool::{AcquireOptions, PoolMode};
pub use registry::{ProxyStats, TaskStats};
pub use session::LeasedSession;
pub use transport::{Connector, SocksConnector, Transport};
