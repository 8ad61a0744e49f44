// Domain models

pub mod proxy;

pub use proxy::{ProxyEndpoint, ProxyTags};
