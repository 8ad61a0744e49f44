// Error taxonomy for the broker.
//
// Two layers: `TransportError` enumerates the recognised failure modes that
// count as evidence against a proxy (SOCKS handshake, connect, read timeout,
// protocol/framing, lease-execution deadline); `BrokerError` is everything a
// caller can see. Failures outside the recognised set travel as
// `BrokerError::Other` and never touch registry state.

use std::time::Duration;

use thiserror::Error;

/// A failure mode attributable to the proxy or the upstream network path.
#[derive(Debug, Error)]
pub enum TransportError {
    /// SOCKS5 tunnel could not be established.
    #[error("socks handshake failed: {0}")]
    Socks(String),

    /// Upstream connection refused, reset, or unreachable.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request exceeded its read deadline.
    #[error("read timed out")]
    Timeout,

    /// Malformed or interrupted response framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller work exceeded the per-lease execution deadline.
    #[error("lease execution exceeded {0:?}")]
    LeaseDeadline(Duration),

    /// Transport used after `close`.
    #[error("transport is closed")]
    Closed,

    /// No client could be constructed for the endpoint.
    #[error("unusable proxy endpoint: {0}")]
    BadEndpoint(String),
}

impl From<reqwest::Error> for TransportError {
    /// Map a reqwest failure into the recognised transport-fault set.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransportError::Protocol(err.to_string())
        } else if err.is_builder() || err.is_request() {
            TransportError::BadEndpoint(err.to_string())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }
}

/// Top-level error surface of the crate.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Admission string did not parse as `ip:port:user:password`.
    #[error("malformed proxy string {0:?}, expected ip:port:user:password")]
    InvalidProxyString(String),

    /// No matching session became available before the deadline.
    #[error("timed out waiting for a matching session")]
    AcquireTimeout,

    /// The waiter was cancelled before a session was delivered.
    #[error("acquire was cancelled")]
    Cancelled,

    /// A session was released while an identical session was already idle.
    #[error("session released twice")]
    DoubleRelease,

    /// A recognised transport fault, already attributed to the proxy and
    /// recorded in the registry. Retry with a fresh acquire.
    #[error("proxy {endpoint} failed: {cause}")]
    ProxyFailed {
        endpoint: String,
        #[source]
        cause: TransportError,
    },

    /// A recognised transport fault before attribution (raised inside a
    /// lease scope; the controller converts it into `ProxyFailed`).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A lease failure outside the recognised transport set. Re-raised
    /// verbatim; not evidence of proxy fault.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for BrokerError {
    /// Lease closures can `?` reqwest failures directly; they arrive
    /// pre-classified into the recognised transport set.
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Transport(TransportError::from(err))
    }
}

impl BrokerError {
    /// True for the failure modes that count against the proxy's health.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::ProxyFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_recognised() {
        let err = BrokerError::Transport(TransportError::Timeout);
        assert!(err.is_transport());

        let err = BrokerError::ProxyFailed {
            endpoint: "10.0.0.1:1080".into(),
            cause: TransportError::Connect("refused".into()),
        };
        assert!(err.is_transport());
    }

    #[test]
    fn other_errors_are_not_recognised() {
        assert!(!BrokerError::AcquireTimeout.is_transport());
        assert!(!BrokerError::Cancelled.is_transport());
        assert!(!BrokerError::Other(anyhow::anyhow!("parse failure")).is_transport());
    }

    #[test]
    fn lease_deadline_names_the_budget() {
        let msg = TransportError::LeaseDeadline(Duration::from_secs(20)).to_string();
        assert!(msg.contains("20s"), "unexpected message: {msg}");
    }

    #[test]
    fn proxy_failed_chains_the_cause() {
        let err = BrokerError::ProxyFailed {
            endpoint: "10.0.0.1:1080".into(),
            cause: TransportError::Timeout,
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:1080"));
        assert!(msg.contains("timed out"));
    }
}
