// Proxy identity and admission-string parsing.
//
// Two credential sets pointing at the same `ip:port` are the same proxy:
// equality and hashing deliberately ignore username/password.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::Serialize;

use crate::error::BrokerError;

/// Free-form tags attached to a proxy at admission, matched subset-wise at
/// acquire time (`country=US`, `provider=aws`, ...).
pub type ProxyTags = HashMap<String, String>;

/// One SOCKS5 endpoint with credentials.
#[derive(Clone, Serialize)]
pub struct ProxyEndpoint {
    ip: String,
    port: u16,
    #[serde(skip)]
    username: String,
    #[serde(skip)]
    password: String,
}

impl ProxyEndpoint {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The full four-field admission string, credentials included. Used for
    /// exact lookup in `manual_check`; never logged.
    pub fn admission_string(&self) -> String {
        format!("{}:{}:{}:{}", self.ip, self.port, self.username, self.password)
    }
}

impl PartialEq for ProxyEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for ProxyEndpoint {}

impl Hash for ProxyEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Debug for ProxyEndpoint {
    // Credentials stay out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl FromStr for ProxyEndpoint {
    type Err = BrokerError;

    /// Parse `A.B.C.D:PORT:USER:PASS`: exactly four colon-separated fields,
    /// the first splitting on `.` into exactly four parts, `PORT` a `u16`.
    /// Everything else passes through verbatim as credentials.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BrokerError::InvalidProxyString(s.to_string());

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(malformed());
        }
        if parts[0].split('.').count() != 4 {
            return Err(malformed());
        }
        let port: u16 = parts[1].parse().map_err(|_| malformed())?;

        Ok(ProxyEndpoint::new(parts[0], port, parts[2], parts[3]))
    }
}
