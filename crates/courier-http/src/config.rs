//! HTTP client configuration.

use reqwest::ClientBuilder;
use std::time::Duration;

use crate::error::{HttpError, Result};

/// Environment variable names read by [`ClientConfig::from_env`].
pub mod vars {
    pub const CONNECT_TIMEOUT_SECS: &str = "COURIER_CONNECT_TIMEOUT_SECS";
    pub const READ_TIMEOUT_SECS: &str = "COURIER_READ_TIMEOUT_SECS";
    pub const WRITE_TIMEOUT_SECS: &str = "COURIER_WRITE_TIMEOUT_SECS";
    pub const MAX_REQUESTS: &str = "COURIER_MAX_REQUESTS";
    pub const USER_AGENT: &str = "COURIER_USER_AGENT";
    pub const TLS: &str = "COURIER_TLS";
}

/// How server certificates and hostnames are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Verify certificate chains and hostnames.
    #[default]
    Verify,
    /// Accept any certificate for any hostname.
    TrustAll,
    /// Pick each check individually.
    Custom {
        verify_certificates: bool,
        verify_hostnames: bool,
    },
}

impl TlsPolicy {
    /// Parse from string (`verify`, `trust-all`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "verify" | "strict" => Some(Self::Verify),
            "trust-all" | "trust_all" | "insecure" => Some(Self::TrustAll),
            _ => None,
        }
    }

    fn verify_certificates(&self) -> bool {
        match self {
            Self::Verify => true,
            Self::TrustAll => false,
            Self::Custom { verify_certificates, .. } => *verify_certificates,
        }
    }

    fn verify_hostnames(&self) -> bool {
        match self {
            Self::Verify => true,
            Self::TrustAll => false,
            Self::Custom { verify_hostnames, .. } => *verify_hostnames,
        }
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum wait for the next piece of response data.
    pub read_timeout: Duration,
    /// Maximum time to transmit the request.
    pub write_timeout: Duration,
    /// Maximum number of calls running at once; extra calls wait queued.
    pub max_requests: usize,
    /// User agent string.
    pub user_agent: String,
    /// Maximum idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// Enable gzip decompression.
    pub gzip: bool,
    /// Certificate and hostname verification.
    pub tls: TlsPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            max_requests: 64,
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 10,
            gzip: true,
            tls: TlsPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables, keeping defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64(vars::CONNECT_TIMEOUT_SECS) {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(vars::READ_TIMEOUT_SECS) {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(vars::WRITE_TIMEOUT_SECS) {
            config.write_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_u64(vars::MAX_REQUESTS).filter(|m| *m > 0) {
            config.max_requests = max as usize;
        }
        if let Ok(agent) = std::env::var(vars::USER_AGENT) {
            if !agent.trim().is_empty() {
                config.user_agent = agent;
            }
        }
        if let Ok(tls) = std::env::var(vars::TLS) {
            match TlsPolicy::parse(&tls) {
                Some(policy) => config.tls = policy,
                None => tracing::warn!(value = %tls, "ignoring unknown {}", vars::TLS),
            }
        }

        config
    }

    /// Set all three timeouts at once.
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Time allowed between sending the request and receiving response headers.
    pub(crate) fn header_timeout(&self) -> Duration {
        self.write_timeout + self.read_timeout
    }
}

fn env_u64(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(value = %raw, "ignoring non-numeric {}", var);
            None
        }
    }
}

/// Build the underlying engine from a config.
pub(crate) fn build_engine(config: &ClientConfig) -> Result<reqwest::Client> {
    let builder = ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .gzip(config.gzip)
        .danger_accept_invalid_certs(!config.tls.verify_certificates())
        .danger_accept_invalid_hostnames(!config.tls.verify_hostnames());

    builder.build().map_err(HttpError::ClientBuild)
}
