//! Configuration types for Redis connections

use std::time::Duration;

/// Configuration for a single Redis connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Optional password for authentication
    pub auth_password: Option<String>,

    /// Timeout for establishing the connection and completing auth
    pub connection_timeout: Duration,

    /// Timeout for individual command execution on the wire
    pub execute_timeout: Duration,

    /// Route the connection through an externally established SSH tunnel
    pub use_ssh_tunnel: bool,

    /// In cluster traversals, connect to the host reported by CLUSTER SLOTS.
    /// When false only the reported port is used and the configured host is
    /// kept, which is what tunnelled setups need.
    pub override_cluster_host: bool,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            auth_password: None,
            connection_timeout: Duration::from_secs(60),
            execute_timeout: Duration::from_secs(60),
            use_ssh_tunnel: false,
            override_cluster_host: false,
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration for the given endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the authentication password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth_password = Some(password.into());
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the per-command execution timeout
    #[must_use]
    pub const fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Route through an SSH tunnel transport
    #[must_use]
    pub const fn with_ssh_tunnel(mut self, enabled: bool) -> Self {
        self.use_ssh_tunnel = enabled;
        self
    }

    /// Honor cluster-reported host names during traversals
    #[must_use]
    pub const fn with_override_cluster_host(mut self, enabled: bool) -> Self {
        self.override_cluster_host = enabled;
        self
    }

    /// Whether AUTH should be issued after connecting
    #[must_use]
    pub fn use_auth(&self) -> bool {
        self.auth_password.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// A config is usable when it names a host and a non-zero port
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.host.trim().is_empty() && self.port > 0
    }

    /// `host:port` form for log and error messages
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
