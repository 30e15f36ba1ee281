//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pdu::DEFAULT_MAX_PDU_SIZE;

/// Upper bound on I/O worker threads.
pub const MAX_WORKER_THREADS: usize = 64;

/// Root configuration for the balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// I/O worker settings.
    pub workers: WorkerConfig,

    /// Listener definitions (`[[listener]]` tables).
    #[serde(rename = "listener")]
    pub listeners: Vec<ListenerConfig>,

    /// Backend directory servers (`[[backend]]` tables).
    #[serde(rename = "backend")]
    pub backends: Vec<BackendConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Backend reconnect backoff.
    pub backoff: BackoffConfig,

    /// Request routing behaviour.
    pub routing: RoutingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// I/O worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of I/O worker threads, each running its own event loop.
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 4 }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listener URL: `ldap://host:port`, `ldaps://host:port` or `ldapi://<encoded path>`.
    pub url: String,

    /// Certificate material, required for `ldaps`.
    pub tls: Option<TlsConfig>,

    /// Octal file mode applied to `ldapi` sockets (e.g. "0660").
    pub permissions: Option<String>,

    /// Clients on this listener bypass the backend pending-request ceiling.
    pub privileged: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            url: "ldap://0.0.0.0:1389".to_string(),
            tls: None,
            permissions: None,
            privileged: false,
        }
    }
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Backend directory server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend URI (e.g., "ldap://10.0.0.5:389").
    pub uri: String,

    /// Ceiling on ordinary (`OPEN`) upstream connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Ceiling on bind-only upstream connections.
    #[serde(default = "default_max_bind_connections")]
    pub max_bind_connections: usize,

    /// Ceiling on connections being established at once.
    #[serde(default = "default_max_connecting")]
    pub max_connecting: usize,

    /// Requests allowed to wait for a connection before failing fast.
    #[serde(default = "default_max_pending_ops")]
    pub max_pending_ops: usize,

    /// In-flight operations allowed on one `OPEN` upstream connection (0 = unlimited).
    #[serde(default = "default_max_pending_per_connection")]
    pub max_pending_per_connection: usize,

    /// Trust settings for `ldaps` backends.
    #[serde(default)]
    pub tls: Option<BackendTlsConfig>,
}

fn default_max_connections() -> usize {
    4
}

fn default_max_bind_connections() -> usize {
    1
}

fn default_max_connecting() -> usize {
    2
}

fn default_max_pending_ops() -> usize {
    1000
}

fn default_max_pending_per_connection() -> usize {
    0
}

impl BackendConfig {
    /// A backend entry with default limits.
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            max_connections: default_max_connections(),
            max_bind_connections: default_max_bind_connections(),
            max_connecting: default_max_connecting(),
            max_pending_ops: default_max_pending_ops(),
            max_pending_per_connection: default_max_pending_per_connection(),
            tls: None,
        }
    }
}

/// TLS trust configuration for a backend.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BackendTlsConfig {
    /// CA bundle (PEM); the webpki roots are used when unset.
    pub ca_path: Option<String>,

    /// Server name to verify instead of the URI host.
    pub server_name: Option<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Age after which an in-flight operation is considered stale, in seconds.
    pub operation_secs: u64,

    /// Backend connect timeout in seconds.
    pub connect_secs: u64,

    /// Idle client connection timeout in seconds (0 disables).
    pub idle_secs: u64,

    /// Ceiling on the graceful shutdown drain, in seconds.
    pub drain_secs: u64,

    /// Period of the staleness scanner in milliseconds.
    pub scan_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_secs: 30,
            connect_secs: 5,
            idle_secs: 0,
            drain_secs: 10,
            scan_interval_ms: 1000,
        }
    }
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_secs > 0).then(|| Duration::from_secs(self.idle_secs))
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Backend reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failed connect, in milliseconds.
    pub base_ms: u64,

    /// Ceiling for the escalating delay, in milliseconds.
    pub max_ms: u64,

    /// Period of each backend's retry timer, in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 30_000,
            retry_interval_ms: 1000,
        }
    }
}

/// Backend selection strategy across backends.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// What a client sees when its upstream disappears mid-request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamLoss {
    /// Synthesize an `unavailable` result for the request.
    #[default]
    Error,
    /// Close the client connection.
    Close,
}

/// Request routing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: Strategy,
    pub upstream_loss: UpstreamLoss,
    /// Largest PDU accepted from either side, in bytes.
    pub max_pdu_size: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            upstream_loss: UpstreamLoss::Error,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
