//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listener and backend URLs and their TLS requirements
//! - Validate value ranges (thread counts, ceilings, timeouts)
//! - Detect duplicate backend names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::{BalancerConfig, MAX_WORKER_THREADS};
use crate::net::address::{LdapUrl, Transport, UrlError};

/// A single semantic problem in the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no listeners configured")]
    NoListeners,
    #[error("worker threads must be between 1 and {max}, got {got}")]
    WorkerThreads { got: usize, max: usize },
    #[error("listener '{url}': {source}")]
    ListenerUrl { url: String, source: UrlError },
    #[error("listener '{0}' uses ldaps but has no tls section")]
    ListenerMissingTls(String),
    #[error("listener '{0}': permissions only apply to ldapi listeners")]
    PermissionsOnTcp(String),
    #[error("listener '{url}': invalid octal permissions '{value}'")]
    Permissions { url: String, value: String },
    #[error("backend '{name}': {source}")]
    BackendUri { name: String, source: UrlError },
    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),
    #[error("backend '{0}' allows no connections")]
    NoConnections(String),
    #[error("backend '{0}': max_connecting must be at least 1")]
    NoConnecting(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("backoff base_ms ({base}) exceeds max_ms ({max})")]
    Backoff { base: u64, max: u64 },
}

/// Parse an octal permission string such as "0660".
pub fn parse_permissions(value: &str) -> Option<u32> {
    let digits = value.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).ok().filter(|mode| *mode <= 0o7777)
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.workers.threads == 0 || config.workers.threads > MAX_WORKER_THREADS {
        errors.push(ValidationError::WorkerThreads {
            got: config.workers.threads,
            max: MAX_WORKER_THREADS,
        });
    }

    if config.listeners.is_empty() {
        errors.push(ValidationError::NoListeners);
    }
    for listener in &config.listeners {
        let url = match listener.url.parse::<LdapUrl>() {
            Ok(url) => url,
            Err(source) => {
                errors.push(ValidationError::ListenerUrl {
                    url: listener.url.clone(),
                    source,
                });
                continue;
            }
        };
        if url.transport == Transport::Tls && listener.tls.is_none() {
            errors.push(ValidationError::ListenerMissingTls(listener.url.clone()));
        }
        if let Some(value) = &listener.permissions {
            if url.transport != Transport::Local {
                errors.push(ValidationError::PermissionsOnTcp(listener.url.clone()));
            } else if parse_permissions(value).is_none() {
                errors.push(ValidationError::Permissions {
                    url: listener.url.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        if let Err(source) = backend.uri.parse::<LdapUrl>() {
            errors.push(ValidationError::BackendUri {
                name: backend.name.clone(),
                source,
            });
        }
        if backend.max_connections + backend.max_bind_connections == 0 {
            errors.push(ValidationError::NoConnections(backend.name.clone()));
        }
        if backend.max_connecting == 0 {
            errors.push(ValidationError::NoConnecting(backend.name.clone()));
        }
    }

    let timeouts = &config.timeouts;
    if timeouts.operation_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.operation_secs"));
    }
    if timeouts.connect_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_secs"));
    }
    if timeouts.scan_interval_ms == 0 {
        errors.push(ValidationError::Zero("timeouts.scan_interval_ms"));
    }
    if config.backoff.retry_interval_ms == 0 {
        errors.push(ValidationError::Zero("backoff.retry_interval_ms"));
    }
    if config.backoff.base_ms > config.backoff.max_ms {
        errors.push(ValidationError::Backoff {
            base: config.backoff.base_ms,
            max: config.backoff.max_ms,
        });
    }
    if config.routing.max_pdu_size == 0 {
        errors.push(ValidationError::Zero("routing.max_pdu_size"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
