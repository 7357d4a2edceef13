use rusty_relay_messages::AcknowledgeMode;
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::{
    link::SelectionPolicy,
    util::{duration_from_env_ms, from_env_or_else, generate_id},
};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);
const DEFAULT_BODY_RETENTION: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const DEFAULT_INLINE_BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Origin id of this relay server instance.
    pub instance_id: String,
    pub http_port: u16,
    pub https_port: u16,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Links without any traffic for this long are considered dead.
    pub client_timeout: Duration,
    pub request_timeout: Duration,
    /// Bodies up to this size travel inline in the relay message.
    pub inline_body_limit: usize,
    pub selection_policy: SelectionPolicy,
    pub acknowledge_mode: AcknowledgeMode,
    /// Directory of the disk backed body store, in-memory when `None`.
    pub body_store_dir: Option<PathBuf>,
    pub body_retention: Duration,
    pub sweep_interval: Duration,
    /// How long a shutdown waits for calls in flight before closing links.
    pub shutdown_grace: Duration,
    /// Tenant id to connector secret.
    pub tenants: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance_id: generate_id(12),
            http_port: 8080,
            https_port: 8443,
            tls_cert_file: "./certs/cert.pem".to_string(),
            tls_key_file: "./certs/key.pem".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            client_timeout: DEFAULT_KEEP_ALIVE_INTERVAL * 2,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inline_body_limit: DEFAULT_INLINE_BODY_LIMIT,
            selection_policy: SelectionPolicy::RoundRobin,
            acknowledge_mode: AcknowledgeMode::Disabled,
            body_store_dir: None,
            body_retention: DEFAULT_BODY_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            tenants: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let keep_alive_interval =
            duration_from_env_ms("RELAY_KEEP_ALIVE_INTERVAL_MS", defaults.keep_alive_interval);

        Self {
            instance_id: from_env_or_else("RELAY_INSTANCE_ID", || defaults.instance_id.clone()),
            http_port: from_env_or_else("RELAY_HTTP_PORT", || defaults.http_port),
            https_port: from_env_or_else("RELAY_HTTPS_PORT", || defaults.https_port),
            tls_cert_file: from_env_or_else("RELAY_TLS_CERT_FILE", || {
                defaults.tls_cert_file.clone()
            }),
            tls_key_file: from_env_or_else("RELAY_TLS_KEY_FILE", || defaults.tls_key_file.clone()),
            handshake_timeout: duration_from_env_ms(
                "RELAY_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
            ),
            keep_alive_interval,
            client_timeout: duration_from_env_ms("RELAY_CLIENT_TIMEOUT_MS", keep_alive_interval * 2),
            request_timeout: duration_from_env_ms(
                "RELAY_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            ),
            inline_body_limit: from_env_or_else("RELAY_INLINE_BODY_LIMIT", || {
                defaults.inline_body_limit
            }),
            selection_policy: from_env_or_else("RELAY_SELECTION_POLICY", || {
                defaults.selection_policy
            }),
            acknowledge_mode: from_env_or_else("RELAY_ACKNOWLEDGE_MODE", || {
                defaults.acknowledge_mode
            }),
            body_store_dir: std::env::var("RELAY_BODY_STORE_DIR").ok().map(PathBuf::from),
            body_retention: duration_from_env_ms("RELAY_BODY_RETENTION_MS", defaults.body_retention),
            sweep_interval: duration_from_env_ms("RELAY_SWEEP_INTERVAL_MS", defaults.sweep_interval),
            shutdown_grace: duration_from_env_ms("RELAY_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            tenants: std::env::var("RELAY_TENANTS")
                .map(|value| parse_tenants(&value))
                .unwrap_or_default(),
        }
    }
}

/// Parses `tenant:secret,tenant:secret`. Malformed pairs are skipped.
pub fn parse_tenants(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(tenant, secret)| (tenant.trim().to_string(), secret.trim().to_string()))
        .filter(|(tenant, secret)| !tenant.is_empty() && !secret.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tenants() {
        let tenants = parse_tenants("t1:s1, t2 : s2,broken,t3:");
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants["t1"], "s1");
        assert_eq!(tenants["t2"], "s2");
    }

    #[test]
    fn test_client_timeout_defaults_to_twice_keep_alive() {
        let config = RelayConfig::default();
        assert_eq!(config.client_timeout, config.keep_alive_interval * 2);
    }
}
