//! Server configuration.
//!
//! Loaded from `NKUDO_*` environment variables with workable defaults for
//! local development. Production deployments set the store to `postgres`
//! and point the CA at real key material.

use std::net::SocketAddr;

/// Which store backs the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// In-memory (development only, state lost on restart).
    Memory,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres { url: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener. TLS termination (including agent
    /// mTLS verification) happens in front; the verified client serial is
    /// forwarded in `x-nkudo-client-serial`.
    pub bind_addr: SocketAddr,
    /// Store selection.
    pub store: StoreKind,
    /// Log level filter.
    pub log_level: String,
    /// Admin key for tenant/key management routes. Admin routes reject
    /// everything when unset.
    pub admin_key: Option<String>,
    /// Paths to CA certificate/key PEM files. A self-signed root is
    /// generated at boot when unset.
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    /// Common name for a boot-generated CA.
    pub ca_common_name: String,
    /// Agent client certificate lifetime, hours.
    pub agent_cert_ttl_hours: i64,
    /// Offline sweeper cadence, seconds.
    pub sweep_interval_secs: u64,
    /// Heartbeat staleness threshold, seconds.
    pub stale_threshold_secs: i64,
    /// Execution lease TTL, seconds.
    pub lease_ttl_secs: i64,
    /// Longest enrollment-token TTL a caller may request, seconds.
    pub max_token_ttl_secs: i64,
    /// Log ingest queue capacity.
    pub log_queue_capacity: usize,
    /// Audit chain verification cadence, seconds.
    pub audit_verify_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `NKUDO_BIND_ADDR` / `PORT` — listener address (default `127.0.0.1:8440`)
    /// - `NKUDO_STORE` — `memory` or `postgres` (default: `memory`)
    /// - `DATABASE_URL` — PostgreSQL connection string
    /// - `NKUDO_LOG_LEVEL` — log filter (default: `info`)
    /// - `NKUDO_ADMIN_KEY` — admin bearer key (admin routes disabled if unset)
    /// - `NKUDO_CA_CERT` / `NKUDO_CA_KEY` — CA PEM paths (generated if unset)
    /// - `NKUDO_CA_COMMON_NAME` — CN for a generated CA
    /// - `NKUDO_AGENT_CERT_TTL_HOURS` — client cert lifetime (default: 168)
    /// - `NKUDO_SWEEP_INTERVAL_SECS` — sweeper cadence (default: 15)
    /// - `NKUDO_STALE_THRESHOLD_SECS` — offline threshold (default: 90)
    /// - `NKUDO_LEASE_TTL_SECS` — execution lease TTL (default: 60)
    /// - `NKUDO_MAX_TOKEN_TTL_SECS` — enrollment token TTL cap (default: 3600)
    /// - `NKUDO_LOG_QUEUE_CAPACITY` — ingest queue size (default: 4096)
    /// - `NKUDO_AUDIT_VERIFY_INTERVAL_SECS` — verifier cadence (default: 300)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("NKUDO_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8440)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8440);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8440))
        };

        let store = match std::env::var("NKUDO_STORE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => {
                let url = std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/nkudo".to_owned());
                StoreKind::Postgres { url }
            }
            _ => StoreKind::Memory,
        };

        Self {
            bind_addr,
            store,
            log_level: env_or("NKUDO_LOG_LEVEL", "info"),
            admin_key: std::env::var("NKUDO_ADMIN_KEY").ok(),
            ca_cert_path: std::env::var("NKUDO_CA_CERT").ok(),
            ca_key_path: std::env::var("NKUDO_CA_KEY").ok(),
            ca_common_name: env_or("NKUDO_CA_COMMON_NAME", "nkudo agents ca"),
            agent_cert_ttl_hours: env_parse("NKUDO_AGENT_CERT_TTL_HOURS", 168),
            sweep_interval_secs: env_parse("NKUDO_SWEEP_INTERVAL_SECS", 15),
            stale_threshold_secs: env_parse("NKUDO_STALE_THRESHOLD_SECS", 90),
            lease_ttl_secs: env_parse("NKUDO_LEASE_TTL_SECS", 60),
            max_token_ttl_secs: env_parse("NKUDO_MAX_TOKEN_TTL_SECS", 3600),
            log_queue_capacity: env_parse("NKUDO_LOG_QUEUE_CAPACITY", 4096),
            audit_verify_interval_secs: env_parse("NKUDO_AUDIT_VERIFY_INTERVAL_SECS", 300),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
