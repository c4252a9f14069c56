use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::node::CredentialScope;
use crate::supervisor::BackoffPolicy;

const DEFAULT_LND_HOST: &str = "localhost";
const DEFAULT_LND_PORT: u16 = 10009;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 10_000;
const DEFAULT_LOCKED_BACKOFF_MS: u64 = 30_000;
const DEFAULT_SETTLED_MARKER_CAPACITY: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeBackend {
    Lnd,
    Memory,
}

impl NodeBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lnd => "lnd",
            Self::Memory => "memory",
        }
    }
}

/// Where and how to reach the node for one credential scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeEndpoint {
    pub host: String,
    pub port: u16,
    pub macaroon_path: PathBuf,
}

impl ScopeEndpoint {
    #[must_use]
    pub fn address(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: NodeBackend,
    /// Trust anchor for the node's self-signed TLS certificate.
    pub cert_path: PathBuf,
    pub read_only: ScopeEndpoint,
    pub invoice: ScopeEndpoint,
    pub streaming: ScopeEndpoint,
    pub retry_backoff: Duration,
    pub locked_backoff: Duration,
    pub settled_marker_capacity: usize,
    pub mail_enabled: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid INVOICE_BRIDGE_NODE_BACKEND: {0}")]
    InvalidBackend(String),
    #[error("invalid {key}: {message}")]
    Invalid { key: String, message: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        parse_config_from_env(|key| env::var(key).ok())
    }

    #[must_use]
    pub fn endpoint(&self, scope: CredentialScope) -> &ScopeEndpoint {
        match scope {
            CredentialScope::ReadOnly => &self.read_only,
            CredentialScope::Invoice => &self.invoice,
            CredentialScope::Streaming => &self.streaming,
        }
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            retry: self.retry_backoff,
            node_locked: self.locked_backoff,
        }
    }

    /// Config for the in-memory backend; no files are read.
    #[must_use]
    pub fn memory() -> Self {
        let endpoint = |name: &str| ScopeEndpoint {
            host: DEFAULT_LND_HOST.to_string(),
            port: DEFAULT_LND_PORT,
            macaroon_path: PathBuf::from(format!("{name}.macaroon")),
        };
        Self {
            backend: NodeBackend::Memory,
            cert_path: PathBuf::from("tls.cert"),
            read_only: endpoint("readonly"),
            invoice: endpoint("invoice"),
            streaming: endpoint("invoice"),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            locked_backoff: Duration::from_millis(DEFAULT_LOCKED_BACKOFF_MS),
            settled_marker_capacity: DEFAULT_SETTLED_MARKER_CAPACITY,
            mail_enabled: true,
        }
    }
}

pub(crate) fn parse_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let backend = match non_empty(&lookup, "INVOICE_BRIDGE_NODE_BACKEND")
        .unwrap_or_else(|| "lnd".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "lnd" => NodeBackend::Lnd,
        "memory" => NodeBackend::Memory,
        other => return Err(ConfigError::InvalidBackend(other.to_string())),
    };

    let retry_backoff_ms = parse_u64_env_lookup(
        &lookup,
        "INVOICE_BRIDGE_RETRY_BACKOFF_MS",
        DEFAULT_RETRY_BACKOFF_MS,
        100,
        600_000,
    )?;
    let locked_backoff_ms = parse_u64_env_lookup(
        &lookup,
        "INVOICE_BRIDGE_LOCKED_BACKOFF_MS",
        DEFAULT_LOCKED_BACKOFF_MS,
        100,
        3_600_000,
    )?
    .max(retry_backoff_ms);
    let settled_marker_capacity = parse_u64_env_lookup(
        &lookup,
        "INVOICE_BRIDGE_SETTLED_MARKER_CAPACITY",
        DEFAULT_SETTLED_MARKER_CAPACITY as u64,
        1,
        10_000_000,
    )? as usize;
    let mail_enabled = parse_bool_env_lookup(&lookup, "INVOICE_BRIDGE_MAIL_ENABLED", true)?;

    if backend == NodeBackend::Memory {
        return Ok(Config {
            retry_backoff: Duration::from_millis(retry_backoff_ms),
            locked_backoff: Duration::from_millis(locked_backoff_ms),
            settled_marker_capacity,
            mail_enabled,
            ..Config::memory()
        });
    }

    let host = non_empty(&lookup, "LND_HOST").unwrap_or_else(|| DEFAULT_LND_HOST.to_string());
    let port = parse_port(&lookup, "LND_PORT", DEFAULT_LND_PORT)?;
    let cert_path = required_path(&lookup, "LND_CERT_PATH")?;
    let readonly_macaroon = required_path(&lookup, "LND_READONLY_MACAROON_PATH")?;
    let invoice_macaroon = required_path(&lookup, "LND_INVOICE_MACAROON_PATH")?;
    let stream_macaroon = non_empty(&lookup, "LND_STREAM_MACAROON_PATH")
        .map_or_else(|| invoice_macaroon.clone(), PathBuf::from);

    let scope_endpoint = |prefix: &str, macaroon_path: PathBuf| -> Result<ScopeEndpoint, ConfigError> {
        Ok(ScopeEndpoint {
            host: non_empty(&lookup, &format!("LND_{prefix}_HOST")).unwrap_or_else(|| host.clone()),
            port: parse_port(&lookup, &format!("LND_{prefix}_PORT"), port)?,
            macaroon_path,
        })
    };

    Ok(Config {
        backend,
        cert_path,
        read_only: scope_endpoint("READONLY", readonly_macaroon)?,
        invoice: scope_endpoint("INVOICE", invoice_macaroon)?,
        streaming: scope_endpoint("STREAM", stream_macaroon)?,
        retry_backoff: Duration::from_millis(retry_backoff_ms),
        locked_backoff: Duration::from_millis(locked_backoff_ms),
        settled_marker_capacity,
        mail_enabled,
    })
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_path(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<PathBuf, ConfigError> {
    non_empty(lookup, key)
        .map(PathBuf::from)
        .ok_or(ConfigError::Missing(key))
}

fn parse_port(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match non_empty(lookup, key) {
        Some(raw) => raw.parse::<u16>().map_err(|error| ConfigError::Invalid {
            key: key.to_string(),
            message: error.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|error| ConfigError::Invalid {
                key: key.to_string(),
                message: error.to_string(),
            })
            .map(|value| value.clamp(min, max)),
        None => Ok(default),
    }
}

fn parse_bool_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("expected a boolean, got {other}"),
        }),
    }
}
