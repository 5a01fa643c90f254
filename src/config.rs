//! Process configuration. Everything comes from the environment with
//! defaults; only a provider API key is required. A `.env` file is loaded
//! at startup without overriding variables that are already set.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loopdetect::DEFAULT_SIDECAR_TIMEOUT;
use crate::proxy::{DEFAULT_INTERVENTION_HINT, DEFAULT_TENANT_HEADER};
use crate::runner::DEFAULT_TASK_LIMIT;

const DEFAULT_SPEND_LIMIT_USD: f64 = 100.0;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub redis_url: Option<String>,
    /// USD per hour applied to tenants without a stored limit.
    pub default_spend_limit: f64,
    pub tenant_header: String,
    pub sidecar_socket: Option<PathBuf>,
    pub sidecar_timeout: Duration,
    pub intervention_hint: String,
    pub async_op_limit: usize,
    pub otel_endpoint: Option<String>,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_nonempty("LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            redis_url: env_nonempty("REDIS_URL"),
            default_spend_limit: parse_spend_limit(env_nonempty("DEFAULT_SPEND_LIMIT")),
            tenant_header: env_nonempty("TENANT_ID_HEADER")
                .unwrap_or_else(|| DEFAULT_TENANT_HEADER.to_string()),
            sidecar_socket: env_nonempty("SIDECAR_UDS_PATH").map(PathBuf::from),
            sidecar_timeout: parse_timeout_ms(env_nonempty("SIDECAR_TIMEOUT_MS")),
            intervention_hint: env_nonempty("INTERVENTION_HINT")
                .unwrap_or_else(|| DEFAULT_INTERVENTION_HINT.to_string()),
            async_op_limit: parse_task_limit(env_nonempty("ASYNC_OP_LIMIT")),
            otel_endpoint: env_nonempty("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_spend_limit(raw: Option<String>) -> f64 {
    let Some(raw) = raw else {
        return DEFAULT_SPEND_LIMIT_USD;
    };
    match raw.parse::<f64>() {
        Ok(limit) if limit.is_finite() && limit >= 0.0 => limit,
        _ => {
            tracing::warn!(
                value = %raw,
                default = DEFAULT_SPEND_LIMIT_USD,
                "invalid DEFAULT_SPEND_LIMIT, using default"
            );
            DEFAULT_SPEND_LIMIT_USD
        }
    }
}

fn parse_timeout_ms(raw: Option<String>) -> Duration {
    raw.and_then(|value| value.parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SIDECAR_TIMEOUT)
}

fn parse_task_limit(raw: Option<String>) -> usize {
    raw.and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_TASK_LIMIT)
}

/// Loads `KEY=VALUE` pairs from a dotenv-style file. Empty lines and `#`
/// comments are skipped, surrounding quotes are trimmed, and variables that
/// are already set win over the file.
pub fn load_env_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
    Ok(())
}
