// Daemon configuration sourced from environment variables, with an optional
// YAML override file for ops-managed deployments.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_STREAMS: u32 = 1024;
const DEFAULT_CONFIG_PATH: &str = "/usr/local/rill/config.yml";

#[derive(Debug, Clone)]
pub struct RilldConfig {
    // QUIC listener bind address.
    pub listen_addr: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Max frame size accepted on control streams and preambles.
    pub max_frame_bytes: usize,
    // QUIC idle timeout.
    pub idle_timeout_ms: u64,
    // Per-connection concurrent stream cap.
    pub max_streams: u32,
    // Optional ALPN protocol ids offered by the listener.
    pub alpn: Vec<String>,
    // TLS certificate/key PEM paths; unset means a self-signed dev cert.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    // Shared token enabling the `token` auth scheme; unset disables auth.
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RilldConfigOverride {
    listen_addr: Option<String>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
    idle_timeout_ms: Option<u64>,
    max_streams: Option<u32>,
    alpn: Option<Vec<String>>,
    cert_path: Option<String>,
    key_path: Option<String>,
    auth_token: Option<String>,
}

impl RilldConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("RILL_LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("parse RILL_LISTEN")?;
        let metrics_bind = std::env::var("RILL_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .context("parse RILL_METRICS_BIND")?;
        let max_frame_bytes = std::env::var("RILL_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let idle_timeout_ms = std::env::var("RILL_IDLE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
        let max_streams = std::env::var("RILL_MAX_STREAMS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_STREAMS);
        let alpn = std::env::var("RILL_ALPN")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(|proto| proto.trim().to_string())
                    .filter(|proto| !proto.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let cert_path = std::env::var("RILL_TLS_CERT").ok();
        let key_path = std::env::var("RILL_TLS_KEY").ok();
        let auth_token = std::env::var("RILL_AUTH_TOKEN").ok();
        Ok(Self {
            listen_addr,
            metrics_bind,
            max_frame_bytes,
            idle_timeout_ms,
            max_streams,
            alpn,
            cert_path,
            key_path,
            auth_token,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("RILL_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read rilld config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let override_cfg: RilldConfigOverride =
                serde_yaml::from_str(&contents).context("parse rilld config yaml")?;
            if let Some(value) = override_cfg.listen_addr {
                config.listen_addr = value.parse().context("parse listen_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().context("parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.max_frame_bytes {
                if value > 0 {
                    config.max_frame_bytes = value;
                }
            }
            if let Some(value) = override_cfg.idle_timeout_ms {
                if value > 0 {
                    config.idle_timeout_ms = value;
                }
            }
            if let Some(value) = override_cfg.max_streams {
                if value > 0 {
                    config.max_streams = value;
                }
            }
            if let Some(value) = override_cfg.alpn {
                config.alpn = value;
            }
            if let Some(value) = override_cfg.cert_path {
                config.cert_path = Some(value);
            }
            if let Some(value) = override_cfg.key_path {
                config.key_path = Some(value);
            }
            if let Some(value) = override_cfg.auth_token {
                config.auth_token = Some(value);
            }
        }
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_apply() {
        let yaml = "listen_addr: \"127.0.0.1:9100\"\nmax_frame_bytes: 1024\nalpn: [\"rill\"]\n";
        let override_cfg: RilldConfigOverride =
            serde_yaml::from_str(yaml).expect("parse override");
        assert_eq!(override_cfg.listen_addr.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(override_cfg.max_frame_bytes, Some(1024));
        assert_eq!(override_cfg.alpn, Some(vec!["rill".to_string()]));
    }
}
