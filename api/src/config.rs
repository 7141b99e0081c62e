/// Server configuration from environment variables (`.env` honoured).
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::bilibili::USER_AGENT;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cookie_path: PathBuf,
    /// Unset keeps outbound fetches without any deadline.
    pub upstream_connect_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&lookup, "API_PORT", 9961);
        let cookie_path = lookup("COOKIE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cookie.json"));
        let upstream_connect_timeout = lookup("UPSTREAM_CONNECT_TIMEOUT_SECS")
            .and_then(|raw| match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    warn!("Ignoring UPSTREAM_CONNECT_TIMEOUT_SECS={}", raw);
                    None
                }
            });

        Self {
            host,
            port,
            cookie_path,
            upstream_connect_timeout,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pooled outbound client shared by the relay and the platform client.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = self.upstream_connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder.build()
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}={}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
