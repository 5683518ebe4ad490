use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    connection::{Backoff, DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP},
    error::ConfigError,
    membership::{DEFAULT_JOIN_ACK_TIMEOUT, DEFAULT_JOIN_MAX_RETRIES},
    message_store::DEFAULT_DUPLICATE_WINDOW,
    sync::{SyncTimeouts, DEFAULT_SEND_ACK_TIMEOUT},
};

const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_TRANSPORT_URL: &str = "ws://127.0.0.1:5000/ws";
const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: Url,
    pub transport_url: Url,
    pub join_ack_timeout: Duration,
    pub join_max_retries: u32,
    pub send_ack_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub duplicate_window: Duration,
}

impl ClientSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.reconnect_base,
            cap: self.reconnect_cap,
        }
    }

    pub fn sync_timeouts(&self) -> SyncTimeouts {
        SyncTimeouts {
            join_ack: self.join_ack_timeout,
            join_max_retries: self.join_max_retries,
            send_ack: self.send_ack_timeout,
            duplicate_window: self.duplicate_window,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    transport_url: Option<String>,
    join_ack_timeout_ms: Option<u64>,
    join_max_retries: Option<u32>,
    send_ack_timeout_ms: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_cap_ms: Option<u64>,
    duplicate_window_ms: Option<u64>,
}

/// Loads settings from `client.toml` (or `APP__CONFIG`) and `APP__*`
/// environment variables, in that order of precedence over the defaults.
pub fn load_settings() -> Result<ClientSettings, ConfigError> {
    let path = std::env::var("APP__CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_settings_from(Path::new(&path), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let file = read_file_settings(path)?;

    let api_url = env("APP__API_URL")
        .or(file.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let transport_url = env("APP__TRANSPORT_URL")
        .or(file.transport_url)
        .unwrap_or_else(|| DEFAULT_TRANSPORT_URL.to_string());

    let settings = ClientSettings {
        api_url: parse_url("api_url", &api_url)?,
        transport_url: parse_url("transport_url", &transport_url)?,
        join_ack_timeout: millis(
            &env,
            "APP__JOIN_ACK_TIMEOUT_MS",
            file.join_ack_timeout_ms,
            DEFAULT_JOIN_ACK_TIMEOUT,
        )?,
        join_max_retries: match env("APP__JOIN_MAX_RETRIES") {
            Some(raw) => parse_number("APP__JOIN_MAX_RETRIES", &raw)?,
            None => file.join_max_retries.unwrap_or(DEFAULT_JOIN_MAX_RETRIES),
        },
        send_ack_timeout: millis(
            &env,
            "APP__SEND_ACK_TIMEOUT_MS",
            file.send_ack_timeout_ms,
            DEFAULT_SEND_ACK_TIMEOUT,
        )?,
        reconnect_base: millis(
            &env,
            "APP__RECONNECT_BASE_MS",
            file.reconnect_base_ms,
            DEFAULT_RECONNECT_BASE,
        )?,
        reconnect_cap: millis(
            &env,
            "APP__RECONNECT_CAP_MS",
            file.reconnect_cap_ms,
            DEFAULT_RECONNECT_CAP,
        )?,
        duplicate_window: millis(
            &env,
            "APP__DUPLICATE_WINDOW_MS",
            file.duplicate_window_ms,
            DEFAULT_DUPLICATE_WINDOW,
        )?,
    };

    if settings.reconnect_cap < settings.reconnect_base {
        return Err(ConfigError::Value {
            field: "reconnect_cap_ms",
            value: settings.reconnect_cap.as_millis().to_string(),
        });
    }

    Ok(settings)
}

fn read_file_settings(path: &Path) -> Result<FileSettings, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileSettings::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|source| ConfigError::Url { field, source })
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Value {
        field,
        value: raw.to_string(),
    })
}

fn millis(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    from_file: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match env(key) {
        Some(raw) => parse_number::<u64>(key, &raw).map(Duration::from_millis),
        None => Ok(from_file.map(Duration::from_millis).unwrap_or(default)),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
