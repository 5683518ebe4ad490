//! Error types for each component boundary.

use shared::{
    domain::{ConversationId, LocalId},
    error::ApiError,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect transport: {0}")]
    Connect(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Receive(String),
    #[error("transport closed by peer")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("request issued under generation {requested} but connection is on {current}")]
    StaleGeneration { requested: u64, current: u64 },
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("base url {0} cannot carry a path")]
    InvalidBase(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("server returned {:?}: {}", .0.code, .0.message)]
    Api(ApiError),
    #[error("invalid response body: {0}")]
    Decode(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("conversation {0} is not live")]
    NotLive(ConversationId),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("no message with local id {0}")]
    UnknownLocalId(LocalId),
    #[error("message {0} has not failed")]
    NotFailed(LocalId),
    #[error("sync runtime has stopped")]
    RuntimeStopped,
    #[error("backend request failed: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid url for {field}: {source}")]
    Url {
        field: &'static str,
        source: url::ParseError,
    },
    #[error("invalid value for {field}: {value}")]
    Value { field: &'static str, value: String },
}
