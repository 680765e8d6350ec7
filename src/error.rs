use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WavereqError {
    #[error("cannot submit: no station selected")]
    NoStationSelected,

    #[error("cannot submit: relative time windows need at least one event")]
    NoEventSelected,

    #[error(
        "request of {lines} traces / {size_mb} MB exceeds total limits ({line_limit} traces, {size_limit} MB)"
    )]
    TotalLimitExceeded {
        lines: usize,
        size_mb: u64,
        line_limit: u64,
        size_limit: u64,
    },

    #[error("limit of {limit} traces exceeded; deselect some stations, streams and/or events")]
    TraceLimitExceeded { limit: u64 },

    #[error("none of the requested streams were available in the given time period")]
    NoDataAvailable,

    #[error("duplicate event key: {0}")]
    DuplicateEventKey(String),

    #[error("no request pack loaded")]
    MissingPack,

    #[error("invalid stream code: {0}")]
    InvalidStreamCode(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("malformed row in {kind} batch: {message}")]
    MalformedBatch { kind: &'static str, message: String },

    #[error("invalid auth token: {0}")]
    InvalidAuthToken(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("metadata request failed: {0}")]
    MetadataHttp(String),

    #[error("metadata service returned status {status}: {message}")]
    MetadataStatus { status: u16, message: String },

    #[error("routing request failed: {0}")]
    RoutingHttp(String),

    #[error("routing service returned status {status}: {message}")]
    RoutingStatus { status: u16, message: String },

    #[error("no routes received")]
    NoRoutes,

    #[error("data request failed: {0}")]
    DataHttp(String),

    #[error("request service failed: {0}")]
    LegacyHttp(String),

    #[error("request service returned status {status}: {message}")]
    LegacyStatus { status: u16, message: String },

    #[error("offline storage is not available; downloads are disabled")]
    StoreDisabled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request {0} not found")]
    RequestNotFound(u64),

    #[error("missing config file wavereq.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
