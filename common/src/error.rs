use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("status frame too short: {0} bytes, need at least 6")]
    ShortFrame(usize),
}

/// Failures surfaced to a caller waiting on an adapter reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("disconnected")]
    Disconnected,
    #[error("device {0} not found")]
    NotFound(String),
    #[error("no reply within {0} ms")]
    Timeout(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("expected `<type>;<id>`, got {0:?}")]
    Malformed(String),
    #[error("empty adapter id")]
    EmptyId,
}

/// Thermostat command protocol errors. `Display` is the exact wire reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("parse error")]
    Parse,
    #[error("no cmd")]
    NoCmd,
    #[error("unknown cmd")]
    UnknownCmd,
    #[error("no address")]
    NoAddress,
    #[error("no temp")]
    NoTemp,
    #[error("bad mode")]
    BadMode,
    #[error("no device")]
    NoDevice,
    #[error("stale")]
    Stale,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadoutError {
    #[error("expected 3 fields `t;p;h`, got {0}")]
    FieldCount(usize),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid timezone {0:?}")]
    Timezone(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
