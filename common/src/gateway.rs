//! Adapter handshake parsing and per-device-type command routing.

use std::fmt;

use crate::error::{HandshakeError, HubError};

pub const DEV_NOT_FOUND: &str = "DEV NOT FOUND";
pub const UNKNOWN_DEV_TYPE: &str = "UNKNOWN DEV TYPE";
pub const REPLY_OK: &str = "OK";
pub const REPLY_ERROR: &str = "ERROR";

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// 433 MHz transmitter dongle.
    Tx433,
    /// Temperature probe.
    Temp,
    /// LED strip controller taking raw hex frames.
    Led,
    Other(String),
}

impl DeviceType {
    pub fn parse(value: &str) -> Self {
        match value {
            "433TX" | "TX433" => Self::Tx433,
            "TEMP" => Self::Temp,
            "LED" => Self::Led,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tx433 => "433TX",
            Self::Temp => "TEMP",
            Self::Led => "LED",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First line an adapter sends: `<type>;<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub device_type: DeviceType,
    pub id: String,
}

impl Handshake {
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim();
        let parts: Vec<&str> = line.split(';').collect();
        let [device_type, id] = parts.as_slice() else {
            return Err(HandshakeError::Malformed(line.to_string()));
        };
        if id.is_empty() {
            return Err(HandshakeError::EmptyId);
        }

        Ok(Self {
            device_type: DeviceType::parse(device_type),
            id: id.to_string(),
        })
    }
}

/// Client command line: `<id>;<payload...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    pub id: String,
    pub payload: String,
}

impl GatewayRequest {
    /// Everything after the first `;` is payload, including further `;`.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (id, payload) = line.split_once(';').unwrap_or((line, ""));
        Self {
            id: id.to_string(),
            payload: payload.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Send this line to the adapter and map its reply.
    Forward(String),
    /// Answer the client directly without touching the adapter.
    Reply(&'static str),
}

pub fn route(device_type: &DeviceType, payload: &str) -> Route {
    match device_type {
        DeviceType::Tx433 => Route::Forward(format!(">{payload}")),
        DeviceType::Temp => Route::Forward(payload.to_string()),
        DeviceType::Led if is_hex_frame(payload) => {
            Route::Forward(format!("#{}", payload.to_ascii_uppercase()))
        }
        DeviceType::Led => Route::Reply(REPLY_ERROR),
        DeviceType::Other(_) => Route::Reply(UNKNOWN_DEV_TYPE),
    }
}

/// Turns the adapter's answer into the single line returned to the client.
pub fn map_reply(device_type: &DeviceType, reply: Result<&str, &HubError>) -> String {
    let Ok(reply) = reply else {
        return REPLY_ERROR.to_string();
    };

    match device_type {
        DeviceType::Tx433 | DeviceType::Led if reply == REPLY_OK => REPLY_OK.to_string(),
        DeviceType::Tx433 | DeviceType::Led => REPLY_ERROR.to_string(),
        DeviceType::Temp if reply == REPLY_ERROR => REPLY_ERROR.to_string(),
        DeviceType::Temp => reply.to_string(),
        DeviceType::Other(_) => UNKNOWN_DEV_TYPE.to_string(),
    }
}

fn is_hex_frame(payload: &str) -> bool {
    !payload.is_empty()
        && payload.len() % 2 == 0
        && payload.bytes().all(|byte| byte.is_ascii_hexdigit())
}
