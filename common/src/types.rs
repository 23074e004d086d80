use serde::{Deserialize, Serialize};

/// Decoded thermostat status, as reported by the valve's status frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermostatState {
    #[serde(rename = "lowBattery")]
    pub low_battery: bool,
    #[serde(rename = "valvePosition")]
    pub valve_position: u8,
    #[serde(rename = "targetTemperature")]
    pub target_temperature: f32,
    pub manual: bool,
    pub holiday: bool,
    pub boost: bool,
    pub dst: bool,
    #[serde(rename = "openWindow")]
    pub open_window: bool,
}

impl Default for ThermostatState {
    fn default() -> Self {
        Self {
            low_battery: false,
            valve_position: 0,
            target_temperature: 19.0,
            manual: false,
            holiday: false,
            boost: false,
            dst: false,
            open_window: false,
        }
    }
}

/// Per-valve settings pushed to the radio on attach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub offset: f32,
    pub lock: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            offset: 0.0,
            lock: false,
        }
    }
}

/// Partial config as supplied by an `ADD` request; absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub offset: Option<f32>,
    #[serde(default)]
    pub lock: Option<bool>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.lock.is_none()
    }

    /// Folds `other` into `self`, keeping fields `other` does not mention.
    pub fn merge(&mut self, other: ConfigUpdate) {
        if other.offset.is_some() {
            self.offset = other.offset;
        }
        if other.lock.is_some() {
            self.lock = other.lock;
        }
    }

    pub fn resolve(&self) -> DeviceConfig {
        DeviceConfig {
            offset: self.offset.unwrap_or(0.0),
            lock: self.lock.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveMode {
    Auto,
    Manual,
    Eco,
}

impl ValveMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Eco => "eco",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "eco" => Some(Self::Eco),
            _ => None,
        }
    }
}

/// One row of the `LIST` reply and `/api/thermostats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermostatSummary {
    pub address: String,
    pub attached: bool,
    pub stale: bool,
    #[serde(rename = "lastReadoutAgeMs")]
    pub last_readout_age_ms: Option<u64>,
    pub config: DeviceConfig,
    pub state: Option<ThermostatState>,
}
