use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{eq3::MODEL_NAME, error::ConfigError};

/// Timing and retry policy of the per-thermostat task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTiming {
    pub failsafe_ms: u64,
    pub max_failures: u32,
    pub refresh_interval_ms: u64,
    pub change_refresh_ms: u64,
    pub refresh_retry_ms: u64,
    pub activity_window_ms: u64,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            failsafe_ms: 8_000,
            max_failures: 10,
            refresh_interval_ms: 300_000,
            change_refresh_ms: 90_000,
            refresh_retry_ms: 5_000,
            activity_window_ms: 600_000,
        }
    }
}

impl SchedulerTiming {
    pub fn sanitize(&mut self) {
        self.failsafe_ms = self.failsafe_ms.clamp(1_000, 60_000);
        self.refresh_interval_ms = self.refresh_interval_ms.max(10_000);
        self.change_refresh_ms = self.change_refresh_ms.max(10_000);
        self.refresh_retry_ms = self.refresh_retry_ms.max(1_000);
        self.activity_window_ms = self.activity_window_ms.max(self.refresh_interval_ms);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub adapter_port: u16,
    pub command_port: u16,
    pub http_port: u16,
    pub weather_ingest_port: u16,
    pub weather_feed_port: u16,
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub command_read_timeout_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            adapter_port: 37201,
            command_port: 37202,
            http_port: 8090,
            weather_ingest_port: 38000,
            weather_feed_port: 38001,
            ping_interval_ms: 5_000,
            idle_timeout_ms: 10_000,
            command_read_timeout_ms: 10_000,
            reply_timeout_ms: 30_000,
        }
    }
}

impl GatewayConfig {
    pub fn sanitize(&mut self) {
        self.ping_interval_ms = self.ping_interval_ms.max(500);
        // At least two pings per idle window.
        self.idle_timeout_ms = self.idle_timeout_ms.max(self.ping_interval_ms * 2);
        self.command_read_timeout_ms = self.command_read_timeout_ms.max(100);
        self.reply_timeout_ms = self.reply_timeout_ms.max(100);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermoConfig {
    pub command_port: u16,
    pub http_port: u16,
    pub timezone: String,
    pub model_name: String,
    pub tick_ms: u64,
    #[serde(default)]
    pub simulated_valves: Vec<String>,
    #[serde(default)]
    pub scheduler: SchedulerTiming,
}

impl Default for ThermoConfig {
    fn default() -> Self {
        Self {
            command_port: 37203,
            http_port: 8091,
            timezone: "UTC".to_string(),
            model_name: MODEL_NAME.to_string(),
            tick_ms: 250,
            simulated_valves: Vec::new(),
            scheduler: SchedulerTiming::default(),
        }
    }
}

impl ThermoConfig {
    pub fn sanitize(&mut self) {
        self.tick_ms = self.tick_ms.clamp(10, 1_000);
        if self.model_name.trim().is_empty() {
            self.model_name = MODEL_NAME.to_string();
        }
        self.simulated_valves.retain(|address| !address.trim().is_empty());
        self.scheduler.sanitize();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub thermo: ThermoConfig,
}

pub const CONFIG_PATH_ENV: &str = "HUB_CONFIG";

impl HubConfig {
    /// `$HUB_CONFIG`, or `./.hub/config.json`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hub/config.json"))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: HubConfig = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.gateway.sanitize();
        self.thermo.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = HubConfig::from_json(br#"{"thermo": {"command_port": 4000, "http_port": 4001, "timezone": "Europe/Prague", "model_name": "", "tick_ms": 0}}"#).unwrap();

        assert_eq!(config.gateway.adapter_port, 37201);
        assert_eq!(config.thermo.command_port, 4000);
        assert_eq!(config.thermo.model_name, MODEL_NAME);
        assert_eq!(config.thermo.tick_ms, 10);
        assert_eq!(config.thermo.scheduler.failsafe_ms, 8_000);
    }

    #[test]
    fn idle_timeout_never_undercuts_ping() {
        let mut gateway = GatewayConfig {
            ping_interval_ms: 8_000,
            idle_timeout_ms: 1_000,
            ..GatewayConfig::default()
        };
        gateway.sanitize();

        assert_eq!(gateway.idle_timeout_ms, 16_000);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            HubConfig::from_json(b"{not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
