pub mod config;
pub mod discovery;
pub mod eq3;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod radio;
pub mod scheduler;
pub mod types;
pub mod weather;

pub use config::{GatewayConfig, HubConfig, SchedulerTiming, ThermoConfig};
pub use error::{CodecError, ConfigError, HandshakeError, HubError, ProtocolError, ReadoutError};
pub use fleet::{FleetAction, ThermostatFleet};
pub use radio::{RadioAction, RadioEvent, ScanAction};
pub use scheduler::{LinkPhase, Thermostat, ThermostatAction};
pub use types::{ConfigUpdate, DeviceConfig, ThermostatState, ThermostatSummary, ValveMode};
