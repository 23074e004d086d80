//! All thermostats handled by one radio: the discovery table plus one
//! [`Thermostat`] scheduler per attached valve.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::{
    config::SchedulerTiming,
    discovery::Discovery,
    eq3::TaskKind,
    error::ProtocolError,
    radio::{RadioAction, RadioEvent, ScanAction},
    scheduler::{TaskError, TaskId, Thermostat, ThermostatAction},
    types::{ConfigUpdate, ThermostatState, ThermostatSummary, ValveMode},
};

#[derive(Debug, Clone, PartialEq)]
pub enum FleetAction {
    Radio {
        address: String,
        action: RadioAction,
    },
    Scan(ScanAction),
    TaskCompleted {
        address: String,
        id: TaskId,
        kind: TaskKind,
        result: Result<(), TaskError>,
    },
    Killed {
        address: String,
    },
}

#[derive(Debug, Clone)]
pub struct ThermostatFleet {
    timing: SchedulerTiming,
    discovery: Discovery,
    thermostats: HashMap<String, Thermostat>,
}

impl ThermostatFleet {
    pub fn new(model_name: impl Into<String>, timing: SchedulerTiming) -> Self {
        Self {
            timing,
            discovery: Discovery::new(model_name),
            thermostats: HashMap::new(),
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn thermostat(&self, address: &str) -> Option<&Thermostat> {
        self.thermostats.get(address)
    }

    /// `ADD`: remembers the config and either re-applies it to the attached
    /// valve or lets discovery look for it.
    pub fn add(
        &mut self,
        address: &str,
        update: ConfigUpdate,
        wall_clock: NaiveDateTime,
        now_ms: u64,
    ) -> Vec<FleetAction> {
        let mut actions = Vec::new();
        if let Some(scan) = self.discovery.want(address, update) {
            actions.push(FleetAction::Scan(scan));
        }

        if !update.is_empty() {
            if let Some(thermostat) = self.thermostats.get_mut(address) {
                let emitted = thermostat.reset_config(update, wall_clock, now_ms);
                translate(address, emitted, &mut actions);
            }
        }
        actions
    }

    /// Makes sure `address` is at least being searched for.
    pub fn track(&mut self, address: &str) -> Vec<FleetAction> {
        if self.discovery.is_wanted(address) {
            return Vec::new();
        }
        self.discovery
            .want(address, ConfigUpdate::default())
            .map(FleetAction::Scan)
            .into_iter()
            .collect()
    }

    pub fn status(&self, address: &str, now_ms: u64) -> Result<ThermostatState, ProtocolError> {
        let thermostat = self
            .thermostats
            .get(address)
            .ok_or(ProtocolError::NoDevice)?;
        if thermostat.is_stale(now_ms) {
            return Err(ProtocolError::Stale);
        }
        Ok(thermostat.state())
    }

    pub fn set_temperature(
        &mut self,
        address: &str,
        temp: f32,
        now_ms: u64,
    ) -> Result<Vec<FleetAction>, ProtocolError> {
        self.with_thermostat(address, |thermostat| {
            thermostat.set_temperature(temp, now_ms)
        })
    }

    pub fn set_mode(
        &mut self,
        address: &str,
        mode: ValveMode,
        now_ms: u64,
    ) -> Result<Vec<FleetAction>, ProtocolError> {
        self.with_thermostat(address, |thermostat| thermostat.set_mode(mode, now_ms))
    }

    pub fn set_boost(
        &mut self,
        address: &str,
        on: bool,
        now_ms: u64,
    ) -> Result<Vec<FleetAction>, ProtocolError> {
        self.with_thermostat(address, |thermostat| thermostat.set_boost(on, now_ms))
    }

    /// Every wanted address, attached or not, sorted by address.
    pub fn list(&self, now_ms: u64) -> Vec<ThermostatSummary> {
        let mut addresses: Vec<&str> = self.discovery.wanted_addresses().collect();
        addresses.sort_unstable();

        addresses
            .into_iter()
            .map(|address| match self.thermostats.get(address) {
                Some(thermostat) => ThermostatSummary {
                    address: address.to_string(),
                    attached: true,
                    stale: thermostat.is_stale(now_ms),
                    last_readout_age_ms: thermostat
                        .last_readout_ms()
                        .map(|last| now_ms.saturating_sub(last)),
                    config: thermostat.config().unwrap_or_default(),
                    state: Some(thermostat.state()),
                },
                None => ThermostatSummary {
                    address: address.to_string(),
                    attached: false,
                    stale: false,
                    last_readout_age_ms: None,
                    config: self
                        .discovery
                        .wanted_config(address)
                        .unwrap_or_default()
                        .resolve(),
                    state: None,
                },
            })
            .collect()
    }

    pub fn handle_radio_event(
        &mut self,
        event: RadioEvent,
        wall_clock: NaiveDateTime,
        now_ms: u64,
    ) -> Vec<FleetAction> {
        let mut actions = Vec::new();
        match event {
            RadioEvent::StateChanged { powered_on } => {
                info!(powered_on, "radio state changed");
                if let Some(scan) = self.discovery.on_radio_state(powered_on) {
                    actions.push(FleetAction::Scan(scan));
                }
            }
            RadioEvent::Discovered { address, name } => {
                let Some(update) = self.discovery.on_discovered(&address, &name) else {
                    return actions;
                };
                if let Some(scan) = self.discovery.reconcile() {
                    actions.push(FleetAction::Scan(scan));
                }

                let mut thermostat = Thermostat::new(address.clone(), self.timing.clone());
                let emitted = thermostat.reset_config(update, wall_clock, now_ms);
                self.thermostats.insert(address.clone(), thermostat);
                translate(&address, emitted, &mut actions);
            }
            RadioEvent::Connected { address } => {
                self.route(&address, &mut actions, |thermostat| {
                    thermostat.on_connected(now_ms)
                });
            }
            RadioEvent::WriteComplete { address, result } => {
                self.route(&address, &mut actions, |thermostat| {
                    thermostat.on_write_complete(result, now_ms)
                });
            }
            RadioEvent::Notify { address, value } => {
                self.route(&address, &mut actions, |thermostat| {
                    thermostat.on_notify(&value, now_ms)
                });
            }
            RadioEvent::Disconnected { address } => {
                self.route(&address, &mut actions, |thermostat| {
                    thermostat.on_disconnected(now_ms)
                });
            }
        }
        actions
    }

    /// Fires due failsafe and refresh timers on every thermostat.
    pub fn tick(&mut self, now_ms: u64) -> Vec<FleetAction> {
        let mut actions = Vec::new();
        let due: Vec<String> = self
            .thermostats
            .iter()
            .filter(|(_, thermostat)| {
                thermostat
                    .next_deadline_ms()
                    .is_some_and(|deadline| now_ms >= deadline)
            })
            .map(|(address, _)| address.clone())
            .collect();

        for address in due {
            self.route(&address, &mut actions, |thermostat| thermostat.tick(now_ms));
        }
        actions
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.thermostats
            .values()
            .filter_map(Thermostat::next_deadline_ms)
            .min()
    }

    fn with_thermostat(
        &mut self,
        address: &str,
        apply: impl FnOnce(&mut Thermostat) -> Vec<ThermostatAction>,
    ) -> Result<Vec<FleetAction>, ProtocolError> {
        let thermostat = self
            .thermostats
            .get_mut(address)
            .ok_or(ProtocolError::NoDevice)?;
        let mut actions = Vec::new();
        translate(address, apply(thermostat), &mut actions);
        Ok(actions)
    }

    fn route(
        &mut self,
        address: &str,
        actions: &mut Vec<FleetAction>,
        apply: impl FnOnce(&mut Thermostat) -> Vec<ThermostatAction>,
    ) {
        let Some(thermostat) = self.thermostats.get_mut(address) else {
            debug!(address, "radio event for unknown thermostat");
            return;
        };
        let emitted = apply(thermostat);
        let killed = emitted.contains(&ThermostatAction::Killed);
        translate(address, emitted, actions);

        if killed {
            self.retire(address, actions);
        }
    }

    fn retire(&mut self, address: &str, actions: &mut Vec<FleetAction>) {
        self.thermostats.remove(address);
        if self.discovery.release(address) {
            warn!(address, "thermostat killed, resuming discovery");
        }
        if let Some(scan) = self.discovery.reconcile() {
            actions.push(FleetAction::Scan(scan));
        }
    }
}

fn translate(address: &str, emitted: Vec<ThermostatAction>, actions: &mut Vec<FleetAction>) {
    actions.extend(emitted.into_iter().map(|action| match action {
        ThermostatAction::Radio(action) => FleetAction::Radio {
            address: address.to_string(),
            action,
        },
        ThermostatAction::Completed { id, kind, result } => FleetAction::TaskCompleted {
            address: address.to_string(),
            id,
            kind,
            result,
        },
        ThermostatAction::Killed => FleetAction::Killed {
            address: address.to_string(),
        },
    }));
}
