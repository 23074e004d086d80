//! In-memory eQ-3 valves behind the [`Radio`] trait, for hosts without BLE.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use hub_common::{
    eq3::{encode_status, MAX_TEMPERATURE_C, MIN_TEMPERATURE_C, MODEL_NAME},
    RadioEvent, ThermostatState,
};

use crate::radio::Radio;

#[derive(Debug, Clone)]
struct SimulatedValve {
    state: ThermostatState,
    connected: bool,
    comfort: f32,
    eco: f32,
}

impl SimulatedValve {
    fn new() -> Self {
        Self {
            state: ThermostatState::default(),
            connected: false,
            comfort: 21.0,
            eco: 17.0,
        }
    }

    fn apply(&mut self, command: &[u8]) {
        match command {
            [0x41, half] => self.set_target(f32::from(*half) / 2.0),
            [0x40, mode] => self.state.manual = *mode == 0x40,
            [0x45, on] => self.state.boost = *on != 0,
            [0x43] => self.set_target(self.comfort),
            [0x44] => self.set_target(self.eco),
            [0x11, comfort, eco] => {
                self.comfort = f32::from(*comfort) / 2.0;
                self.eco = f32::from(*eco) / 2.0;
            }
            _ => {}
        }
    }

    fn set_target(&mut self, target: f32) {
        let target = target.clamp(MIN_TEMPERATURE_C, MAX_TEMPERATURE_C);
        self.state.target_temperature = target;
        let open = (target - MIN_TEMPERATURE_C) / (MAX_TEMPERATURE_C - MIN_TEMPERATURE_C);
        self.state.valve_position = (open * 100.0).round() as u8;
    }
}

#[derive(Clone)]
pub struct SimulatedRadio {
    events: UnboundedSender<RadioEvent>,
    valves: Arc<Mutex<HashMap<String, SimulatedValve>>>,
}

impl SimulatedRadio {
    pub fn new(addresses: &[String], events: UnboundedSender<RadioEvent>) -> Self {
        let valves = addresses
            .iter()
            .map(|address| (address.clone(), SimulatedValve::new()))
            .collect();
        Self {
            events,
            valves: Arc::new(Mutex::new(valves)),
        }
    }

    pub fn power_on(&self) {
        info!(
            valves = self.valves.lock().unwrap_or_else(PoisonError::into_inner).len(),
            "simulated radio powered on"
        );
        self.emit(RadioEvent::StateChanged { powered_on: true });
    }

    fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            debug!("radio event dropped, receiver gone");
        }
    }
}

impl Radio for SimulatedRadio {
    fn connect(&self, address: &str) {
        let mut valves = self.valves.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(valve) = valves.get_mut(address) else {
            // Unknown peers never answer; the failsafe takes over.
            return;
        };
        valve.connected = true;
        drop(valves);
        self.emit(RadioEvent::Connected {
            address: address.to_string(),
        });
    }

    fn disconnect(&self, address: &str) {
        if let Some(valve) = self
            .valves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(address)
        {
            valve.connected = false;
        }
        self.emit(RadioEvent::Disconnected {
            address: address.to_string(),
        });
    }

    fn write_control(&self, address: &str, bytes: Vec<u8>) {
        let mut valves = self.valves.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = match valves.get_mut(address) {
            Some(valve) if valve.connected => {
                valve.apply(&bytes);
                Ok(encode_status(&valve.state))
            }
            _ => Err("not connected".to_string()),
        };
        drop(valves);

        match frame {
            Ok(frame) => {
                self.emit(RadioEvent::WriteComplete {
                    address: address.to_string(),
                    result: Ok(()),
                });
                self.emit(RadioEvent::Notify {
                    address: address.to_string(),
                    value: frame,
                });
            }
            Err(err) => self.emit(RadioEvent::WriteComplete {
                address: address.to_string(),
                result: Err(err),
            }),
        }
    }

    fn start_scan(&self) {
        let addresses: Vec<String> = self
            .valves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for address in addresses {
            self.emit(RadioEvent::Discovered {
                address,
                name: MODEL_NAME.to_string(),
            });
        }
    }

    fn stop_scan(&self) {
        debug!("simulated scan stopped");
    }
}
