//! Thermostat command protocol: one JSON object per line in, one out.
//!
//! ```text
//! {"cmd":"ADD","address":"00:1a:22:0a:bb:cc","offset":-1.0,"lock":true}
//! {"cmd":"STATUS","address":"00:1a:22:0a:bb:cc"}
//! {"cmd":"TEMP","address":"00:1a:22:0a:bb:cc","temp":21.5}
//! ```

use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};

use crate::{
    error::ProtocolError,
    fleet::{FleetAction, ThermostatFleet},
    types::{ConfigUpdate, ThermostatState, ThermostatSummary, ValveMode},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Add {
        address: String,
        update: ConfigUpdate,
    },
    Status {
        address: String,
    },
    Temp {
        address: String,
        temp: Option<f64>,
    },
    Mode {
        address: String,
        mode: Option<ValveMode>,
    },
    Boost {
        address: String,
        on: bool,
    },
    List,
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim()).map_err(|_| ProtocolError::Parse)?;
    let Value::Object(fields) = value else {
        return Err(ProtocolError::Parse);
    };
    let cmd = fields.get("cmd").ok_or(ProtocolError::NoCmd)?;

    match cmd.as_str() {
        Some("LIST") => Ok(Request::List),
        Some("ADD") => Ok(Request::Add {
            address: address(&fields)?,
            update: ConfigUpdate {
                offset: fields
                    .get("offset")
                    .and_then(Value::as_f64)
                    .map(|offset| offset as f32),
                lock: fields.get("lock").and_then(Value::as_bool),
            },
        }),
        Some("STATUS") => Ok(Request::Status {
            address: address(&fields)?,
        }),
        Some("TEMP") => Ok(Request::Temp {
            address: address(&fields)?,
            temp: fields.get("temp").and_then(Value::as_f64),
        }),
        Some("MODE") => Ok(Request::Mode {
            address: address(&fields)?,
            mode: fields
                .get("mode")
                .and_then(Value::as_str)
                .and_then(ValveMode::parse),
        }),
        Some("BOOST") => Ok(Request::Boost {
            address: address(&fields)?,
            on: fields.get("on").and_then(Value::as_bool).unwrap_or(true),
        }),
        _ => Err(ProtocolError::UnknownCmd),
    }
}

fn address(fields: &Map<String, Value>) -> Result<String, ProtocolError> {
    fields
        .get("address")
        .and_then(Value::as_str)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .ok_or(ProtocolError::NoAddress)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    State(ThermostatState),
    List(Vec<ThermostatSummary>),
    Error(ProtocolError),
}

impl Response {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Ok => json!({ "ok": true }),
            Self::State(state) => json!({
                "ok": true,
                "lowBattery": state.low_battery,
                "valvePosition": state.valve_position,
                "targetTemperature": state.target_temperature,
                "manual": state.manual,
                "holiday": state.holiday,
                "boost": state.boost,
                "dst": state.dst,
                "openWindow": state.open_window,
            }),
            Self::List(devices) => list_body(devices),
            Self::Error(err) => json!({ "error": err.to_string() }),
        }
    }

    pub fn to_line(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Self::Error(err)
    }
}

/// Body shared by `LIST` and the HTTP thermostat listing.
pub fn list_body(devices: &[ThermostatSummary]) -> Value {
    json!({
        "ok": true,
        "devices": serde_json::to_value(devices).unwrap_or_default(),
    })
}

/// Applies one request to the fleet. Commands that name an address make sure
/// it is tracked before anything else, so discovery starts looking for it even
/// when the request itself fails.
pub fn dispatch(
    fleet: &mut ThermostatFleet,
    request: Request,
    wall_clock: NaiveDateTime,
    now_ms: u64,
) -> (Response, Vec<FleetAction>) {
    match request {
        Request::List => (Response::List(fleet.list(now_ms)), Vec::new()),
        Request::Add { address, update } => {
            let actions = fleet.add(&address, update, wall_clock, now_ms);
            (Response::Ok, actions)
        }
        Request::Status { address } => {
            let actions = fleet.track(&address);
            let response = match fleet.status(&address, now_ms) {
                Ok(state) => Response::State(state),
                Err(err) => err.into(),
            };
            (response, actions)
        }
        Request::Temp { address, temp } => {
            let mut actions = fleet.track(&address);
            let Some(temp) = temp else {
                return (ProtocolError::NoTemp.into(), actions);
            };
            let response = apply(
                fleet.set_temperature(&address, temp as f32, now_ms),
                &mut actions,
            );
            (response, actions)
        }
        Request::Mode { address, mode } => {
            let mut actions = fleet.track(&address);
            let Some(mode) = mode else {
                return (ProtocolError::BadMode.into(), actions);
            };
            let response = apply(fleet.set_mode(&address, mode, now_ms), &mut actions);
            (response, actions)
        }
        Request::Boost { address, on } => {
            let mut actions = fleet.track(&address);
            let response = apply(fleet.set_boost(&address, on, now_ms), &mut actions);
            (response, actions)
        }
    }
}

/// Parses and dispatches one request line.
pub fn handle_line(
    fleet: &mut ThermostatFleet,
    line: &str,
    wall_clock: NaiveDateTime,
    now_ms: u64,
) -> (Response, Vec<FleetAction>) {
    match parse_request(line) {
        Ok(request) => dispatch(fleet, request, wall_clock, now_ms),
        Err(err) => (err.into(), Vec::new()),
    }
}

fn apply(
    result: Result<Vec<FleetAction>, ProtocolError>,
    actions: &mut Vec<FleetAction>,
) -> Response {
    match result {
        Ok(emitted) => {
            actions.extend(emitted);
            Response::Ok
        }
        Err(err) => err.into(),
    }
}
