//! eQ-3 radiator valve control protocol.
//!
//! Commands are written to the valve's control characteristic; every command
//! is answered with a status frame notification:
//!
//! ```text
//! 0x02 0x01 <flags> <valve %> <0x04> <target * 2> ...
//! ```

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::{error::CodecError, types::ThermostatState, types::ValveMode};

pub const MIN_TEMPERATURE_C: f32 = 4.5;
pub const MAX_TEMPERATURE_C: f32 = 30.0;
pub const MIN_OFFSET_C: f32 = -3.5;
pub const MAX_OFFSET_C: f32 = 3.5;
/// Open-window durations are written in steps of five minutes.
pub const OPEN_WINDOW_STEP_MIN: u32 = 5;

/// Advertised local name of the supported valve model.
pub const MODEL_NAME: &str = "CC-RT-BLE";

const CMD_INFO: u8 = 0x03;
const CMD_SET_TIME: u8 = 0x03;
const CMD_PRESET: u8 = 0x11;
const CMD_OFFSET: u8 = 0x13;
const CMD_OPEN_WINDOW: u8 = 0x14;
const CMD_MODE: u8 = 0x40;
const CMD_TEMPERATURE: u8 = 0x41;
const CMD_COMFORT: u8 = 0x43;
const CMD_ECO: u8 = 0x44;
const CMD_BOOST: u8 = 0x45;
const CMD_LOCK: u8 = 0x80;

const MODE_AUTO: u8 = 0x00;
const MODE_MANUAL: u8 = 0x40;
const MODE_ECO: u8 = 0x80;

const FLAG_MANUAL: u8 = 0x01;
const FLAG_HOLIDAY: u8 = 0x02;
const FLAG_BOOST: u8 = 0x04;
const FLAG_DST: u8 = 0x08;
const FLAG_OPEN_WINDOW: u8 = 0x10;
const FLAG_LOW_BATTERY: u8 = 0x80;

const STATUS_FRAME_LEN: usize = 6;

/// Queue de-duplication class of a command. Two queued tasks never share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Info,
    Date,
    Mode,
    Boost,
    Lock,
    Offset,
    Temperature,
    DayNight,
    Preset,
    OpenWindow,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Date => "DATE",
            Self::Mode => "MODE",
            Self::Boost => "BOOST",
            Self::Lock => "LOCK",
            Self::Offset => "OFFSET",
            Self::Temperature => "TEMP",
            Self::DayNight => "DAYNIGHT",
            Self::Preset => "PRESET",
            Self::OpenWindow => "WINDOW",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Info,
    SetTime(NaiveDateTime),
    Mode(ValveMode),
    Boost(bool),
    Lock(bool),
    Temperature(f32),
    Offset(f32),
    Comfort,
    Eco,
    TemperaturePreset { comfort: f32, eco: f32 },
    /// Temperature held while a window is open, and for how long.
    OpenWindow { temp: f32, duration_minutes: u32 },
}

impl Command {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Info => TaskKind::Info,
            Self::SetTime(_) => TaskKind::Date,
            Self::Mode(_) => TaskKind::Mode,
            Self::Boost(_) => TaskKind::Boost,
            Self::Lock(_) => TaskKind::Lock,
            Self::Temperature(_) => TaskKind::Temperature,
            Self::Offset(_) => TaskKind::Offset,
            Self::Comfort | Self::Eco => TaskKind::DayNight,
            Self::TemperaturePreset { .. } => TaskKind::Preset,
            Self::OpenWindow { .. } => TaskKind::OpenWindow,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Info => vec![CMD_INFO],
            Self::SetTime(now) => vec![
                CMD_SET_TIME,
                (now.year().rem_euclid(100)) as u8,
                now.month() as u8,
                now.day() as u8,
                now.hour() as u8,
                now.minute() as u8,
                now.second() as u8,
            ],
            Self::Mode(mode) => {
                let value = match mode {
                    ValveMode::Auto => MODE_AUTO,
                    ValveMode::Manual => MODE_MANUAL,
                    ValveMode::Eco => MODE_ECO,
                };
                vec![CMD_MODE, value]
            }
            Self::Boost(on) => vec![CMD_BOOST, u8::from(*on)],
            Self::Lock(on) => vec![CMD_LOCK, u8::from(*on)],
            Self::Temperature(temp) => {
                vec![CMD_TEMPERATURE, half_degrees(clamp_temperature(*temp))]
            }
            Self::Offset(offset) => vec![CMD_OFFSET, offset_byte(*offset)],
            Self::Comfort => vec![CMD_COMFORT],
            Self::Eco => vec![CMD_ECO],
            Self::TemperaturePreset { comfort, eco } => vec![
                CMD_PRESET,
                half_degrees(clamp_temperature(*comfort)),
                half_degrees(clamp_temperature(*eco)),
            ],
            Self::OpenWindow {
                temp,
                duration_minutes,
            } => vec![
                CMD_OPEN_WINDOW,
                half_degrees(clamp_temperature(*temp)),
                u8::try_from(duration_minutes / OPEN_WINDOW_STEP_MIN).unwrap_or(u8::MAX),
            ],
        }
    }
}

/// Clamps a target to the valve's settable range. NaN maps to the minimum.
pub fn clamp_temperature(temp: f32) -> f32 {
    if temp.is_nan() {
        return MIN_TEMPERATURE_C;
    }
    temp.clamp(MIN_TEMPERATURE_C, MAX_TEMPERATURE_C)
}

pub fn clamp_offset(offset: f32) -> f32 {
    if offset.is_nan() {
        return 0.0;
    }
    offset.clamp(MIN_OFFSET_C, MAX_OFFSET_C)
}

/// Clamps a target and rounds it to the half degree the valve stores.
pub fn quantize_temperature(temp: f32) -> f32 {
    f32::from(half_degrees(clamp_temperature(temp))) / 2.0
}

fn half_degrees(temp: f32) -> u8 {
    (temp * 2.0).round().clamp(0.0, 255.0) as u8
}

fn offset_byte(offset: f32) -> u8 {
    (2.0 * offset + 7.0).round().clamp(0.0, 255.0) as u8
}

pub fn decode_status(frame: &[u8]) -> Result<ThermostatState, CodecError> {
    if frame.len() < STATUS_FRAME_LEN {
        return Err(CodecError::ShortFrame(frame.len()));
    }

    let flags = frame[2];
    Ok(ThermostatState {
        manual: flags & FLAG_MANUAL != 0,
        holiday: flags & FLAG_HOLIDAY != 0,
        boost: flags & FLAG_BOOST != 0,
        dst: flags & FLAG_DST != 0,
        open_window: flags & FLAG_OPEN_WINDOW != 0,
        low_battery: flags & FLAG_LOW_BATTERY != 0,
        valve_position: frame[3],
        target_temperature: f32::from(frame[5]) / 2.0,
    })
}

/// Builds the frame a valve would notify for `state`.
pub fn encode_status(state: &ThermostatState) -> Vec<u8> {
    let mut flags = 0;
    for (set, bit) in [
        (state.manual, FLAG_MANUAL),
        (state.holiday, FLAG_HOLIDAY),
        (state.boost, FLAG_BOOST),
        (state.dst, FLAG_DST),
        (state.open_window, FLAG_OPEN_WINDOW),
        (state.low_battery, FLAG_LOW_BATTERY),
    ] {
        if set {
            flags |= bit;
        }
    }

    vec![
        0x02,
        0x01,
        flags,
        state.valve_position.min(100),
        0x04,
        half_degrees(state.target_temperature),
    ]
}
