//! Vocabulary shared between the scheduler and whatever drives the BLE radio.

/// Something the radio reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    StateChanged { powered_on: bool },
    Discovered { address: String, name: String },
    Connected { address: String },
    WriteComplete {
        address: String,
        result: Result<(), String>,
    },
    Notify { address: String, value: Vec<u8> },
    Disconnected { address: String },
}

impl RadioEvent {
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::StateChanged { .. } => None,
            Self::Discovered { address, .. }
            | Self::Connected { address }
            | Self::WriteComplete { address, .. }
            | Self::Notify { address, .. }
            | Self::Disconnected { address } => Some(address),
        }
    }
}

/// Something one thermostat wants the radio to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioAction {
    Connect,
    Write(Vec<u8>),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Start,
    Stop,
}
