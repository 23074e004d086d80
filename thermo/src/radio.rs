use hub_common::{FleetAction, RadioAction, ScanAction};
use tracing::{debug, warn};

/// BLE radio capability. Calls return immediately; outcomes arrive later as
/// [`RadioEvent`](hub_common::RadioEvent)s on the channel the backend was
/// built with.
pub trait Radio: Send + Sync {
    fn connect(&self, address: &str);
    fn disconnect(&self, address: &str);
    fn write_control(&self, address: &str, bytes: Vec<u8>);
    fn start_scan(&self);
    fn stop_scan(&self);
}

pub fn execute_fleet_actions(radio: &dyn Radio, actions: Vec<FleetAction>) {
    for action in actions {
        match action {
            FleetAction::Radio { address, action } => match action {
                RadioAction::Connect => radio.connect(&address),
                RadioAction::Write(bytes) => radio.write_control(&address, bytes),
                RadioAction::Disconnect => radio.disconnect(&address),
            },
            FleetAction::Scan(ScanAction::Start) => radio.start_scan(),
            FleetAction::Scan(ScanAction::Stop) => radio.stop_scan(),
            FleetAction::TaskCompleted {
                address,
                id,
                kind,
                result,
            } => match result {
                Ok(()) => debug!(%address, id, kind = kind.as_str(), "task done"),
                Err(err) => debug!(%address, id, kind = kind.as_str(), ?err, "task failed"),
            },
            FleetAction::Killed { address } => {
                warn!(%address, "thermostat dropped after repeated radio timeouts");
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::Radio;

    /// Records every call for assertions.
    #[derive(Default)]
    pub struct RecordingRadio {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingRadio {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Radio for RecordingRadio {
        fn connect(&self, address: &str) {
            self.record(format!("connect {address}"));
        }

        fn disconnect(&self, address: &str) {
            self.record(format!("disconnect {address}"));
        }

        fn write_control(&self, address: &str, bytes: Vec<u8>) {
            self.record(format!("write {address} {bytes:02x?}"));
        }

        fn start_scan(&self) {
            self.record("start_scan".to_string());
        }

        fn stop_scan(&self) {
            self.record("stop_scan".to_string());
        }
    }
}
