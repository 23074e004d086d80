use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::{radio::ScanAction, types::ConfigUpdate};

/// Tracks which valves are wanted and which are attached, and decides when
/// the radio should be scanning.
#[derive(Debug, Clone)]
pub struct Discovery {
    model_name: String,
    wanted: HashMap<String, ConfigUpdate>,
    attached: HashSet<String>,
    radio_ready: bool,
    scanning: bool,
}

impl Discovery {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            wanted: HashMap::new(),
            attached: HashSet::new(),
            radio_ready: false,
            scanning: false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_attached(&self, address: &str) -> bool {
        self.attached.contains(address)
    }

    pub fn is_wanted(&self, address: &str) -> bool {
        self.wanted.contains_key(address)
    }

    pub fn wanted_config(&self, address: &str) -> Option<ConfigUpdate> {
        self.wanted.get(address).copied()
    }

    pub fn wanted_addresses(&self) -> impl Iterator<Item = &str> {
        self.wanted.keys().map(String::as_str)
    }

    /// Registers interest in `address`. Repeated calls merge config fields.
    pub fn want(&mut self, address: &str, update: ConfigUpdate) -> Option<ScanAction> {
        self.wanted
            .entry(address.to_string())
            .and_modify(|existing| existing.merge(update))
            .or_insert(update);
        self.reconcile()
    }

    pub fn on_radio_state(&mut self, powered_on: bool) -> Option<ScanAction> {
        self.radio_ready = powered_on;
        if !powered_on {
            // The radio stops scanning on its own when it powers off.
            self.scanning = false;
            return None;
        }
        self.reconcile()
    }

    /// Returns the stored config when the advertisement is a wanted valve that
    /// is not attached yet. The address is marked attached.
    pub fn on_discovered(&mut self, address: &str, name: &str) -> Option<ConfigUpdate> {
        if name != self.model_name {
            return None;
        }
        let Some(update) = self.wanted.get(address).copied() else {
            debug!(address, "ignoring unrequested valve");
            return None;
        };
        if !self.attached.insert(address.to_string()) {
            return None;
        }

        info!(address, "valve discovered");
        Some(update)
    }

    /// Forgets that `address` is attached so it can be discovered again.
    pub fn release(&mut self, address: &str) -> bool {
        self.attached.remove(address)
    }

    /// Starts scanning while any wanted valve is unattached and stops once
    /// every wanted valve is attached.
    pub fn reconcile(&mut self) -> Option<ScanAction> {
        if !self.radio_ready {
            return None;
        }

        let missing = self
            .wanted
            .keys()
            .any(|address| !self.attached.contains(address));
        match (missing, self.scanning) {
            (true, false) => {
                self.scanning = true;
                Some(ScanAction::Start)
            }
            (false, true) => {
                self.scanning = false;
                Some(ScanAction::Stop)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::eq3::MODEL_NAME;

    #[test]
    fn scan_waits_for_powered_radio() {
        let mut discovery = Discovery::new(MODEL_NAME);

        assert_eq!(discovery.want("aa", ConfigUpdate::default()), None);
        assert_eq!(discovery.on_radio_state(true), Some(ScanAction::Start));
        assert!(discovery.is_scanning());
    }

    #[test]
    fn discovery_filters_by_name_and_interest() {
        let mut discovery = Discovery::new(MODEL_NAME);
        discovery.on_radio_state(true);
        discovery.want(
            "aa",
            ConfigUpdate {
                offset: Some(1.0),
                lock: None,
            },
        );

        assert_eq!(discovery.on_discovered("aa", "OTHER"), None);
        assert_eq!(discovery.on_discovered("bb", MODEL_NAME), None);
        assert_eq!(
            discovery.on_discovered("aa", MODEL_NAME),
            Some(ConfigUpdate {
                offset: Some(1.0),
                lock: None,
            })
        );
        assert_eq!(discovery.on_discovered("aa", MODEL_NAME), None);
        assert!(discovery.is_attached("aa"));
    }

    #[test]
    fn scan_stops_once_everything_is_attached() {
        let mut discovery = Discovery::new(MODEL_NAME);
        discovery.on_radio_state(true);
        discovery.want("aa", ConfigUpdate::default());
        discovery.want("bb", ConfigUpdate::default());

        discovery.on_discovered("aa", MODEL_NAME);
        assert_eq!(discovery.reconcile(), None);

        discovery.on_discovered("bb", MODEL_NAME);
        assert_eq!(discovery.reconcile(), Some(ScanAction::Stop));

        assert!(discovery.release("aa"));
        assert_eq!(discovery.reconcile(), Some(ScanAction::Start));
        assert!(!discovery.release("aa"));
    }

    #[test]
    fn repeated_want_merges_config() {
        let mut discovery = Discovery::new(MODEL_NAME);
        discovery.want(
            "aa",
            ConfigUpdate {
                offset: Some(1.0),
                lock: None,
            },
        );
        discovery.want(
            "aa",
            ConfigUpdate {
                offset: None,
                lock: Some(true),
            },
        );

        assert_eq!(
            discovery.wanted_config("aa"),
            Some(ConfigUpdate {
                offset: Some(1.0),
                lock: Some(true),
            })
        );
    }

    #[test]
    fn power_loss_clears_scanning() {
        let mut discovery = Discovery::new(MODEL_NAME);
        discovery.want("aa", ConfigUpdate::default());
        discovery.on_radio_state(true);

        assert_eq!(discovery.on_radio_state(false), None);
        assert!(!discovery.is_scanning());
        assert_eq!(discovery.on_radio_state(true), Some(ScanAction::Start));
    }
}
