use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::Path,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use hub_common::{
    protocol::list_body, ConfigError, FleetAction, HubConfig, RadioEvent, ThermoConfig,
    ThermostatFleet,
};

use crate::{
    radio::{execute_fleet_actions, Radio},
    server::serve_client,
    simulated::SimulatedRadio,
};

#[derive(Clone)]
pub struct AppState {
    fleet: Arc<Mutex<ThermostatFleet>>,
    radio: Arc<dyn Radio>,
    timezone: Tz,
}

impl AppState {
    pub fn new(fleet: ThermostatFleet, radio: Arc<dyn Radio>, timezone: Tz) -> Self {
        Self {
            fleet: Arc::new(Mutex::new(fleet)),
            radio,
            timezone,
        }
    }

    /// Runs `apply` against the fleet with the current clocks and hands the
    /// resulting actions to the radio. Radio calls never block, so they run
    /// under the fleet lock and reach the radio in the order the fleet
    /// emitted them.
    pub async fn with_fleet<T>(
        &self,
        apply: impl FnOnce(&mut ThermostatFleet, NaiveDateTime, u64) -> (T, Vec<FleetAction>),
    ) -> T {
        let mut fleet = self.fleet.lock().await;
        let (value, actions) = apply(&mut fleet, now_in_timezone(self.timezone), monotonic_ms());
        if !actions.is_empty() {
            execute_fleet_actions(self.radio.as_ref(), actions);
        }
        value
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = HubConfig::path_from_env();
    let mut config = load_config(&path).await.unwrap_or_else(|err| {
        warn!("failed to load config from {}: {err:#}", path.display());
        ThermoConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let timezone = parse_timezone(&config.timezone).unwrap_or_else(|err| {
        warn!("{err}, falling back to UTC");
        Tz::UTC
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let radio = SimulatedRadio::new(&config.simulated_valves, events_tx);
    let fleet = ThermostatFleet::new(config.model_name.clone(), config.scheduler.clone());
    let app_state = AppState::new(fleet, Arc::new(radio.clone()), timezone);

    spawn_radio_event_loop(app_state.clone(), events_rx);
    spawn_control_loop(app_state.clone(), Duration::from_millis(config.tick_ms));
    radio.power_on();

    let commands = bind(config.command_port, "thermostat command server").await?;
    spawn_command_loop(app_state.clone(), commands);

    let app = Router::new()
        .route("/api/thermostats", get(handle_get_thermostats))
        .with_state(app_state);

    let http = bind(config.http_port, "thermostat http").await?;
    info!("thermostat status api on http://{}", http.local_addr()?);
    axum::serve(http, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<ThermoConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(HubConfig::from_json(&raw)?.thermo),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(ThermoConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: &mut ThermoConfig) {
    let port = |name: &str| {
        std::env::var(name)
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
    };
    if let Some(value) = port("THERMO_COMMAND_PORT") {
        config.command_port = value;
    }
    if let Some(value) = port("THERMO_HTTP_PORT") {
        config.http_port = value;
    }
    if let Ok(timezone) = std::env::var("THERMO_TIMEZONE") {
        config.timezone = timezone;
    }
}

fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.parse::<Tz>()
        .map_err(|_| ConfigError::Timezone(name.to_string()))
}

async fn bind(port: u16, what: &str) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {what} at {addr}"))?;
    info!("{what} listening on {addr}");
    Ok(listener)
}

fn spawn_command_loop(app_state: AppState, listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let app_state = app_state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_client(stream, app_state).await {
                            warn!("thermostat command connection failed: {err:#}");
                        }
                    });
                }
                Err(err) => warn!("thermostat command accept failed: {err}"),
            }
        }
    });
}

fn spawn_radio_event_loop(app_state: AppState, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            app_state
                .with_fleet(|fleet, wall_clock, now_ms| {
                    ((), fleet.handle_radio_event(event, wall_clock, now_ms))
                })
                .await;
        }
        warn!("radio event channel closed");
    });
}

fn spawn_control_loop(app_state: AppState, tick: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);

        loop {
            interval.tick().await;
            app_state
                .with_fleet(|fleet, _, now_ms| ((), fleet.tick(now_ms)))
                .await;
        }
    });
}

async fn handle_get_thermostats(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state
        .with_fleet(|fleet, _, now_ms| (fleet.list(now_ms), Vec::new()))
        .await;
    Json(list_body(&devices))
}

fn now_in_timezone(timezone: Tz) -> NaiveDateTime {
    Utc::now().with_timezone(&timezone).naive_local()
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use hub_common::{eq3::MODEL_NAME, ConfigUpdate, SchedulerTiming};

    use super::*;
    use crate::radio::testing::RecordingRadio;

    #[test]
    fn timezone_names_are_validated() {
        assert_eq!(parse_timezone("Europe/Prague").ok(), Some(Tz::Europe__Prague));
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ConfigError::Timezone(name)) if name == "Mars/Olympus"
        ));
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let first = monotonic_ms();
        let second = monotonic_ms();
        assert!(second >= first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_scan_changes_reach_radio_in_order() {
        let radio = Arc::new(RecordingRadio::default());
        let fleet = ThermostatFleet::new(MODEL_NAME, SchedulerTiming::default());
        let state = AppState::new(fleet, radio.clone(), Tz::UTC);
        state
            .with_fleet(|fleet, wall_clock, now_ms| {
                (
                    (),
                    fleet.handle_radio_event(
                        RadioEvent::StateChanged { powered_on: true },
                        wall_clock,
                        now_ms,
                    ),
                )
            })
            .await;

        let mut workers = Vec::new();
        for index in 0..32 {
            let address = format!("00:1a:22:00:00:{index:02x}");
            let adder = state.clone();
            let add_address = address.clone();
            workers.push(tokio::spawn(async move {
                adder
                    .with_fleet(|fleet, wall_clock, now_ms| {
                        (
                            (),
                            fleet.add(&add_address, ConfigUpdate::default(), wall_clock, now_ms),
                        )
                    })
                    .await;
            }));
            let finder = state.clone();
            workers.push(tokio::spawn(async move {
                finder
                    .with_fleet(|fleet, wall_clock, now_ms| {
                        (
                            (),
                            fleet.handle_radio_event(
                                RadioEvent::Discovered {
                                    address,
                                    name: MODEL_NAME.to_string(),
                                },
                                wall_clock,
                                now_ms,
                            ),
                        )
                    })
                    .await;
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let scans: Vec<String> = radio
            .calls()
            .into_iter()
            .filter(|call| call.ends_with("_scan"))
            .collect();
        for pair in scans.windows(2) {
            assert_ne!(pair[0], pair[1], "scan calls out of order: {scans:?}");
        }
        let radio_scanning = scans.last().is_some_and(|call| call == "start_scan");
        let scanning = state
            .with_fleet(|fleet, _, _| (fleet.discovery().is_scanning(), Vec::new()))
            .await;
        assert_eq!(radio_scanning, scanning);
    }
}
