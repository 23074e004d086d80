use std::{io::ErrorKind, net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use hub_common::{weather::Readout, GatewayConfig, HubConfig};

use crate::{
    command::{serve_command, CommandTiming},
    registry::{serve_adapter, LinkTiming, Registry},
    weather::{epoch_ms, serve_feed, serve_ingest, WeatherStation},
};

#[derive(Clone)]
struct AppState {
    registry: Registry,
    station: WeatherStation,
}

#[derive(Debug, Serialize)]
struct WeatherStatus {
    #[serde(flatten)]
    readout: Readout,
    active: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = HubConfig::path_from_env();
    let mut config = load_config(&path).await.unwrap_or_else(|err| {
        warn!("failed to load config from {}: {err:#}", path.display());
        GatewayConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let app_state = AppState {
        registry: Registry::new(),
        station: WeatherStation::new(),
    };

    let link_timing = LinkTiming {
        ping_interval: Duration::from_millis(config.ping_interval_ms),
        idle_timeout: Duration::from_millis(config.idle_timeout_ms),
    };
    let command_timing = CommandTiming {
        read_timeout: Duration::from_millis(config.command_read_timeout_ms),
        reply_timeout: Duration::from_millis(config.reply_timeout_ms),
    };

    let adapters = bind(config.adapter_port, "adapter registry").await?;
    let registry = app_state.registry.clone();
    spawn_accept_loop(adapters, "adapter", move |stream| {
        let registry = registry.clone();
        async move {
            serve_adapter(stream, registry, link_timing).await;
            Ok(())
        }
    });

    let commands = bind(config.command_port, "gateway command server").await?;
    let registry = app_state.registry.clone();
    spawn_accept_loop(commands, "command", move |stream| {
        serve_command(stream, registry.clone(), command_timing)
    });

    let ingest = bind(config.weather_ingest_port, "weather ingest").await?;
    let station = app_state.station.clone();
    spawn_accept_loop(ingest, "weather ingest", move |stream| {
        serve_ingest(stream, station.clone())
    });

    let feed = bind(config.weather_feed_port, "weather feed").await?;
    let station = app_state.station.clone();
    spawn_accept_loop(feed, "weather feed", move |stream| {
        serve_feed(stream, station.clone())
    });

    let app = Router::new()
        .route("/api/adapters", get(handle_get_adapters))
        .route("/api/weather", get(handle_get_weather))
        .with_state(app_state);

    let http = bind(config.http_port, "gateway http").await?;
    info!("gateway status api on http://{}", http.local_addr()?);
    axum::serve(http, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(HubConfig::from_json(&raw)?.gateway),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(GatewayConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: &mut GatewayConfig) {
    for (name, port) in [
        ("GATEWAY_ADAPTER_PORT", &mut config.adapter_port),
        ("GATEWAY_COMMAND_PORT", &mut config.command_port),
        ("GATEWAY_HTTP_PORT", &mut config.http_port),
    ] {
        if let Some(value) = std::env::var(name)
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            *port = value;
        }
    }
}

async fn bind(port: u16, what: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {what} at {addr}"))?;
    info!("{what} listening on {addr}");
    Ok(listener)
}

fn spawn_accept_loop<F, Fut>(listener: TcpListener, what: &'static str, serve: F)
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let connection = serve(stream);
                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            warn!("{what} connection failed: {err:#}");
                        }
                    });
                }
                Err(err) => warn!("{what} accept failed: {err}"),
            }
        }
    });
}

async fn handle_get_adapters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn handle_get_weather(State(state): State<AppState>) -> impl IntoResponse {
    let readout = state.station.latest();
    Json(WeatherStatus {
        active: readout.is_active(epoch_ms()),
        readout,
    })
}
