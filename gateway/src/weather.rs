//! Weather station ingest and feed listeners.

use std::sync::Arc;

use chrono::Utc;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::watch,
};
use tracing::{debug, info, warn};

use hub_common::weather::{parse_readout, Readout};

/// Latest readout, shared between the ingest side, the feed side and the
/// HTTP API.
#[derive(Clone)]
pub struct WeatherStation {
    latest: Arc<watch::Sender<Readout>>,
}

impl Default for WeatherStation {
    fn default() -> Self {
        Self::new()
    }
}

impl WeatherStation {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Readout::default());
        Self {
            latest: Arc::new(latest),
        }
    }

    pub fn latest(&self) -> Readout {
        *self.latest.borrow()
    }

    fn publish(&self, readout: Readout) {
        info!(t = ?readout.t, p = ?readout.p, h = ?readout.h, "weather readout");
        self.latest.send_replace(readout);
    }

    fn subscribe(&self) -> watch::Receiver<Readout> {
        self.latest.subscribe()
    }
}

/// Reads `t;p;h` lines from a station until it disconnects.
pub async fn serve_ingest(stream: TcpStream, station: WeatherStation) -> anyhow::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_readout(&line, epoch_ms()) {
            Ok(readout) => station.publish(readout),
            Err(err) => warn!("dropping weather line {line:?}: {err}"),
        }
    }
    Ok(())
}

/// Streams the latest readout, then every new one, as JSON lines.
pub async fn serve_feed(stream: TcpStream, station: WeatherStation) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut updates = station.subscribe();

    let current = *updates.borrow_and_update();
    write_readout(&mut writer, &current).await?;

    let mut discard = [0u8; 64];
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let readout = *updates.borrow_and_update();
                write_readout(&mut writer, &readout).await?;
            }
            read = reader.read(&mut discard) => {
                if read? == 0 {
                    debug!("weather feed client left");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn write_readout<W>(writer: &mut W, readout: &Readout) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(readout)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

pub fn epoch_ms() -> u64 {
    Utc::now().timestamp_millis().try_into().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    async fn listen<F, Fut>(station: WeatherStation, serve: F) -> std::net::SocketAddr
    where
        F: Fn(TcpStream, WeatherStation) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, station.clone()));
            }
        });
        addr
    }

    #[tokio::test]
    async fn ingest_replaces_latest_readout() {
        let station = WeatherStation::new();
        let addr = listen(station.clone(), serve_ingest).await;

        let mut sensor = TcpStream::connect(addr).await.unwrap();
        sensor.write_all(b"-3.0-5;1013.2;87\n").await.unwrap();
        sensor.shutdown().await.unwrap();

        for _ in 0..100 {
            if station.latest().ts != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let latest = station.latest();
        assert_eq!(
            (latest.t, latest.p, latest.h),
            (Some(-3.05), Some(1013.2), Some(87.0))
        );
    }

    #[tokio::test]
    async fn feed_sends_current_then_updates() {
        let station = WeatherStation::new();
        let addr = listen(station.clone(), serve_feed).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first, r#"{"t":null,"p":null,"h":null,"ts":0}"#);

        station.publish(Readout {
            t: Some(20.5),
            p: Some(1000.0),
            h: Some(40.0),
            ts: 1,
        });
        let next: Readout = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(next.t, Some(20.5));
    }
}
