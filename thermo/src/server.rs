//! Thermostat command server: one JSON request per connection, one JSON reply,
//! then close.

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::debug;

use hub_common::protocol::{handle_line, Response};

use crate::host::AppState;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn serve_client(stream: TcpStream, app_state: AppState) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let line = match tokio::time::timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(line) => line?,
        Err(_) => {
            debug!("thermostat client sent nothing, closing");
            return Ok(());
        }
    };
    let Some(line) = line else {
        return Ok(());
    };

    let response: Response = app_state
        .with_fleet(|fleet, wall_clock, now_ms| handle_line(fleet, &line, wall_clock, now_ms))
        .await;
    debug!(request = %line.trim(), reply = ?response, "thermostat command");

    writer
        .write_all(format!("{}\n", response.to_line()).as_bytes())
        .await?;
    writer.shutdown().await?;
    Ok(())
}
