//! Gateway command server: one `<id>;<payload>` request per connection.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

use hub_common::{
    gateway::{map_reply, route, GatewayRequest, Route, DEV_NOT_FOUND},
    HubError,
};

use crate::registry::Registry;

const MAX_REQUEST_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct CommandTiming {
    pub read_timeout: Duration,
    pub reply_timeout: Duration,
}

pub async fn serve_command(
    mut stream: TcpStream,
    registry: Registry,
    timing: CommandTiming,
) -> anyhow::Result<()> {
    let request = match tokio::time::timeout(timing.read_timeout, read_request(&mut stream)).await
    {
        Ok(request) => request?,
        Err(_) => {
            debug!("command client sent nothing, closing");
            return Ok(());
        }
    };
    let Some(request) = request else {
        return Ok(());
    };

    let reply = handle_request(&registry, &request, timing.reply_timeout).await;
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Clients write a single request, usually without a trailing newline, and
/// wait for the reply. The first chunk read is taken as the whole request.
async fn read_request<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let read = reader.read(&mut buf).await?;
    if read == 0 {
        return Ok(None);
    }

    let raw = String::from_utf8_lossy(&buf[..read]);
    let line = raw.split('\n').next().unwrap_or_default();
    Ok(Some(line.trim().to_string()))
}

pub async fn handle_request(registry: &Registry, line: &str, reply_timeout: Duration) -> String {
    let request = GatewayRequest::parse(line);
    let adapter = match registry.lookup(&request.id).await {
        Ok(adapter) => adapter,
        Err(err) => {
            debug!("rejecting command: {err}");
            return DEV_NOT_FOUND.to_string();
        }
    };

    let payload = match route(&adapter.device_type, &request.payload) {
        Route::Forward(payload) => payload,
        Route::Reply(reply) => return reply.to_string(),
    };

    let reply = match tokio::time::timeout(reply_timeout, adapter.send(payload)).await {
        Ok(reply) => reply,
        Err(_) => Err(HubError::Timeout(
            reply_timeout.as_millis().try_into().unwrap_or(u64::MAX),
        )),
    };
    if let Err(err) = &reply {
        warn!(id = %request.id, "adapter request failed: {err}");
    }

    map_reply(&adapter.device_type, reply.as_deref())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    use super::*;
    use crate::registry::{serve_adapter, LinkTiming};

    const LINK: LinkTiming = LinkTiming {
        ping_interval: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(10),
    };

    async fn registry_with_adapter(
        handshake: &str,
    ) -> (
        Registry,
        tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();
        let accept_registry = registry.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_adapter(stream, accept_registry, LINK).await;
        });

        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();
        writer
            .write_all(format!("{handshake}\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING");
        writer.write_all(b"PONG\n").await.unwrap();
        (registry, lines, writer)
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (registry, mut lines, _writer) = registry_with_adapter("TEMP;probe").await;

        let reply = handle_request(&registry, "nope;READ", Duration::from_secs(1)).await;

        assert_eq!(reply, DEV_NOT_FOUND);
        let forwarded = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await;
        assert!(forwarded.is_err());
    }

    #[tokio::test]
    async fn transmitter_payload_is_prefixed() {
        let (registry, mut lines, mut writer) = registry_with_adapter("433TX;tx").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let call = tokio::spawn({
            let registry = registry.clone();
            async move { handle_request(&registry, "tx;10101", Duration::from_secs(1)).await }
        });
        assert_eq!(lines.next_line().await.unwrap().unwrap(), ">10101");
        writer.write_all(b"BUSY\n").await.unwrap();

        assert_eq!(call.await.unwrap(), "ERROR");
    }

    #[tokio::test]
    async fn temperature_reply_passes_through() {
        let (registry, mut lines, mut writer) = registry_with_adapter("TEMP;probe").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let call = tokio::spawn({
            let registry = registry.clone();
            async move { handle_request(&registry, "probe;READ", Duration::from_secs(1)).await }
        });
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "READ");
        writer.write_all(b"21.44\n").await.unwrap();

        assert_eq!(call.await.unwrap(), "21.44");
    }

    #[tokio::test]
    async fn silent_adapter_times_out_with_error() {
        let (registry, _lines, _writer) = registry_with_adapter("TEMP;probe").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = handle_request(&registry, "probe;READ", Duration::from_millis(100)).await;

        assert_eq!(reply, "ERROR");
    }

    #[tokio::test]
    async fn serves_one_request_per_connection() {
        let (registry, mut lines, mut writer) = registry_with_adapter("TEMP;probe").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timing = CommandTiming {
            read_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
        };
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_command(stream, registry, timing).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"probe;READ").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "READ");
        writer.write_all(b"19.5\n").await.unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "19.5");
    }
}
