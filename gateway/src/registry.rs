//! Persistent adapter links.
//!
//! Each adapter connection is served by one task that owns the socket and its
//! [`SendQueue`]. Other tasks reach it through an [`AdapterHandle`], which
//! hands payloads over an mpsc channel and waits on a oneshot for the reply.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use hub_common::{
    gateway::{DeviceType, Handshake, PING, PONG},
    pipeline::SendQueue,
    HubError,
};

type ReplySender = oneshot::Sender<Result<String, HubError>>;

/// Who is waiting for the reply to a queued line.
enum Sink {
    Handshake,
    Ping,
    Client(ReplySender),
}

struct Outbound {
    payload: String,
    reply: ReplySender,
}

#[derive(Clone)]
pub struct AdapterHandle {
    pub device_type: DeviceType,
    pub connected_at_epoch: i64,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl AdapterHandle {
    /// Queues `payload` on the adapter link and waits for its reply.
    pub async fn send(&self, payload: String) -> Result<String, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outbound { payload, reply })
            .map_err(|_| HubError::Disconnected)?;
        rx.await.unwrap_or(Err(HubError::Disconnected))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "connectedAtEpoch")]
    pub connected_at_epoch: i64,
}

#[derive(Clone, Default)]
pub struct Registry {
    adapters: Arc<Mutex<HashMap<String, AdapterHandle>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<AdapterHandle> {
        self.adapters.lock().await.get(id).cloned()
    }

    pub async fn lookup(&self, id: &str) -> Result<AdapterHandle, HubError> {
        self.get(id)
            .await
            .ok_or_else(|| HubError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<AdapterSummary> {
        let adapters = self.adapters.lock().await;
        let mut summaries: Vec<AdapterSummary> = adapters
            .iter()
            .map(|(id, handle)| AdapterSummary {
                id: id.clone(),
                device_type: handle.device_type.to_string(),
                connected_at_epoch: handle.connected_at_epoch,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, id: String, handle: AdapterHandle) {
        if let Some(previous) = self.adapters.lock().await.insert(id.clone(), handle) {
            info!(
                id = %id,
                previous_conn = previous.conn_id,
                "adapter re-registered, replacing older link"
            );
        }
    }

    /// Removes `id` only while it still belongs to connection `conn_id`.
    async fn unregister(&self, id: &str, conn_id: u64) {
        let mut adapters = self.adapters.lock().await;
        if adapters
            .get(id)
            .is_some_and(|handle| handle.conn_id == conn_id)
        {
            adapters.remove(id);
            info!(id, "adapter unregistered");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

struct AdapterLink {
    registry: Registry,
    timing: LinkTiming,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    queue: SendQueue<Sink>,
    registered: Option<String>,
    next_ping: Option<Instant>,
}

/// Serves one adapter connection until it closes, goes idle or fails.
pub async fn serve_adapter(stream: TcpStream, registry: Registry, timing: LinkTiming) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut link = AdapterLink {
        conn_id: registry.next_conn_id(),
        registry,
        timing,
        tx,
        queue: SendQueue::new(),
        registered: None,
        next_ping: None,
    };
    debug!(%peer, conn = link.conn_id, "adapter connected");

    // The handshake is the adapter's unprompted first line; keepalive starts
    // right behind it.
    link.queue.push(None, Sink::Handshake);
    link.queue.push(Some(PING.to_string()), Sink::Ping);

    let mut idle_deadline = Instant::now() + link.timing.idle_timeout;
    loop {
        let ping_at = link.next_ping;
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%peer, "adapter read failed: {err}");
                        break;
                    }
                };
                idle_deadline = Instant::now() + link.timing.idle_timeout;
                match link.on_line(line.trim(), &mut writer).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!(%peer, "adapter write failed: {err:#}");
                        break;
                    }
                }
            }
            Some(outbound) = rx.recv() => {
                let next = link.queue.push(Some(outbound.payload), Sink::Client(outbound.reply));
                if let Err(err) = write_next(&mut writer, next).await {
                    warn!(%peer, "adapter write failed: {err:#}");
                    break;
                }
            }
            _ = sleep_until(ping_at.unwrap_or(idle_deadline)), if ping_at.is_some() => {
                link.next_ping = None;
                let next = link.queue.push(Some(PING.to_string()), Sink::Ping);
                if let Err(err) = write_next(&mut writer, next).await {
                    warn!(%peer, "adapter write failed: {err:#}");
                    break;
                }
            }
            _ = sleep_until(idle_deadline) => {
                info!(%peer, "adapter idle, closing link");
                break;
            }
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        link.queue.push(None, Sink::Client(outbound.reply));
    }
    link.close().await;
}

impl AdapterLink {
    /// Handles one inbound line. Returns `false` when the link must close.
    async fn on_line<W>(&mut self, line: &str, writer: &mut W) -> anyhow::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let Some((sink, next)) = self.queue.complete() else {
            debug!(conn = self.conn_id, line, "ignoring unsolicited adapter line");
            return Ok(true);
        };

        match sink {
            Sink::Handshake => match Handshake::parse(line) {
                Ok(handshake) => self.register(handshake).await,
                Err(err) => {
                    warn!(conn = self.conn_id, "rejecting adapter: {err}");
                    return Ok(false);
                }
            },
            Sink::Ping if line == PONG => {
                self.next_ping = Some(Instant::now() + self.timing.ping_interval);
            }
            Sink::Ping => {
                debug!(conn = self.conn_id, line, "keepalive answered without PONG, stopping pings");
            }
            Sink::Client(reply) => {
                // The caller may have given up already.
                let _ = reply.send(Ok(line.to_string()));
            }
        }

        write_next(writer, next).await?;
        Ok(true)
    }

    async fn register(&mut self, handshake: Handshake) {
        info!(
            id = %handshake.id,
            device_type = %handshake.device_type,
            "adapter registered"
        );
        let handle = AdapterHandle {
            device_type: handshake.device_type,
            connected_at_epoch: Utc::now().timestamp(),
            conn_id: self.conn_id,
            tx: self.tx.clone(),
        };
        self.registry.register(handshake.id.clone(), handle).await;
        self.registered = Some(handshake.id);
    }

    async fn close(mut self) {
        if let Some(id) = self.registered.take() {
            self.registry.unregister(&id, self.conn_id).await;
        }
        for sink in self.queue.drain() {
            if let Sink::Client(reply) = sink {
                let _ = reply.send(Err(HubError::Disconnected));
            }
        }
        debug!(conn = self.conn_id, "adapter link closed");
    }
}

async fn write_next<W>(writer: &mut W, payload: Option<String>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(payload) = payload {
        writer.write_all(format!("{payload}\n").as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    const TIMING: LinkTiming = LinkTiming {
        ping_interval: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(10),
    };

    const FAST: LinkTiming = LinkTiming {
        ping_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(200),
    };

    async fn start_registry() -> (Registry, std::net::SocketAddr) {
        start_registry_with(TIMING).await
    }

    async fn start_registry_with(timing: LinkTiming) -> (Registry, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();
        let accept_registry = registry.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_adapter(stream, accept_registry.clone(), timing));
            }
        });
        (registry, addr)
    }

    struct FakeAdapter {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl FakeAdapter {
        async fn connect(addr: std::net::SocketAddr, handshake: &str) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut adapter = Self {
                lines: BufReader::new(reader).lines(),
                writer,
            };
            adapter.say(handshake).await;
            assert_eq!(adapter.next().await, "PING");
            adapter.say("PONG").await;
            adapter
        }

        async fn next_within(&mut self, wait: Duration) -> Option<String> {
            tokio::time::timeout(wait, self.lines.next_line())
                .await
                .ok()
                .map(|line| line.unwrap().unwrap_or_default())
        }

        async fn say(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn next(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }
    }

    async fn wait_for(registry: &Registry, id: &str) -> AdapterHandle {
        for _ in 0..100 {
            if let Some(handle) = registry.get(id).await {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("adapter {id} never registered");
    }

    #[tokio::test]
    async fn handshake_registers_adapter() {
        let (registry, addr) = start_registry().await;
        let _adapter = FakeAdapter::connect(addr, "433TX;abc").await;

        let handle = wait_for(&registry, "abc").await;

        assert_eq!(handle.device_type, DeviceType::Tx433);
        let listed: Vec<String> = registry.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(listed, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn sends_are_pipelined_one_at_a_time() {
        let (registry, addr) = start_registry().await;
        let mut adapter = FakeAdapter::connect(addr, "TEMP;probe").await;
        let handle = wait_for(&registry, "probe").await;

        let mut calls = Vec::new();
        for payload in ["P1", "P2", "P3"] {
            let handle = handle.clone();
            calls.push(tokio::spawn(async move {
                handle.send(payload.to_string()).await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(adapter.next().await, "P1");
        // Nothing else may be written before the first reply.
        let early = tokio::time::timeout(Duration::from_millis(100), adapter.next()).await;
        assert!(early.is_err());

        adapter.say("reply1").await;
        assert_eq!(adapter.next().await, "P2");
        adapter.say("reply2").await;
        assert_eq!(adapter.next().await, "P3");
        adapter.say("reply3").await;

        let mut replies = Vec::new();
        for call in calls {
            replies.push(call.await.unwrap());
        }
        assert_eq!(
            replies,
            vec![
                Ok("reply1".to_string()),
                Ok("reply2".to_string()),
                Ok("reply3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn close_fails_queued_callers_and_unregisters() {
        let (registry, addr) = start_registry().await;
        let mut adapter = FakeAdapter::connect(addr, "TEMP;probe").await;
        let handle = wait_for(&registry, "probe").await;

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send("READ".to_string()).await }
        });
        assert_eq!(adapter.next().await, "READ");
        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send("READ".to_string()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(adapter);

        assert_eq!(first.await.unwrap(), Err(HubError::Disconnected));
        assert_eq!(second.await.unwrap(), Err(HubError::Disconnected));
        for _ in 0..100 {
            if registry.get("probe").await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("adapter was never unregistered");
    }

    #[tokio::test]
    async fn malformed_handshake_drops_connection() {
        let (registry, addr) = start_registry().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"garbage\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap(), None);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn stale_connection_close_keeps_newer_registration() {
        let (registry, addr) = start_registry().await;
        let old = FakeAdapter::connect(addr, "TEMP;probe").await;
        let old_conn = wait_for(&registry, "probe").await.conn_id;

        let _new = FakeAdapter::connect(addr, "TEMP;probe").await;
        let mut new_conn = old_conn;
        for _ in 0..100 {
            new_conn = wait_for(&registry, "probe").await.conn_id;
            if new_conn != old_conn {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(new_conn, old_conn);

        drop(old);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            registry.get("probe").await.map(|handle| handle.conn_id),
            Some(new_conn)
        );
    }

    #[tokio::test]
    async fn ping_follows_each_pong_after_one_interval() {
        let timing = LinkTiming {
            ping_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(5),
        };
        let (_registry, addr) = start_registry_with(timing).await;
        let mut adapter = FakeAdapter::connect(addr, "TEMP;probe").await;

        for _ in 0..2 {
            let answered = Instant::now();
            assert_eq!(adapter.next().await, "PING");
            assert!(answered.elapsed() >= Duration::from_millis(40));
            adapter.say("PONG").await;
        }
    }

    #[tokio::test]
    async fn wrong_keepalive_answer_stops_pings() {
        let timing = LinkTiming {
            ping_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(5),
        };
        let (registry, addr) = start_registry_with(timing).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut adapter = FakeAdapter {
            lines: BufReader::new(reader).lines(),
            writer,
        };

        adapter.say("TEMP;probe").await;
        assert_eq!(adapter.next().await, "PING");
        adapter.say("HELLO").await;

        assert_eq!(adapter.next_within(Duration::from_millis(300)).await, None);
        assert!(registry.get("probe").await.is_some());
    }

    #[tokio::test]
    async fn idle_link_closes_and_fails_queued_callers() {
        let (registry, addr) = start_registry_with(FAST).await;
        let mut adapter = FakeAdapter::connect(addr, "TEMP;probe").await;
        let handle = wait_for(&registry, "probe").await;

        // Leave the next keepalive unanswered so the request waits behind it.
        assert_eq!(adapter.next().await, "PING");
        let call = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send("READ".to_string()).await }
        });

        assert_eq!(call.await.unwrap(), Err(HubError::Disconnected));
        assert_eq!(adapter.lines.next_line().await.unwrap(), None);
        assert!(registry.get("probe").await.is_none());
    }
}
