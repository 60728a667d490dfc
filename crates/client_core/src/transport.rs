use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::SyncSettings,
    types::{ConnectionState, LiveEvent},
};

const EVENT_BUFFER: usize = 1024;

/// Process-wide event stream shared by every open conversation. Delivery is
/// at least once and may be reordered relative to REST responses.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LiveEvent>;
    fn connection(&self) -> watch::Receiver<ConnectionState>;
    async fn emit(&self, request: ClientRequest) -> Result<()>;
}

/// A channel that never connects; the session falls back to polling.
pub struct OfflineLiveChannel {
    events: broadcast::Sender<LiveEvent>,
    state: watch::Sender<ConnectionState>,
}

impl OfflineLiveChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { events, state }
    }
}

impl Default for OfflineLiveChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveChannel for OfflineLiveChannel {
    fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn emit(&self, _request: ClientRequest) -> Result<()> {
        Err(anyhow!("live channel is offline"))
    }
}

struct WsShared {
    events: broadcast::Sender<LiveEvent>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// WebSocket event stream that reconnects forever with capped exponential
/// backoff. Connection state flips are published on a watch channel.
pub struct WsLiveChannel {
    shared: Arc<WsShared>,
    supervisor: JoinHandle<()>,
}

impl WsLiveChannel {
    pub fn ws_url(server_url: &str, user_id: UserId) -> Result<Url> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&ws_url).with_context(|| format!("invalid server url: {ws_url}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry a path: {ws_url}"))?
            .pop_if_empty()
            .push("ws");
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.0.to_string());
        Ok(url)
    }

    /// Starts the connection supervisor. Returns immediately; watch
    /// [`LiveChannel::connection`] to learn when the socket is up.
    pub fn connect(settings: &SyncSettings, user_id: UserId) -> Result<Self> {
        let url = Self::ws_url(&settings.server_url, user_id)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(WsShared {
            events,
            state,
            outbound: Mutex::new(None),
        });
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            url,
            settings.reconnect_initial_delay,
            settings.reconnect_max_delay,
        ));
        Ok(Self { shared, supervisor })
    }

    pub async fn shutdown(&self) {
        self.supervisor.abort();
        *self.shared.outbound.lock().await = None;
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for WsLiveChannel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl LiveChannel for WsLiveChannel {
    fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.shared.events.subscribe()
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn emit(&self, request: ClientRequest) -> Result<()> {
        let frame = serde_json::to_string(&request)?;
        let guard = self.shared.outbound.lock().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("live channel is disconnected"))?;
        sender
            .send(frame)
            .map_err(|_| anyhow!("live channel closed while sending"))
    }
}

async fn supervise(shared: Arc<WsShared>, url: Url, initial_delay: Duration, max_delay: Duration) {
    let mut delay = initial_delay;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %url, "live: connected");
                delay = initial_delay;
                run_connection(&shared, stream).await;
                info!(url = %url, "live: disconnected");
            }
            Err(err) => {
                warn!(
                    url = %url,
                    retry_in_ms = delay.as_millis() as u64,
                    "live: connect failed: {err}"
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

async fn run_connection(shared: &WsShared, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut writer, mut reader) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *shared.outbound.lock().await = Some(tx);
    shared.state.send_replace(ConnectionState::Connected);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = writer.send(WsMessage::Text(frame)).await {
                    warn!("live: send failed: {err}");
                    break;
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => dispatch(shared, &text),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("live: receive failed: {err}");
                    break;
                }
            }
        }
    }

    *shared.outbound.lock().await = None;
    shared.state.send_replace(ConnectionState::Disconnected);
}

fn dispatch(shared: &WsShared, text: &str) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            warn!("live: invalid server event: {err}");
            return;
        }
    };
    match LiveEvent::try_from(event) {
        Ok(event) => {
            debug!(kind = event.kind(), "live: event received");
            let _ = shared.events.send(event);
        }
        Err(err) => debug!("live: dropping event: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
