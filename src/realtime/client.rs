//! Reconnecting real-time channel client

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::events::{Handshake, InsightUpdateRequest, MetricsRequest, Ping};
use super::message::{ChannelMessage, MessageType};
use super::transport::{ChannelConnection, ChannelConnector, ConnectRequest, TransportEvent};
use crate::auth::AuthProvider;
use crate::error::{Result, SyncError};
use crate::retry::{Backoff, BackoffState};
use crate::types::RealtimeConfig;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Handle returned by [`RealtimeClient::subscribe`]
pub type ListenerId = u64;

pub type MessageListener = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Live connection. Everything spawned for it stops when it closes.
struct Link {
    epoch: u64,
    outgoing: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn close(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
    connector: Arc<dyn ChannelConnector>,
    state: watch::Sender<ConnectionState>,
    /// Bumped whenever a connection attempt starts or a link is torn down;
    /// work from an older epoch is discarded
    epoch: AtomicU64,
    link: Mutex<Option<Link>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<BackoffState>,
    listeners: RwLock<HashMap<MessageType, Vec<(ListenerId, MessageListener)>>>,
    next_listener: AtomicU64,
    history: Mutex<VecDeque<ChannelMessage>>,
    events: broadcast::Sender<ChannelMessage>,
    last_error: RwLock<Option<String>>,
    last_inbound: Mutex<Instant>,
}

/// Client side of the push channel
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    pub fn new(
        config: RealtimeConfig,
        auth: Arc<dyn AuthProvider>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let backoff = Backoff::from_millis(config.reconnect_base_ms, config.reconnect_max_ms);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.history_size.max(16));

        Self {
            inner: Arc::new(Inner {
                config,
                auth,
                connector,
                state,
                epoch: AtomicU64::new(0),
                link: Mutex::new(None),
                reconnect: Mutex::new(None),
                backoff: Mutex::new(BackoffState::new(backoff)),
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                history: Mutex::new(VecDeque::new()),
                events,
                last_error: RwLock::new(None),
                last_inbound: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Whether a reconnect timer is armed
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .reconnect
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Every decoded inbound message
    pub fn events(&self) -> broadcast::Receiver<ChannelMessage> {
        self.inner.events.subscribe()
    }

    /// Most recent inbound messages, oldest first
    pub fn history(&self) -> Vec<ChannelMessage> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn subscribe<F>(&self, message_type: MessageType, listener: F) -> ListenerId
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .write()
            .entry(message_type)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(lid, _)| *lid != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Open the channel. Does nothing unless currently disconnected.
    pub async fn connect(&self) -> Result<()> {
        let began = self.inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Ok(());
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.last_error.write() = None;

        let token = match self.inner.auth.current_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(self.connect_failed(epoch, SyncError::AuthenticationRequired)),
            Err(e) => {
                tracing::warn!("Token unavailable for channel: {}", e);
                return Err(self.connect_failed(epoch, SyncError::AuthenticationRequired));
            }
        };

        let request = ConnectRequest {
            url: self.inner.config.url.clone(),
            token,
            client_type: self.inner.config.client_type.clone(),
            client_id: self.inner.config.client_id.clone(),
        };
        let ChannelConnection { outgoing, incoming } =
            match self.inner.connector.connect(&request).await {
                Ok(connection) => connection,
                Err(e) => return Err(self.connect_failed(epoch, e)),
            };

        if !self.is_current(epoch) {
            return Err(SyncError::Cancelled);
        }

        *self.inner.last_inbound.lock() = Instant::now();
        let reader = tokio::spawn(read_loop(self.clone(), epoch, incoming));
        *self.inner.link.lock() = Some(Link {
            epoch,
            outgoing: outgoing.clone(),
            tasks: vec![reader],
        });

        let handshake = ChannelMessage::json(
            MessageType::Handshake,
            &Handshake {
                client_version: self.inner.config.client_version.clone(),
                platform: std::env::consts::OS.to_string(),
                device_id: self.inner.config.client_id.clone(),
            },
        )?;
        if outgoing.send(handshake.encode()?).await.is_err() {
            self.close_link();
            return Err(self.connect_failed(epoch, SyncError::Network("handshake not sent".into())));
        }

        let connected = self.is_current(epoch)
            && self.inner.state.send_if_modified(|s| {
                if *s == ConnectionState::Connecting {
                    *s = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
        if !connected {
            return Err(SyncError::NotConnected);
        }

        self.inner.backoff.lock().reset();
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), epoch));
        match self.inner.link.lock().as_mut() {
            Some(link) if link.epoch == epoch => link.tasks.push(heartbeat),
            _ => heartbeat.abort(),
        }

        tracing::info!(url = %self.inner.config.url, "Channel connected");
        Ok(())
    }

    /// Close the channel and cancel every timer
    pub fn disconnect(&self) {
        if let Some(timer) = self.inner.reconnect.lock().take() {
            timer.abort();
        }
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        self.inner.state.send_replace(ConnectionState::Disconnecting);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.close_link();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("Channel disconnected");
    }

    /// Connect on sign-in, disconnect on sign-out
    pub async fn handle_auth_change(&self, authenticated: bool) {
        if authenticated {
            if let Err(e) = self.connect().await {
                tracing::warn!("Channel connect after sign-in failed: {}", e);
            }
        } else {
            self.disconnect();
        }
    }

    /// Send a typed payload; fails with `NotConnected` unless connected
    pub async fn send<T: Serialize>(&self, message_type: MessageType, payload: &T) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let message = ChannelMessage::json(message_type, payload)?;
        self.send_message(&message).await
    }

    pub async fn send_message(&self, message: &ChannelMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let (epoch, outgoing) = match self.inner.link.lock().as_ref() {
            Some(link) => (link.epoch, link.outgoing.clone()),
            None => return Err(SyncError::NotConnected),
        };

        if outgoing.send(message.encode()?).await.is_err() {
            self.handle_transport_error(epoch, "write failed".to_string());
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }

    /// Ask the server for metric updates since `since`
    pub async fn request_metrics(&self, since: DateTime<Utc>, types: Vec<String>) -> Result<()> {
        self.send(MessageType::MetricsRequest, &MetricsRequest { since, types })
            .await
    }

    pub async fn request_insight_update(&self, insight_id: &str) -> Result<()> {
        self.send(
            MessageType::InsightUpdateRequest,
            &InsightUpdateRequest {
                insight_id: insight_id.to_string(),
            },
        )
        .await
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    fn close_link(&self) {
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
    }

    fn connect_failed(&self, epoch: u64, error: SyncError) -> SyncError {
        tracing::warn!("Channel connect failed: {}", error);
        *self.inner.last_error.write() = Some(error.to_string());
        if self.is_current(epoch) {
            self.inner.state.send_replace(ConnectionState::Disconnected);
            self.schedule_reconnect();
        }
        error
    }

    /// A live connection failed: tear it down and arm a reconnect
    fn handle_transport_error(&self, epoch: u64, reason: String) {
        if !self.is_current(epoch) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.close_link();
        tracing::warn!("Channel transport error: {}", reason);
        *self.inner.last_error.write() = Some(reason);

        let dropped = self.inner.state.send_if_modified(|s| {
            if matches!(s, ConnectionState::Connected | ConnectionState::Connecting) {
                *s = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if dropped {
            self.schedule_reconnect();
        }
    }

    /// Arm one reconnect timer; a timer already armed wins
    fn schedule_reconnect(&self) {
        let mut slot = self.inner.reconnect.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let delay = self.inner.backoff.lock().next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Channel reconnect scheduled");

        let client = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            client.inner.reconnect.lock().take();
            if let Err(e) = client.connect().await {
                tracing::debug!("Channel reconnect failed: {}", e);
            }
        }));
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        *self.inner.last_inbound.lock() = Instant::now();

        let message = match ChannelMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping channel frame: {}", e);
                return;
            }
        };
        tracing::trace!(id = %message.id, message_type = %message.message_type, "Channel message");

        {
            let mut history = self.inner.history.lock();
            history.push_back(message.clone());
            while history.len() > self.inner.config.history_size {
                history.pop_front();
            }
        }

        let listeners: Vec<MessageListener> = self
            .inner
            .listeners
            .read()
            .get(&message.message_type)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(&message);
        }

        let _ = self.inner.events.send(message);
    }
}

async fn read_loop(client: RealtimeClient, epoch: u64, mut incoming: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = incoming.recv().await {
        if !client.is_current(epoch) {
            return;
        }
        match event {
            TransportEvent::Text(text) => client.dispatch_frame(text.as_bytes()),
            TransportEvent::Binary(bytes) => client.dispatch_frame(&bytes),
            TransportEvent::Closed => {
                client.handle_transport_error(epoch, "connection closed by peer".to_string());
                return;
            }
            TransportEvent::Error(e) => {
                client.handle_transport_error(epoch, format!("connection lost: {}", e));
                return;
            }
        }
    }
    client.handle_transport_error(epoch, "transport ended".to_string());
}

async fn heartbeat_loop(client: RealtimeClient, epoch: u64) {
    let period = client.inner.config.heartbeat_interval();
    let pong_timeout = client.inner.config.pong_timeout_secs.map(Duration::from_secs);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !client.is_current(epoch) {
            return;
        }

        if let Some(timeout) = pong_timeout {
            let silent_for = client.inner.last_inbound.lock().elapsed();
            if silent_for > timeout {
                client.handle_transport_error(epoch, "no inbound traffic before pong timeout".into());
                return;
            }
        }

        let ping = Ping {
            timestamp: Utc::now(),
        };
        if let Err(e) = client.send(MessageType::Ping, &ping).await {
            tracing::debug!("Heartbeat stopped: {}", e);
            return;
        }
    }
}
