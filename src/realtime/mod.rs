//! Real-time push channel
//!
//! A [`RealtimeClient`] keeps one authenticated connection open, answers the
//! server with a handshake, sends heartbeats and reconnects with backoff.
//! Inbound frames are decoded into [`ChannelMessage`]s and fanned out to
//! per-type listeners; an [`EventProcessor`] writes data messages into the
//! local store.

mod client;
mod events;
mod message;
mod processor;
mod transport;

pub use client::{ConnectionState, ListenerId, MessageListener, RealtimeClient};
pub use events::{
    AnalysisUpdate, ChannelEvent, Handshake, InsightNotification, InsightUpdateRequest,
    MetricUpdate, MetricsRequest, NotificationAction, Ping, ServerError, SyncStatusUpdate,
    SystemNotification, SystemNotificationKind,
};
pub use message::{ChannelMessage, MessageCategory, MessageType};
pub use processor::{EventProcessor, PROCESSED_TYPES};
#[cfg(feature = "websocket")]
pub use transport::WsConnector;
pub use transport::{ChannelConnection, ChannelConnector, ConnectRequest, TransportEvent};
