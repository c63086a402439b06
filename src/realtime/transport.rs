//! Full-duplex transport under the real-time client

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Something that happened on the inbound side of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    /// Closed by the peer
    Closed,
    Error(String),
}

/// Parameters of one connection attempt
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub token: String,
    pub client_type: String,
    pub client_id: String,
}

/// An open connection. Dropping `outgoing` closes it.
pub struct ChannelConnection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the channel endpoint
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<ChannelConnection>;
}

#[cfg(feature = "websocket")]
pub use ws::WsConnector;

#[cfg(feature = "websocket")]
mod ws {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    use super::{ChannelConnection, ChannelConnector, ConnectRequest, TransportEvent};
    use crate::error::{Result, SyncError};

    const CHANNEL_CAPACITY: usize = 256;

    /// WebSocket connector over tokio-tungstenite
    pub struct WsConnector {
        timeout: Duration,
    }

    impl WsConnector {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    fn header(value: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(value)
            .map_err(|e| SyncError::Config(format!("invalid header value: {}", e)))
    }

    #[async_trait]
    impl ChannelConnector for WsConnector {
        async fn connect(&self, request: &ConnectRequest) -> Result<ChannelConnection> {
            let mut http_request = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| SyncError::Config(format!("invalid channel url: {}", e)))?;
            let headers = http_request.headers_mut();
            headers.insert("Authorization", header(&format!("Bearer {}", request.token))?);
            headers.insert("X-Client-Type", header(&request.client_type)?);
            headers.insert("X-Client-ID", header(&request.client_id)?);

            let (stream, _) = tokio::time::timeout(self.timeout, connect_async(http_request))
                .await
                .map_err(|_| SyncError::Network("channel connect timed out".to_string()))?
                .map_err(|e| SyncError::Network(format!("channel connect failed: {}", e)))?;

            tracing::debug!(url = %request.url, "Channel transport open");

            let (mut sink, mut source) = stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

            let write_errors = in_tx.clone();
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        let _ = write_errors.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let event = match frame {
                        Ok(Message::Text(text)) => TransportEvent::Text(text),
                        Ok(Message::Binary(bytes)) => TransportEvent::Binary(bytes),
                        Ok(Message::Close(_)) => TransportEvent::Closed,
                        Ok(_) => continue,
                        Err(e) => TransportEvent::Error(e.to_string()),
                    };
                    let terminal = matches!(event, TransportEvent::Closed | TransportEvent::Error(_));
                    if in_tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
                let _ = in_tx.send(TransportEvent::Closed).await;
            });

            Ok(ChannelConnection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}
