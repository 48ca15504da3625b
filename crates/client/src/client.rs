//! WebSocket connector for job and batch streaming channels.
//!
//! [`StreamClient`] holds the streaming base URL. Call
//! [`StreamClient::connect`] to open one [`WsStream`] addressed by a
//! job or batch id.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream for one channel.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What a streaming channel is addressed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Job,
    Batch,
}

impl ChannelKind {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Job => "jobs",
            Self::Batch => "batches",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job => f.write_str("job"),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// Connection configuration for the streaming endpoint.
#[derive(Debug, Clone)]
pub struct StreamClient {
    ws_url: String,
}

impl StreamClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8000`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// WebSocket base URL.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full URL of the channel for `channel_id`.
    ///
    /// Jobs live under `/ws/jobs/{id}`, batches under `/ws/batches/{id}`.
    pub fn channel_url(&self, channel_id: &str, kind: ChannelKind) -> String {
        format!("{}/ws/{}/{}", self.ws_url, kind.path_segment(), channel_id)
    }

    /// Open the streaming connection for one job or batch.
    pub async fn connect(
        &self,
        channel_id: &str,
        kind: ChannelKind,
    ) -> Result<WsStream, StreamClientError> {
        let url = self.channel_url(channel_id, kind);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            StreamClientError::Connection(format!("Failed to connect to {url}: {e}"))
        })?;

        tracing::debug!(channel_id, %kind, url = %url, "Streaming channel connected");
        Ok(ws_stream)
    }
}

/// Errors that can occur when opening a streaming channel.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
