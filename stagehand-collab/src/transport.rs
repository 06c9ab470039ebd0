//! Byte-frame transport under the collaboration session.
//!
//! A [`Connection`] is a pair of channels: frames pushed into `outgoing`
//! are written to the wire, frames read from the wire arrive on `incoming`.
//! `incoming` yielding `None` means the transport is gone.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use stagehand_core::DocumentId;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::session::ChannelConfig;

pub struct Connection {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

/// Opens connections for a document.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        document_id: DocumentId,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send;
}

/// Connects to `{server_url}/{document_id}` over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    server_url: String,
    buffer: usize,
}

impl WebSocketConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            buffer: 256,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.server_url.clone()).with_buffer(config.channel_buffer)
    }

    /// Frames buffered in each direction.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn url_for(&self, document_id: DocumentId) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), document_id)
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        document_id: DocumentId,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send {
        let url = self.url_for(document_id);
        let buffer = self.buffer;
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Refused {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            log::debug!("WebSocket connected to {url}");

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(buffer);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(buffer);

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward binary frames until the socket closes
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.into()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::debug!("WebSocket to {url} closed");
            });

            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_url_for_document() {
        let doc = Uuid::new_v4();
        let connector = WebSocketConnector::new("ws://localhost:9090/");
        assert_eq!(connector.url_for(doc), format!("ws://localhost:9090/{doc}"));
        assert_eq!(connector.server_url(), "ws://localhost:9090/");
    }

    #[test]
    fn test_from_config() {
        let config = ChannelConfig {
            server_url: "ws://relay.local".into(),
            channel_buffer: 0,
            ..ChannelConfig::default()
        };
        let connector = WebSocketConnector::from_config(&config);
        assert_eq!(connector.server_url(), "ws://relay.local");
        assert_eq!(connector.buffer, 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://127.0.0.1:{port}"));
        let result = connector.connect(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TransportError::Refused { .. })));
    }
}
