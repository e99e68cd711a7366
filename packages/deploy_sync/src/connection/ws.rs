//! WebSocket [`Connector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use super::{Connector, Link};
use crate::error::{ConnectError, SyncError};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Connects to `{base}/ws?session_id={id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base: String,
}

impl WsConnector {
    /// `base_url` is the backend's HTTP origin; `http` and `https` map to
    /// `ws` and `wss`.
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(SyncError::Config(format!(
                "backend URL must start with http(s):// or ws(s)://: {}",
                base_url
            )));
        };
        Ok(Self { ws_base })
    }

    pub fn url_for(&self, session_id: &str) -> String {
        format!("{}/ws?session_id={}", self.ws_base, session_id)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, session_id: &str) -> Result<Link, ConnectError> {
        let url = self.url_for(session_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(ConnectError::from_tungstenite)?;
        debug!(%url, "websocket open");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

        // Writer: drain outbound channel into the socket. Ends when the
        // manager drops its sender.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    warn!("websocket write error: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: forward text frames. Ends on close, error, or when the
        // manager drops its receiver.
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(tungstenite::Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("websocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
