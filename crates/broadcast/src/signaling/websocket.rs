//! WebSocket relay client for the JSON-RPC 2.0 reference relay

use super::protocol::*;
use super::relay::{Envelope, Relay, RelayFrame, RelayLink};
use crate::config::BroadcastConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Relay reached over a WebSocket URL
#[derive(Debug, Clone)]
pub struct WsRelay {
    url: String,
}

impl WsRelay {
    /// Create a relay client for `url` (ws:// or wss://)
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    /// Relay client for `config.relay_url`
    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self::new(&config.relay_url)
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send `peer.announce` and wait for the relay's verdict
    async fn announce(
        write: &mut futures::stream::SplitSink<WsStream, Message>,
        read: &mut futures::stream::SplitStream<WsStream>,
        peer_id: &str,
    ) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = JsonRpcRequest::new(
            methods::ANNOUNCE,
            json!(AnnounceParams {
                peer_id: peer_id.to_string()
            }),
            Some(json!(request_id)),
        );

        write
            .send(Message::Text(request.to_json()?))
            .await
            .map_err(|e| Error::RelayUnreachable(format!("Failed to announce: {}", e)))?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match JsonRpcFrame::from_json(&text) {
                    Ok(JsonRpcFrame::Response(response)) if response.id == json!(request_id) => {
                        return Ok(());
                    }
                    Ok(JsonRpcFrame::Error(err)) if err.error.code == error_codes::IDENTITY_TAKEN => {
                        return Err(Error::IdentityAlreadyRegistered(peer_id.to_string()));
                    }
                    Ok(JsonRpcFrame::Error(err)) => {
                        return Err(Error::RelayUnreachable(format!(
                            "Relay refused announce ({}): {}",
                            err.error.code, err.error.message
                        )));
                    }
                    Ok(other) => debug!("Ignoring frame before announce reply: {:?}", other),
                    Err(e) => warn!("Unparseable frame before announce reply: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    return Err(Error::RelayUnreachable(format!("WebSocket error: {}", e)));
                }
                _ => {}
            }
        }

        Err(Error::RelayUnreachable(
            "relay closed the connection during announce".to_string(),
        ))
    }

    /// Sender task: forwards envelopes as `peer.signal` notifications
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        while let Some(envelope) = rx.recv().await {
            let notification = JsonRpcRequest::notification(
                methods::SIGNAL,
                json!(OutboundSignalParams {
                    to: envelope.to,
                    payload: envelope.message,
                }),
            );

            let text = match notification.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode signal: {}", e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Relay sender task terminated");
    }

    /// Receiver task: decodes relay notifications into frames
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<RelayFrame>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    let frame = Self::decode_frame(&text).unwrap_or_else(|e| RelayFrame::Malformed {
                        detail: e.to_string(),
                    });
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Relay closed the WebSocket connection");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Relay receiver task terminated");
    }

    fn decode_frame(text: &str) -> Result<RelayFrame> {
        let request = JsonRpcRequest::from_json(text)?;
        match request.method.as_str() {
            methods::SIGNAL => {
                let params: InboundSignalParams = request.params_as()?;
                Ok(RelayFrame::Message {
                    from: params.from,
                    message: params.payload,
                })
            }
            methods::LEFT => {
                let params: LeftParams = request.params_as()?;
                Ok(RelayFrame::PeerGone {
                    peer: params.peer_id,
                })
            }
            methods::UNDELIVERABLE => {
                let params: UndeliverableParams = request.params_as()?;
                Ok(RelayFrame::Undeliverable { to: params.to })
            }
            other => Err(Error::ProtocolViolation(format!(
                "Unknown relay method: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn register(&self, peer_id: &str) -> Result<RelayLink> {
        info!("Connecting to relay {} as {}", self.url, peer_id);

        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| Error::RelayUnreachable(format!("Failed to connect: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        Self::announce(&mut write, &mut read, peer_id).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, outbound_rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &str {
        "websocket"
    }
}
