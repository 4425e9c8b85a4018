//! WebSocket relay server speaking the JSON-RPC 2.0 relay protocol
//!
//! Each accepted connection may announce one identity. Signals are routed
//! through a shared `RelayHub`; on disconnect the identity is released and
//! every peer it exchanged signals with receives `peer.left`.

use super::protocol::*;
use super::relay::{Envelope, HubRegistration, RelayFrame, RelayHub};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// Reference relay server
#[derive(Clone, Default)]
pub struct RelayServer {
    hub: Arc<RelayHub>,
}

/// Handle to a running relay server. Dropping it stops the server.
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Create a server with an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server routing through an existing hub
    pub fn with_hub(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    /// Routing hub
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Bind `addr` and start accepting connections in the background
    pub async fn bind(self, addr: SocketAddr) -> Result<RelayServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay server listening on ws://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, self.hub, shutdown_rx));

        Ok(RelayServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

impl RelayServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should use
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(self) {
        info!("Shutting down relay server");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Relay accept loop ended abnormally: {}", e);
        }
        info!("Relay server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: Arc<RelayHub>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted relay connection from {}", addr);
                    let hub = Arc::clone(&hub);
                    let shutdown = shutdown_rx.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, hub, shutdown).await {
                            debug!("Relay connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    while connections.join_next().await.is_some() {}
}

/// Serve one WebSocket connection until it closes or the server shuts down
async fn handle_connection(
    stream: TcpStream,
    hub: Arc<RelayHub>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Replies and routed frames share one writer.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<RelayFrame>();
    let frame_out = out_tx.clone();
    let frame_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match encode_frame(frame) {
                Ok(Some(text)) => {
                    if frame_out.send(Message::Text(text)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to encode relay frame: {}", e),
            }
        }
    });

    let mut registration: Option<HubRegistration> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_request(&text, &hub, &mut registration, &frame_tx);
                    if let Some(reply) = reply {
                        let _ = out_tx.send(Message::Text(reply));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = out_tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Relay connection closed by client: {}", addr);
                    break;
                }
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", addr, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    if let Some(registration) = registration.take() {
        info!("Relay peer {} disconnected", registration.peer_id());
        hub.unregister(&registration);
    }

    drop(frame_tx);
    frame_task.abort();
    drop(out_tx);
    let _ = forward_task.await;

    Ok(())
}

/// Process one JSON-RPC request, returning the reply to send (if any)
fn handle_request(
    text: &str,
    hub: &RelayHub,
    registration: &mut Option<HubRegistration>,
    frame_tx: &mpsc::UnboundedSender<RelayFrame>,
) -> Option<String> {
    let request = match JsonRpcRequest::from_json(text) {
        Ok(request) => request,
        Err(e) => {
            return error_reply(error_codes::PARSE_ERROR, e.to_string(), Value::Null);
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        methods::ANNOUNCE => {
            if let Some(existing) = registration.as_ref() {
                return error_reply(
                    error_codes::INVALID_REQUEST,
                    format!("Connection already announced as {}", existing.peer_id()),
                    id,
                );
            }

            let params: AnnounceParams = match request.params_as() {
                Ok(params) => params,
                Err(e) => return error_reply(error_codes::INVALID_PARAMS, e.to_string(), id),
            };

            match hub.register(&params.peer_id, frame_tx.clone()) {
                Ok(reg) => {
                    info!("Relay peer announced: {}", params.peer_id);
                    *registration = Some(reg);
                    JsonRpcResponse::new(json!({ "success": true, "peer_id": params.peer_id }), id)
                        .to_json()
                        .ok()
                }
                Err(Error::IdentityAlreadyRegistered(peer_id)) => {
                    warn!("Rejected duplicate announce for {}", peer_id);
                    error_reply(
                        error_codes::IDENTITY_TAKEN,
                        format!("Identity already registered: {}", peer_id),
                        id,
                    )
                }
                Err(e) => error_reply(error_codes::INVALID_REQUEST, e.to_string(), id),
            }
        }
        methods::SIGNAL => {
            let Some(reg) = registration.as_ref() else {
                return error_reply(
                    error_codes::NOT_ANNOUNCED,
                    "Announce an identity before signaling".to_string(),
                    id,
                );
            };

            match request.params_as::<OutboundSignalParams>() {
                Ok(params) => {
                    hub.route(
                        reg,
                        Envelope {
                            to: params.to,
                            message: params.payload,
                        },
                    );
                    None
                }
                Err(e) => error_reply(error_codes::INVALID_PARAMS, e.to_string(), id),
            }
        }
        other => error_reply(
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown method: {}", other),
            id,
        ),
    }
}

fn error_reply(code: i32, message: String, id: Value) -> Option<String> {
    JsonRpcError::new(code, message, id).to_json().ok()
}

/// Encode a hub frame as a relay notification
fn encode_frame(frame: RelayFrame) -> Result<Option<String>> {
    let notification = match frame {
        RelayFrame::Message { from, message } => JsonRpcRequest::notification(
            methods::SIGNAL,
            json!(InboundSignalParams {
                from,
                payload: message,
            }),
        ),
        RelayFrame::PeerGone { peer } => {
            JsonRpcRequest::notification(methods::LEFT, json!(LeftParams { peer_id: peer }))
        }
        RelayFrame::Undeliverable { to } => JsonRpcRequest::notification(
            methods::UNDELIVERABLE,
            json!(UndeliverableParams { to }),
        ),
        RelayFrame::Malformed { .. } => return Ok(None),
    };
    notification.to_json().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(peer_id: &str) -> String {
        JsonRpcRequest::new(methods::ANNOUNCE, json!({ "peer_id": peer_id }), Some(json!(1)))
            .to_json()
            .unwrap()
    }

    fn error_code(reply: Option<String>) -> i32 {
        match JsonRpcFrame::from_json(&reply.unwrap()).unwrap() {
            JsonRpcFrame::Error(e) => e.error.code,
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_announce_then_duplicate() {
        let hub = RelayHub::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let mut first = None;
        let mut second = None;

        let reply = handle_request(&announce("bc-1"), &hub, &mut first, &tx1).unwrap();
        assert!(matches!(JsonRpcFrame::from_json(&reply).unwrap(), JsonRpcFrame::Response(_)));
        assert!(first.is_some());

        let reply = handle_request(&announce("bc-1"), &hub, &mut second, &tx2);
        assert_eq!(error_code(reply), error_codes::IDENTITY_TAKEN);
        assert!(second.is_none());
    }

    #[test]
    fn test_signal_requires_announce() {
        let hub = RelayHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registration = None;
        let signal = JsonRpcRequest::notification(
            methods::SIGNAL,
            json!({ "to": "bc-1", "payload": { "type": "hangup", "call_id": "c" } }),
        )
        .to_json()
        .unwrap();

        let reply = handle_request(&signal, &hub, &mut registration, &tx);
        assert_eq!(error_code(reply), error_codes::NOT_ANNOUNCED);
    }

    #[test]
    fn test_garbage_and_unknown_method() {
        let hub = RelayHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registration = None;

        assert_eq!(
            error_code(handle_request("not json", &hub, &mut registration, &tx)),
            error_codes::PARSE_ERROR
        );

        let unknown = JsonRpcRequest::new("peer.dance", json!({}), Some(json!(2)))
            .to_json()
            .unwrap();
        assert_eq!(
            error_code(handle_request(&unknown, &hub, &mut registration, &tx)),
            error_codes::METHOD_NOT_FOUND
        );
    }

    #[test]
    fn test_encode_frames() {
        let text = encode_frame(RelayFrame::PeerGone { peer: "vw-1".into() })
            .unwrap()
            .unwrap();
        let request = JsonRpcRequest::from_json(&text).unwrap();
        assert_eq!(request.method, methods::LEFT);
        assert_eq!(request.params_as::<LeftParams>().unwrap().peer_id, "vw-1");

        assert!(encode_frame(RelayFrame::Malformed { detail: "x".into() })
            .unwrap()
            .is_none());
    }
}
