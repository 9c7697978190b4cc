//! WebSocket relay: upgrade the inbound connection and pump frames both
//! ways until either side closes.
//!
//! The target connection is established before the inbound upgrade is
//! accepted, so dial and TLS failures still map to a 502 at the HTTP
//! layer. After the upgrade, two pumps run as sibling futures; whichever
//! finishes first cancels the other, then both sides get a close frame.

use std::sync::Arc;

use axum::{
    extract::{
        WebSocketUpgrade,
        ws::{self, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{CloseFrame as TungsteniteCloseFrame, frame::coding::CloseCode},
    },
};
use url::Url;

use crate::{error::ProxyError, registry::ProxyInstance, tls::TlsBypass};

type TargetStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the target WebSocket, then accept the inbound upgrade and relay.
pub async fn proxy_websocket(
    upgrade: WebSocketUpgrade,
    instance: Arc<ProxyInstance>,
    mut target: Url,
    outbound: HeaderMap,
    bypass: TlsBypass,
) -> Result<Response, ProxyError> {
    let converted = match target.scheme() {
        "http" => target.set_scheme("ws"),
        "https" => target.set_scheme("wss"),
        _ => Ok(()),
    };
    if converted.is_err() {
        return Err(ProxyError::InvalidUrl("scheme conversion failed".to_string()));
    }

    let mut request = target
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

    // The handshake owns its own hop headers; forward only the payload ones.
    for (name, value) in &outbound {
        if is_handshake_header(name) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }

    let tls_config = bypass
        .client_config()
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    let connector = Connector::Rustls(Arc::new(tls_config));

    let (target_stream, _handshake_response) =
        connect_async_tls_with_config(request, None, false, Some(connector))
            .await
            .map_err(|e| ProxyError::Upstream(format!("WebSocket connect failed: {e}")))?;

    tracing::debug!(
        instance = %instance.name,
        target = %target,
        "Target WebSocket connected, upgrading client"
    );

    let name = instance.name.clone();
    let target_display = target.to_string();
    Ok(upgrade.on_upgrade(move |client| pump(client, target_stream, name, target_display)))
}

fn is_handshake_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name == "host"
        || name == "upgrade"
        || name == "connection"
        || name.starts_with("sec-websocket-")
}

/// Forward frames in both directions until either side closes or errors.
async fn pump(client: WebSocket, target: TargetStream, instance: String, target_display: String) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut target_tx, mut target_rx) = target.split();

    let client_to_target = async {
        while let Some(message) = client_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "Client socket error, closing target");
                    let _ = target_tx
                        .send(tungstenite::Message::Close(Some(TungsteniteCloseFrame {
                            code: CloseCode::Away,
                            reason: "client went away".into(),
                        })))
                        .await;
                    break;
                }
            };
            let is_close = matches!(message, ws::Message::Close(_));
            let Some(outgoing) = client_to_upstream(message) else {
                continue;
            };
            if target_tx.send(outgoing).await.is_err() || is_close {
                break;
            }
        }
    };

    let target_to_client = async {
        while let Some(message) = target_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "Target socket error, closing client");
                    let _ = client_tx
                        .send(ws::Message::Close(Some(ws::CloseFrame {
                            code: 1001,
                            reason: "target went away".into(),
                        })))
                        .await;
                    break;
                }
            };
            let is_close = matches!(message, tungstenite::Message::Close(_));
            let Some(outgoing) = upstream_to_client(message) else {
                continue;
            };
            if client_tx.send(outgoing).await.is_err() || is_close {
                break;
            }
        }
    };

    // Whichever pump finishes first cancels the other.
    tokio::select! {
        _ = client_to_target => {
            tracing::debug!(instance = %instance, "Client side finished first");
        }
        _ = target_to_client => {
            tracing::debug!(instance = %instance, "Target side finished first");
        }
    }

    let _ = target_tx.close().await;
    let _ = client_tx.close().await;

    tracing::info!(
        instance = %instance,
        target = %target_display,
        "WebSocket session closed"
    );
}

/// Convert an inbound client frame for the target connection.
fn client_to_upstream(message: ws::Message) -> Option<tungstenite::Message> {
    match message {
        ws::Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().to_owned())),
        ws::Message::Binary(data) => Some(tungstenite::Message::Binary(data.to_vec())),
        ws::Message::Ping(data) => Some(tungstenite::Message::Ping(data.to_vec())),
        ws::Message::Pong(data) => Some(tungstenite::Message::Pong(data.to_vec())),
        ws::Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|frame| {
            TungsteniteCloseFrame {
                code: CloseCode::from(frame.code),
                reason: frame.reason.to_string().into(),
            }
        }))),
    }
}

/// Convert a target frame for the inbound client connection.
fn upstream_to_client(message: tungstenite::Message) -> Option<ws::Message> {
    match message {
        tungstenite::Message::Text(text) => Some(ws::Message::Text(text.into())),
        tungstenite::Message::Binary(data) => Some(ws::Message::Binary(data.into())),
        tungstenite::Message::Ping(data) => Some(ws::Message::Ping(data.into())),
        tungstenite::Message::Pong(data) => Some(ws::Message::Pong(data.into())),
        tungstenite::Message::Close(frame) => {
            Some(ws::Message::Close(frame.map(|frame| ws::CloseFrame {
                code: frame.code.into(),
                reason: frame.reason.to_string().into(),
            })))
        }
        // Raw frames never cross the relay.
        tungstenite::Message::Frame(_) => None,
    }
}
