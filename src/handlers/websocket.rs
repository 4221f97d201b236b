use async_trait::async_trait;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::auth::token::bearer;
use crate::core::connection::{Connector, Link, LinkPeer};
use crate::error::{Result, SyncError};

/// Opens the push channel over a WebSocket, authenticating the upgrade
/// request with a bearer header
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url, access_token: &str) -> Result<Link> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::ConfigError(format!("Invalid socket URL {}: {}", url, e)))?;
        let auth = HeaderValue::from_str(&bearer(access_token))
            .map_err(|_| SyncError::Unauthorized("Access token is not a valid header value".to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);

        let (ws_stream, _) = connect_async(request).await.map_err(map_handshake_error)?;
        info!("WebSocket connected to {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (link, peer) = Link::pair();
        let LinkPeer { mut sent, push } = peer;

        // Forward frames from the connection manager to the socket
        tokio::task::spawn(async move {
            while let Some(frame) = sent.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    return;
                }
            }
            debug!("Outbound side released, closing WebSocket");
            let _ = ws_tx.close().await;
        });

        // Forward text frames from the socket to the connection manager
        tokio::task::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if push.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if push.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            // Dropping `push` ends the link
        });

        Ok(link)
    }
}

fn map_handshake_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            SyncError::Unauthorized(format!("Handshake rejected with {}", response.status()))
        }
        tungstenite::Error::Http(response) => {
            SyncError::TransientNetwork(format!("Handshake failed with {}", response.status()))
        }
        other => SyncError::TransientNetwork(other.to_string()),
    }
}
