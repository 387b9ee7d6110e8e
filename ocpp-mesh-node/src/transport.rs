//! WebSocket links
//!
//! Each link gets a writer task draining its [`Connection`] channel and a
//! reader loop feeding frames to the dispatcher in arrival order. Peers dial
//! `ws://host:port/<their node id>`; upstream links are redialed with
//! exponential backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ocpp_mesh_core::{Connection, Dispatcher, NetworkingNodeId, RoutingTable};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid upstream {0}: expected NODE=ws://host:port[/path]")]
    InvalidUpstream(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A neighbor this node dials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub peer: NetworkingNodeId,
    pub url: String,
}

impl std::str::FromStr for Upstream {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkError::InvalidUpstream(s.to_string());
        let (peer, url) = s.split_once('=').ok_or_else(invalid)?;
        let peer = peer.trim().parse().map_err(|_| invalid())?;
        let url = url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(invalid());
        }
        Ok(Self {
            peer,
            url: url.to_string(),
        })
    }
}

/// Build the URL a node dials: base URL plus its own id as the last segment
pub fn build_link_url(base_url: &str, local: &NetworkingNodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), local)
}

/// Peer id named by the last path segment of a handshake URI
pub fn peer_from_path(path: &str) -> Option<NetworkingNodeId> {
    path.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Owns the WebSocket side of every link
pub struct Transport {
    dispatcher: Dispatcher,
    routes: Arc<RoutingTable>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl Transport {
    pub fn new(dispatcher: Dispatcher, routes: Arc<RoutingTable>) -> Self {
        Self {
            dispatcher,
            routes,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }

    fn ws_config() -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        }
    }

    /// Accept links from downstream peers until the listener fails
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<(), LinkError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for OCPP links on {}", addr);

        loop {
            let (stream, remote) = listener.accept().await?;
            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.accept(stream, remote).await {
                    warn!("Handshake with {} failed: {}", remote, e);
                }
            });
        }
    }

    async fn accept(&self, stream: TcpStream, remote: SocketAddr) -> Result<(), LinkError> {
        let mut peer = None;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let Some(id) = peer_from_path(request.uri().path()) else {
                let mut refusal = ErrorResponse::new(Some("path must end with the node id".to_string()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                return Err(refusal);
            };
            peer = Some(id);

            let offered = request
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
                .unwrap_or(false);
            if offered {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
            }
            Ok(response)
        };

        let ws = accept_hdr_async(stream, callback).await?;
        let Some(peer) = peer else {
            return Ok(());
        };
        info!("Accepted link from {} ({})", peer, remote);
        self.run_link(peer, ws).await;
        Ok(())
    }

    /// Keep a link to `upstream` up, redialing with backoff
    pub async fn dial(self: Arc<Self>, upstream: Upstream) {
        let mut delay = self.reconnect_delay;
        loop {
            match self.connect(&upstream).await {
                Ok(ws) => {
                    delay = self.reconnect_delay;
                    self.run_link(upstream.peer.clone(), ws).await;
                }
                Err(e) => error!("Connection to {} failed: {}", upstream.peer, e),
            }

            info!("Reconnecting to {} in {:?}", upstream.peer, delay);
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, self.max_reconnect_delay);
        }
    }

    async fn connect(
        &self,
        upstream: &Upstream,
    ) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, LinkError> {
        let url = build_link_url(&upstream.url, self.dispatcher.node_id());
        info!("Connecting to {} at {}", upstream.peer, url);

        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

        let (ws, response) = connect_async_with_config(request, Some(Self::ws_config()), false).await?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!("{} did not accept {}, got {:?}", upstream.peer, OCPP_SUBPROTOCOL, accepted);
        }
        Ok(ws)
    }

    /// Serve one established link until either side closes it
    async fn run_link<S>(&self, peer: NetworkingNodeId, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.dispatcher.config();
        let max_format_errors = config.max_format_errors;
        let (connection, mut outbound) = Connection::channel(peer.clone(), config.outbound_queue_capacity);
        if self.routes.add_connection(connection.clone()).is_some() {
            warn!("{} reconnected; replacing its previous link", peer);
        }

        let (mut ws_tx, mut ws_rx) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let mut format_errors = 0u32;
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    let outcome = self.dispatcher.handle_inbound(&connection, text.as_bytes()).await;
                    if outcome.is_format_error() {
                        format_errors += 1;
                        if format_errors > max_format_errors {
                            warn!("{} sent {} malformed frames in a row; closing", peer, format_errors);
                            break;
                        }
                    } else {
                        format_errors = 0;
                    }
                }
                Some(Ok(Message::Binary(_))) => warn!("Ignoring binary frame from {}", peer),
                Some(Ok(Message::Close(_))) => {
                    info!("{} closed the link", peer);
                    break;
                }
                Some(Ok(_)) => debug!("Control frame from {}", peer),
                Some(Err(e)) => {
                    error!("WebSocket error on link to {}: {}", peer, e);
                    break;
                }
                None => {
                    info!("Link to {} ended", peer);
                    break;
                }
            }
        }

        self.routes.remove_connection(&connection);
        writer.abort();
    }
}
