use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::Uri,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{
    future::{self, BoxFuture},
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    endpoint::{ConnectionError, Endpoint},
    registry::Registry,
};

pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
}

impl RelayServer {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_registry(listener, Registry::new())
    }

    pub fn with_registry(listener: TcpListener, registry: Registry) -> Self {
        Self { listener, registry }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer { listener, registry } = self;

        axum::serve(listener, app(registry))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("relay shutting down");
            })
            .await
            .context("relay server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// `/health` reports on the registry; every other path names a channel and
/// expects a WebSocket upgrade.
pub fn app(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(channel_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    channels: usize,
    members: usize,
}

async fn health(State(registry): State<Registry>) -> Json<Health> {
    let snapshot = registry.snapshot().await;
    Json(Health {
        status: "ok",
        channels: snapshot.len(),
        members: snapshot.iter().map(|channel| channel.members).sum(),
    })
}

async fn channel_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(registry): State<Registry>,
) -> Response {
    let channel = uri.path().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, channel, registry))
}

async fn handle_socket(socket: WebSocket, channel: String, registry: Registry) {
    info!(%channel, "websocket connected");

    let (sink, stream) = socket.split();
    let endpoint = Arc::new(WebSocketEndpoint::new(sink));
    registry.connect(&channel, endpoint, text_messages(stream)).await;

    info!(%channel, "websocket disconnected");
}

/// Outbound half of an upgraded socket. The relay drives it from the
/// member's writer task only; the lock lets `send` take `&self`.
struct WebSocketEndpoint {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WebSocketEndpoint {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl Endpoint for WebSocketEndpoint {
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(text)).await?;
            Ok(())
        })
    }
}

/// Text frames until the peer closes. Control and binary frames are skipped;
/// axum already answers pings.
fn text_messages(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, ConnectionError>> + Send + Unpin {
    stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(error) => Some(Err(ConnectionError::from(error))),
            })
        })
}
