//! HTTP + WebSocket gateway in front of the document registry.
//!
//! Routes:
//! ```text
//! POST /api/join   {name?, entryCode?} → {entryCode}      create or look up
//! GET  /ws?doc=<code>&name=<name>      → WebSocket session
//! GET  /health                         → {status, documents}
//! GET  /, /doc/{code}, /static/*       → pages (only with web_root)
//! ```
//!
//! Each WebSocket session:
//! ```text
//!  socket ──split──┬── reader: text frame → Document::update_content
//!                  └── writer: ClientLink → text frame (Close when the
//!                                            document drops the client)
//! ```
//!
//! The gateway is plumbing: every decision about content, membership and
//! lifetime is made by [`Document`] and [`DocumentRegistry`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::document::Document;
use crate::entry_code::EntryCode;
use crate::registry::{DocumentRegistry, RegistryError};

/// Body of `POST /api/join`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub name: String,
    /// Empty creates a new document
    #[serde(default)]
    pub entry_code: String,
}

/// Response of `POST /api/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub entry_code: EntryCode,
}

/// Query string of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub documents: usize,
}

/// User-facing gateway failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing document entry code")]
    MissingEntryCode,
    #[error("Document not found")]
    NotFound(#[from] RegistryError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::MissingEntryCode => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<DocumentRegistry>,
}

/// The collaboration server: registry + reaper + HTTP gateway.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(DocumentRegistry::with_config(config.registry.clone()));
        Self { config, registry }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
        };

        let mut router = Router::new()
            .route("/api/join", post(join_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler));

        if let Some(root) = &self.config.web_root {
            router = router
                .route_service("/", ServeFile::new(root.join("templates/index.html")))
                .route_service(
                    "/doc/{code}",
                    ServeFile::new(root.join("templates/document.html")),
                )
                .nest_service("/static", ServeDir::new(root.join("static")));
        }

        router.with_state(state).layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// On shutdown every document is deleted first, which closes all
    /// WebSocket sessions, and then the reaper is stopped.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let reaper = self.registry.spawn_reaper();
        let router = self.router();

        log::info!("Sync server listening on {local_addr}");

        let registry = self.registry.clone();
        let signal = async move {
            shutdown.await;
            let closed = registry.shutdown().await;
            log::info!("Shutting down, closed {closed} documents");
        };

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await;

        reaper.stop().await;
        result
    }

    /// Bind and serve in the background. Handy for tests and embedding.
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = self.registry.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = self.serve(listener, shutdown).await {
                log::error!("Sync server error: {e}");
            }
        });

        Ok(ServerHandle {
            local_addr,
            registry,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// A server running in the background.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<DocumentRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Stop the server and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Display name used when a client does not give one.
pub fn synthesize_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("user-{}", &id[..8])
}

/// Create a document (empty code) or confirm an existing one.
async fn join_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, GatewayError> {
    let doc = if req.entry_code.is_empty() {
        state.registry.create().await
    } else {
        state.registry.get(&req.entry_code).await?
    };

    log::debug!("Join request from {:?} for document {}", req.name, doc.entry_code());
    Ok(Json(JoinResponse {
        entry_code: doc.entry_code().clone(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        documents: state.registry.len().await,
    })
}

/// Validate the session parameters, then upgrade.
///
/// Parameters are checked before the upgrade so plain HTTP callers get a
/// 400/404 instead of an upgrade rejection.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<SessionParams>,
    State(state): State<AppState>,
) -> Response {
    if params.doc.is_empty() {
        return GatewayError::MissingEntryCode.into_response();
    }
    let doc = match state.registry.get(&params.doc).await {
        Ok(doc) => doc,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let name = if params.name.is_empty() {
        synthesize_name()
    } else {
        params.name
    };

    ws.on_upgrade(move |socket| run_session(socket, doc, name, state.registry))
}

/// Drive one WebSocket connection attached to `doc`.
async fn run_session(
    socket: WebSocket,
    doc: Arc<Document>,
    name: String,
    registry: Arc<DocumentRegistry>,
) {
    let (handle, mut link) = registry.client_channel();
    let client_id = handle.id();
    let mut close_signal = link.close_signal();
    let session_handle = handle.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer: drains the client's outbound buffer onto the socket
    let writer = tokio::spawn(async move {
        while let Some(content) = link.recv().await {
            if ws_sender.send(Message::Text(Utf8Bytes::from(&*content))).await.is_err() {
                // Dropping the link makes every later send to this client fail
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        let _ = ws_sender.close().await;
    });

    doc.add_client(handle, name.clone()).await;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Last-write-wins: the whole message replaces the content
                        doc.update_content(text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Client {name} disconnected from document {}", doc.entry_code());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for client {name}: {e}");
                        break;
                    }
                }
            }
            _ = close_signal.closed() => {
                log::debug!("Document {} closed session for {name}", doc.entry_code());
                break;
            }
        }
    }

    doc.remove_client(client_id).await;
    session_handle.close();
    let _ = writer.await;
}
