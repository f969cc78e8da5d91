//! # padcast-collab - shared text documents with live fan-out
//!
//! Clients join a document by a six-character entry code, push full-content
//! updates, and every connected client receives each update.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (text)  ┌──────────────────────────────┐
//! │ Client U1   │ ◄─────────────────► │ SyncServer (axum gateway)    │
//! └─────────────┘                     └──────────────┬───────────────┘
//! ┌─────────────┐                                    │ get / create
//! │ Client U2   │ ◄───────┐                          ▼
//! └─────────────┘         │           ┌──────────────────────────────┐
//!                         │           │ DocumentRegistry             │
//!                         │           │ (RwLock map + idle reaper)   │
//!                         │           └──────────────┬───────────────┘
//!                         │                          │ Arc<Document>
//!                         │                          ▼
//!                         │           ┌──────────────────────────────┐
//!                         │           │ Document (Mutex: content,    │
//!                         │           │ clients) ── update queue ──┐ │
//!                         │           └────────────────────────────┼─┘
//!                         │                                        ▼
//!                         └──────── ClientHandle ◄──────── Broadcaster
//! ```
//!
//! Conflict policy is last-write-wins: each update replaces the whole
//! content, and the order in which updates reach the document lock decides
//! which one survives.
//!
//! ## Modules
//!
//! - [`entry_code`] - random six-character document codes
//! - [`client`] - send-only handles the document uses to reach connections
//! - [`document`] - content, membership, update queue
//! - [`broadcast`] - per-document fan-out loop
//! - [`registry`] - code → document map and idle reaper
//! - [`config`] - server configuration from defaults and environment
//! - [`server`] - HTTP join endpoint and WebSocket sessions

pub mod entry_code;
pub mod client;
pub mod document;
pub mod broadcast;
pub mod registry;
pub mod config;
pub mod server;

// Re-exports for convenience
pub use entry_code::{EntryCode, ENTRY_CODE_LEN};
pub use client::{ClientHandle, ClientId, ClientLink, CloseSignal, SendError};
pub use document::{Document, DocumentPhase};
pub use broadcast::{BroadcastStats, FanOut};
pub use registry::{DocumentRegistry, Reaper, RegistryConfig, RegistryError, RegistryStats};
pub use config::{ConfigError, ServerConfig};
pub use server::{
    GatewayError, HealthResponse, JoinRequest, JoinResponse, ServerHandle, SessionParams,
    SyncServer,
};
