//! Realtime conversation synchronization core for chat clients.
//!
//! Keeps a local view of a user's conversations and messages consistent
//! with a remote chat server that is reached through two independent
//! transports: request/response HTTP calls for history ([`history`]) and a
//! persistent bidirectional push channel for live traffic ([`connection`]).
//! The [`orchestrator`] arbitrates between them and publishes immutable
//! [`SyncSnapshot`]s to the presentation layer.

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod store;
pub mod typing;

pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState, Connector, WsConnector};
pub use error::{SyncError, SyncResult};
pub use history::{ConversationApi, HistoryLoader};
pub use models::{Conversation, Credential, Message, MessageStatus, Role};
pub use orchestrator::{SyncHandle, SyncNotice, SyncOrchestrator, SyncSnapshot};
