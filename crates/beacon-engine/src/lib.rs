//! Runtime of the Beacon real-time messaging core.
//!
//! The engine keeps one persistent WebSocket to the chat server, decodes its
//! push stream into typed events, and reconciles those events with REST
//! history fetches and optimistic local sends into a single consistent
//! timeline per conversation — while tracking unread/mention state, typing
//! presence, and connection health under an idle-aware power-saving policy.
//!
//! Services are explicitly constructed and injectable; a typical host wires
//! them like this:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use beacon_engine::{
//!     ActivityMonitor, ConnectionManager, DirectoryCache, EngineConfig, HttpConversationApi,
//!     MessageStream, NotificationCenter, StaticAuthProvider, SyncEngine,
//! };
//! use beacon_platform::InMemoryKeyValueStore;
//!
//! # async fn wire() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let auth = Arc::new(StaticAuthProvider::new("token", "u_me"));
//!
//! let conn = ConnectionManager::new(&config, auth.clone());
//! let stream = MessageStream::spawn(conn.frames());
//! let api = Arc::new(HttpConversationApi::new(config.api_base.clone(), auth));
//! let store = Arc::new(InMemoryKeyValueStore::default());
//! let notifications = Arc::new(NotificationCenter::new(store, None));
//! let directory = Arc::new(DirectoryCache::new());
//!
//! let monitor = ActivityMonitor::spawn(conn.clone(), notifications.clone(), &config);
//! let engine = SyncEngine::spawn(
//!     conn.clone(),
//!     &stream,
//!     api,
//!     notifications,
//!     directory,
//!     "u_me",
//!     &config,
//! );
//!
//! conn.connect().await?;
//! let _ = monitor;
//! let _ = engine;
//! # Ok(())
//! # }
//! ```

/// Idle/active/hidden classification and connection suspension.
pub mod activity;
/// REST collaborators (history, listings, durable fallbacks).
pub mod api;
/// Authentication collaborator boundary.
pub mod auth;
/// Environment-backed runtime configuration.
pub mod config;
/// WebSocket connection lifecycle.
pub mod connection;
/// User directory collaborator and lookup cache.
pub mod directory;
/// Outbound action encoding with REST fallback.
pub mod dispatch;
/// Per-conversation draft persistence.
pub mod drafts;
/// The reconciliation core.
pub mod engine;
/// Tracing bootstrap.
pub mod logging;
/// Desktop notification gating and preferences.
pub mod notify;
/// Presence writer/reader.
pub mod presence;
/// Typed event demultiplexing over the push stream.
pub mod stream;

pub use activity::{ActivityMonitor, InputSignal};
pub use api::{ConversationApi, HttpConversationApi};
pub use auth::{AuthProvider, StaticAuthProvider};
pub use config::{ConfigError, EngineConfig};
pub use connection::ConnectionManager;
pub use directory::{DirectoryCache, UserDirectory};
pub use dispatch::ActionDispatcher;
pub use drafts::{Draft, DraftStore};
pub use engine::{EngineHandle, SyncEngine};
pub use notify::{NotificationCenter, NotificationPreferences, NotificationSink};
pub use presence::{status_for, PresenceReader, PresenceStore, PresenceWriter};
pub use stream::{
    MembershipEvent, MessageDeleted, MessageStream, NotificationEvent, PresenceEvent,
    ServerErrorEvent, StreamEvent, TypingEvent, UnreadEvent,
};
