//! Tether Core Library
//!
//! This crate keeps an in-process mirror of the entities a companion service
//! owns: saved assets, chats, anchors, time ranges, and workstream
//! summaries. The service pushes "identifier changed" notifications over a
//! per-kind TCP channel; the mirror resolves the full entities back over the
//! pull API and serves them from memory.

pub mod cache;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod ready;
pub mod registry;
pub mod remote;
pub mod source;
pub mod types;
pub mod watch;

// Re-export commonly used types
pub use cache::{EntityCache, ListenerId};
pub use config::SyncConfig;
pub use connection::{ChannelId, ConnectionManager, NotificationSink, ReadyOn};
pub use discovery::{EndpointDiscovery, ServiceEndpoint};
pub use error::{TetherError, TetherResult};
pub use ready::ReadySignal;
pub use registry::{EntityBinding, EntityCacheRegistry, ServiceContext};
pub use remote::{HttpRemoteService, RemoteService};
pub use source::{EntitySource, RemoteEntitySource};
pub use types::{CacheStats, ChangeRecord, EntityEntry, EntityId, EntityKind, EntitySnapshot};
pub use watch::EndpointWatcher;
