//! Typed registry binding one connection/cache pair per entity kind
//!
//! `EntityCacheRegistry::get_or_create` is idempotent, mirroring the
//! connection registry's singleton behavior: the first call for a kind
//! builds the `(ConnectionManager, EntityCache)` pair, later calls return
//! the existing binding. CLI/TUI layers consume the typed passthroughs on
//! [`EntityBinding`] and never touch the engine directly.

use crate::cache::{EntityCache, ListenerId};
use crate::config::SyncConfig;
use crate::connection::{ChannelId, ConnectionManager, ReadyOn};
use crate::discovery::EndpointDiscovery;
use crate::error::TetherResult;
use crate::ready::ReadySignal;
use crate::remote::{HttpRemoteService, RemoteService};
use crate::source::{EntitySource, RemoteEntitySource};
use crate::types::{CacheStats, EntityId, EntityKind, EntitySnapshot};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared dependencies every binding is built from
pub struct ServiceContext {
    /// Sync configuration shared by all caches and connections
    pub config: SyncConfig,
    /// Endpoint discovery shared by pull and push paths
    pub discovery: Arc<EndpointDiscovery>,
    /// Pull-side service client
    pub remote: Arc<dyn RemoteService>,
    /// Prefix for channel ids in the process-wide connection registry
    pub namespace: String,
}

impl ServiceContext {
    /// Production context: file-based discovery + blocking HTTP pull client
    pub fn new(config: SyncConfig) -> TetherResult<Self> {
        let discovery = Arc::new(EndpointDiscovery::from_config(&config)?);
        let remote: Arc<dyn RemoteService> =
            Arc::new(HttpRemoteService::new(Arc::clone(&discovery), &config)?);
        Ok(Self {
            config,
            discovery,
            remote,
            namespace: "tether".to_string(),
        })
    }

    /// Replace the pull-side client (tests, alternative transports)
    pub fn with_remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = remote;
        self
    }

    /// Namespace the channel ids, letting independent registries coexist
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// One entity kind's connection/cache pair with typed passthroughs
pub struct EntityBinding {
    kind: EntityKind,
    connection: Arc<ConnectionManager>,
    cache: Arc<EntityCache>,
}

impl EntityBinding {
    /// The entity kind this binding serves
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The underlying cache
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// The underlying connection
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Resolved entities in cache order
    pub fn list(&self) -> Vec<EntitySnapshot> {
        self.cache.list()
    }

    /// One entity, resolving on miss
    pub fn get(&self, id: &EntityId) -> Option<EntitySnapshot> {
        self.cache.get(id)
    }

    /// Subscribe to entity updates
    pub fn subscribe_updates(
        &self,
        callback: impl Fn(&EntitySnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        self.cache.on_update(callback)
    }

    /// Unsubscribe from entity updates
    pub fn unsubscribe_updates(&self, listener: ListenerId) -> bool {
        self.cache.off_update(listener)
    }

    /// Subscribe to entity removals
    pub fn subscribe_removals(
        &self,
        callback: impl Fn(&EntityId, Option<&EntitySnapshot>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.cache.on_remove(callback)
    }

    /// Unsubscribe from entity removals
    pub fn unsubscribe_removals(&self, listener: ListenerId) -> bool {
        self.cache.off_remove(listener)
    }

    /// Block until the first full sync pass completes
    pub fn wait_ready(&self) {
        self.cache.wait_ready();
    }

    /// Bounded wait for the first full sync pass
    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        self.cache.wait_ready_timeout(timeout)
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Open the push channel
    pub fn start(&self) -> TetherResult<()> {
        self.connection.start()
    }

    /// Close the push channel
    pub fn close(&self) {
        self.connection.close();
    }

    /// Cycle the push channel
    pub fn reconnect(&self) -> TetherResult<()> {
        self.connection.reconnect()
    }
}

/// Registry of entity bindings, one per kind
pub struct EntityCacheRegistry {
    context: ServiceContext,
    bindings: DashMap<EntityKind, Arc<EntityBinding>>,
}

static GLOBAL: OnceCell<EntityCacheRegistry> = OnceCell::new();

impl EntityCacheRegistry {
    /// Create a registry over an explicit context
    pub fn new(context: ServiceContext) -> Self {
        Self {
            context,
            bindings: DashMap::new(),
        }
    }

    /// The process-wide registry, built from default configuration
    pub fn global() -> TetherResult<&'static EntityCacheRegistry> {
        GLOBAL.get_or_try_init(|| Ok(Self::new(ServiceContext::new(SyncConfig::default())?)))
    }

    /// The binding for a kind, building it on first use; idempotent
    pub fn get_or_create(&self, kind: EntityKind) -> Arc<EntityBinding> {
        self.bindings
            .entry(kind)
            .or_insert_with(|| self.build_binding(kind))
            .clone()
    }

    /// Bindings built so far
    pub fn bindings(&self) -> Vec<Arc<EntityBinding>> {
        self.bindings.iter().map(|entry| entry.clone()).collect()
    }

    /// Open the push channel for every kind
    pub fn start_all(&self) {
        for kind in EntityKind::ALL {
            let binding = self.get_or_create(kind);
            if let Err(e) = binding.start() {
                warn!(kind = %kind, error = %e, "failed to start push channel");
            }
        }
    }

    /// Close every built binding's push channel
    pub fn close_all(&self) {
        for binding in self.bindings() {
            binding.close();
        }
    }

    /// Cycle every built binding's push channel (service moved at runtime)
    pub fn reconnect_all(&self) {
        info!("reconnecting all entity channels");
        for binding in self.bindings() {
            if let Err(e) = binding.reconnect() {
                warn!(kind = %binding.kind(), error = %e, "reconnect failed");
            }
        }
    }

    fn build_binding(&self, kind: EntityKind) -> Arc<EntityBinding> {
        let source: Arc<dyn EntitySource> = Arc::new(RemoteEntitySource::for_kind(
            kind,
            Arc::clone(&self.context.remote),
        ));
        let ready = Arc::new(ReadySignal::new());
        let cache = EntityCache::new(source, self.context.config.clone(), Arc::clone(&ready));

        let channel = ChannelId::new(format!(
            "{}/{}",
            self.context.namespace,
            kind.channel_name()
        ));
        let connection = ConnectionManager::get_or_create(channel.clone(), || {
            let sink = Arc::clone(&cache);
            let on_close = Arc::clone(&cache);
            Arc::new(
                ConnectionManager::new(
                    channel,
                    ReadyOn::FirstSync,
                    ready,
                    Arc::clone(&self.context.discovery),
                    self.context.config.clone(),
                    sink,
                )
                .with_close_callback(move || on_close.reset_for_reconnect()),
            )
        });

        Arc::new(EntityBinding {
            kind,
            connection,
            cache,
        })
    }
}
