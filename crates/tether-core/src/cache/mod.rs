//! Generic entity cache engine
//!
//! One keyed cache per entity kind, all running the same machinery: push
//! notifications enqueue ids through a dedup set, a lazily-started resolver
//! worker drains the queue via synchronous fetches, and update/removal
//! listeners observe the results. Tombstones are applied synchronously in
//! [`EntityCache::notify`]; everything additive is eventually consistent and
//! gated by the shared readiness signal.
//!
//! Locking discipline: the snapshot map, its order vector, the pending set
//! and the FIFO queue all live under one mutex, so the "an id is pending iff
//! it is queued" invariant holds at every observable instant. Listener lists
//! are copied under their own lock and invoked outside it, so callbacks may
//! re-enter the registration API.


use crate::config::SyncConfig;
use crate::connection::NotificationSink;
use crate::error::TetherResult;
use crate::ready::ReadySignal;
use crate::source::EntitySource;
use crate::types::{CacheStats, EntityEntry, EntityId, EntityKind, EntitySnapshot};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle returned by listener registration, used to unregister
pub type ListenerId = u64;

type UpdateCallback = Arc<dyn Fn(&EntitySnapshot) + Send + Sync>;
type RemovalCallback = Arc<dyn Fn(&EntityId, Option<&EntitySnapshot>) + Send + Sync>;

/// Mutable cache state, all under one lock
struct CacheInner {
    /// Map order; index 0 is "most recent"
    order: Vec<EntityId>,
    /// id -> placeholder or resolved snapshot
    entries: HashMap<EntityId, EntityEntry>,
    /// Ids queued and not yet dequeued by the worker
    pending: HashSet<EntityId>,
    /// FIFO of ids awaiting resolution
    queue: VecDeque<EntityId>,
    /// Cold-start seeding in flight; keeps an idle worker waiting
    bulk_mode: bool,
    /// Whether the first-sync ordering hook already ran this connection
    first_shot_done: bool,
    /// At most one live resolver worker
    worker_alive: bool,
    /// Cold-start bulk fetch performed (or currently being performed)
    seeded: bool,
    /// Lifetime counters
    batches_received: u64,
    tombstones_applied: u64,
    resolve_failures: u64,
}

struct ListenerSet {
    next_id: ListenerId,
    update: Vec<(ListenerId, UpdateCallback)>,
    removal: Vec<(ListenerId, RemovalCallback)>,
}

/// Keyed cache of one entity kind with a background resolver worker
pub struct EntityCache {
    kind: EntityKind,
    source: Arc<dyn EntitySource>,
    config: SyncConfig,
    ready: Arc<ReadySignal>,
    inner: Mutex<CacheInner>,
    queue_cv: Condvar,
    listeners: Mutex<ListenerSet>,
    /// Self-reference for spawning workers that outlive the caller
    weak: Weak<EntityCache>,
}

impl EntityCache {
    /// Create a cache for one entity kind
    ///
    /// The readiness signal is shared with the owning connection: the cache
    /// sets it when its first full resolution pass completes.
    pub fn new(
        source: Arc<dyn EntitySource>,
        config: SyncConfig,
        ready: Arc<ReadySignal>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            kind: source.kind(),
            source,
            config,
            ready,
            inner: Mutex::new(CacheInner {
                order: Vec::new(),
                entries: HashMap::new(),
                pending: HashSet::new(),
                queue: VecDeque::new(),
                bulk_mode: false,
                first_shot_done: false,
                worker_alive: false,
                seeded: false,
                batches_received: 0,
                tombstones_applied: 0,
                resolve_failures: 0,
            }),
            queue_cv: Condvar::new(),
            listeners: Mutex::new(ListenerSet {
                next_id: 1,
                update: Vec::new(),
                removal: Vec::new(),
            }),
            weak: weak.clone(),
        })
    }

    /// The entity kind this cache mirrors
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Authoritative bulk id list from the companion service
    pub fn identifiers(&self) -> TetherResult<Vec<EntityId>> {
        self.source.list_identifiers()
    }

    /// Current state of the snapshot map, in map order
    ///
    /// Lazily bulk-populates on the first call; may contain unresolved
    /// placeholders while a drain is in progress.
    pub fn snapshot(&self) -> Vec<(EntityId, EntityEntry)> {
        self.ensure_seeded();
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| (id.clone(), e.clone())))
            .collect()
    }

    /// Resolved entities in map order
    ///
    /// Returns empty (without blocking) if the service is unreachable at
    /// cold start; the cache resumes populating once it becomes reachable.
    pub fn list(&self) -> Vec<EntitySnapshot> {
        self.snapshot()
            .into_iter()
            .filter_map(|(_, entry)| entry.into_snapshot())
            .collect()
    }

    /// Resolved entity for an id, resolving on miss
    pub fn get(&self, id: &EntityId) -> Option<EntitySnapshot> {
        if let Some(EntityEntry::Resolved(snap)) = self.inner.lock().entries.get(id) {
            return Some(snap.clone());
        }
        self.resolve(id)
    }

    /// Synchronous point resolution
    ///
    /// Updates the map and fires update listeners on success. On fetch
    /// failure the map is left untouched (a stale entry stays present rather
    /// than flickering out) and `None` is returned.
    pub fn resolve(&self, id: &EntityId) -> Option<EntitySnapshot> {
        let snapshot = match self.source.fetch(id) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(kind = %self.kind, id = %id, error = %e, "entity resolution failed");
                self.inner.lock().resolve_failures += 1;
                return None;
            }
        };

        {
            let mut inner = self.inner.lock();
            if !inner.entries.contains_key(id) {
                inner.order.insert(0, id.clone());
            }
            inner
                .entries
                .insert(id.clone(), EntityEntry::Resolved(snapshot.clone()));
        }

        self.fire_update(&snapshot);
        Some(snapshot)
    }

    /// Push entry point: apply one batch of raw change records
    ///
    /// Tombstones are applied synchronously (the id is gone from the map by
    /// the time this returns, and removal listeners have fired). Changed ids
    /// are deduplicated against the pending set and enqueued; brand-new ids
    /// get a placeholder at the front of the map so recency-sorted listings
    /// stay approximately correct before resolution completes. A tombstone
    /// and an add for the same id in one batch: the tombstone wins,
    /// regardless of record order.
    pub fn notify(&self, batch: &[Value]) {
        let mut changes = Vec::with_capacity(batch.len());
        for raw in batch {
            match self.source.change_record(raw) {
                Some(record) => changes.push(record),
                None => {
                    debug!(kind = %self.kind, record = %raw, "skipping malformed push record");
                }
            }
        }

        let tombstoned: HashSet<&EntityId> = changes
            .iter()
            .filter(|c| c.tombstoned)
            .map(|c| &c.id)
            .collect();

        let mut removed: Vec<(EntityId, Option<EntitySnapshot>)> = Vec::new();
        let spawn_worker = {
            let mut inner = self.inner.lock();
            inner.batches_received += 1;

            for change in changes.iter().filter(|c| !c.tombstoned) {
                if tombstoned.contains(&change.id) || inner.pending.contains(&change.id) {
                    continue;
                }
                if !inner.entries.contains_key(&change.id) {
                    inner.order.insert(0, change.id.clone());
                    inner.entries.insert(change.id.clone(), EntityEntry::Pending);
                }
                inner.pending.insert(change.id.clone());
                inner.queue.push_back(change.id.clone());
            }

            for change in changes.iter().filter(|c| c.tombstoned) {
                if let Some(entry) = inner.entries.remove(&change.id) {
                    inner.order.retain(|id| id != &change.id);
                    inner.tombstones_applied += 1;
                    removed.push((change.id.clone(), entry.into_snapshot()));
                }
                // Drop any queued resolution so the id cannot resurrect.
                if inner.pending.remove(&change.id) {
                    inner.queue.retain(|id| id != &change.id);
                }
            }

            let spawn = !inner.queue.is_empty() && !inner.worker_alive;
            if spawn {
                inner.worker_alive = true;
            }
            spawn
        };

        self.queue_cv.notify_one();

        for (id, old) in &removed {
            self.fire_removal(id, old.as_ref());
        }

        if spawn_worker {
            self.spawn_worker();
        }
    }

    /// Register an update listener; fired after every successful resolve
    pub fn on_update(
        &self,
        callback: impl Fn(&EntitySnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.update.push((id, Arc::new(callback)));
        id
    }

    /// Unregister an update listener; returns whether it was registered
    pub fn off_update(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.update.len();
        listeners.update.retain(|(lid, _)| *lid != id);
        listeners.update.len() != before
    }

    /// Register a removal listener; fired with the last known snapshot
    pub fn on_remove(
        &self,
        callback: impl Fn(&EntityId, Option<&EntitySnapshot>) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.removal.push((id, Arc::new(callback)));
        id
    }

    /// Unregister a removal listener; returns whether it was registered
    pub fn off_remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.removal.len();
        listeners.removal.retain(|(lid, _)| *lid != id);
        listeners.removal.len() != before
    }

    /// Block until the cache has completed at least one full sync pass
    pub fn wait_ready(&self) {
        self.ready.wait();
    }

    /// Bounded wait for readiness; returns whether the cache became ready
    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout)
    }

    /// Whether the readiness signal is currently set
    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let resolved = inner.entries.values().filter(|e| e.is_resolved()).count();
        CacheStats {
            resolved,
            placeholders: inner.entries.len() - resolved,
            pending: inner.pending.len(),
            queued: inner.queue.len(),
            batches_received: inner.batches_received,
            tombstones_applied: inner.tombstones_applied,
            resolve_failures: inner.resolve_failures,
        }
    }

    /// Connection-close hook: arm the next first-sync pass
    ///
    /// The readiness signal is cleared by the owning connection; this resets
    /// the one-shot ordering hook if configured to re-run per connection.
    pub fn reset_for_reconnect(&self) {
        let mut inner = self.inner.lock();
        if self.config.resort_on_reconnect {
            inner.first_shot_done = false;
        }
    }

    /// Cold start: seed placeholders for the authoritative id set
    fn ensure_seeded(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.seeded {
                return;
            }
            inner.seeded = true;
            inner.bulk_mode = true;
        }

        let ids = match self.source.list_identifiers() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "cold-start bulk listing failed");
                let mut inner = self.inner.lock();
                inner.bulk_mode = false;
                // Allow the next read to retry the cold start.
                inner.seeded = false;
                return;
            }
        };

        let spawn_worker = {
            let mut inner = self.inner.lock();
            for id in ids {
                if !inner.entries.contains_key(&id) {
                    inner.order.push(id.clone());
                    inner.entries.insert(id.clone(), EntityEntry::Pending);
                }
                if !inner.pending.contains(&id) {
                    inner.pending.insert(id.clone());
                    inner.queue.push_back(id);
                }
            }
            inner.bulk_mode = false;
            debug!(kind = %self.kind, queued = inner.queue.len(), "cold start seeded");

            // Spawn even for an empty id set: the worker's drained-queue
            // exit path is what runs the first-shot hook and sets readiness.
            let spawn = !inner.worker_alive;
            if spawn {
                inner.worker_alive = true;
            }
            spawn
        };

        self.queue_cv.notify_one();

        if spawn_worker {
            self.spawn_worker();
        }
    }

    /// Spawn the resolver worker; `worker_alive` was already claimed by the
    /// caller under the lock
    fn spawn_worker(&self) {
        let Some(cache) = self.weak.upgrade() else {
            return;
        };
        let spawned = std::thread::Builder::new()
            .name(format!("tether-{}-resolver", self.kind.channel_name()))
            .spawn(move || cache.run_worker());
        if let Err(e) = spawned {
            warn!(kind = %self.kind, error = %e, "failed to spawn resolver worker");
            self.inner.lock().worker_alive = false;
        }
    }

    /// Resolver worker: drain the queue, then run the one-time first-sync
    /// ordering hook, set readiness, and exit
    fn run_worker(&self) {
        debug!(kind = %self.kind, "resolver worker started");

        enum Step {
            Resolve(EntityId),
            Finish,
        }

        loop {
            let step = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(id) = inner.queue.pop_front() {
                        inner.pending.remove(&id);
                        break Step::Resolve(id);
                    }
                    let timed_out = self
                        .queue_cv
                        .wait_for(&mut inner, self.config.queue_poll)
                        .timed_out();
                    if !timed_out || inner.bulk_mode {
                        // Woken by an enqueue, or cold-start seeding is
                        // still in flight: keep draining/waiting.
                        continue;
                    }
                    if !inner.queue.is_empty() {
                        continue;
                    }
                    if !inner.first_shot_done {
                        self.apply_first_shot(&mut inner);
                        inner.first_shot_done = true;
                    }
                    inner.worker_alive = false;
                    break Step::Finish;
                }
            };

            match step {
                Step::Resolve(id) => {
                    // A failed resolve is logged inside; a single bad id
                    // never stops the worker.
                    let _ = self.resolve(&id);
                }
                Step::Finish => {
                    self.ready.set();
                    debug!(kind = %self.kind, "resolver worker finished");
                    return;
                }
            }
        }
    }

    /// Reorder the whole map once, per the kind's first-sync policy
    fn apply_first_shot(&self, inner: &mut CacheInner) {
        let mut resolved: Vec<EntitySnapshot> = inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).and_then(|e| e.snapshot()).cloned())
            .collect();
        self.source.first_sync_order(&mut resolved);

        let mut new_order: Vec<EntityId> = resolved.into_iter().map(|s| s.id).collect();
        for id in &inner.order {
            if inner.entries.get(id).is_some_and(|e| !e.is_resolved()) {
                new_order.push(id.clone());
            }
        }
        inner.order = new_order;
        debug!(kind = %self.kind, "first-sync ordering applied");
    }

    fn fire_update(&self, snapshot: &EntitySnapshot) {
        let callbacks: Vec<UpdateCallback> = self
            .listeners
            .lock()
            .update
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    fn fire_removal(&self, id: &EntityId, old: Option<&EntitySnapshot>) {
        let callbacks: Vec<RemovalCallback> = self
            .listeners
            .lock()
            .removal
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(id, old);
        }
    }
}

impl NotificationSink for EntityCache {
    fn deliver(&self, batch: Vec<Value>) {
        self.notify(&batch);
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("EntityCache")
            .field("kind", &self.kind)
            .field("entries", &stats.total_entries())
            .field("queued", &stats.queued)
            .finish()
    }
}
