//! Per-entity-type resolver descriptors
//!
//! One generic cache engine serves every entity kind; the differences
//! (where the bulk list comes from, how to fetch one entity, how to read
//! the id out of a push record, and how a finished first sync should order
//! the map) live behind [`EntitySource`]. `RemoteEntitySource` is the single
//! implementation, parametrized per kind.

use crate::error::TetherResult;
use crate::remote::RemoteService;
use crate::types::{ChangeRecord, EntityId, EntityKind, EntitySnapshot};
use serde_json::Value;
use std::sync::Arc;

/// The four per-kind hooks the cache engine is parametrized by
pub trait EntitySource: Send + Sync {
    /// The entity kind this source serves
    fn kind(&self) -> EntityKind;

    /// Authoritative bulk id list (cold start only)
    fn list_identifiers(&self) -> TetherResult<Vec<EntityId>>;

    /// Synchronous point resolution of one entity
    fn fetch(&self, id: &EntityId) -> TetherResult<EntitySnapshot>;

    /// Normalize a raw push record, or `None` if it is malformed
    fn change_record(&self, raw: &Value) -> Option<ChangeRecord>;

    /// One-time post-first-sync ordering of the resolved entries
    fn first_sync_order(&self, entries: &mut Vec<EntitySnapshot>);
}

/// How a kind orders its entries once the first sync completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderPolicy {
    /// Most recently updated first (`updated_at`, entries without a parsable
    /// timestamp sink to the end)
    UpdatedAtDesc,
    /// Ascending by a string field
    FieldAsc(&'static str),
    /// Descending by a string field
    FieldDesc(&'static str),
}

/// [`EntitySource`] over the companion service's pull API
pub struct RemoteEntitySource {
    kind: EntityKind,
    remote: Arc<dyn RemoteService>,
    /// Field carrying the entity id in this kind's push records
    id_key: &'static str,
    order: OrderPolicy,
}

impl RemoteEntitySource {
    /// Saved snippets, recency-ordered
    pub fn assets(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            kind: EntityKind::Asset,
            remote,
            id_key: "id",
            order: OrderPolicy::UpdatedAtDesc,
        }
    }

    /// Chat conversations, recency-ordered
    pub fn chats(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            kind: EntityKind::Chat,
            remote,
            id_key: "id",
            order: OrderPolicy::UpdatedAtDesc,
        }
    }

    /// File/directory anchors, ordered by path
    pub fn anchors(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            kind: EntityKind::Anchor,
            remote,
            id_key: "id",
            order: OrderPolicy::FieldAsc("path"),
        }
    }

    /// Time ranges, newest start first
    pub fn ranges(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            kind: EntityKind::Range,
            remote,
            id_key: "id",
            order: OrderPolicy::FieldDesc("start"),
        }
    }

    /// Workstream summaries, keyed by workstream id, recency-ordered
    pub fn summaries(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            kind: EntityKind::Summary,
            remote,
            id_key: "workstream_id",
            order: OrderPolicy::UpdatedAtDesc,
        }
    }

    /// The source for a given kind
    pub fn for_kind(kind: EntityKind, remote: Arc<dyn RemoteService>) -> Self {
        match kind {
            EntityKind::Asset => Self::assets(remote),
            EntityKind::Chat => Self::chats(remote),
            EntityKind::Anchor => Self::anchors(remote),
            EntityKind::Range => Self::ranges(remote),
            EntityKind::Summary => Self::summaries(remote),
        }
    }
}

impl EntitySource for RemoteEntitySource {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn list_identifiers(&self) -> TetherResult<Vec<EntityId>> {
        self.remote.list_identifiers(self.kind)
    }

    fn fetch(&self, id: &EntityId) -> TetherResult<EntitySnapshot> {
        self.remote.fetch(self.kind, id)
    }

    fn change_record(&self, raw: &Value) -> Option<ChangeRecord> {
        let id = raw.get(self.id_key)?.as_str()?;
        if id.is_empty() {
            return None;
        }
        let tombstoned = raw
            .get("tombstoned")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(ChangeRecord {
            id: EntityId::from(id),
            tombstoned,
        })
    }

    fn first_sync_order(&self, entries: &mut Vec<EntitySnapshot>) {
        match self.order {
            OrderPolicy::UpdatedAtDesc => {
                entries.sort_by(|a, b| b.updated_at().cmp(&a.updated_at()));
            }
            OrderPolicy::FieldAsc(field) => {
                entries.sort_by(|a, b| a.str_field(field).cmp(&b.str_field(field)));
            }
            OrderPolicy::FieldDesc(field) => {
                entries.sort_by(|a, b| b.str_field(field).cmp(&a.str_field(field)));
            }
        }
    }
}
