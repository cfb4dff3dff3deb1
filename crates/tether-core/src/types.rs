//! Core data types shared across the synchronization engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque identifier of a server-owned entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new entity id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The entity types mirrored from the companion service
///
/// Each kind gets its own cache and its own push channel; the engine that
/// serves them is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Saved snippets
    Asset,
    /// Chat conversations
    Chat,
    /// File/directory anchors
    Anchor,
    /// Time ranges
    Range,
    /// Workstream summaries
    Summary,
}

impl EntityKind {
    /// All kinds, in registry construction order
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Asset,
        EntityKind::Chat,
        EntityKind::Anchor,
        EntityKind::Range,
        EntityKind::Summary,
    ];

    /// Channel / URL path segment for this kind
    pub fn channel_name(&self) -> &'static str {
        match self {
            EntityKind::Asset => "assets",
            EntityKind::Chat => "chats",
            EntityKind::Anchor => "anchors",
            EntityKind::Range => "ranges",
            EntityKind::Summary => "summaries",
        }
    }

    /// Human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            EntityKind::Asset => "asset",
            EntityKind::Chat => "chat",
            EntityKind::Anchor => "anchor",
            EntityKind::Range => "time range",
            EntityKind::Summary => "workstream summary",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel_name())
    }
}

/// A fully-resolved entity as returned by the companion service
///
/// The payload is service-defined and opaque to the engine; nothing here is
/// interpreted beyond the id and the handful of fields the per-kind ordering
/// hooks read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity identifier
    pub id: EntityId,
    /// Opaque service-defined payload
    pub value: Value,
}

impl EntitySnapshot {
    /// Create a snapshot from an id and raw payload
    pub fn new(id: impl Into<EntityId>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    /// Read a top-level field of the payload
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }

    /// Read a top-level string field of the payload
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Parse the payload's `updated_at` field, if present
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.str_field("updated_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// A single "identifier changed" push record, normalized
///
/// Produced from a raw service-defined record by the per-kind
/// notification-key extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// The entity the record refers to
    pub id: EntityId,
    /// Whether the entity was deleted upstream
    pub tombstoned: bool,
}

impl ChangeRecord {
    /// A change record for a new or updated entity
    pub fn changed(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            tombstoned: false,
        }
    }

    /// A tombstone record for a deleted entity
    pub fn tombstone(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            tombstoned: true,
        }
    }
}

/// One slot in the snapshot map
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEntry {
    /// Known id, full entity not resolved yet
    Pending,
    /// Fully resolved entity
    Resolved(EntitySnapshot),
}

impl EntityEntry {
    /// Whether the entry holds a resolved entity
    pub fn is_resolved(&self) -> bool {
        matches!(self, EntityEntry::Resolved(_))
    }

    /// The resolved snapshot, if any
    pub fn snapshot(&self) -> Option<&EntitySnapshot> {
        match self {
            EntityEntry::Resolved(snap) => Some(snap),
            EntityEntry::Pending => None,
        }
    }

    /// Consume the entry, keeping the resolved snapshot if any
    pub fn into_snapshot(self) -> Option<EntitySnapshot> {
        match self {
            EntityEntry::Resolved(snap) => Some(snap),
            EntityEntry::Pending => None,
        }
    }
}

/// Counters describing a cache's current state and lifetime activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently resolved
    pub resolved: usize,
    /// Entries currently held as unresolved placeholders
    pub placeholders: usize,
    /// Ids in the dedup set (always equal to `queued`)
    pub pending: usize,
    /// Ids currently queued for resolution
    pub queued: usize,
    /// Push batches received over the connection lifetime
    pub batches_received: u64,
    /// Tombstones applied
    pub tombstones_applied: u64,
    /// Fetch-by-id failures (entries kept stale)
    pub resolve_failures: u64,
}

impl CacheStats {
    /// Total entries currently in the snapshot map
    pub fn total_entries(&self) -> usize {
        self.resolved + self.placeholders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_id_roundtrip() {
        let id = EntityId::from("a1");
        assert_eq!(id.as_str(), "a1");
        assert_eq!(id.to_string(), "a1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"a1\"");
    }

    #[test]
    fn test_kind_channel_names() {
        let names: Vec<_> = EntityKind::ALL.iter().map(|k| k.channel_name()).collect();
        assert_eq!(
            names,
            vec!["assets", "chats", "anchors", "ranges", "summaries"]
        );
    }

    #[test]
    fn test_snapshot_updated_at() {
        let snap = EntitySnapshot::new(
            "a1",
            json!({"name": "foo", "updated_at": "2026-08-01T12:00:00Z"}),
        );
        assert_eq!(snap.str_field("name"), Some("foo"));
        let ts = snap.updated_at().unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-08-01T12:00:00+00:00");
    }

    #[test]
    fn test_snapshot_updated_at_malformed() {
        let snap = EntitySnapshot::new("a1", json!({"updated_at": "yesterday"}));
        assert!(snap.updated_at().is_none());
    }

    #[test]
    fn test_entry_accessors() {
        let entry = EntityEntry::Resolved(EntitySnapshot::new("a1", json!({})));
        assert!(entry.is_resolved());
        assert!(entry.snapshot().is_some());
        assert!(!EntityEntry::Pending.is_resolved());
        assert!(EntityEntry::Pending.into_snapshot().is_none());
    }
}
