//! Upstream pull contract: bulk id listing and fetch-by-id
//!
//! The push channel lives in [`crate::connection`]; this module covers the
//! synchronous pull side the resolver worker and cold-start path depend on.

mod http;

pub use http::HttpRemoteService;

use crate::error::TetherResult;
use crate::types::{EntityId, EntityKind, EntitySnapshot};

/// Synchronous pull interface to the companion service
///
/// Both calls block; they are only ever made from resolver workers or from
/// callers that explicitly asked for a point read.
pub trait RemoteService: Send + Sync {
    /// The current, authoritative set of ids for an entity kind
    ///
    /// Used only for cold start.
    fn list_identifiers(&self, kind: EntityKind) -> TetherResult<Vec<EntityId>>;

    /// Fetch the full entity for one id
    fn fetch(&self, kind: EntityKind, id: &EntityId) -> TetherResult<EntitySnapshot>;
}
