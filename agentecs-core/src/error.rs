//! The error taxonomy surfaced by a tick.
//!
//! Individual modules (`component`, `entity`, `result`, `storage`) define
//! their own narrow error types; `EcsError` is the umbrella type returned
//! by `World`/`ScopedAccess` operations that can fail for more than one
//! reason.

use std::any::TypeId;

use crate::component::ComponentIdCollision;
use crate::entity::{EntityId, ShardMismatch};
use crate::result::MalformedReturn;

#[derive(thiserror::Error, Debug)]
pub enum EcsError {
    #[error(transparent)]
    ComponentIdCollision(#[from] ComponentIdCollision),

    #[error("entity {entity} is missing component {type_id:?}")]
    EntityMissing { entity: EntityId, type_id: TypeId },

    #[error("entity {0} does not exist")]
    NoSuchEntity(EntityId),

    #[error("system `{system}` attempted {attempted:?} access to {type_id:?} outside its declared pattern")]
    AccessViolation {
        system: String,
        type_id: TypeId,
        attempted: AccessKind,
    },

    #[error(transparent)]
    MalformedReturn(#[from] MalformedReturn),

    #[error(transparent)]
    ShardMismatch(#[from] ShardMismatch),

    #[error("tick failed: retries exhausted for system `{system}`")]
    TickFailure { system: String, source: Box<EcsError> },

    #[error("conflicting writes to entity {entity} component {type_id:?} within one group")]
    ConflictError { entity: EntityId, type_id: TypeId },

    #[cfg(feature = "serialize")]
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Which kind of access a failed operation attempted, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

pub type EcsResult<T> = Result<T, EcsError>;
