//! Core data structures for a concurrent, stateful-agent ECS runtime:
//! the component registry, entity allocator, storage protocol, access
//! algebra, system descriptors, the per-tick mutation log, and the
//! `World` that ties them together.
//!
//! Scheduling a tick across many systems lives one crate up, in
//! `agentecs-systems`, which depends on everything exported here.

pub mod access;
pub mod component;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod query;
pub mod result;
pub mod storage;
pub mod world;

pub use access::{EntityHandle, ScopedAccess};
pub use component::{
    combine, register_component, registry, split, Combinable, Component, ComponentIdCollision,
    ComponentRegistry, ComponentTypeMeta, Splittable,
};
pub use descriptor::{system, system_dev, system_readonly, SystemBuilder, SystemDescriptor, SystemFn, SystemMode};
pub use entity::{well_known, EntityAllocator, EntityId, ShardMismatch, RESERVED_COUNT};
pub use error::{AccessKind, EcsError, EcsResult};
pub use query::{queries_disjoint, AccessPattern, Query};
pub use result::{normalize_result, MalformedReturn, MergeStrategy, Op, ReturnValue, SequencedOp, SystemResult};
pub use storage::{AsyncStorage, BulkUpdate, ComponentRow, LocalStorage, Storage, StorageError};
pub use world::{NonMergeableHandling, NonSplittableHandling, World};
