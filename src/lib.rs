//! Root crate: re-exports `agentecs-core` and `agentecs-systems` behind a
//! single dependency, plus a `prelude` module for the common import list.

pub use agentecs_core as core;
pub use agentecs_systems as systems;

pub use agentecs_core::{
    combine, normalize_result, queries_disjoint, register_component, registry, split, system, system_dev,
    system_readonly, AccessKind, AccessPattern, AsyncStorage, BulkUpdate, Combinable, Component, ComponentIdCollision,
    ComponentRegistry, ComponentRow, ComponentTypeMeta, EcsError, EcsResult, EntityAllocator, EntityHandle, EntityId,
    LocalStorage, MalformedReturn, MergeStrategy, NonMergeableHandling, NonSplittableHandling, Op, Query, ReturnValue,
    ScopedAccess, SequencedOp, ShardMismatch, Splittable, Storage, StorageError, SystemBuilder, SystemDescriptor,
    SystemFn, SystemMode, SystemResult, World, RESERVED_COUNT,
};
pub use agentecs_systems::{Backoff, ExecutionGroup, ExecutionPlan, OnExhausted, RetryPolicy, Scheduler, SchedulerConfig, SystemPlanInfo};

/// The types and functions most call sites need: component registration,
/// the `system()` builders, `World`, and the `Scheduler`.
pub mod prelude {
    pub use agentecs_core::{
        register_component, registry, system, system_dev, system_readonly, AccessPattern, Combinable, Component,
        EcsError, EcsResult, EntityHandle, EntityId, Query, ReturnValue, ScopedAccess, Splittable, SystemDescriptor,
        SystemMode, World,
    };
    pub use agentecs_systems::{Backoff, MergeStrategy, OnExhausted, RetryPolicy, Scheduler, SchedulerConfig};
}
