//! Schedules system execution across a tick: builds concurrent execution
//! groups from each system's declared access pattern, retries failing
//! systems per a configurable policy, and reconciles conflicting writes
//! within a group before committing to a [`agentecs_core::World`].

pub mod scheduler;

pub use scheduler::{
    Backoff, ExecutionGroup, ExecutionPlan, OnExhausted, RetryPolicy, Scheduler, SchedulerConfig, SystemPlanInfo,
};

// Re-exported unchanged so callers see the same module boundary this
// crate has always presented, even though `SystemDescriptor` itself now
// lives one layer down in `agentecs-core` (see DESIGN.md).
pub use agentecs_core::{system, system_dev, system_readonly, MergeStrategy, SystemBuilder, SystemDescriptor, SystemMode};
