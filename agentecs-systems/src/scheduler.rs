//! Builds a concurrent execution plan from a set of registered systems and
//! drives one tick of the runtime.
//!
//! The default plan has exactly two tiers: every `runs_alone` (dev-mode)
//! system gets its own isolated group that runs to completion before
//! anything else starts, then every remaining system runs concurrently in
//! one final group. Same-key writes across that group's systems are not
//! prevented by grouping; they're reconciled at commit time by
//! [`MergeStrategy`].

use std::time::Duration;

use agentecs_core::{EcsError, EcsResult, EntityId, MergeStrategy, SystemDescriptor, SystemResult, World};
use futures::future::join_all;
use futures::stream::{self, StreamExt};

/// One set of systems the scheduler runs concurrently.
#[derive(Clone)]
pub struct ExecutionGroup {
    pub systems: Vec<SystemDescriptor>,
}

/// The ordered sequence of groups one tick runs through.
#[derive(Clone)]
pub struct ExecutionPlan {
    pub groups: Vec<ExecutionGroup>,
}

/// Introspection record for one system's place in a plan, surfaced by
/// [`Scheduler::execution_plan_info`] for debugging/tooling.
#[derive(Debug, Clone)]
pub struct SystemPlanInfo {
    pub name: String,
    pub group: usize,
    pub phase: String,
    pub frequency: f64,
    pub runs_alone: bool,
}

impl ExecutionPlan {
    /// Every `runs_alone` system gets its own isolated group, in
    /// registration order; every other system lands in one trailing group
    /// that runs concurrently as a whole.
    pub fn build_default(systems: &[SystemDescriptor]) -> Self {
        let mut groups: Vec<ExecutionGroup> = Vec::new();

        for descriptor in systems.iter().filter(|d| d.runs_alone) {
            groups.push(ExecutionGroup { systems: vec![descriptor.clone()] });
        }

        let rest: Vec<SystemDescriptor> = systems.iter().filter(|d| !d.runs_alone).cloned().collect();
        if !rest.is_empty() {
            groups.push(ExecutionGroup { systems: rest });
        }

        ExecutionPlan { groups }
    }

    pub fn execution_plan_info(&self) -> Vec<SystemPlanInfo> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(group, g)| {
                g.systems.iter().map(move |s| SystemPlanInfo {
                    name: s.name.clone(),
                    group,
                    phase: s.phase.clone(),
                    frequency: s.frequency,
                    runs_alone: s.runs_alone,
                })
            })
            .collect()
    }
}

/// What happens once [`RetryPolicy::max_attempts`] is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExhausted {
    /// Fail the whole tick with `EcsError::TickFailure`.
    Fail,
    /// Treat the system as having produced no writes this tick and move on.
    Skip,
}

/// Delay applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Linear(Duration),
    Exponential { base: Duration, factor: f64 },
}

/// How many times, and how, a failing system is retried within one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub on_exhausted: OnExhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 1, backoff: Backoff::None, on_exhausted: OnExhausted::Fail }
    }
}

async fn apply_backoff(backoff: Backoff, attempt: u32) {
    match backoff {
        Backoff::None => {}
        Backoff::Linear(step) => tokio::time::sleep(step * attempt).await,
        Backoff::Exponential { base, factor } => {
            let millis = base.as_millis() as f64 * factor.powi(attempt as i32 - 1);
            tokio::time::sleep(Duration::from_millis(millis.max(0.0) as u64)).await;
        }
    }
}

/// Scheduler-wide settings: how many systems may run concurrently within a
/// single execution group, how a failing system is retried, and how two
/// systems' conflicting writes within one group are reconciled.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// `None` runs every system in a group concurrently with no cap;
    /// `Some(n)` bounds it to `n` in flight at once.
    pub max_concurrent: Option<usize>,
    pub retry_policy: RetryPolicy,
    pub merge_strategy: MergeStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { max_concurrent: None, retry_policy: RetryPolicy::default(), merge_strategy: MergeStrategy::default() }
    }
}

/// Owns a registered set of systems and drives them through a [`World`] one
/// tick at a time.
pub struct Scheduler {
    config: SchedulerConfig,
    systems: Vec<SystemDescriptor>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Scheduler { config, systems: Vec::new() }
    }

    /// A scheduler configured to never run two systems concurrently,
    /// useful for deterministic tests and debugging.
    pub fn sequential() -> Self {
        Scheduler::new(SchedulerConfig { max_concurrent: Some(1), ..SchedulerConfig::default() })
    }

    pub fn register(&mut self, descriptor: SystemDescriptor) -> &mut Self {
        self.systems.push(descriptor);
        self
    }

    pub fn systems(&self) -> &[SystemDescriptor] {
        &self.systems
    }

    pub fn execution_plan(&self) -> ExecutionPlan {
        ExecutionPlan::build_default(&self.systems)
    }

    pub fn execution_plan_info(&self) -> Vec<SystemPlanInfo> {
        self.execution_plan().execution_plan_info()
    }

    async fn run_with_retry(&self, world: &World, descriptor: &SystemDescriptor) -> EcsResult<SystemResult> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match world.execute_system(descriptor.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if attempt >= self.config.retry_policy.max_attempts {
                        return match self.config.retry_policy.on_exhausted {
                            OnExhausted::Fail => {
                                Err(EcsError::TickFailure { system: descriptor.name.clone(), source: Box::new(err) })
                            }
                            OnExhausted::Skip => {
                                tracing::warn!(system = %descriptor.name, error = %err, "system failed, retries exhausted, skipping");
                                Ok(SystemResult::new())
                            }
                        };
                    }
                    tracing::warn!(system = %descriptor.name, attempt, error = %err, "system failed, retrying");
                    apply_backoff(self.config.retry_policy.backoff, attempt).await;
                }
            }
        }
    }

    fn commit_group(&self, world: &World, results: Vec<EcsResult<SystemResult>>) -> EcsResult<Vec<EntityId>> {
        let mut combined: Option<SystemResult> = None;
        for result in results {
            let result = result?;
            combined = Some(match combined {
                None => result,
                Some(mut acc) => {
                    acc.merge_with_strategy(result, self.config.merge_strategy)?;
                    acc
                }
            });
        }
        Ok(world.apply_result(combined.unwrap_or_default()))
    }

    /// Run every group in the plan, in order, committing each group's
    /// combined result before the next group starts. Returns every entity
    /// id allocated by a `Spawn` op this tick, in commit order.
    pub async fn tick(&self, world: &World) -> EcsResult<Vec<EntityId>> {
        let plan = self.execution_plan();
        let mut new_entities = Vec::new();

        for group in &plan.groups {
            let results = match self.config.max_concurrent {
                Some(max) => {
                    stream::iter(group.systems.iter().map(|d| self.run_with_retry(world, d)))
                        .buffer_unordered(max)
                        .collect::<Vec<_>>()
                        .await
                }
                None => join_all(group.systems.iter().map(|d| self.run_with_retry(world, d))).await,
            };
            new_entities.extend(self.commit_group(world, results)?);
        }

        Ok(new_entities)
    }

    /// Alias for [`Scheduler::tick`], kept since this runtime's tick core
    /// is async end to end and callers may reach for either name.
    pub async fn tick_async(&self, world: &World) -> EcsResult<Vec<EntityId>> {
        self.tick(world).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use agentecs_core::{system, system_dev, AccessPattern, ReturnValue};

    #[derive(Clone, Debug, PartialEq)]
    struct Position(f64);
    #[derive(Clone, Debug, PartialEq)]
    struct Velocity(f64);
    #[derive(Clone, Debug, PartialEq)]
    struct Health(i32);

    fn rw(name: &str, ty: TypeId) -> SystemDescriptor {
        system(name).reads(AccessPattern::types([ty])).writes(AccessPattern::types([ty])).build()
    }

    fn rw_writer(name: &str, entity: EntityId, value: Position) -> SystemDescriptor {
        system(name)
            .reads(AccessPattern::types([TypeId::of::<Position>()]))
            .writes(AccessPattern::types([TypeId::of::<Position>()]))
            .run_sync(move |access| {
                access.update(entity, value.clone())?;
                Ok(ReturnValue::Empty)
            })
            .build()
    }

    #[test]
    fn runs_alone_systems_each_get_their_own_group() {
        let overlay = system_dev("overlay").build();
        let mover = rw("mover", TypeId::of::<Position>());
        let plan = ExecutionPlan::build_default(&[overlay, mover]);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].systems.len(), 1);
        assert!(plan.groups[0].systems[0].runs_alone);
    }

    #[test]
    fn disjoint_systems_share_a_group() {
        let mover = rw("mover", TypeId::of::<Position>());
        let healer = rw("healer", TypeId::of::<Health>());
        let plan = ExecutionPlan::build_default(&[mover, healer]);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].systems.len(), 2);
    }

    #[test]
    fn overlapping_systems_share_the_single_trailing_group() {
        let a = rw("a", TypeId::of::<Position>());
        let b = rw("b", TypeId::of::<Position>());
        let plan = ExecutionPlan::build_default(&[a, b]);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].systems.len(), 2);
    }

    #[tokio::test]
    async fn tick_commits_two_disjoint_systems_in_one_group() {
        let world = World::new();
        let entity = world.spawn(vec![
            (TypeId::of::<Position>(), Box::new(Position(0.0))),
            (TypeId::of::<Health>(), Box::new(Health(10))),
        ]);

        let mut scheduler = Scheduler::default();
        scheduler.register(
            system("mover")
                .reads(AccessPattern::types([TypeId::of::<Position>()]))
                .writes(AccessPattern::types([TypeId::of::<Position>()]))
                .run_sync(move |access| {
                    access.update(entity, Position(1.0))?;
                    Ok(ReturnValue::Empty)
                })
                .build(),
        );
        scheduler.register(
            system("healer")
                .reads(AccessPattern::types([TypeId::of::<Health>()]))
                .writes(AccessPattern::types([TypeId::of::<Health>()]))
                .run_sync(move |access| {
                    access.update(entity, Health(20))?;
                    Ok(ReturnValue::Empty)
                })
                .build(),
        );

        scheduler.tick(&world).await.unwrap();
        assert_eq!(world.get_copy::<Position>(entity).unwrap(), Position(1.0));
        assert_eq!(world.get_copy::<Health>(entity).unwrap(), Health(20));
    }

    #[tokio::test]
    async fn retry_policy_recovers_from_a_transient_failure() {
        let world = World::new();
        let entity = world.spawn(vec![(TypeId::of::<Position>(), Box::new(Position(0.0)))]);
        let attempts = Arc::new(AtomicU32::new(0));

        let mut scheduler = Scheduler::new(SchedulerConfig {
            retry_policy: RetryPolicy { max_attempts: 3, backoff: Backoff::None, on_exhausted: OnExhausted::Fail },
            ..SchedulerConfig::default()
        });

        let attempts_for_system = attempts.clone();
        scheduler.register(
            system("flaky")
                .reads(AccessPattern::types([TypeId::of::<Position>(), TypeId::of::<Velocity>()]))
                .writes(AccessPattern::types([TypeId::of::<Position>()]))
                .run_sync(move |access| {
                    let n = attempts_for_system.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        let _ = access.get::<Velocity>(entity)?;
                    }
                    access.update(entity, Position(5.0))?;
                    Ok(ReturnValue::Empty)
                })
                .build(),
        );

        scheduler.tick(&world).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(world.get_copy::<Position>(entity).unwrap(), Position(5.0));
    }

    #[tokio::test]
    async fn retries_exhausted_with_skip_leaves_world_untouched() {
        let world = World::new();
        let entity = world.spawn(vec![(TypeId::of::<Position>(), Box::new(Position(0.0)))]);

        let mut scheduler = Scheduler::new(SchedulerConfig {
            retry_policy: RetryPolicy { max_attempts: 1, backoff: Backoff::None, on_exhausted: OnExhausted::Skip },
            ..SchedulerConfig::default()
        });
        scheduler.register(
            system("always_fails")
                .reads(AccessPattern::types([TypeId::of::<Velocity>()]))
                .run_sync(move |access| {
                    let _ = access.get::<Velocity>(entity)?;
                    Ok(ReturnValue::Empty)
                })
                .build(),
        );

        scheduler.tick(&world).await.unwrap();
        assert_eq!(world.get_copy::<Position>(entity).unwrap(), Position(0.0));
    }

    #[test]
    fn merge_strategy_error_rejects_conflicting_writes_from_two_buffers() {
        let entity = EntityId::new(0, 1000, 0);
        let mut direct = SystemResult::new();
        direct.record_update(entity, Position(9.0));
        let mut other = SystemResult::new();
        other.record_update(entity, Position(10.0));
        let err = direct.merge_with_strategy(other, MergeStrategy::Error).unwrap_err();
        assert!(matches!(err, EcsError::ConflictError { .. }));
    }

    #[tokio::test]
    async fn two_writers_to_the_same_key_in_the_trailing_group_fail_the_tick_under_error_strategy() {
        let world = World::new();
        let entity = world.spawn(vec![(TypeId::of::<Position>(), Box::new(Position(0.0)))]);

        let mut scheduler =
            Scheduler::new(SchedulerConfig { merge_strategy: MergeStrategy::Error, ..SchedulerConfig::default() });
        scheduler.register(rw_writer("writer_one", entity, Position(1.0)));
        scheduler.register(rw_writer("writer_two", entity, Position(2.0)));

        let plan = scheduler.execution_plan();
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].systems.len(), 2);

        let err = scheduler.tick(&world).await.unwrap_err();
        assert!(matches!(err, EcsError::ConflictError { .. }));
    }

    #[tokio::test]
    async fn two_writers_to_the_same_key_resolve_via_last_writer_wins() {
        let world = World::new();
        let entity = world.spawn(vec![(TypeId::of::<Position>(), Box::new(Position(0.0)))]);

        let mut scheduler = Scheduler::new(SchedulerConfig {
            merge_strategy: MergeStrategy::LastWriterWins,
            ..SchedulerConfig::default()
        });
        scheduler.register(rw_writer("writer_one", entity, Position(1.0)));
        scheduler.register(rw_writer("writer_two", entity, Position(2.0)));

        scheduler.tick(&world).await.unwrap();
        assert_eq!(world.get_copy::<Position>(entity).unwrap(), Position(2.0));
    }

    #[test]
    fn sequential_scheduler_caps_concurrency_at_one() {
        let scheduler = Scheduler::sequential();
        assert_eq!(scheduler.systems().len(), 0);
    }

    #[test]
    fn execution_plan_info_exposes_phase_and_frequency() {
        let mut scheduler = Scheduler::default();
        scheduler.register(
            system("mover")
                .reads(AccessPattern::types([TypeId::of::<Position>()]))
                .writes(AccessPattern::types([TypeId::of::<Position>()]))
                .phase("physics")
                .build(),
        );
        let info = scheduler.execution_plan_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].name, "mover");
        assert_eq!(info[0].phase, "physics");
        assert_eq!(info[0].frequency, 1.0);
    }
}
