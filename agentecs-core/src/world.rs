//! `World`: owns storage, bootstraps the reserved singleton entities, runs
//! one system to completion, and commits its result to storage.
//!
//! Tick orchestration across a whole execution plan lives in
//! `agentecs-systems`'s `Scheduler`, which is built on top of
//! [`World::execute_system`] and [`World::apply_result`] — `World` itself
//! has no notion of execution groups or retries.

use std::any::TypeId;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::access::ScopedAccess;
use crate::component::Component;
use crate::descriptor::SystemDescriptor;
use crate::entity::{well_known, EntityAllocator, EntityId};
use crate::error::{AccessKind, EcsError, EcsResult};
use crate::result::{normalize_result, Op, SystemResult};
use crate::storage::{BulkUpdate, LocalStorage, Storage};

/// Strategy for resolving a type present on both entities in an out-of-tick
/// merge when that type does not implement `Combinable`. The in-tick
/// `ScopedAccess::merge_entities` always behaves as `Second` (the default
/// fold rule); this enum is an opt-in for callers outside a tick who want a
/// different tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonMergeableHandling {
    /// Keep `a`'s value.
    First,
    /// Keep `b`'s value (last-writer-wins, `b` treated as later).
    Second,
    /// Drop the component from the merged entity.
    Skip,
    /// Fail the merge with `EcsError::ConflictError`.
    Error,
}

/// Strategy for a type on the split entity that does not implement
/// `Splittable`. `ScopedAccess::split_entity` always behaves as `Both`
/// (independent deep copies, the default rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonSplittableHandling {
    /// Independent deep copies on both sides (the default).
    Both,
    /// The same instance goes to the left entity only; right gets none.
    First,
    /// Drop the component from both resulting entities.
    Skip,
    /// Fail the split with `EcsError::ConflictError`.
    Error,
}

pub struct World {
    storage: Box<dyn Storage>,
    allocator: Mutex<EntityAllocator>,
}

impl Default for World {
    fn default() -> Self {
        World::new()
    }
}

impl World {
    pub fn new() -> Self {
        World::with_storage(Box::new(LocalStorage::new()))
    }

    pub fn with_storage(storage: Box<dyn Storage>) -> Self {
        let mut allocator = EntityAllocator::new(0);
        allocator.reserve(well_known::WORLD);
        allocator.reserve(well_known::CLOCK);
        storage.create_entity(well_known::WORLD);
        storage.create_entity(well_known::CLOCK);
        World { storage, allocator: Mutex::new(allocator) }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    // --- Out-of-tick helpers ------------------------------------------
    //
    // These mutate storage immediately and are not safe to call while a
    // tick is in flight.

    pub fn spawn(&self, components: Vec<(TypeId, Box<dyn Component>)>) -> EntityId {
        let entity = self.allocator.lock().allocate();
        self.storage.create_entity(entity);
        for (type_id, component) in components {
            self.storage.set(entity, type_id, component);
        }
        entity
    }

    pub fn destroy(&self, entity: EntityId) -> EcsResult<()> {
        self.allocator.lock().deallocate(entity)?;
        self.storage.destroy_entity(entity);
        Ok(())
    }

    pub fn get_copy<T: Component>(&self, entity: EntityId) -> EcsResult<T> {
        let type_id = TypeId::of::<T>();
        let component = self.storage.get(entity, type_id).ok_or(EcsError::EntityMissing { entity, type_id })?;
        Ok(*component.downcast::<T>().ok().expect("component type mismatch"))
    }

    pub fn set<T: Component>(&self, entity: EntityId, component: T) {
        self.storage.set(entity, TypeId::of::<T>(), Box::new(component));
    }

    pub fn singleton_copy<T: Component>(&self) -> EcsResult<T> {
        self.get_copy::<T>(well_known::WORLD)
    }

    pub fn set_singleton<T: Component>(&self, component: T) {
        self.set(well_known::WORLD, component);
    }

    pub fn query_copies(&self, required: &[TypeId]) -> Vec<(EntityId, crate::storage::ComponentRow)> {
        self.storage.iter(required)
    }

    pub fn merge_entities(&self, a: EntityId, b: EntityId, handling: NonMergeableHandling) -> EcsResult<EntityId> {
        if !self.storage.entity_exists(a) {
            return Err(EcsError::NoSuchEntity(a));
        }
        if !self.storage.entity_exists(b) {
            return Err(EcsError::NoSuchEntity(b));
        }

        let registry = crate::component::registry();
        let mut by_type: HashMap<TypeId, Box<dyn Component>> =
            self.storage.types_of(a).into_iter().map(|t| (t, self.storage.get(a, t).unwrap())).collect();

        for type_id in self.storage.types_of(b) {
            let value_b = self.storage.get(b, type_id).unwrap();
            match by_type.remove(&type_id) {
                None => {
                    by_type.insert(type_id, value_b);
                }
                Some(value_a) => {
                    let is_combinable = registry.combinable(type_id);
                    if is_combinable {
                        by_type.insert(type_id, registry.combine_dyn(type_id, value_a, value_b));
                    } else {
                        match handling {
                            NonMergeableHandling::First => {
                                by_type.insert(type_id, value_a);
                            }
                            NonMergeableHandling::Second => {
                                by_type.insert(type_id, value_b);
                            }
                            NonMergeableHandling::Skip => {}
                            NonMergeableHandling::Error => {
                                return Err(EcsError::ConflictError { entity: a, type_id });
                            }
                        }
                    }
                }
            }
        }

        let merged = self.spawn(by_type.into_iter().collect());
        self.destroy(a)?;
        self.destroy(b)?;
        Ok(merged)
    }

    pub fn split_entity(&self, entity: EntityId, handling: NonSplittableHandling) -> EcsResult<(EntityId, EntityId)> {
        if !self.storage.entity_exists(entity) {
            return Err(EcsError::NoSuchEntity(entity));
        }

        let registry = crate::component::registry();
        let mut left = Vec::new();
        let mut right = Vec::new();
        for type_id in self.storage.types_of(entity) {
            let value = self.storage.get(entity, type_id).unwrap();
            if registry.splittable(type_id) {
                let (l, r) = registry.split_dyn(type_id, value);
                left.push((type_id, l));
                right.push((type_id, r));
            } else {
                match handling {
                    NonSplittableHandling::Both => {
                        let copy = value.clone_boxed();
                        left.push((type_id, value));
                        right.push((type_id, copy));
                    }
                    NonSplittableHandling::First => {
                        left.push((type_id, value));
                    }
                    NonSplittableHandling::Skip => {}
                    NonSplittableHandling::Error => {
                        return Err(EcsError::ConflictError { entity, type_id });
                    }
                }
            }
        }

        let left_id = self.spawn(left);
        let right_id = self.spawn(right);
        self.destroy(entity)?;
        Ok((left_id, right_id))
    }

    // --- Tick execution -------------------------------------------------

    /// Run one system to completion against the current committed state,
    /// producing the `SystemResult` it buffered. Does not touch storage.
    pub async fn execute_system(&self, descriptor: SystemDescriptor) -> EcsResult<SystemResult> {
        let run = descriptor.run.clone();
        let validated_against = descriptor.clone();
        let mut access = ScopedAccess::new(self, descriptor);
        let outcome = run(&mut access).await?;
        let mut buffer = access.into_buffer();
        buffer.merge(normalize_result(outcome));
        World::validate_result_access(&validated_against, &buffer)?;
        Ok(buffer)
    }

    /// Validate that every op in `result` only touches types the
    /// descriptor may write. Buffer writes made through `ScopedAccess`
    /// already enforce this per call; this second pass also covers writes
    /// contributed by the system's returned shorthand value, which bypass
    /// `ScopedAccess` entirely.
    pub fn validate_result_access(descriptor: &SystemDescriptor, result: &SystemResult) -> EcsResult<()> {
        for sequenced in result.ops() {
            match &sequenced.op {
                Op::Update { type_id, .. } | Op::Insert { type_id, .. } | Op::Remove { type_id, .. } => {
                    if !descriptor.can_write(*type_id) {
                        return Err(EcsError::AccessViolation {
                            system: descriptor.name.clone(),
                            type_id: *type_id,
                            attempted: AccessKind::Write,
                        });
                    }
                }
                Op::Spawn { components, .. } => {
                    for (type_id, _) in components {
                        if !descriptor.can_write(*type_id) {
                            return Err(EcsError::AccessViolation {
                                system: descriptor.name.clone(),
                                type_id: *type_id,
                                attempted: AccessKind::Write,
                            });
                        }
                    }
                }
                Op::Destroy { .. } => {}
            }
        }
        Ok(())
    }

    /// Commit `result`'s ops to storage in recorded order. Provisional
    /// spawn ids resolve to freshly allocated
    /// entity ids, the k-th spawn op becoming the k-th new entity. Returns
    /// the newly allocated entity ids, in spawn order.
    pub fn apply_result(&self, result: SystemResult) -> Vec<EntityId> {
        let registry = crate::component::registry();
        let mut provisional_to_real: HashMap<EntityId, EntityId> = HashMap::new();
        let mut new_entities = Vec::new();
        let mut batch = BulkUpdate::default();
        let mut staged: HashMap<(EntityId, TypeId), Box<dyn Component>> = HashMap::new();
        let mut destroyed: std::collections::HashSet<EntityId> = std::collections::HashSet::new();

        let resolve = |provisional_to_real: &HashMap<EntityId, EntityId>, entity: EntityId| -> EntityId {
            if entity.is_provisional() {
                *provisional_to_real.get(&entity).expect("provisional id referenced before its spawn op")
            } else {
                entity
            }
        };

        for sequenced in result.into_ops() {
            match sequenced.op {
                Op::Spawn { provisional, components } => {
                    let real = self.allocator.lock().allocate();
                    self.storage.create_entity(real);
                    provisional_to_real.insert(provisional, real);
                    new_entities.push(real);
                    for (type_id, component) in components {
                        staged.insert((real, type_id), component);
                    }
                }
                Op::Update { entity, type_id, component } => {
                    let entity = resolve(&provisional_to_real, entity);
                    if destroyed.contains(&entity) {
                        continue;
                    }
                    let key = (entity, type_id);
                    match staged.remove(&key) {
                        Some(prior) if registry.combinable(type_id) => {
                            staged.insert(key, registry.combine_dyn(type_id, prior, component));
                        }
                        _ => {
                            staged.insert(key, component);
                        }
                    }
                }
                Op::Insert { entity, type_id, component } => {
                    let entity = resolve(&provisional_to_real, entity);
                    if destroyed.contains(&entity) {
                        continue;
                    }
                    let key = (entity, type_id);
                    match staged.remove(&key) {
                        Some(prior) if registry.combinable(type_id) => {
                            staged.insert(key, registry.combine_dyn(type_id, prior, component));
                        }
                        _ => {
                            staged.insert(key, component);
                        }
                    }
                }
                Op::Remove { entity, type_id } => {
                    let entity = resolve(&provisional_to_real, entity);
                    staged.remove(&(entity, type_id));
                    batch.removes.push((entity, type_id));
                }
                Op::Destroy { entity } => {
                    let entity = resolve(&provisional_to_real, entity);
                    staged.retain(|(e, _), _| *e != entity);
                    batch.removes.retain(|(e, _)| *e != entity);
                    destroyed.insert(entity);
                    batch.destroys.push(entity);
                }
            }
        }

        for ((entity, type_id), component) in staged {
            if destroyed.contains(&entity) {
                continue;
            }
            batch.inserts.push((entity, type_id, component));
        }

        self.storage.apply_updates(batch);
        new_entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{system, system_dev, system_readonly};
    use crate::result::ReturnValue;

    #[derive(Clone, Debug, PartialEq)]
    struct Count(i32);

    #[test]
    fn spawn_and_read_out_of_tick() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);
        assert_eq!(world.get_copy::<Count>(e).unwrap(), Count(0));
    }

    #[tokio::test]
    async fn own_writes_visible_within_one_system_then_committed() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);

        let descriptor = system("writer")
            .reads(AccessPattern::types([TypeId::of::<Count>()]))
            .writes(AccessPattern::types([TypeId::of::<Count>()]))
            .run_sync(move |access| {
                access.update(e, Count(1))?;
                let seen = access.get::<Count>(e)?;
                assert_eq!(seen, Count(1));
                Ok(ReturnValue::Empty)
            })
            .build();

        let result = world.execute_system(descriptor).await.unwrap();
        world.apply_result(result);
        assert_eq!(world.get_copy::<Count>(e).unwrap(), Count(1));
    }

    #[tokio::test]
    async fn access_violation_fails_before_commit() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);

        #[derive(Clone, Debug, PartialEq)]
        struct Label(String);

        let descriptor = system("bad_reader")
            .reads(AccessPattern::types([TypeId::of::<Count>()]))
            .writes(AccessPattern::types([TypeId::of::<Count>()]))
            .run_sync(move |access| {
                let _ = access.get::<Label>(e)?;
                Ok(ReturnValue::Empty)
            })
            .build();

        let err = world.execute_system(descriptor).await.unwrap_err();
        assert!(matches!(err, EcsError::AccessViolation { .. }));
    }

    #[tokio::test]
    async fn return_value_writes_are_validated_against_descriptor() {
        let world = World::new();
        let e = world.spawn(vec![]);

        let descriptor = system_readonly("sneaky")
            .reads(AccessPattern::types([TypeId::of::<Count>()]))
            .run_sync(move |_| Ok(ReturnValue::Updates(vec![(e, TypeId::of::<Count>(), Box::new(Count(5)))])))
            .build();

        let err = world.execute_system(descriptor).await.unwrap_err();
        assert!(matches!(err, EcsError::AccessViolation { .. }));
    }

    #[test]
    fn merge_entities_out_of_tick_uses_combinable_and_handling() {
        #[derive(Clone, Debug, PartialEq)]
        struct Position(f64, f64);
        impl crate::component::Combinable for Position {
            fn combine(self, other: Self) -> Self {
                Position((self.0 + other.0) / 2.0, (self.1 + other.1) / 2.0)
            }
        }
        crate::component::registry().register_combinable::<Position>();

        #[derive(Clone, Debug, PartialEq)]
        struct Tag(String);

        let world = World::new();
        let a = world.spawn(vec![
            (TypeId::of::<Position>(), Box::new(Position(0.0, 0.0))),
            (TypeId::of::<Tag>(), Box::new(Tag("alice".into()))),
        ]);
        let b = world.spawn(vec![
            (TypeId::of::<Position>(), Box::new(Position(10.0, 20.0))),
            (TypeId::of::<Tag>(), Box::new(Tag("bob".into()))),
        ]);

        let merged = world.merge_entities(a, b, NonMergeableHandling::Second).unwrap();
        assert_eq!(world.get_copy::<Position>(merged).unwrap(), Position(5.0, 10.0));
        assert_eq!(world.get_copy::<Tag>(merged).unwrap(), Tag("bob".to_string()));
        assert!(!world.storage().entity_exists(a));
        assert!(!world.storage().entity_exists(b));
    }

    #[test]
    fn split_entity_out_of_tick_uses_splittable_and_independent_copies() {
        #[derive(Clone, Debug, PartialEq)]
        struct Credits(i64);
        impl crate::component::Splittable for Credits {
            fn split(self) -> (Self, Self) {
                (Credits(self.0 / 2), Credits(self.0 / 2))
            }
        }
        crate::component::registry().register_splittable::<Credits>();

        #[derive(Clone, Debug, PartialEq)]
        struct Health(i64);

        let world = World::new();
        let e = world.spawn(vec![
            (TypeId::of::<Credits>(), Box::new(Credits(100))),
            (TypeId::of::<Health>(), Box::new(Health(100))),
        ]);

        let (left, right) = world.split_entity(e, NonSplittableHandling::Both).unwrap();
        assert_eq!(world.get_copy::<Credits>(left).unwrap(), Credits(50));
        assert_eq!(world.get_copy::<Credits>(right).unwrap(), Credits(50));
        assert_eq!(world.get_copy::<Health>(left).unwrap(), Health(100));
        assert_eq!(world.get_copy::<Health>(right).unwrap(), Health(100));

        world.set::<Health>(left, Health(1));
        assert_eq!(world.get_copy::<Health>(right).unwrap(), Health(100));
    }

    #[tokio::test]
    async fn dev_system_runs_in_isolation_before_normal_group_in_a_manual_two_group_tick() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);

        let dev = system_dev("dev_increment")
            .run_sync(move |access| {
                let current = access.get::<Count>(e)?;
                access.update(e, Count(current.0 + 1))?;
                Ok(ReturnValue::Empty)
            })
            .build();
        let dev_result = world.execute_system(dev).await.unwrap();
        world.apply_result(dev_result);

        let normal = system("normal_add_ten")
            .reads(AccessPattern::types([TypeId::of::<Count>()]))
            .writes(AccessPattern::types([TypeId::of::<Count>()]))
            .run_sync(move |access| {
                let current = access.get::<Count>(e)?;
                access.update(e, Count(current.0 + 10))?;
                Ok(ReturnValue::Empty)
            })
            .build();
        let normal_result = world.execute_system(normal).await.unwrap();
        world.apply_result(normal_result);

        assert_eq!(world.get_copy::<Count>(e).unwrap(), Count(11));
    }
}
