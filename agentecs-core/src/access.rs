//! `ScopedAccess`: the per-system world view handed to a running system.
//!
//! Enforces the system's declared read/write pattern, serves snapshot-
//! isolated reads layered over the system's own buffered writes, and
//! records writes into a [`SystemResult`] that `World::apply_result`
//! commits at the end of the group.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};

use crate::component::Component;
use crate::descriptor::{SystemDescriptor, SystemMode};
use crate::entity::EntityId;
use crate::error::{AccessKind, EcsError, EcsResult};
use crate::result::{Op, SequencedOp, SystemResult};
use crate::world::World;

enum OverlayEntry {
    Present(Box<dyn Component>),
    Removed,
}

/// The world view passed to one system invocation.
///
/// Reads are "buffer-aware": they reflect this system's own writes so far
/// (own-writes-visible) but never another system's, because every
/// `ScopedAccess` owns an independent buffer over the same immutable
/// storage snapshot.
pub struct ScopedAccess<'w> {
    world: &'w World,
    descriptor: SystemDescriptor,
    buffer: SystemResult,
    overlay: HashMap<(EntityId, TypeId), OverlayEntry>,
    destroyed: HashSet<EntityId>,
    spawned: HashSet<EntityId>,
}

impl<'w> ScopedAccess<'w> {
    pub fn new(world: &'w World, descriptor: SystemDescriptor) -> Self {
        ScopedAccess {
            world,
            descriptor,
            buffer: SystemResult::new(),
            overlay: HashMap::new(),
            destroyed: HashSet::new(),
            spawned: HashSet::new(),
        }
    }

    pub fn descriptor(&self) -> &SystemDescriptor {
        &self.descriptor
    }

    /// Consume this access, returning the buffer it accumulated. Called by
    /// `World::execute_system` once the system callable has returned.
    pub fn into_buffer(self) -> SystemResult {
        self.buffer
    }

    fn resolve(&self, entity: EntityId, type_id: TypeId) -> Option<Box<dyn Component>> {
        match self.overlay.get(&(entity, type_id)) {
            Some(OverlayEntry::Present(component)) => Some((**component).clone_boxed()),
            Some(OverlayEntry::Removed) => None,
            None => self.world.storage().get(entity, type_id),
        }
    }

    fn row_of(&self, entity: EntityId) -> Vec<(TypeId, Box<dyn Component>)> {
        let mut types: HashSet<TypeId> = self.world.storage().types_of(entity).into_iter().collect();
        for (key, entry) in self.overlay.iter() {
            if key.0 != entity {
                continue;
            }
            match entry {
                OverlayEntry::Present(_) => {
                    types.insert(key.1);
                }
                OverlayEntry::Removed => {
                    types.remove(&key.1);
                }
            }
        }
        types
            .into_iter()
            .filter_map(|type_id| self.resolve(entity, type_id).map(|c| (type_id, c)))
            .collect()
    }

    fn check_read(&self, type_id: TypeId) -> EcsResult<()> {
        if self.descriptor.can_read(type_id) {
            Ok(())
        } else {
            Err(EcsError::AccessViolation { system: self.descriptor.name.clone(), type_id, attempted: AccessKind::Read })
        }
    }

    fn check_write(&self, type_id: TypeId) -> EcsResult<()> {
        if self.descriptor.mode == SystemMode::Pure {
            return Err(EcsError::AccessViolation { system: self.descriptor.name.clone(), type_id, attempted: AccessKind::Write });
        }
        if self.descriptor.can_write(type_id) {
            Ok(())
        } else {
            Err(EcsError::AccessViolation { system: self.descriptor.name.clone(), type_id, attempted: AccessKind::Write })
        }
    }

    // --- Read API ---------------------------------------------------

    pub fn get<T: Component>(&self, entity: EntityId) -> EcsResult<T> {
        let type_id = TypeId::of::<T>();
        self.check_read(type_id)?;
        if self.destroyed.contains(&entity) {
            return Err(EcsError::EntityMissing { entity, type_id });
        }
        let component = self.resolve(entity, type_id).ok_or(EcsError::EntityMissing { entity, type_id })?;
        Ok(*component.downcast::<T>().ok().expect("component type mismatch"))
    }

    pub fn has<T: Component>(&self, entity: EntityId) -> bool {
        let type_id = TypeId::of::<T>();
        if self.destroyed.contains(&entity) {
            return false;
        }
        match self.overlay.get(&(entity, type_id)) {
            Some(OverlayEntry::Present(_)) => true,
            Some(OverlayEntry::Removed) => false,
            None => self.world.storage().has(entity, type_id),
        }
    }

    /// Entities carrying every type in `required`, with each entity's
    /// component values resolved through this system's buffer.
    pub fn query(&self, required: &[TypeId]) -> EcsResult<Vec<(EntityId, Vec<(TypeId, Box<dyn Component>)>)>> {
        for type_id in required {
            self.check_read(*type_id)?;
        }

        let mut candidates: HashSet<EntityId> =
            self.world.storage().iter(required).into_iter().map(|(e, _)| e).collect();
        candidates.extend(self.spawned.iter().copied());

        let mut out = Vec::new();
        for entity in candidates {
            if self.destroyed.contains(&entity) {
                continue;
            }
            let mut row = Vec::with_capacity(required.len());
            let mut disqualified = false;
            for type_id in required {
                match self.resolve(entity, *type_id) {
                    Some(component) => row.push((*type_id, component)),
                    None => {
                        disqualified = true;
                        break;
                    }
                }
            }
            if !disqualified {
                out.push((entity, row));
            }
        }
        Ok(out)
    }

    pub fn entities(&self) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .world
            .storage()
            .all_entities()
            .into_iter()
            .filter(|e| !self.destroyed.contains(e))
            .collect();
        for spawned in &self.spawned {
            if !self.destroyed.contains(spawned) {
                out.push(*spawned);
            }
        }
        out
    }

    pub fn entity_exists(&self, entity: EntityId) -> bool {
        if self.destroyed.contains(&entity) {
            return false;
        }
        self.world.storage().entity_exists(entity) || self.spawned.contains(&entity)
    }

    pub fn singleton<T: Component>(&self) -> EcsResult<T> {
        self.get::<T>(crate::entity::well_known::WORLD)
    }

    pub fn entity(&mut self, id: EntityId) -> EntityHandle<'_, 'w> {
        EntityHandle { access: self, entity: id }
    }

    // --- Write API ---------------------------------------------------

    pub fn update<T: Component>(&mut self, entity: EntityId, component: T) -> EcsResult<()> {
        let type_id = TypeId::of::<T>();
        self.check_write(type_id)?;
        let overlay_copy = component.clone_boxed();
        self.buffer.record_update(entity, component);
        self.overlay.insert((entity, type_id), OverlayEntry::Present(overlay_copy));
        Ok(())
    }

    pub fn update_singleton<T: Component>(&mut self, component: T) -> EcsResult<()> {
        self.update(crate::entity::well_known::WORLD, component)
    }

    pub fn insert<T: Component>(&mut self, entity: EntityId, component: T) -> EcsResult<()> {
        let type_id = TypeId::of::<T>();
        self.check_write(type_id)?;
        let overlay_copy = component.clone_boxed();
        self.buffer.record_insert(entity, component);
        self.overlay.insert((entity, type_id), OverlayEntry::Present(overlay_copy));
        Ok(())
    }

    pub fn remove<T: Component>(&mut self, entity: EntityId) -> EcsResult<()> {
        let type_id = TypeId::of::<T>();
        self.check_write(type_id)?;
        self.buffer.record_remove::<T>(entity);
        self.overlay.insert((entity, type_id), OverlayEntry::Removed);
        Ok(())
    }

    /// Spawn a new entity, returning a provisional `EntityId` valid only
    /// for the remainder of this system's execution.
    pub fn spawn(&mut self, components: Vec<(TypeId, Box<dyn Component>)>) -> EcsResult<EntityId> {
        for (type_id, _) in &components {
            self.check_write(*type_id)?;
        }
        let provisional = self.buffer.record_spawn(components);
        self.spawned.insert(provisional);
        if let Some(SequencedOp { op: Op::Spawn { components, .. }, .. }) = self.buffer.ops().last() {
            for (type_id, component) in components {
                self.overlay.insert((provisional, *type_id), OverlayEntry::Present((**component).clone_boxed()));
            }
        }
        Ok(provisional)
    }

    pub fn destroy(&mut self, entity: EntityId) {
        self.buffer.record_destroy(entity);
        self.destroyed.insert(entity);
    }

    /// Merge `a` and `b` into a freshly spawned (provisional) entity using
    /// each shared component type's `Combinable` impl, or last-writer-wins
    /// (treating `b` as later) where neither implements it. Destroys both
    /// inputs.
    pub fn merge_entities(&mut self, a: EntityId, b: EntityId) -> EcsResult<EntityId> {
        if !self.entity_exists(a) {
            return Err(EcsError::NoSuchEntity(a));
        }
        if !self.entity_exists(b) {
            return Err(EcsError::NoSuchEntity(b));
        }

        let row_a = self.row_of(a);
        let row_b = self.row_of(b);
        let registry = crate::component::registry();

        let mut by_type: HashMap<TypeId, Box<dyn Component>> = row_a.into_iter().collect();
        for (type_id, value_b) in row_b {
            match by_type.remove(&type_id) {
                Some(value_a) => {
                    by_type.insert(type_id, registry.combine_dyn(type_id, value_a, value_b));
                }
                None => {
                    by_type.insert(type_id, value_b);
                }
            }
        }

        let merged = self.spawn(by_type.into_iter().collect())?;
        self.destroy(a);
        self.destroy(b);
        Ok(merged)
    }

    /// Split `e` into two freshly spawned (provisional) entities using each
    /// component type's `Splittable` impl, or independent deep copies where
    /// it is not implemented. Destroys `e`.
    pub fn split_entity(&mut self, e: EntityId) -> EcsResult<(EntityId, EntityId)> {
        if !self.entity_exists(e) {
            return Err(EcsError::NoSuchEntity(e));
        }

        let row = self.row_of(e);
        let registry = crate::component::registry();
        let mut left = Vec::with_capacity(row.len());
        let mut right = Vec::with_capacity(row.len());
        for (type_id, value) in row {
            let (l, r) = registry.split_dyn(type_id, value);
            left.push((type_id, l));
            right.push((type_id, r));
        }

        let left_id = self.spawn(left)?;
        let right_id = self.spawn(right)?;
        self.destroy(e);
        Ok((left_id, right_id))
    }
}

/// Convenience handle bound to one entity, returned by
/// [`ScopedAccess::entity`], so repeated per-component access doesn't need
/// to re-pass the entity id each time.
pub struct EntityHandle<'a, 'w> {
    access: &'a mut ScopedAccess<'w>,
    entity: EntityId,
}

impl<'a, 'w> EntityHandle<'a, 'w> {
    pub fn get<T: Component>(&self) -> EcsResult<T> {
        self.access.get::<T>(self.entity)
    }

    pub fn set<T: Component>(&mut self, component: T) -> EcsResult<()> {
        self.access.update(self.entity, component)
    }

    pub fn remove<T: Component>(&mut self) -> EcsResult<()> {
        self.access.remove::<T>(self.entity)
    }

    pub fn contains<T: Component>(&self) -> bool {
        self.access.has::<T>(self.entity)
    }

    pub fn id(&self) -> EntityId {
        self.entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{system, system_readonly};
    use crate::query::AccessPattern;
    use crate::world::World;

    #[derive(Clone, Debug, PartialEq)]
    struct Count(i32);

    impl crate::component::Combinable for Count {
        fn combine(self, other: Self) -> Self {
            Count(self.0 + other.0)
        }
    }

    fn all_access(name: &str) -> SystemDescriptor {
        system(name).reads(AccessPattern::All).writes(AccessPattern::All).build()
    }

    #[test]
    fn own_write_is_visible_to_later_read_in_same_system() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);
        let mut access = ScopedAccess::new(&world, all_access("writer"));
        access.update(e, Count(1)).unwrap();
        assert_eq!(access.get::<Count>(e).unwrap(), Count(1));
    }

    #[test]
    fn read_outside_declared_pattern_is_an_access_violation() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);
        let descriptor = system_readonly("inspector").build();
        let access = ScopedAccess::new(&world, descriptor);
        let err = access.get::<Count>(e).unwrap_err();
        assert!(matches!(err, EcsError::AccessViolation { .. }));
    }

    #[test]
    fn readonly_system_cannot_write() {
        let world = World::new();
        let e = world.spawn(vec![]);
        let descriptor = system_readonly("inspector").reads(AccessPattern::types([TypeId::of::<Count>()])).build();
        let mut access = ScopedAccess::new(&world, descriptor);
        let err = access.update(e, Count(1)).unwrap_err();
        assert!(matches!(err, EcsError::AccessViolation { attempted: AccessKind::Write, .. }));
    }

    #[test]
    fn destroy_hides_entity_from_subsequent_reads() {
        let world = World::new();
        let e = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(0)))]);
        let mut access = ScopedAccess::new(&world, all_access("destroyer"));
        access.destroy(e);
        assert!(access.get::<Count>(e).is_err());
        assert!(!access.entity_exists(e));
    }

    #[test]
    fn spawned_entity_is_queryable_within_the_same_system() {
        let world = World::new();
        let mut access = ScopedAccess::new(&world, all_access("spawner"));
        let spawned = access.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(9)))]).unwrap();
        assert!(spawned.is_provisional());
        let rows = access.query(&[TypeId::of::<Count>()]).unwrap();
        assert!(rows.iter().any(|(e, _)| *e == spawned));
    }

    #[test]
    fn merge_uses_combinable_and_falls_back_to_last_writer_wins() {
        #[derive(Clone, Debug, PartialEq)]
        struct Tag(String);

        let world = World::new();
        let a = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(10)))]);
        let b = world.spawn(vec![(TypeId::of::<Count>(), Box::new(Count(32))), (TypeId::of::<Tag>(), Box::new(Tag("b".into())))]);

        crate::component::registry().register_combinable::<Count>();

        let mut access = ScopedAccess::new(&world, all_access("merger"));
        let merged = access.merge_entities(a, b).unwrap();
        assert!(!access.entity_exists(a));
        assert!(!access.entity_exists(b));
        assert!(access.entity_exists(merged));
    }
}
