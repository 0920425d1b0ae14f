//! Entity identity and allocation.
//!
//! An [`EntityId`] is a `(shard, index, generation)` triple. `shard == 0` is
//! the local shard; other values are reserved for future cross-shard
//! execution (see spec Non-goals). Indices below [`RESERVED_COUNT`] are
//! reserved for well-known singletons and are never handed out by
//! [`EntityAllocator`].

use std::collections::HashMap;

/// First `RESERVED_COUNT` indices on every shard are reserved for
/// well-known singleton entities (`WORLD`, `CLOCK`, ...).
pub const RESERVED_COUNT: u32 = 1000;

/// Stable identifier for a single well-known singleton entity.
pub mod well_known {
    use super::EntityId;

    /// Holds world-level singleton components.
    pub const WORLD: EntityId = EntityId { shard: 0, index: 0, generation: 0 };
    /// Holds tick/clock singleton components.
    pub const CLOCK: EntityId = EntityId { shard: 0, index: 1, generation: 0 };
}

/// Generational entity handle.
///
/// Equality and hashing consider all three fields, so a recycled index with
/// a bumped generation never compares equal to its predecessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityId {
    pub shard: u32,
    pub index: i64,
    pub generation: u32,
}

impl EntityId {
    pub const fn new(shard: u32, index: i64, generation: u32) -> Self {
        EntityId { shard, index, generation }
    }

    /// `true` for shard 0, the only shard the local allocator can vouch for.
    pub fn is_local(&self) -> bool {
        self.shard == 0
    }

    /// `true` for a negative index: a provisional id minted by a
    /// [`crate::access::ScopedAccess::spawn`] call that hasn't been committed
    /// yet. Provisional ids are only meaningful within the system call that
    /// produced them.
    pub fn is_provisional(&self) -> bool {
        self.index < 0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.shard, self.index, self.generation)
    }
}

/// Error returned by [`EntityAllocator::deallocate`] for a foreign entity.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot deallocate entity {entity} from shard {entity_shard} on allocator for shard {local_shard}", entity = .entity, entity_shard = .entity.shard, local_shard = .local_shard)]
pub struct ShardMismatch {
    pub entity: EntityId,
    pub local_shard: u32,
}

/// Issues and recycles [`EntityId`]s for a single shard.
///
/// `allocate` is O(1) amortized: it pops a `(index, generation)` pair from a
/// free list before minting a fresh index. `deallocate` bumps the stored
/// generation so in-flight handles pointing at the old generation compare as
/// dead.
#[derive(Debug)]
pub struct EntityAllocator {
    shard: u32,
    next_index: i64,
    free_list: Vec<(i64, u32)>,
    generations: HashMap<i64, u32>,
}

impl EntityAllocator {
    pub fn new(shard: u32) -> Self {
        EntityAllocator {
            shard,
            next_index: i64::from(RESERVED_COUNT),
            free_list: Vec::new(),
            generations: HashMap::default(),
        }
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Allocate a fresh or recycled entity id.
    pub fn allocate(&mut self) -> EntityId {
        if let Some((index, generation)) = self.free_list.pop() {
            return EntityId::new(self.shard, index, generation);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.generations.insert(index, 0);
        EntityId::new(self.shard, index, 0)
    }

    /// Recycle `entity`'s index, bumping its generation for the next
    /// allocation to reuse.
    pub fn deallocate(&mut self, entity: EntityId) -> Result<(), ShardMismatch> {
        if entity.shard != self.shard {
            return Err(ShardMismatch { entity, local_shard: self.shard });
        }

        let next_generation = entity.generation.wrapping_add(1);
        self.generations.insert(entity.index, next_generation);
        self.free_list.push((entity.index, next_generation));
        Ok(())
    }

    /// `true` iff `entity` is on this shard and its generation matches the
    /// generation this allocator currently has on file for its index.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        if entity.shard != self.shard {
            return false;
        }
        self.generations.get(&entity.index) == Some(&entity.generation)
    }

    /// Mark a reserved index as alive without going through the normal
    /// allocation path. Used by `World` at startup to ensure the well-known
    /// singleton entities exist.
    pub fn reserve(&mut self, entity: EntityId) {
        debug_assert_eq!(entity.shard, self.shard);
        debug_assert!((entity.index as u64) < u64::from(RESERVED_COUNT));
        self.generations.insert(entity.index, entity.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_starts_after_reserved_range() {
        let mut alloc = EntityAllocator::new(0);
        let e = alloc.allocate();
        assert_eq!(e.index, i64::from(RESERVED_COUNT));
        assert!(alloc.is_alive(e));
    }

    #[test]
    fn deallocate_then_allocate_reuses_index_with_bumped_generation() {
        let mut alloc = EntityAllocator::new(0);
        let e = alloc.allocate();
        alloc.deallocate(e).unwrap();
        assert!(!alloc.is_alive(e));

        let reused = alloc.allocate();
        assert_eq!(reused.index, e.index);
        assert_eq!(reused.generation, e.generation + 1);
        assert!(alloc.is_alive(reused));
    }

    #[test]
    fn deallocate_rejects_foreign_shard() {
        let mut alloc = EntityAllocator::new(0);
        let foreign = EntityId::new(1, 5, 0);
        assert!(alloc.deallocate(foreign).is_err());
    }

    #[test]
    fn is_alive_false_for_never_seen_index() {
        let alloc = EntityAllocator::new(0);
        assert!(!alloc.is_alive(EntityId::new(0, 42, 0)));
    }

    #[test]
    fn foreign_shard_entity_never_alive_locally() {
        let mut alloc = EntityAllocator::new(0);
        let e = alloc.allocate();
        let mut other = EntityAllocator::new(1);
        assert!(!other.is_alive(e));
        let _ = other.allocate();
    }

    #[test]
    fn provisional_id_has_negative_index() {
        let id = EntityId::new(0, -1, 0);
        assert!(id.is_provisional());
        assert!(!EntityId::new(0, 0, 0).is_provisional());
    }
}
