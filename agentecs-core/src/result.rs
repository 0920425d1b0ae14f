//! `SystemResult`: the append-only, totally ordered mutation log a system
//! buffers during a tick and that the commit pipeline replays into storage.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};

use crate::component::Component;
use crate::entity::EntityId;
use crate::error::{EcsError, EcsResult};

/// One recorded mutation, tagged with the sequence number it was recorded
/// at. Sequence numbers are per-`SystemResult` and start at 0.
pub enum Op {
    Update { entity: EntityId, type_id: TypeId, component: Box<dyn Component> },
    Insert { entity: EntityId, type_id: TypeId, component: Box<dyn Component> },
    Remove { entity: EntityId, type_id: TypeId },
    Spawn { provisional: EntityId, components: Vec<(TypeId, Box<dyn Component>)> },
    Destroy { entity: EntityId },
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Update { entity, type_id, .. } => {
                f.debug_struct("Update").field("entity", entity).field("type_id", type_id).finish()
            }
            Op::Insert { entity, type_id, .. } => {
                f.debug_struct("Insert").field("entity", entity).field("type_id", type_id).finish()
            }
            Op::Remove { entity, type_id } => {
                f.debug_struct("Remove").field("entity", entity).field("type_id", type_id).finish()
            }
            Op::Spawn { provisional, components } => f
                .debug_struct("Spawn")
                .field("provisional", provisional)
                .field("type_count", &components.len())
                .finish(),
            Op::Destroy { entity } => f.debug_struct("Destroy").field("entity", entity).finish(),
        }
    }
}

/// An op plus the sequence number it was recorded at.
#[derive(Debug)]
pub struct SequencedOp {
    pub seq: u64,
    pub op: Op,
}

/// Raised by a `record_*` call given a null-equivalent input, or by a
/// normalization helper given an unrecognized shorthand shape.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed system return value: {0}")]
pub struct MalformedReturn(pub String);

/// Shorthand value a system callable may return instead of (or alongside)
/// buffering writes directly through `ScopedAccess`. `PURE` systems must
/// express every mutation this way, since their buffer rejects writes.
pub enum ReturnValue {
    /// Nothing to merge.
    Empty,
    /// A fully formed result, merged into the system's buffer as-is.
    Result(SystemResult),
    /// `(entity, type, component)` triples, each recorded as an update.
    /// Collapses every map- and list-shaped shorthand a caller might reach
    /// for (`{entity: {type: component}}`, `{entity: component}`,
    /// `[(entity, component)]`) into one explicit shape, since a statically
    /// typed return value has to name the component type up front.
    Updates(Vec<(EntityId, TypeId, Box<dyn Component>)>),
}

/// Normalize a system's shorthand return value into a canonical
/// `SystemResult`, ready to merge into the system's buffer.
pub fn normalize_result(value: ReturnValue) -> SystemResult {
    match value {
        ReturnValue::Empty => SystemResult::new(),
        ReturnValue::Result(result) => result,
        ReturnValue::Updates(updates) => {
            let mut result = SystemResult::new();
            for (entity, type_id, component) in updates {
                result.record_update_dyn(entity, type_id, component);
            }
            result
        }
    }
}

/// The mutation buffer a system writes into during its execution.
///
/// Ops are stored in recorded order and never reordered or dropped by
/// `SystemResult` itself; folding/last-writer-wins collapsing happens only
/// in the derived projections (`updates()` etc.) and at commit time in
/// `World::apply_result`.
#[derive(Default)]
pub struct SystemResult {
    ops: Vec<SequencedOp>,
    next_seq: u64,
    next_provisional_index: i64,
}

impl SystemResult {
    pub fn new() -> Self {
        SystemResult::default()
    }

    fn push(&mut self, op: Op) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push(SequencedOp { seq, op });
    }

    pub fn record_update<T: Component>(&mut self, entity: EntityId, component: T) {
        self.push(Op::Update { entity, type_id: TypeId::of::<T>(), component: Box::new(component) });
    }

    pub fn record_update_dyn(&mut self, entity: EntityId, type_id: TypeId, component: Box<dyn Component>) {
        self.push(Op::Update { entity, type_id, component });
    }

    pub fn record_insert<T: Component>(&mut self, entity: EntityId, component: T) {
        self.push(Op::Insert { entity, type_id: TypeId::of::<T>(), component: Box::new(component) });
    }

    pub fn record_insert_dyn(&mut self, entity: EntityId, type_id: TypeId, component: Box<dyn Component>) {
        self.push(Op::Insert { entity, type_id, component });
    }

    pub fn record_remove<T: Component>(&mut self, entity: EntityId) {
        self.push(Op::Remove { entity, type_id: TypeId::of::<T>() });
    }

    pub fn record_remove_dyn(&mut self, entity: EntityId, type_id: TypeId) {
        self.push(Op::Remove { entity, type_id });
    }

    /// Record a spawn with the given components, returning a provisional
    /// `EntityId` whose negative index encodes "the k-th queued spawn in
    /// this buffer". Duplicate component types in `components` keep only
    /// the last occurrence.
    pub fn record_spawn(&mut self, mut components: Vec<(TypeId, Box<dyn Component>)>) -> EntityId {
        let mut seen = HashMap::new();
        let mut deduped: Vec<(TypeId, Box<dyn Component>)> = Vec::with_capacity(components.len());
        for (type_id, component) in components.drain(..) {
            if let Some(existing_index) = seen.get(&type_id).copied() {
                tracing::warn!(?type_id, "duplicate component type in spawn call, keeping last");
                deduped[existing_index] = (type_id, component);
            } else {
                seen.insert(type_id, deduped.len());
                deduped.push((type_id, component));
            }
        }

        self.next_provisional_index -= 1;
        let provisional = EntityId::new(0, self.next_provisional_index, 0);
        self.push(Op::Spawn { provisional, components: deduped });
        provisional
    }

    pub fn record_destroy(&mut self, entity: EntityId) {
        self.push(Op::Destroy { entity });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[SequencedOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<SequencedOp> {
        self.ops
    }

    /// Append `other`'s ops after self's, preserving each side's internal
    /// order, and renumbering `other`'s sequence numbers to continue from
    /// self's.
    pub fn merge(&mut self, other: SystemResult) {
        for sequenced in other.ops {
            self.push(sequenced.op);
        }
    }

    /// `updates()` collapsed to last-writer-wins per `(entity, type)`, for
    /// inspection/debugging. The underlying op list, not this projection,
    /// is what `World::apply_result` replays.
    pub fn updates(&self) -> HashMap<(EntityId, TypeId), &dyn Component> {
        let mut out = HashMap::new();
        for sequenced in &self.ops {
            if let Op::Update { entity, type_id, component } = &sequenced.op {
                out.insert((*entity, *type_id), component.as_ref());
            }
        }
        out
    }

    pub fn inserts(&self) -> HashMap<(EntityId, TypeId), &dyn Component> {
        let mut out = HashMap::new();
        for sequenced in &self.ops {
            if let Op::Insert { entity, type_id, component } = &sequenced.op {
                out.insert((*entity, *type_id), component.as_ref());
            }
        }
        out
    }

    pub fn removes(&self) -> Vec<(EntityId, TypeId)> {
        self.ops
            .iter()
            .filter_map(|s| match &s.op {
                Op::Remove { entity, type_id } => Some((*entity, *type_id)),
                _ => None,
            })
            .collect()
    }

    pub fn spawns(&self) -> Vec<EntityId> {
        self.ops
            .iter()
            .filter_map(|s| match &s.op {
                Op::Spawn { provisional, .. } => Some(*provisional),
                _ => None,
            })
            .collect()
    }

    pub fn destroys(&self) -> Vec<EntityId> {
        self.ops
            .iter()
            .filter_map(|s| match &s.op {
                Op::Destroy { entity } => Some(*entity),
                _ => None,
            })
            .collect()
    }

    /// `(entity, type)` pairs this buffer writes to via `Update`/`Insert`.
    /// Used by [`SystemResult::merge_with_strategy`] to detect cross-system
    /// write collisions before a scheduler commits a concurrent group.
    fn write_keys(&self) -> HashSet<(EntityId, TypeId)> {
        self.ops
            .iter()
            .filter_map(|s| match &s.op {
                Op::Update { entity, type_id, .. } | Op::Insert { entity, type_id, .. } => Some((*entity, *type_id)),
                _ => None,
            })
            .collect()
    }

    /// Merge `other` into self honoring `strategy` for any `(entity, type)`
    /// pair both sides wrote to via `Update`/`Insert`.
    ///
    /// A single system's own buffer never needs this (there's nothing to
    /// reconcile against); it exists for `agentecs-systems`'s `Scheduler`,
    /// which merges the buffers of every system in one concurrent execution
    /// group before handing the combined result to `World::apply_result`.
    pub fn merge_with_strategy(&mut self, other: SystemResult, strategy: MergeStrategy) -> EcsResult<()> {
        match strategy {
            MergeStrategy::MergeableFirst => {
                self.merge(other);
                Ok(())
            }
            MergeStrategy::LastWriterWins => {
                let incoming = other.write_keys();
                self.ops.retain(|s| match &s.op {
                    Op::Update { entity, type_id, .. } | Op::Insert { entity, type_id, .. } => {
                        !incoming.contains(&(*entity, *type_id))
                    }
                    _ => true,
                });
                self.merge(other);
                Ok(())
            }
            MergeStrategy::Error => {
                let mine = self.write_keys();
                let theirs = other.write_keys();
                if let Some((entity, type_id)) = mine.intersection(&theirs).next().copied() {
                    return Err(EcsError::ConflictError { entity, type_id });
                }
                self.merge(other);
                Ok(())
            }
        }
    }
}

/// How the commit pipeline reconciles two systems that wrote to the same
/// `(entity, type)` pair within one concurrent execution group.
///
/// Folding within a *single* system's own buffer, or through
/// `World::apply_result`'s default algorithm, always uses the
/// `Combinable`-or-last-writer-wins rule regardless of this setting;
/// `MergeStrategy` only governs how a scheduler reconciles *distinct*
/// systems' buffers before that commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Ignore `Combinable` entirely: whichever system ran later keeps its
    /// write outright.
    LastWriterWins,
    /// Fold through `Combinable` where registered, otherwise last-writer-
    /// wins. The default.
    MergeableFirst,
    /// Any overlapping write between two distinct systems in the group is a
    /// hard error, regardless of `Combinable`. Opt-in strict mode.
    Error,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::MergeableFirst
    }
}

impl std::fmt::Debug for SystemResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResult").field("op_count", &self.ops.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Count(i32);

    fn e(index: i64) -> EntityId {
        EntityId::new(0, index, 0)
    }

    #[test]
    fn sequence_numbers_start_at_zero_and_increase() {
        let mut r = SystemResult::new();
        r.record_update(e(1), Count(1));
        r.record_update(e(2), Count(2));
        r.record_destroy(e(3));
        let seqs: Vec<u64> = r.ops().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn empty_result_has_no_ops() {
        assert!(SystemResult::new().is_empty());
    }

    #[test]
    fn merge_preserves_left_then_right_order() {
        let mut left = SystemResult::new();
        left.record_update(e(1), Count(1));
        let mut right = SystemResult::new();
        right.record_update(e(2), Count(2));
        right.record_update(e(3), Count(3));

        left.merge(right);
        let entities: Vec<EntityId> = left
            .ops()
            .iter()
            .map(|s| match &s.op {
                Op::Update { entity, .. } => *entity,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(entities, vec![e(1), e(2), e(3)]);

        let seqs: Vec<u64> = left.ops().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn spawn_returns_distinct_decreasing_provisional_ids() {
        let mut r = SystemResult::new();
        let a = r.record_spawn(vec![(TypeId::of::<Count>(), Box::new(Count(1)))]);
        let b = r.record_spawn(vec![(TypeId::of::<Count>(), Box::new(Count(2)))]);
        assert!(a.is_provisional());
        assert!(b.is_provisional());
        assert_ne!(a, b);
        assert_eq!(a.index, -1);
        assert_eq!(b.index, -2);
    }

    #[test]
    fn duplicate_component_type_in_spawn_keeps_last() {
        let mut r = SystemResult::new();
        r.record_spawn(vec![
            (TypeId::of::<Count>(), Box::new(Count(1))),
            (TypeId::of::<Count>(), Box::new(Count(2))),
        ]);
        match &r.ops()[0].op {
            Op::Spawn { components, .. } => {
                assert_eq!(components.len(), 1);
                let c = components[0].1.downcast_ref::<Count>().unwrap();
                assert_eq!(*c, Count(2));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn updates_projection_collapses_to_last_writer_wins() {
        let mut r = SystemResult::new();
        r.record_update(e(1), Count(1));
        r.record_update(e(1), Count(2));
        let updates = r.updates();
        let c = updates.get(&(e(1), TypeId::of::<Count>())).unwrap();
        assert_eq!(c.downcast_ref::<Count>().unwrap(), &Count(2));
        // the underlying op list still has both writes
        assert_eq!(r.ops().len(), 2);
    }

    #[test]
    fn merge_with_strategy_error_rejects_overlapping_writes() {
        let mut a = SystemResult::new();
        a.record_update(e(1), Count(1));
        let mut b = SystemResult::new();
        b.record_update(e(1), Count(2));

        let err = a.merge_with_strategy(b, MergeStrategy::Error).unwrap_err();
        assert!(matches!(err, EcsError::ConflictError { .. }));
    }

    #[test]
    fn merge_with_strategy_last_writer_wins_drops_the_earlier_write() {
        let mut a = SystemResult::new();
        a.record_update(e(1), Count(1));
        a.record_update(e(2), Count(9));
        let mut b = SystemResult::new();
        b.record_update(e(1), Count(2));

        a.merge_with_strategy(b, MergeStrategy::LastWriterWins).unwrap();
        let remaining: Vec<EntityId> = a
            .ops()
            .iter()
            .filter_map(|s| match &s.op {
                Op::Update { entity, .. } => Some(*entity),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![e(2), e(1)]);
    }

    #[test]
    fn merge_with_strategy_mergeable_first_keeps_both_for_apply_result_to_fold() {
        let mut a = SystemResult::new();
        a.record_update(e(1), Count(1));
        let mut b = SystemResult::new();
        b.record_update(e(1), Count(2));

        a.merge_with_strategy(b, MergeStrategy::MergeableFirst).unwrap();
        assert_eq!(a.ops().len(), 2);
    }
}
