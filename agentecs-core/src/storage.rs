//! Storage protocol and the default in-process backend.
//!
//! `Storage` is implemented against `Box<dyn Component>` values keyed by
//! `(EntityId, TypeId)`. The default [`LocalStorage`] backend is a plain
//! `HashMap`-of-`HashMap`s behind a single [`parking_lot::RwLock`]; it is
//! not lock-free and is not meant to be swapped under a running tick (see
//! spec invariant: storage is mutated only at commit).

use std::any::TypeId;

use fxhash::FxHashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::component::Component;
use crate::entity::EntityId;

/// Errors raised by the storage layer itself (as opposed to access-control
/// errors, which live in `ScopedAccess`/`World`).
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("entity {0} does not exist")]
    EntityMissing(EntityId),
    #[cfg(feature = "serialize")]
    #[error("component type {0:?} has no registered serializer")]
    Unserializable(TypeId),
    #[cfg(feature = "serialize")]
    #[error("snapshot references unknown component type id {0}")]
    UnknownComponentTypeId(u64),
    #[cfg(feature = "serialize")]
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),
}

/// The set of component types an entity currently carries, and their
/// values. Small by convention (agents rarely carry more than a handful of
/// component types), hence `SmallVec`.
pub type ComponentRow = SmallVec<[(TypeId, Box<dyn Component>); 8]>;

/// The inputs to a single bulk commit: every update, insert, remove, and
/// destroy a tick produced, batched for one atomic apply.
#[derive(Default)]
pub struct BulkUpdate {
    pub updates: Vec<(EntityId, TypeId, Box<dyn Component>)>,
    pub inserts: Vec<(EntityId, TypeId, Box<dyn Component>)>,
    pub removes: Vec<(EntityId, TypeId)>,
    pub destroys: Vec<EntityId>,
}

/// Replaceable storage backend.
///
/// `get` always returns a deep copy; callers that need to avoid a clone use
/// [`Storage::with_component_ref`], which scopes reference access to a
/// closure instead of handing out a bare reference across a lock boundary.
pub trait Storage: Send + Sync {
    fn create_entity(&self, entity: EntityId);
    fn destroy_entity(&self, entity: EntityId);
    fn entity_exists(&self, entity: EntityId) -> bool;
    fn all_entities(&self) -> Vec<EntityId>;

    fn get(&self, entity: EntityId, type_id: TypeId) -> Option<Box<dyn Component>>;
    fn with_component_ref(&self, entity: EntityId, type_id: TypeId, f: &mut dyn FnMut(&dyn Component));
    fn set(&self, entity: EntityId, type_id: TypeId, component: Box<dyn Component>);
    fn remove(&self, entity: EntityId, type_id: TypeId) -> Option<Box<dyn Component>>;
    fn has(&self, entity: EntityId, type_id: TypeId) -> bool;
    fn types_of(&self, entity: EntityId) -> Vec<TypeId>;

    /// Entities carrying every type in `required`, each with its full
    /// component row. Ordering is stable within one call but otherwise
    /// unspecified.
    fn iter(&self, required: &[TypeId]) -> Vec<(EntityId, ComponentRow)>;

    /// Apply a bulk update atomically with respect to other `Storage`
    /// callers (the default backend takes its single write lock for the
    /// whole batch). Returns nothing beyond success; new-entity allocation
    /// happens before this call, in `World::apply_result`.
    fn apply_updates(&self, batch: BulkUpdate);

    #[cfg(feature = "serialize")]
    fn snapshot(&self) -> Result<Vec<u8>, StorageError>;
    #[cfg(feature = "serialize")]
    fn restore(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Async variants of [`Storage`] with identical semantics. The default
/// backend implements them as direct delegates to the synchronous methods.
pub trait AsyncStorage: Storage {
    fn get_async<'a>(&'a self, entity: EntityId, type_id: TypeId) -> BoxFuture<'a, Option<Box<dyn Component>>> {
        Box::pin(futures::future::ready(self.get(entity, type_id)))
    }

    fn apply_updates_async<'a>(&'a self, batch: BulkUpdate) -> BoxFuture<'a, ()> {
        self.apply_updates(batch);
        Box::pin(futures::future::ready(()))
    }

    #[cfg(feature = "serialize")]
    fn snapshot_async<'a>(&'a self) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(futures::future::ready(self.snapshot()))
    }
}

impl<T: Storage + ?Sized> AsyncStorage for T {}

#[cfg(feature = "serialize")]
#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotRow {
    entity: EntityId,
    components: Vec<(u64, Vec<u8>)>,
}

#[cfg(feature = "serialize")]
#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    rows: Vec<SnapshotRow>,
}

/// Default in-process backend: a `HashMap<EntityId, ComponentRow>` behind
/// one lock.
#[derive(Default)]
pub struct LocalStorage {
    entities: RwLock<FxHashMap<EntityId, ComponentRow>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        LocalStorage::default()
    }
}

impl Storage for LocalStorage {
    fn create_entity(&self, entity: EntityId) {
        self.entities.write().entry(entity).or_insert_with(SmallVec::new);
    }

    fn destroy_entity(&self, entity: EntityId) {
        self.entities.write().remove(&entity);
    }

    fn entity_exists(&self, entity: EntityId) -> bool {
        self.entities.read().contains_key(&entity)
    }

    fn all_entities(&self) -> Vec<EntityId> {
        self.entities.read().keys().copied().collect()
    }

    fn get(&self, entity: EntityId, type_id: TypeId) -> Option<Box<dyn Component>> {
        let entities = self.entities.read();
        entities
            .get(&entity)
            .and_then(|row| row.iter().find(|(t, _)| *t == type_id))
            .map(|(_, c)| (**c).clone_boxed())
    }

    fn with_component_ref(&self, entity: EntityId, type_id: TypeId, f: &mut dyn FnMut(&dyn Component)) {
        if let Some(row) = self.entities.read().get(&entity) {
            if let Some((_, component)) = row.iter().find(|(t, _)| *t == type_id) {
                f(component.as_ref());
            }
        }
    }

    fn set(&self, entity: EntityId, type_id: TypeId, component: Box<dyn Component>) {
        let mut entities = self.entities.write();
        let row = entities.entry(entity).or_insert_with(SmallVec::new);
        match row.iter_mut().find(|(t, _)| *t == type_id) {
            Some((_, slot)) => *slot = component,
            None => row.push((type_id, component)),
        }
    }

    fn remove(&self, entity: EntityId, type_id: TypeId) -> Option<Box<dyn Component>> {
        let mut entities = self.entities.write();
        let row = entities.get_mut(&entity)?;
        let position = row.iter().position(|(t, _)| *t == type_id)?;
        Some(row.remove(position).1)
    }

    fn has(&self, entity: EntityId, type_id: TypeId) -> bool {
        self.entities
            .read()
            .get(&entity)
            .map(|row| row.iter().any(|(t, _)| *t == type_id))
            .unwrap_or(false)
    }

    fn types_of(&self, entity: EntityId) -> Vec<TypeId> {
        self.entities
            .read()
            .get(&entity)
            .map(|row| row.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default()
    }

    fn iter(&self, required: &[TypeId]) -> Vec<(EntityId, ComponentRow)> {
        let entities = self.entities.read();
        entities
            .iter()
            .filter(|(_, row)| required.iter().all(|t| row.iter().any(|(rt, _)| rt == t)))
            .map(|(entity, row)| {
                let cloned: ComponentRow = row.iter().map(|(t, c)| (*t, (**c).clone_boxed())).collect();
                (*entity, cloned)
            })
            .collect()
    }

    fn apply_updates(&self, batch: BulkUpdate) {
        let mut entities = self.entities.write();

        for entity in batch.destroys {
            entities.remove(&entity);
        }
        for (entity, type_id) in batch.removes {
            if let Some(row) = entities.get_mut(&entity) {
                if let Some(pos) = row.iter().position(|(t, _)| *t == type_id) {
                    row.remove(pos);
                }
            }
        }
        for (entity, type_id, component) in batch.inserts.into_iter().chain(batch.updates) {
            let row = entities.entry(entity).or_insert_with(SmallVec::new);
            match row.iter_mut().find(|(t, _)| *t == type_id) {
                Some((_, slot)) => *slot = component,
                None => row.push((type_id, component)),
            }
        }
    }

    #[cfg(feature = "serialize")]
    fn snapshot(&self) -> Result<Vec<u8>, StorageError> {
        let registry = crate::component::registry();
        let entities = self.entities.read();
        let mut rows = Vec::with_capacity(entities.len());

        for (entity, row) in entities.iter() {
            let mut components = Vec::with_capacity(row.len());
            for (type_id, component) in row.iter() {
                let meta = registry
                    .meta_of_type_id(*type_id)
                    .ok_or(StorageError::Unserializable(*type_id))?;
                let bytes = registry
                    .serialize_dyn(*type_id, component.as_ref())
                    .ok_or(StorageError::Unserializable(*type_id))?;
                components.push((meta.component_type_id, bytes));
            }
            rows.push(SnapshotRow { entity: *entity, components });
        }

        bincode::serialize(&SnapshotFile { rows }).map_err(StorageError::Decode)
    }

    #[cfg(feature = "serialize")]
    fn restore(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let registry = crate::component::registry();
        let file: SnapshotFile = bincode::deserialize(bytes).map_err(StorageError::Decode)?;

        let mut entities = self.entities.write();
        entities.clear();
        for row in file.rows {
            let mut components: ComponentRow = SmallVec::with_capacity(row.components.len());
            for (component_type_id, bytes) in row.components {
                let type_id = registry
                    .type_id_of(component_type_id)
                    .ok_or(StorageError::UnknownComponentTypeId(component_type_id))?;
                let component = registry
                    .deserialize_dyn(component_type_id, &bytes)
                    .ok_or(StorageError::Unserializable(type_id))?;
                components.push((type_id, component));
            }
            entities.insert(row.entity, components);
        }
        Ok(())
    }
}
