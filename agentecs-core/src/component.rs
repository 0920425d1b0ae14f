//! Component type registry and the optional combine/split operation
//! protocols.
//!
//! Components are opaque, `'static + Send + Sync` user records. A component
//! type's id is derived deterministically from its fully qualified Rust type
//! name (module path + type name) so that independently started processes
//! agree on ids without coordination.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::OnceLock;

use downcast_rs::{impl_downcast, Downcast};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Implemented automatically for every component type.
pub trait Component: Any + Send + Sync + Downcast {
    /// Deep-clone this component into a new boxed instance. Used everywhere
    /// the runtime must hand out a copy instead of aliasing storage.
    fn clone_boxed(&self) -> Box<dyn Component>;
}
impl_downcast!(Component);

impl<T> Component for T
where
    T: Any + Send + Sync + Clone,
{
    fn clone_boxed(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }
}

/// A component type that knows how to fold two writes of itself together.
///
/// When multiple ops target the same `(entity, type)`, [`crate::world::World::apply_result`]
/// folds them with `combine` instead of discarding the earlier value
/// (last-writer-wins, the fallback for types that don't implement this).
pub trait Combinable: Component + Sized {
    fn combine(self, other: Self) -> Self;
}

/// A component type that knows how to split one instance into two, for
/// [`crate::world::World::split_entity`].
///
/// Types without a `Splittable` impl fall back to two independent deep
/// copies of the original value.
pub trait Splittable: Component + Sized {
    fn split(self) -> (Self, Self);
}

/// Metadata recorded for every registered component type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentTypeMeta {
    pub component_type_id: u64,
    pub type_name: String,
}

/// Deterministic id for a fully qualified component type name: the first 16
/// hex digits of its SHA-256 digest, interpreted as a big-endian `u64`.
///
/// Identical source-level type definitions yield identical ids on any host;
/// this is what lets two processes that loaded the same code exchange
/// snapshots without negotiating type ids.
pub fn stable_component_type_id(fully_qualified_name: &str) -> u64 {
    let digest = Sha256::digest(fully_qualified_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Raised when two distinct types derive the same component type id.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("component id collision: `{new_type}` and `{existing_type}` both hash to {id}")]
pub struct ComponentIdCollision {
    pub id: u64,
    pub new_type: String,
    pub existing_type: String,
}

type CombineFn = dyn Fn(Box<dyn Component>, Box<dyn Component>) -> Box<dyn Component> + Send + Sync;
type SplitFn = dyn Fn(Box<dyn Component>) -> (Box<dyn Component>, Box<dyn Component>) + Send + Sync;
#[cfg(feature = "serialize")]
type SerializeFn = dyn Fn(&dyn Component) -> Vec<u8> + Send + Sync;
#[cfg(feature = "serialize")]
type DeserializeFn = dyn Fn(&[u8]) -> Box<dyn Component> + Send + Sync;

/// Process-wide registry mapping component `TypeId`s to stable
/// [`ComponentTypeMeta`]. Registration is idempotent; a name collision
/// between two *different* types is a fatal, immediately surfaced error.
///
/// Also holds the type-erased `Combinable`/`Splittable` dispatch tables:
/// storage only ever sees `Box<dyn Component>`, so a type's combine/split
/// behavior must be looked up by `TypeId` rather than called directly.
#[derive(Default)]
pub struct ComponentRegistry {
    by_type: RwLock<HashMap<TypeId, ComponentTypeMeta>>,
    by_id: RwLock<HashMap<u64, TypeId>>,
    combine_fns: RwLock<HashMap<TypeId, Box<CombineFn>>>,
    split_fns: RwLock<HashMap<TypeId, Box<SplitFn>>>,
    #[cfg(feature = "serialize")]
    serialize_fns: RwLock<HashMap<TypeId, Box<SerializeFn>>>,
    #[cfg(feature = "serialize")]
    deserialize_fns: RwLock<HashMap<u64, Box<DeserializeFn>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `fully_qualified_name`, returning its metadata.
    ///
    /// Idempotent for a type already registered under the same name. Fails
    /// if the derived id already belongs to a different type.
    pub fn register<T: Component>(
        &self,
        fully_qualified_name: &str,
    ) -> Result<ComponentTypeMeta, ComponentIdCollision> {
        let type_id = TypeId::of::<T>();

        if let Some(meta) = self.by_type.read().get(&type_id) {
            return Ok(meta.clone());
        }

        let component_type_id = stable_component_type_id(fully_qualified_name);

        {
            let by_id = self.by_id.read();
            if let Some(existing_type_id) = by_id.get(&component_type_id) {
                if *existing_type_id != type_id {
                    let existing_name = self
                        .by_type
                        .read()
                        .get(existing_type_id)
                        .map(|m| m.type_name.clone())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    return Err(ComponentIdCollision {
                        id: component_type_id,
                        new_type: fully_qualified_name.to_string(),
                        existing_type: existing_name,
                    });
                }
            }
        }

        let meta = ComponentTypeMeta {
            component_type_id,
            type_name: fully_qualified_name.to_string(),
        };

        self.by_type.write().insert(type_id, meta.clone());
        self.by_id.write().insert(component_type_id, type_id);
        tracing::debug!(type_name = %meta.type_name, component_type_id, "registered component type");
        Ok(meta)
    }

    pub fn meta_of<T: Component>(&self) -> Option<ComponentTypeMeta> {
        self.by_type.read().get(&TypeId::of::<T>()).cloned()
    }

    pub fn is_registered<T: Component>(&self) -> bool {
        self.by_type.read().contains_key(&TypeId::of::<T>())
    }

    pub fn meta_of_type_id(&self, type_id: TypeId) -> Option<ComponentTypeMeta> {
        self.by_type.read().get(&type_id).cloned()
    }

    /// The concrete Rust `TypeId` a previously registered `component_type_id`
    /// maps to, if any.
    pub fn type_id_of(&self, component_type_id: u64) -> Option<TypeId> {
        self.by_id.read().get(&component_type_id).copied()
    }

    /// Record that `T` implements [`Combinable`], so dynamic combine calls
    /// against boxed components of this type dispatch to `T::combine`
    /// instead of falling back to last-writer-wins.
    pub fn register_combinable<T: Combinable>(&self) {
        self.combine_fns.write().insert(
            TypeId::of::<T>(),
            Box::new(|prior, new| {
                let prior = *prior.downcast::<T>().ok().expect("combine type mismatch");
                let new = *new.downcast::<T>().ok().expect("combine type mismatch");
                Box::new(prior.combine(new))
            }),
        );
    }

    /// Record that `T` implements [`Splittable`].
    pub fn register_splittable<T: Splittable>(&self) {
        self.split_fns.write().insert(
            TypeId::of::<T>(),
            Box::new(|value| {
                let value = *value.downcast::<T>().ok().expect("split type mismatch");
                let (a, b) = value.split();
                (Box::new(a) as Box<dyn Component>, Box::new(b) as Box<dyn Component>)
            }),
        );
    }

    /// Fold `prior` and `new` (both must be the same component type) using
    /// the registered `Combinable` impl, or last-writer-wins if none was
    /// registered for this type.
    pub fn combine_dyn(&self, type_id: TypeId, prior: Box<dyn Component>, new: Box<dyn Component>) -> Box<dyn Component> {
        match self.combine_fns.read().get(&type_id) {
            Some(f) => f(prior, new),
            None => new,
        }
    }

    /// Split `value` using the registered `Splittable` impl, or two
    /// independent deep copies if none was registered for this type.
    pub fn split_dyn(&self, type_id: TypeId, value: Box<dyn Component>) -> (Box<dyn Component>, Box<dyn Component>) {
        match self.split_fns.read().get(&type_id) {
            Some(f) => f(value),
            None => {
                let copy = value.clone_boxed();
                (value, copy)
            }
        }
    }

    /// `true` if `type_id` has a registered `Combinable` impl.
    pub fn combinable(&self, type_id: TypeId) -> bool {
        self.combine_fns.read().contains_key(&type_id)
    }

    /// `true` if `type_id` has a registered `Splittable` impl.
    pub fn splittable(&self, type_id: TypeId) -> bool {
        self.split_fns.read().contains_key(&type_id)
    }

    /// Record that `T` may be serialized into a snapshot, using `bincode`
    /// under the hood. Required for any component type that should survive
    /// `Storage::snapshot`/`restore`; types that never register here are
    /// simply absent from a restored world.
    #[cfg(feature = "serialize")]
    pub fn register_serializable<T>(&self)
    where
        T: Component + serde::Serialize + serde::de::DeserializeOwned,
    {
        let type_id = TypeId::of::<T>();
        self.serialize_fns.write().insert(
            type_id,
            Box::new(|value| {
                let value = value.downcast_ref::<T>().expect("serialize type mismatch");
                bincode::serialize(value).expect("component serialization failed")
            }),
        );

        let component_type_id = self
            .by_type
            .read()
            .get(&type_id)
            .map(|meta| meta.component_type_id)
            .expect("register component before register_serializable");

        self.deserialize_fns.write().insert(
            component_type_id,
            Box::new(|bytes| {
                let value: T = bincode::deserialize(bytes).expect("component deserialization failed");
                Box::new(value)
            }),
        );
    }

    #[cfg(feature = "serialize")]
    pub fn serializable_type_ids(&self) -> HashSetTypeIds {
        self.serialize_fns.read().keys().copied().collect()
    }

    #[cfg(feature = "serialize")]
    pub fn serialize_dyn(&self, type_id: TypeId, value: &dyn Component) -> Option<Vec<u8>> {
        self.serialize_fns.read().get(&type_id).map(|f| f(value))
    }

    #[cfg(feature = "serialize")]
    pub fn deserialize_dyn(&self, component_type_id: u64, bytes: &[u8]) -> Option<Box<dyn Component>> {
        self.deserialize_fns.read().get(&component_type_id).map(|f| f(bytes))
    }
}

#[cfg(feature = "serialize")]
type HashSetTypeIds = std::collections::HashSet<TypeId>;

static GLOBAL_REGISTRY: OnceLock<ComponentRegistry> = OnceLock::new();

/// Access the process-wide component registry.
pub fn registry() -> &'static ComponentRegistry {
    GLOBAL_REGISTRY.get_or_init(ComponentRegistry::new)
}

/// Register `T` in the global registry using `std::any::type_name::<T>()` as
/// its fully qualified name. Idempotent; panics on a genuine id collision
/// since that is always a programming error (two types sharing a name
/// hashes to the same id only if the registry is fed a bogus name).
pub fn register_component<T: Component>() -> ComponentTypeMeta {
    registry()
        .register::<T>(std::any::type_name::<T>())
        .expect("component id collision")
}

/// Fold two instances of the same component type using `Combinable::combine`
/// directly. Call sites that only have a concrete `T: Combinable` (not a
/// type-erased `Box<dyn Component>`) use this instead of going through the
/// registry's dynamic dispatch table.
pub fn combine<T: Combinable>(prior: T, new: T) -> T {
    prior.combine(new)
}

/// Split a component using `Splittable::split` directly, for call sites
/// holding a concrete `T: Splittable`.
pub fn split<T: Splittable>(value: T) -> (T, T) {
    value.split()
}
