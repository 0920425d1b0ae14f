//! Access pattern algebra: what a system reads and writes, and the query
//! shapes it can ask a [`crate::access::ScopedAccess`] for.
//!
//! An [`AccessPattern`] describes a system's declared footprint over
//! component types. The scheduler uses [`queries_disjoint`] (by way of
//! [`AccessPattern::disjoint_from`]) to decide which systems may run inside
//! the same concurrent execution group.

use std::any::TypeId;
use std::collections::HashSet;

/// A single query shape: entities that have every type in `required` and
/// none of the types in `excluded`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub required: Vec<TypeId>,
    pub excluded: Vec<TypeId>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn having(mut self, type_id: TypeId) -> Self {
        self.required.push(type_id);
        self
    }

    pub fn excluding(mut self, type_id: TypeId) -> Self {
        self.excluded.push(type_id);
        self
    }

    /// `true` if an entity carrying exactly `archetype` would be matched.
    pub fn matches_archetype(&self, archetype: &HashSet<TypeId>) -> bool {
        self.required.iter().all(|t| archetype.contains(t))
            && self.excluded.iter().all(|t| !archetype.contains(t))
    }

    fn touched_types(&self) -> HashSet<TypeId> {
        self.required.iter().chain(self.excluded.iter()).copied().collect()
    }
}

/// A system's declared read/write footprint over component types.
///
/// Ordered from broadest to narrowest; narrower patterns are easier for the
/// scheduler to run alongside other systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPattern {
    /// Reads and writes every component type. Never shares an execution
    /// group with any other system.
    All,
    /// Touches no component types at all (timers, external I/O bridges).
    /// Always disjoint from every other pattern.
    NoAccess,
    /// Reads and writes exactly this set of component types.
    Types(HashSet<TypeId>),
    /// Reads and writes exactly the types mentioned across this list of
    /// queries (both `required` and `excluded`, since excluded types are
    /// still inspected to decide membership).
    Queries(Vec<Query>),
}

impl AccessPattern {
    pub fn types(types: impl IntoIterator<Item = TypeId>) -> Self {
        AccessPattern::Types(types.into_iter().collect())
    }

    pub fn queries(queries: impl IntoIterator<Item = Query>) -> Self {
        AccessPattern::Queries(queries.into_iter().collect())
    }

    /// The concrete set of types this pattern touches. `None` for `All`,
    /// which by definition touches every type that exists, known or not.
    pub fn touched_types(&self) -> Option<HashSet<TypeId>> {
        match self {
            AccessPattern::All => None,
            AccessPattern::NoAccess => Some(HashSet::new()),
            AccessPattern::Types(types) => Some(types.clone()),
            AccessPattern::Queries(queries) => {
                Some(queries.iter().flat_map(Query::touched_types).collect())
            }
        }
    }

    /// `true` if `type_id` falls within this pattern's footprint.
    pub fn allows(&self, type_id: TypeId) -> bool {
        match self {
            AccessPattern::All => true,
            AccessPattern::NoAccess => false,
            AccessPattern::Types(types) => types.contains(&type_id),
            AccessPattern::Queries(queries) => {
                queries.iter().any(|q| q.touched_types().contains(&type_id))
            }
        }
    }

    /// `true` if two systems with these patterns cannot conflict and may
    /// run concurrently. `All` is never disjoint from anything, including
    /// itself; `NoAccess` is disjoint from everything, including itself.
    pub fn disjoint_from(&self, other: &AccessPattern) -> bool {
        queries_disjoint(self, other)
    }
}

/// Standalone form of [`AccessPattern::disjoint_from`].
pub fn queries_disjoint(a: &AccessPattern, b: &AccessPattern) -> bool {
    match (a, b) {
        (AccessPattern::All, _) | (_, AccessPattern::All) => false,
        (AccessPattern::NoAccess, _) | (_, AccessPattern::NoAccess) => true,
        _ => {
            let a_types = a.touched_types().unwrap_or_default();
            let b_types = b.touched_types().unwrap_or_default();
            a_types.is_disjoint(&b_types)
        }
    }
}
