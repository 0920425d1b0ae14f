//! `SystemDescriptor`: the immutable record a tick uses to validate and
//! invoke one registered system.
//!
//! Built with the `system()` / `system_dev()` / `system_readonly()`
//! factory functions rather than a public struct literal, mirroring the
//! teacher's `SystemBuilder` entry points.

use std::any::TypeId;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::access::ScopedAccess;
use crate::error::EcsResult;
use crate::query::AccessPattern;
use crate::result::ReturnValue;

/// A registered system's callable, type-erased behind `Arc` so descriptors
/// are cheaply cloneable and shareable across a scheduler's execution
/// groups. Sync callables are adapted via [`SystemBuilder::run`]'s use of
/// `futures::future::ready`.
pub type SystemFn = Arc<dyn for<'a, 'w> Fn(&'a mut ScopedAccess<'w>) -> BoxFuture<'a, EcsResult<ReturnValue>> + Send + Sync>;

/// How a system's callable is invoked and what it's permitted to mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    /// Receives a full `ScopedAccess`; may buffer mutations directly and
    /// may also return a shorthand value merged into the buffer at exit.
    Interactive,
    /// Receives read-only access; all mutations must come through the
    /// returned value. Buffer writes are rejected.
    Pure,
    /// May not write at all, via buffer or return value.
    Readonly,
}

/// Immutable record of one registered system.
#[derive(Clone)]
pub struct SystemDescriptor {
    pub name: String,
    pub run: SystemFn,
    pub reads: AccessPattern,
    pub writes: AccessPattern,
    pub mode: SystemMode,
    pub is_async: bool,
    pub frequency: f64,
    pub phase: String,
    pub runs_alone: bool,
}

impl SystemDescriptor {
    pub fn can_read(&self, type_id: TypeId) -> bool {
        self.reads.allows(type_id) || self.writes.allows(type_id)
    }

    pub fn can_write(&self, type_id: TypeId) -> bool {
        self.mode != SystemMode::Readonly && self.writes.allows(type_id)
    }
}

/// Builder for [`SystemDescriptor`]s, started from [`system`], finished
/// with [`SystemBuilder::build`].
///
/// Defaulting rule for `reads`/`writes`: if both are left unset, both
/// become `All`; if only one is set, the other becomes `NoAccess` — there
/// is no implicit write access.
pub struct SystemBuilder {
    name: String,
    run: Option<SystemFn>,
    reads: Option<AccessPattern>,
    writes: Option<AccessPattern>,
    mode: SystemMode,
    is_async: bool,
    frequency: f64,
    phase: String,
    runs_alone: bool,
}

fn noop_run() -> SystemFn {
    Arc::new(|_access| Box::pin(futures::future::ready(Ok(ReturnValue::Empty))))
}

impl SystemBuilder {
    fn new(name: impl Into<String>) -> Self {
        SystemBuilder {
            name: name.into(),
            run: None,
            reads: None,
            writes: None,
            mode: SystemMode::Interactive,
            is_async: false,
            frequency: 1.0,
            phase: "update".to_string(),
            runs_alone: false,
        }
    }

    /// Attach a synchronous callable. `is_async` stays `false`.
    pub fn run_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ScopedAccess) -> EcsResult<ReturnValue> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(move |access| Box::pin(futures::future::ready(f(access)))));
        self.is_async = false;
        self
    }

    /// Attach an asynchronous callable. Sets `is_async = true`.
    pub fn run_async<F>(mut self, f: F) -> Self
    where
        F: for<'a, 'w> Fn(&'a mut ScopedAccess<'w>) -> BoxFuture<'a, EcsResult<ReturnValue>> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(f));
        self.is_async = true;
        self
    }

    pub fn reads(mut self, pattern: AccessPattern) -> Self {
        self.reads = Some(pattern);
        self
    }

    pub fn writes(mut self, pattern: AccessPattern) -> Self {
        self.writes = Some(pattern);
        self
    }

    pub fn mode(mut self, mode: SystemMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    /// Marks this system dev-mode: `runs_alone = true`, both patterns
    /// forced to `All` regardless of what was set earlier.
    pub fn dev(mut self) -> Self {
        self.runs_alone = true;
        self.reads = Some(AccessPattern::All);
        self.writes = Some(AccessPattern::All);
        self
    }

    /// Marks this system readonly: `mode = Readonly`, `writes = NoAccess`.
    pub fn readonly(mut self) -> Self {
        self.mode = SystemMode::Readonly;
        self.writes = Some(AccessPattern::NoAccess);
        self
    }

    pub fn build(self) -> SystemDescriptor {
        let (reads, writes) = match (self.reads, self.writes) {
            (None, None) => (AccessPattern::All, AccessPattern::All),
            (Some(r), None) => (r, AccessPattern::NoAccess),
            (None, Some(w)) => (AccessPattern::NoAccess, w),
            (Some(r), Some(w)) => (r, w),
        };

        if self.mode == SystemMode::Readonly && !matches!(writes, AccessPattern::NoAccess) {
            tracing::warn!(system = %self.name, "readonly system declared a non-empty write pattern; writes will still be rejected at runtime");
        }

        SystemDescriptor {
            name: self.name,
            run: self.run.unwrap_or_else(noop_run),
            reads,
            writes,
            mode: self.mode,
            is_async: self.is_async,
            frequency: self.frequency,
            phase: self.phase,
            runs_alone: self.runs_alone,
        }
    }
}

/// Start building a system descriptor named `name`.
pub fn system(name: impl Into<String>) -> SystemBuilder {
    SystemBuilder::new(name)
}

/// Shorthand for `system(name).dev()`.
pub fn system_dev(name: impl Into<String>) -> SystemBuilder {
    system(name).dev()
}

/// Shorthand for `system(name).readonly()`.
pub fn system_readonly(name: impl Into<String>) -> SystemBuilder {
    system(name).readonly()
}
