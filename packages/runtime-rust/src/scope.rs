//! Thread-safe, lifecycle-bearing attribute scope.
//!
//! A [`Scope`] is shared across threads for its whole lifetime. Lifecycle
//! state lives in an atomic so state queries never block and teardown
//! callbacks can observe `InDestruction` re-entrantly. Attributes live in an
//! [`AttributeContainer`] behind a `parking_lot::RwLock`: queries take the
//! read lock, mutators and [`Scope::run_atomic`] take the write lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use scopes_core::{
    AttributeContainer, AttributeValue, Change, ScopeKind, ScopeObject, ScopeState, Value,
};
use serde::Serialize;

use crate::error::ScopeError;
use crate::listener::{guarded, FailureSource, LifecyclePhase, ListenerFailures};

/// Serializable point-in-time view of a scope, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub id: String,
    pub kind: ScopeKind,
    pub state: ScopeState,
    pub parent_id: Option<String>,
    /// Plain attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// Names of object attributes (objects themselves are not serializable).
    pub objects: Vec<String>,
}

/// Upper bound on destruction hook passes. Each pass runs the hooks of the
/// objects stored since the previous one.
const MAX_HOOK_PASSES: usize = 16;

fn same_object(a: &Arc<dyn ScopeObject>, b: &Arc<dyn ScopeObject>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A named attribute container with a monotonic lifecycle.
pub struct Scope {
    id: String,
    kind: ScopeKind,
    parent_id: Option<String>,
    state: AtomicU8,
    attributes: RwLock<AttributeContainer>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent_id", &self.parent_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Scope {
    /// Creates a scope in the `Constructed` state.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::EmptyId` if `id` is empty.
    pub fn new(
        kind: ScopeKind,
        id: impl Into<String>,
        parent_id: Option<String>,
    ) -> Result<Self, ScopeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ScopeError::EmptyId { kind });
        }
        Ok(Self {
            id,
            kind,
            parent_id,
            state: AtomicU8::new(ScopeState::Constructed.as_u8()),
            attributes: RwLock::new(AttributeContainer::new()),
        })
    }

    /// Creates and initializes a scope in one step, ready to be shared.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::EmptyId` if `id` is empty.
    pub fn new_valid(
        kind: ScopeKind,
        id: impl Into<String>,
        parent_id: Option<String>,
    ) -> Result<Arc<Self>, ScopeError> {
        let scope = Self::new(kind, id, parent_id)?;
        scope.init_scope()?;
        Ok(Arc::new(scope))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Id of the enclosing scope, for lookup only.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> ScopeState {
        // Only this module stores into `state`, always a valid discriminant.
        ScopeState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ScopeState::Destroyed)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() == ScopeState::Valid
    }

    #[must_use]
    pub fn is_in_destruction(&self) -> bool {
        self.state() == ScopeState::InDestruction
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state() == ScopeState::Destroyed
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Moves the scope from `Constructed` to `Valid`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInitialized` (or the matching destruction error) if the
    /// scope has left the `Constructed` state; the state is left unchanged.
    pub fn init_scope(&self) -> Result<(), ScopeError> {
        self.transition(ScopeState::Constructed, ScopeState::Valid)
            .map_err(|current| match current {
                ScopeState::InDestruction => self.in_destruction(),
                ScopeState::Destroyed => self.already_destroyed(),
                ScopeState::Constructed | ScopeState::Valid => ScopeError::AlreadyInitialized {
                    kind: self.kind,
                    id: self.id.clone(),
                },
            })?;
        tracing::trace!(kind = self.kind.as_str(), scope_id = %self.id, "scope initialized");
        Ok(())
    }

    /// Tears the scope down without lifecycle listeners.
    ///
    /// # Errors
    ///
    /// See [`destroy_scope_with`](Self::destroy_scope_with).
    pub fn destroy_scope(&self) -> Result<ListenerFailures, ScopeError> {
        self.destroy_scope_with(|_| ListenerFailures::new())
    }

    /// Tears the scope down: `Valid` -> `InDestruction` -> `Destroyed`.
    ///
    /// Exactly one caller wins the `Valid` -> `InDestruction` transition; every
    /// other call (concurrent, repeated, or re-entrant from a callback) returns
    /// an error without running any callback. The winner runs `on_end`, then
    /// every object attribute's `on_before_scope_destruction` hook, then every
    /// `on_scope_destruction` hook, and finally clears the attributes and marks
    /// the scope `Destroyed` under the write lock. Objects stored while the
    /// hooks run get their own hook pass before the clear. Callback failures
    /// never stop the teardown; they are returned.
    ///
    /// # Errors
    ///
    /// `InDestruction` or `AlreadyDestroyed` if another call got there first,
    /// `NotInitialized` if the scope was never initialized.
    pub fn destroy_scope_with<F>(&self, on_end: F) -> Result<ListenerFailures, ScopeError>
    where
        F: FnOnce(&Scope) -> ListenerFailures,
    {
        self.teardown(on_end, false).map(|(_, failures)| failures)
    }

    /// Like [`destroy_scope_with`](Self::destroy_scope_with), but every
    /// renewal-aware attribute is taken out of the scope after `on_end` and
    /// returned instead of being torn down; its destruction hooks never run.
    ///
    /// # Errors
    ///
    /// See [`destroy_scope_with`](Self::destroy_scope_with).
    pub fn destroy_scope_carrying<F>(
        &self,
        on_end: F,
    ) -> Result<(HashMap<String, AttributeValue>, ListenerFailures), ScopeError>
    where
        F: FnOnce(&Scope) -> ListenerFailures,
    {
        self.teardown(on_end, true)
    }

    fn teardown<F>(
        &self,
        on_end: F,
        carry_renewal_aware: bool,
    ) -> Result<(HashMap<String, AttributeValue>, ListenerFailures), ScopeError>
    where
        F: FnOnce(&Scope) -> ListenerFailures,
    {
        if let Err(current) = self.transition(ScopeState::Valid, ScopeState::InDestruction) {
            let err = match current {
                ScopeState::Constructed => ScopeError::NotInitialized {
                    kind: self.kind,
                    id: self.id.clone(),
                },
                ScopeState::InDestruction => self.in_destruction(),
                ScopeState::Valid | ScopeState::Destroyed => self.already_destroyed(),
            };
            tracing::debug!(
                kind = self.kind.as_str(),
                scope_id = %self.id,
                state = %current,
                "ignoring repeated scope destruction"
            );
            return Err(err);
        }

        let mut failures = on_end(self);
        let mut carried = HashMap::new();
        let mut hooked: Vec<Arc<dyn ScopeObject>> = Vec::new();
        let mut pass = 0;
        loop {
            pass += 1;
            let pending = {
                let mut attributes = self.attributes.write();
                if carry_renewal_aware {
                    carried.extend(attributes.take_renewal_aware());
                }
                let pending: Vec<(String, Arc<dyn ScopeObject>)> = attributes
                    .objects()
                    .into_iter()
                    .filter(|(_, object)| !hooked.iter().any(|h| same_object(h, object)))
                    .collect();
                if pending.is_empty() || pass > MAX_HOOK_PASSES {
                    if !pending.is_empty() {
                        tracing::warn!(
                            kind = self.kind.as_str(),
                            scope_id = %self.id,
                            skipped = pending.len(),
                            "destruction hooks kept storing new objects; clearing without their hooks"
                        );
                    }
                    attributes.clear();
                    self.state
                        .store(ScopeState::Destroyed.as_u8(), Ordering::Release);
                    break;
                }
                pending
            };

            for (name, object) in &pending {
                let hook = || object.on_before_scope_destruction(self.kind, &self.id);
                failures.extend(self.attribute_hook(name, hook));
            }
            for (name, object) in &pending {
                let hook = || object.on_scope_destruction(self.kind, &self.id);
                failures.extend(self.attribute_hook(name, hook));
            }
            hooked.extend(pending.into_iter().map(|(_, object)| object));
        }

        tracing::trace!(
            kind = self.kind.as_str(),
            scope_id = %self.id,
            failures = failures.len(),
            carried = carried.len(),
            "scope destroyed"
        );
        Ok((carried, failures))
    }

    fn attribute_hook<F>(&self, name: &str, hook: F) -> ListenerFailures
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let mut failures = ListenerFailures::new();
        let source = FailureSource::Attribute(name.to_string());
        if let Some(failure) = guarded(LifecyclePhase::End, self, source, hook) {
            failures.push(failure);
        }
        failures
    }

    fn transition(&self, from: ScopeState, to: ScopeState) -> Result<(), ScopeState> {
        debug_assert!(from.can_transition_to(to));
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|raw| ScopeState::from_u8(raw).unwrap_or(ScopeState::Destroyed))
    }

    fn in_destruction(&self) -> ScopeError {
        ScopeError::InDestruction {
            kind: self.kind,
            id: self.id.clone(),
        }
    }

    fn already_destroyed(&self) -> ScopeError {
        ScopeError::AlreadyDestroyed {
            kind: self.kind,
            id: self.id.clone(),
        }
    }

    /// Maps the current state to an access error, if attributes are off limits.
    fn check_access(&self, state: ScopeState) -> Result<(), ScopeError> {
        match state {
            ScopeState::Valid | ScopeState::InDestruction => Ok(()),
            ScopeState::Constructed => Err(ScopeError::NotInitialized {
                kind: self.kind,
                id: self.id.clone(),
            }),
            ScopeState::Destroyed => Err(self.already_destroyed()),
        }
    }

    // -----------------------------------------------------------------------
    // Atomic actions
    // -----------------------------------------------------------------------

    /// Runs `action` with exclusive access to the attributes.
    ///
    /// All `run_atomic` calls on one scope are mutually exclusive and apply in
    /// the order the write lock is granted. The lock is released on every
    /// exit path, including a panicking action.
    ///
    /// The action must not call back into locking methods of this scope
    /// (attribute accessors, `run_atomic`, `destroy_scope`); doing so
    /// deadlocks.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` / `AlreadyDestroyed` if attributes are not
    /// accessible.
    pub fn run_atomic<R, F>(&self, action: F) -> Result<R, ScopeError>
    where
        F: FnOnce(&mut AttributeContainer) -> R,
    {
        let mut attributes = self.attributes.write();
        self.check_access(self.state())?;
        Ok(action(&mut attributes))
    }

    /// Runs `reader` under the read lock; concurrent readers do not block
    /// each other.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` / `AlreadyDestroyed` if attributes are not
    /// accessible.
    pub fn with_attributes<R, F>(&self, reader: F) -> Result<R, ScopeError>
    where
        F: FnOnce(&AttributeContainer) -> R,
    {
        let attributes = self.attributes.read();
        self.check_access(self.state())?;
        Ok(reader(&attributes))
    }

    // -----------------------------------------------------------------------
    // Attribute access
    // -----------------------------------------------------------------------

    fn read<R>(&self, reader: impl FnOnce(&AttributeContainer) -> Option<R>) -> Option<R> {
        match self.with_attributes(reader) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(scope_id = %self.id, "attribute read refused: {err}");
                None
            }
        }
    }

    /// Returns the attribute, or `None` if absent or the scope is not accessible.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        self.read(|a| a.get(name).cloned())
    }

    #[must_use]
    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.read(|a| a.get_value(name).cloned())
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.read(|a| a.get_str(name).map(str::to_string))
    }

    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.read(|a| a.get_i64(name))
    }

    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.read(|a| a.get_f64(name))
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.read(|a| a.get_bool(name))
    }

    #[must_use]
    pub fn get_object<T: ScopeObject>(&self, name: &str) -> Option<Arc<T>> {
        self.read(|a| a.get_object::<T>(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read(|a| Some(a.contains(name))).unwrap_or(false)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read(|a| Some(a.names())).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read(|a| Some(a.len())).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores an attribute.
    ///
    /// # Errors
    ///
    /// `EmptyAttributeName`, or a state error if the scope is not accessible.
    pub fn set(
        &self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<Change, ScopeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ScopeError::EmptyAttributeName);
        }
        self.run_atomic(|a| a.set(name, value))
    }

    /// Stores several attributes under one write lock.
    ///
    /// # Errors
    ///
    /// `EmptyAttributeName` (nothing is stored), or a state error.
    pub fn set_all<I, K, V>(&self, attributes: I) -> Result<Change, ScopeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let entries: Vec<(String, AttributeValue)> = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if entries.iter().any(|(k, _)| k.is_empty()) {
            return Err(ScopeError::EmptyAttributeName);
        }
        self.run_atomic(|a| a.set_all(entries))
    }

    /// Removes an attribute.
    ///
    /// # Errors
    ///
    /// A state error if the scope is not accessible.
    pub fn remove(&self, name: &str) -> Result<Change, ScopeError> {
        self.run_atomic(|a| a.remove(name))
    }

    /// Returns the attribute under `name`, creating it with `init` if absent.
    ///
    /// `init` runs under the write lock, so it runs at most once per name
    /// even under contention. It must not touch this scope.
    ///
    /// # Errors
    ///
    /// `EmptyAttributeName`, or a state error.
    pub fn compute_if_absent<F>(&self, name: &str, init: F) -> Result<AttributeValue, ScopeError>
    where
        F: FnOnce() -> AttributeValue,
    {
        if name.is_empty() {
            return Err(ScopeError::EmptyAttributeName);
        }
        self.run_atomic(|a| a.compute_if_absent(name, init).clone())
    }

    /// Exactly the attributes whose values are renewal-aware.
    #[must_use]
    pub fn renewal_aware_attributes(&self) -> HashMap<String, AttributeValue> {
        self.read(|a| Some(a.renewal_aware())).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> ScopeSnapshot {
        let attributes = self.attributes.read();
        let mut plain = BTreeMap::new();
        let mut objects = Vec::new();
        for (name, value) in attributes.iter() {
            match value {
                AttributeValue::Plain(v) => {
                    plain.insert(name.to_string(), v.clone());
                }
                AttributeValue::Object(_) => objects.push(name.to_string()),
            }
        }
        objects.sort();
        ScopeSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state(),
            parent_id: self.parent_id.clone(),
            attributes: plain,
            objects,
        }
    }
}
