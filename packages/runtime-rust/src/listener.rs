//! Lifecycle listener registration and dispatch.
//!
//! Listeners are registered per [`ScopeKind`] and per [`LifecyclePhase`] and
//! run synchronously on the thread performing the transition. A failing
//! listener (error or panic) never prevents its siblings from running nor the
//! scope from completing its transition; failures are collected into
//! [`ListenerFailures`] and handed back to the caller.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use scopes_core::ScopeKind;
use serde::Serialize;

use crate::scope::Scope;

/// Whether a transition starts or ends a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecyclePhase {
    Begin,
    End,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::End => "end",
        })
    }
}

/// Closure form of a lifecycle listener.
pub type LifecycleCallback = Arc<dyn Fn(&Scope) -> anyhow::Result<()> + Send + Sync>;

/// Trait form of a lifecycle listener, for listeners that care about both
/// phases or several kinds.
///
/// Used as `Arc<dyn ScopeLifecycleListener>`.
pub trait ScopeLifecycleListener: Send + Sync {
    /// Label used in failure reports and logs.
    fn name(&self) -> &str;

    /// Kinds this listener is registered for. Defaults to all of them.
    fn kinds(&self) -> Vec<ScopeKind> {
        ScopeKind::ALL.to_vec()
    }

    /// Called after a scope of one of [`kinds`](Self::kinds) became valid.
    ///
    /// # Errors
    ///
    /// Returned errors are recorded as [`ListenerFailure`]s.
    fn on_scope_begin(&self, _scope: &Scope) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once a scope is in destruction, before its attributes are
    /// torn down.
    ///
    /// # Errors
    ///
    /// Returned errors are recorded as [`ListenerFailure`]s.
    fn on_scope_end(&self, _scope: &Scope) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// What raised a [`ListenerFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureSource {
    /// A registered lifecycle listener, by label.
    Listener(String),
    /// A destruction hook of the named object attribute.
    Attribute(String),
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener(name) => write!(f, "listener '{name}'"),
            Self::Attribute(name) => write!(f, "attribute '{name}'"),
        }
    }
}

/// One failed lifecycle callback.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerFailure {
    pub phase: LifecyclePhase,
    pub kind: ScopeKind,
    pub scope_id: String,
    pub source: FailureSource,
    pub message: String,
    /// True if the callback panicked rather than returning an error.
    pub panicked: bool,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on {} of {} scope '{}': {}",
            self.source, self.phase, self.kind, self.scope_id, self.message
        )
    }
}

/// Aggregate of every callback failure observed during one operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerFailures(Vec<ListenerFailure>);

impl ListenerFailures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: ListenerFailure) {
        self.0.push(failure);
    }

    pub fn extend(&mut self, other: ListenerFailures) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerFailure> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<ListenerFailure> {
        self.0
    }
}

impl fmt::Display for ListenerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lifecycle callback(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ListenerFailures {}

impl IntoIterator for ListenerFailures {
    type Item = ListenerFailure;
    type IntoIter = std::vec::IntoIter<ListenerFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Runs one callback, converting errors and panics into a failure record.
pub(crate) fn guarded<F>(
    phase: LifecyclePhase,
    scope: &Scope,
    source: FailureSource,
    callback: F,
) -> Option<ListenerFailure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let (message, panicked) = match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => return None,
        Ok(Err(err)) => (format!("{err:#}"), false),
        Err(payload) => (panic_message(payload.as_ref()), true),
    };

    tracing::warn!(
        kind = scope.kind().as_str(),
        scope_id = scope.id(),
        phase = %phase,
        source = %source,
        panicked,
        "lifecycle callback failed: {message}"
    );
    metrics::counter!(
        "scope_listener_failures_total",
        "kind" => scope.kind().as_str(),
        "phase" => phase.to_string()
    )
    .increment(1);

    Some(ListenerFailure {
        phase,
        kind: scope.kind(),
        scope_id: scope.id().to_string(),
        source,
        message,
        panicked,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// ListenerRegistry
// ---------------------------------------------------------------------------

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    label: String,
    callback: LifecycleCallback,
}

impl Registration {
    fn new<F>(id: ListenerId, label: String, callback: F) -> Self
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id,
            label,
            callback: Arc::new(callback),
        }
    }
}

type ListenerTable = HashMap<(ScopeKind, LifecyclePhase), Vec<Registration>>;

/// Registry of lifecycle listeners keyed by scope kind and phase.
///
/// The table is copy-on-write behind an `ArcSwap`: dispatch reads a snapshot
/// without locking, so listeners may register or unregister other listeners
/// while being dispatched. Such changes apply from the next transition on.
///
/// Begin listeners run in registration order; end listeners run in reverse
/// registration order.
pub struct ListenerRegistry {
    table: ArcSwap<ListenerTable>,
    next_id: AtomicU64,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.load();
        f.debug_struct("ListenerRegistry")
            .field("registrations", &table.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback invoked when a scope of `kind` begins.
    pub fn register_begin_listener<F>(&self, kind: ScopeKind, callback: F) -> ListenerId
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let label = format!("begin#{}", id.0);
        self.publish(vec![((kind, LifecyclePhase::Begin), Registration::new(id, label, callback))]);
        id
    }

    /// Registers a callback invoked when a scope of `kind` ends.
    pub fn register_end_listener<F>(&self, kind: ScopeKind, callback: F) -> ListenerId
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let label = format!("end#{}", id.0);
        self.publish(vec![((kind, LifecyclePhase::End), Registration::new(id, label, callback))]);
        id
    }

    /// Registers a trait listener for both phases of each of its kinds.
    ///
    /// All of its registrations become visible to dispatch at once.
    pub fn register_listener(&self, listener: Arc<dyn ScopeLifecycleListener>) -> ListenerId {
        let id = self.allocate_id();
        let label = listener.name().to_string();
        let mut entries = Vec::new();
        for kind in listener.kinds() {
            let on_begin = Arc::clone(&listener);
            entries.push((
                (kind, LifecyclePhase::Begin),
                Registration::new(id, label.clone(), move |scope: &Scope| {
                    on_begin.on_scope_begin(scope)
                }),
            ));
            let on_end = Arc::clone(&listener);
            entries.push((
                (kind, LifecyclePhase::End),
                Registration::new(id, label.clone(), move |scope: &Scope| {
                    on_end.on_scope_end(scope)
                }),
            ));
        }
        self.publish(entries);
        id
    }

    /// Removes every registration made under `id`. Returns false if none existed.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let before = self.len();
        self.table.rcu(|table| {
            let mut next = ListenerTable::clone(table);
            for registrations in next.values_mut() {
                registrations.retain(|r| r.id != id);
            }
            next.retain(|_, registrations| !registrations.is_empty());
            next
        });
        self.len() < before
    }

    /// Total number of (kind, phase) registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every listener registered for `phase` on the scope's kind.
    pub fn dispatch(&self, phase: LifecyclePhase, scope: &Scope) -> ListenerFailures {
        let table = self.table.load_full();
        let mut failures = ListenerFailures::new();
        let Some(registrations) = table.get(&(scope.kind(), phase)) else {
            return failures;
        };

        let run = |registration: &Registration, failures: &mut ListenerFailures| {
            let source = FailureSource::Listener(registration.label.clone());
            if let Some(failure) = guarded(phase, scope, source, || (registration.callback)(scope)) {
                failures.push(failure);
            }
        };

        match phase {
            LifecyclePhase::Begin => registrations.iter().for_each(|r| run(r, &mut failures)),
            LifecyclePhase::End => registrations.iter().rev().for_each(|r| run(r, &mut failures)),
        }
        failures
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Appends every entry in a single copy-on-write update.
    fn publish(&self, entries: Vec<((ScopeKind, LifecyclePhase), Registration)>) {
        self.table.rcu(|table| {
            let mut next = ListenerTable::clone(table);
            for (key, registration) in &entries {
                next.entry(*key).or_default().push(registration.clone());
            }
            next
        });
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
