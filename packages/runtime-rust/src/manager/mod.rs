//! Process-wide authority over which scopes are active.
//!
//! [`ScopeManager`] owns every active scope and sequences begin/end
//! transitions under concurrent request and session churn:
//!
//! 1. **Creation** is compare-and-create: the global slot is double-checked
//!    under its own lock, the per-kind tables use `DashMap` entries. Exactly
//!    one racing caller creates a scope; the others reuse it.
//! 2. **Destruction** is exactly-once: a scope is removed from its table
//!    first, and only the caller that removed it destroys it.
//! 3. **Listeners** run after every registry lock has been released, begin
//!    hooks outermost-first, end hooks innermost-first.
//!
//! Lock order, outermost first: `lifecycle` -> `global` -> `applications`
//! -> `sessions` -> `requests` -> scope locks. No code path acquires a
//! registry lock while holding a scope lock.

mod current;
mod transition;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use scopes_core::{AttributeValue, ScopeKind};

use crate::config::ScopeManagerConfig;
use crate::error::ScopeError;
use crate::listener::{
    LifecyclePhase, ListenerFailures, ListenerId, ListenerRegistry, ScopeLifecycleListener,
};
use crate::scope::Scope;

use current::CurrentRequest;
pub use current::RequestScopeGuard;
pub use transition::{RenewalSnapshot, Transition};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// The global scope slot. `ended` is terminal: once the global scope has
/// ended, the manager refuses to begin anything new.
#[derive(Default)]
struct GlobalSlot {
    scope: Option<Arc<Scope>>,
    ended: bool,
}

/// A session and the session-application scopes it owns, kept in one map
/// value so ending the session detaches both with a single remove.
struct SessionEntry {
    scope: Arc<Scope>,
    /// Application id -> session-application scope.
    children: BTreeMap<String, Arc<Scope>>,
}

/// A table value that holds a scope.
trait ScopeSlot {
    fn wrap(scope: Arc<Scope>) -> Self;
    fn scope(&self) -> &Arc<Scope>;
}

impl ScopeSlot for Arc<Scope> {
    fn wrap(scope: Arc<Scope>) -> Self {
        scope
    }

    fn scope(&self) -> &Arc<Scope> {
        self
    }
}

impl ScopeSlot for SessionEntry {
    fn wrap(scope: Arc<Scope>) -> Self {
        Self {
            scope,
            children: BTreeMap::new(),
        }
    }

    fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }
}

/// Everything removed from the tables by a global end, in teardown order.
struct Drained {
    requests: Vec<Arc<Scope>>,
    sessions: Vec<(Arc<Scope>, Vec<Arc<Scope>>)>,
    applications: Vec<Arc<Scope>>,
    global: Option<Arc<Scope>>,
}

/// Owns the active scopes of one process (or one test).
///
/// Create one at startup and pass it by reference; there is no hidden
/// global instance. Dropping a manager whose global scope has not ended
/// ends it, so every scope is torn down deterministically.
pub struct ScopeManager {
    id: u64,
    config: ScopeManagerConfig,
    listeners: ListenerRegistry,
    /// Read-held by every begin/end of a non-global scope, write-held by the
    /// global end, so the global cascade never races a table insert.
    lifecycle: RwLock<()>,
    global: RwLock<GlobalSlot>,
    applications: DashMap<String, Arc<Scope>>,
    sessions: DashMap<String, SessionEntry>,
    requests: DashMap<String, Arc<Scope>>,
}

impl fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeManager")
            .field("id", &self.id)
            .field("global", &self.is_global_scope_present())
            .field("applications", &self.applications.len())
            .field("sessions", &self.sessions.len())
            .field("requests", &self.requests.len())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl ScopeManager {
    #[must_use]
    pub fn new(config: ScopeManagerConfig) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            listeners: ListenerRegistry::new(),
            lifecycle: RwLock::new(()),
            global: RwLock::new(GlobalSlot::default()),
            applications: DashMap::new(),
            sessions: DashMap::new(),
            requests: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ScopeManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// See [`ListenerRegistry::register_begin_listener`].
    pub fn register_begin_listener<F>(&self, kind: ScopeKind, callback: F) -> ListenerId
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.register_begin_listener(kind, callback)
    }

    /// See [`ListenerRegistry::register_end_listener`].
    pub fn register_end_listener<F>(&self, kind: ScopeKind, callback: F) -> ListenerId
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.register_end_listener(kind, callback)
    }

    /// See [`ListenerRegistry::register_listener`].
    pub fn register_listener(&self, listener: Arc<dyn ScopeLifecycleListener>) -> ListenerId {
        self.listeners.register_listener(listener)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Begins a request on the calling thread.
    ///
    /// Ensures the global, application, and session scopes exist (creating
    /// each at most once), then creates a fresh request scope and records it
    /// as this thread's current request. Begin listeners run for every scope
    /// created by this call, in order global, application, session, request.
    ///
    /// # Errors
    ///
    /// `EmptyId` for an empty id, `RequestAlreadyActive` if this thread has an
    /// un-ended request and stale replacement is disabled, `DuplicateRequest`
    /// if `request_id` is in use, `GlobalScopeEnded` after [`on_global_end`].
    ///
    /// [`on_global_end`]: Self::on_global_end
    pub fn on_request_begin(
        &self,
        application_id: &str,
        request_id: &str,
        session_id: &str,
    ) -> Result<Transition<Arc<Scope>>, ScopeError> {
        require_id(ScopeKind::Application, application_id)?;
        require_id(ScopeKind::Request, request_id)?;
        require_id(ScopeKind::Session, session_id)?;

        let mut failures = ListenerFailures::new();
        if let Some(stale) = current::get(self.id) {
            if !self.config.replace_stale_request {
                return Err(ScopeError::RequestAlreadyActive {
                    id: stale.scope.id().to_string(),
                });
            }
            tracing::warn!(
                stale_request = stale.scope.id(),
                request_id,
                "request began while a previous request scope was still open; ending it"
            );
            if let Ok(ended) = self.end_request_scope(&stale.scope) {
                failures.extend(ended.into_parts().1);
            }
        }

        let mut created = Vec::new();
        let attached = self.attach_request(application_id, request_id, session_id, &mut created);
        failures.extend(self.fire_begin(&created));
        let request = attached?;

        current::set(CurrentRequest {
            manager_id: self.id,
            scope: Arc::clone(&request),
            application_id: application_id.to_string(),
            session_id: session_id.to_string(),
        });
        Ok(Transition::new(request, failures))
    }

    /// Like [`on_request_begin`](Self::on_request_begin), but returns a guard
    /// that ends the request when dropped.
    ///
    /// # Errors
    ///
    /// See [`on_request_begin`](Self::on_request_begin).
    pub fn begin_request(
        &self,
        application_id: &str,
        request_id: &str,
        session_id: &str,
    ) -> Result<RequestScopeGuard<'_>, ScopeError> {
        let (scope, failures) = self
            .on_request_begin(application_id, request_id, session_id)?
            .into_parts();
        Ok(RequestScopeGuard::new(self, scope, failures))
    }

    /// Ends the calling thread's current request, destroying its scope.
    /// Application and session scopes are untouched.
    ///
    /// # Errors
    ///
    /// `NoActiveRequest` if this thread has no open request (e.g. the end
    /// runs from cleanup code after a failed begin); `AlreadyDestroyed` if
    /// the request scope was already torn down by a global end.
    pub fn on_request_end(&self) -> Result<Transition<()>, ScopeError> {
        let Some(current) = current::take(self.id) else {
            tracing::warn!("request end without a matching request begin on this thread");
            return Err(ScopeError::NoActiveRequest);
        };
        self.finish_request(&current.scope)
    }

    pub(crate) fn end_request_scope(&self, scope: &Arc<Scope>) -> Result<Transition<()>, ScopeError> {
        current::take_if(self.id, scope);
        self.finish_request(scope)
    }

    fn finish_request(&self, scope: &Arc<Scope>) -> Result<Transition<()>, ScopeError> {
        let removed = {
            let _lifecycle = self.lifecycle.read();
            self.requests
                .remove_if(scope.id(), |_, active| Arc::ptr_eq(active, scope))
                .is_some()
        };
        if !removed {
            return Err(ScopeError::AlreadyDestroyed {
                kind: ScopeKind::Request,
                id: scope.id().to_string(),
            });
        }
        let failures = self.destroy_notified(scope)?;
        Ok(Transition::new((), failures))
    }

    fn attach_request(
        &self,
        application_id: &str,
        request_id: &str,
        session_id: &str,
        created: &mut Vec<Arc<Scope>>,
    ) -> Result<Arc<Scope>, ScopeError> {
        let _lifecycle = self.lifecycle.read();
        let global = self.ensure_global(created)?;
        self.get_or_create(
            &self.applications,
            ScopeKind::Application,
            application_id,
            Some(global.id()),
            created,
        )?;
        self.get_or_create(
            &self.sessions,
            ScopeKind::Session,
            session_id,
            Some(global.id()),
            created,
        )?;

        match self.requests.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(ScopeError::DuplicateRequest {
                id: request_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let scope =
                    Scope::new_valid(ScopeKind::Request, request_id, Some(session_id.to_string()))?;
                slot.insert(Arc::clone(&scope));
                self.on_created(&scope, created);
                Ok(scope)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Applications and sessions
    // -----------------------------------------------------------------------

    /// Returns the application scope, creating it (and the global scope) on
    /// first reference.
    ///
    /// # Errors
    ///
    /// `EmptyId`, or `GlobalScopeEnded`.
    pub fn ensure_application_scope(
        &self,
        application_id: &str,
    ) -> Result<Transition<Arc<Scope>>, ScopeError> {
        require_id(ScopeKind::Application, application_id)?;
        self.ensure_top_level(&self.applications, ScopeKind::Application, application_id)
    }

    /// Returns the session scope, creating it (and the global scope) on first
    /// reference.
    ///
    /// # Errors
    ///
    /// `EmptyId`, or `GlobalScopeEnded`.
    pub fn ensure_session_scope(&self, session_id: &str) -> Result<Transition<Arc<Scope>>, ScopeError> {
        require_id(ScopeKind::Session, session_id)?;
        self.ensure_top_level(&self.sessions, ScopeKind::Session, session_id)
    }

    fn ensure_top_level<V: ScopeSlot>(
        &self,
        table: &DashMap<String, V>,
        kind: ScopeKind,
        id: &str,
    ) -> Result<Transition<Arc<Scope>>, ScopeError> {
        let mut created = Vec::new();
        let scope = {
            let _lifecycle = self.lifecycle.read();
            self.ensure_global(&mut created)
                .and_then(|global| self.get_or_create(table, kind, id, Some(global.id()), &mut created))
        };
        let failures = self.fire_begin(&created);
        Ok(Transition::new(scope?, failures))
    }

    /// Returns the session-application scope for the pair, creating it on
    /// first reference. The session must already exist.
    ///
    /// # Errors
    ///
    /// `EmptyId`, `NotFound` if the session does not exist, or
    /// `GlobalScopeEnded`.
    pub fn ensure_session_application_scope(
        &self,
        session_id: &str,
        application_id: &str,
    ) -> Result<Transition<Arc<Scope>>, ScopeError> {
        require_id(ScopeKind::Session, session_id)?;
        require_id(ScopeKind::Application, application_id)?;

        let mut created = Vec::new();
        let scope = self.attach_session_application(session_id, application_id, &mut created);
        let failures = self.fire_begin(&created);
        Ok(Transition::new(scope?, failures))
    }

    fn attach_session_application(
        &self,
        session_id: &str,
        application_id: &str,
        created: &mut Vec<Arc<Scope>>,
    ) -> Result<Arc<Scope>, ScopeError> {
        let _lifecycle = self.lifecycle.read();
        if self.global.read().ended {
            return Err(ScopeError::GlobalScopeEnded);
        }
        // The child lands in the entry of the session it was created under;
        // a session end removes entry and children together.
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ScopeError::NotFound {
                kind: ScopeKind::Session,
                id: session_id.to_string(),
            })?;
        if let Some(existing) = session.children.get(application_id) {
            return Ok(Arc::clone(existing));
        }
        let scope = Scope::new_valid(
            ScopeKind::SessionApplication,
            self.config.session_application_id(session_id, application_id),
            Some(session.scope.id().to_string()),
        )?;
        session
            .children
            .insert(application_id.to_string(), Arc::clone(&scope));
        drop(session);
        self.on_created(&scope, created);
        Ok(scope)
    }

    /// Ends one session-application scope without touching its session.
    ///
    /// # Errors
    ///
    /// `EmptyId`, or `NotFound` if no such scope is active.
    pub fn on_session_application_end(
        &self,
        session_id: &str,
        application_id: &str,
    ) -> Result<Transition<()>, ScopeError> {
        require_id(ScopeKind::Session, session_id)?;
        require_id(ScopeKind::Application, application_id)?;

        let removed = {
            let _lifecycle = self.lifecycle.read();
            self.sessions
                .get_mut(session_id)
                .and_then(|mut session| session.children.remove(application_id))
        };
        let Some(scope) = removed else {
            return Err(ScopeError::NotFound {
                kind: ScopeKind::SessionApplication,
                id: self.config.session_application_id(session_id, application_id),
            });
        };
        let failures = self.destroy_notified(&scope)?;
        Ok(Transition::new((), failures))
    }

    /// Ends a session.
    ///
    /// The session's renewal-aware attributes (and those of its
    /// session-application scopes) are taken out immediately before
    /// destruction and returned; their destruction hooks do not run.
    /// Still-open session-application scopes are destroyed first, each with
    /// its end listeners, then the session.
    /// Concurrent calls for one id destroy the session exactly once; the
    /// others get `NotFound`.
    ///
    /// # Errors
    ///
    /// `EmptyId`, or `NotFound` if the session is not active.
    pub fn on_session_end(&self, session_id: &str) -> Result<Transition<RenewalSnapshot>, ScopeError> {
        require_id(ScopeKind::Session, session_id)?;

        let removed = {
            let _lifecycle = self.lifecycle.read();
            self.sessions.remove(session_id).map(|(_, entry)| entry)
        };
        let Some(SessionEntry {
            scope: session,
            children,
        }) = removed
        else {
            tracing::debug!(session_id, "session end for unknown or already ended session");
            return Err(ScopeError::NotFound {
                kind: ScopeKind::Session,
                id: session_id.to_string(),
            });
        };

        let mut failures = ListenerFailures::new();
        let mut session_applications = HashMap::new();
        for (application_id, child) in &children {
            match self.destroy_carrying(child) {
                Ok((attributes, child_failures)) => {
                    failures.extend(child_failures);
                    if !attributes.is_empty() {
                        session_applications.insert(application_id.clone(), attributes);
                    }
                }
                Err(err) => {
                    tracing::debug!(scope_id = child.id(), "skipping teardown: {err}");
                }
            }
        }
        let (attributes, session_failures) = self.destroy_carrying(&session)?;
        failures.extend(session_failures);

        let snapshot = RenewalSnapshot {
            session_id: session_id.to_string(),
            attributes,
            session_applications,
        };
        Ok(Transition::new(snapshot, failures))
    }

    /// Ends `old_session_id` and begins `new_session_id`, carrying over every
    /// renewal-aware attribute, including those of session-application
    /// scopes. Non-renewal-aware attributes are dropped with the old session.
    ///
    /// # Errors
    ///
    /// Any error of [`on_session_end`](Self::on_session_end) or
    /// [`ensure_session_scope`](Self::ensure_session_scope).
    pub fn renew_session(
        &self,
        old_session_id: &str,
        new_session_id: &str,
    ) -> Result<Transition<Arc<Scope>>, ScopeError> {
        require_id(ScopeKind::Session, new_session_id)?;
        let (snapshot, mut failures) = self.on_session_end(old_session_id)?.into_parts();

        let (session, begun) = self.ensure_session_scope(new_session_id)?.into_parts();
        failures.extend(begun);
        session.set_all(snapshot.attributes)?;

        for (application_id, attributes) in snapshot.session_applications {
            let (child, begun) = self
                .ensure_session_application_scope(new_session_id, &application_id)?
                .into_parts();
            failures.extend(begun);
            child.set_all(attributes)?;
        }

        tracing::debug!(
            old_session_id,
            new_session_id,
            "session renewed"
        );
        Ok(Transition::new(session, failures))
    }

    /// Ends an application scope. Sessions and their session-application
    /// scopes are independent of it and stay active.
    ///
    /// # Errors
    ///
    /// `EmptyId`, or `NotFound` if the application is not active.
    pub fn on_application_end(&self, application_id: &str) -> Result<Transition<()>, ScopeError> {
        require_id(ScopeKind::Application, application_id)?;
        let removed = {
            let _lifecycle = self.lifecycle.read();
            self.applications.remove(application_id).map(|(_, scope)| scope)
        };
        let Some(scope) = removed else {
            return Err(ScopeError::NotFound {
                kind: ScopeKind::Application,
                id: application_id.to_string(),
            });
        };
        let failures = self.destroy_notified(&scope)?;
        Ok(Transition::new((), failures))
    }

    // -----------------------------------------------------------------------
    // Global
    // -----------------------------------------------------------------------

    /// Ensures the global scope exists without beginning a request.
    ///
    /// # Errors
    ///
    /// `GlobalScopeEnded` after [`on_global_end`](Self::on_global_end).
    pub fn on_global_begin(&self) -> Result<Transition<Arc<Scope>>, ScopeError> {
        let mut created = Vec::new();
        let global = {
            let _lifecycle = self.lifecycle.read();
            self.ensure_global(&mut created)
        };
        let failures = self.fire_begin(&created);
        Ok(Transition::new(global?, failures))
    }

    /// Ends the global scope and everything still active under it.
    ///
    /// Teardown runs child-first: requests, then each session (its
    /// session-application scopes first), then applications, then the global
    /// scope. Afterwards the manager refuses to begin new scopes.
    ///
    /// # Errors
    ///
    /// `AlreadyDestroyed` on a second call, `NotFound` if the global scope was
    /// never created (the manager is still marked as ended).
    pub fn on_global_end(&self) -> Result<Transition<()>, ScopeError> {
        let drained = {
            let _lifecycle = self.lifecycle.write();
            let mut slot = self.global.write();
            if slot.ended {
                return Err(ScopeError::AlreadyDestroyed {
                    kind: ScopeKind::Global,
                    id: self.config.global_scope_id.clone(),
                });
            }
            slot.ended = true;
            let global = slot.scope.take();
            drop(slot);

            Drained {
                requests: drain(&self.requests).into_iter().map(|(_, s)| s).collect(),
                sessions: drain(&self.sessions)
                    .into_iter()
                    .map(|(_, entry)| (entry.scope, entry.children.into_values().collect()))
                    .collect(),
                applications: drain(&self.applications).into_iter().map(|(_, s)| s).collect(),
                global,
            }
        };
        current::take(self.id);

        let Some(global) = drained.global else {
            return Err(ScopeError::NotFound {
                kind: ScopeKind::Global,
                id: self.config.global_scope_id.clone(),
            });
        };

        let mut failures = ListenerFailures::new();
        for request in &drained.requests {
            failures.extend(self.destroy_owned(request));
        }
        for (session, children) in &drained.sessions {
            for child in children {
                failures.extend(self.destroy_owned(child));
            }
            failures.extend(self.destroy_owned(session));
        }
        for application in &drained.applications {
            failures.extend(self.destroy_owned(application));
        }
        failures.extend(self.destroy_notified(&global)?);

        tracing::info!(
            scope_id = global.id(),
            requests = drained.requests.len(),
            sessions = drained.sessions.len(),
            applications = drained.applications.len(),
            failures = failures.len(),
            "global scope ended"
        );
        Ok(Transition::new((), failures))
    }

    fn ensure_global(&self, created: &mut Vec<Arc<Scope>>) -> Result<Arc<Scope>, ScopeError> {
        {
            let slot = self.global.read();
            if slot.ended {
                return Err(ScopeError::GlobalScopeEnded);
            }
            if let Some(scope) = &slot.scope {
                return Ok(Arc::clone(scope));
            }
        }

        let mut slot = self.global.write();
        if slot.ended {
            return Err(ScopeError::GlobalScopeEnded);
        }
        if let Some(scope) = &slot.scope {
            return Ok(Arc::clone(scope));
        }
        let scope = Scope::new_valid(ScopeKind::Global, self.config.global_scope_id.as_str(), None)?;
        slot.scope = Some(Arc::clone(&scope));
        drop(slot);

        tracing::info!(scope_id = scope.id(), "global scope began");
        self.on_created(&scope, created);
        Ok(scope)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Whether the global scope currently exists.
    #[must_use]
    pub fn is_global_scope_present(&self) -> bool {
        self.global.read().scope.is_some()
    }

    #[must_use]
    pub fn has_global_ended(&self) -> bool {
        self.global.read().ended
    }

    #[must_use]
    pub fn global_scope(&self) -> Option<Arc<Scope>> {
        self.global.read().scope.clone()
    }

    #[must_use]
    pub fn application_scope(&self, application_id: &str) -> Option<Arc<Scope>> {
        self.applications.get(application_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn session_scope(&self, session_id: &str) -> Option<Arc<Scope>> {
        self.sessions.get(session_id).map(|r| Arc::clone(&r.scope))
    }

    #[must_use]
    pub fn session_application_scope(
        &self,
        session_id: &str,
        application_id: &str,
    ) -> Option<Arc<Scope>> {
        self.sessions
            .get(session_id)
            .and_then(|session| session.children.get(application_id).cloned())
    }

    #[must_use]
    pub fn request_scope(&self, request_id: &str) -> Option<Arc<Scope>> {
        self.requests.get(request_id).map(|r| Arc::clone(r.value()))
    }

    /// The calling thread's open request scope, if any.
    #[must_use]
    pub fn current_request_scope(&self) -> Option<Arc<Scope>> {
        current::get(self.id).map(|c| c.scope)
    }

    /// The session of the calling thread's open request, if still active.
    #[must_use]
    pub fn current_session_scope(&self) -> Option<Arc<Scope>> {
        current::get(self.id).and_then(|c| self.session_scope(&c.session_id))
    }

    /// The application of the calling thread's open request, if still active.
    #[must_use]
    pub fn current_application_scope(&self) -> Option<Arc<Scope>> {
        current::get(self.id).and_then(|c| self.application_scope(&c.application_id))
    }

    /// Active session ids, sorted.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        sorted_keys(&self.sessions)
    }

    /// Active application ids, sorted.
    #[must_use]
    pub fn application_ids(&self) -> Vec<String> {
        sorted_keys(&self.applications)
    }

    /// Number of active scopes of `kind`.
    #[must_use]
    pub fn active_count(&self, kind: ScopeKind) -> usize {
        match kind {
            ScopeKind::Global => usize::from(self.is_global_scope_present()),
            ScopeKind::Application => self.applications.len(),
            ScopeKind::Session => self.sessions.len(),
            ScopeKind::SessionApplication => self
                .sessions
                .iter()
                .map(|entry| entry.children.len())
                .sum(),
            ScopeKind::Request => self.requests.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn get_or_create<V: ScopeSlot>(
        &self,
        table: &DashMap<String, V>,
        kind: ScopeKind,
        id: &str,
        parent_id: Option<&str>,
        created: &mut Vec<Arc<Scope>>,
    ) -> Result<Arc<Scope>, ScopeError> {
        if let Some(existing) = table.get(id) {
            return Ok(Arc::clone(existing.scope()));
        }
        match table.entry(id.to_string()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get().scope())),
            Entry::Vacant(slot) => {
                let scope = Scope::new_valid(kind, id, parent_id.map(str::to_string))?;
                slot.insert(V::wrap(Arc::clone(&scope)));
                self.on_created(&scope, created);
                Ok(scope)
            }
        }
    }

    fn on_created(&self, scope: &Arc<Scope>, created: &mut Vec<Arc<Scope>>) {
        metrics::counter!("scopes_created_total", "kind" => scope.kind().as_str()).increment(1);
        metrics::gauge!("scopes_active", "kind" => scope.kind().as_str()).increment(1.0);
        self.log_lifecycle("scope began", scope);
        created.push(Arc::clone(scope));
    }

    fn fire_begin(&self, created: &[Arc<Scope>]) -> ListenerFailures {
        let mut failures = ListenerFailures::new();
        for scope in created {
            failures.extend(self.listeners.dispatch(LifecyclePhase::Begin, scope));
        }
        failures
    }

    /// Destroys a scope this caller removed from its table, with end listeners.
    fn destroy_notified(&self, scope: &Scope) -> Result<ListenerFailures, ScopeError> {
        let failures =
            scope.destroy_scope_with(|s| self.listeners.dispatch(LifecyclePhase::End, s))?;
        self.on_destroyed(scope);
        Ok(failures)
    }

    /// Like [`destroy_notified`](Self::destroy_notified), but renewal-aware
    /// attributes are taken out and returned instead of torn down.
    fn destroy_carrying(
        &self,
        scope: &Scope,
    ) -> Result<(HashMap<String, AttributeValue>, ListenerFailures), ScopeError> {
        let carried =
            scope.destroy_scope_carrying(|s| self.listeners.dispatch(LifecyclePhase::End, s))?;
        self.on_destroyed(scope);
        Ok(carried)
    }

    fn on_destroyed(&self, scope: &Scope) {
        metrics::counter!("scopes_destroyed_total", "kind" => scope.kind().as_str()).increment(1);
        metrics::gauge!("scopes_active", "kind" => scope.kind().as_str()).decrement(1.0);
        self.log_lifecycle("scope ended", scope);
    }

    /// Cascade variant of [`destroy_notified`](Self::destroy_notified): a
    /// scope someone destroyed directly is skipped, not an error.
    fn destroy_owned(&self, scope: &Scope) -> ListenerFailures {
        self.destroy_notified(scope).unwrap_or_else(|err| {
            tracing::debug!(scope_id = scope.id(), "skipping teardown: {err}");
            ListenerFailures::new()
        })
    }

    fn log_lifecycle(&self, event: &str, scope: &Scope) {
        if self.config.debug_lifecycle {
            tracing::info!(
                kind = scope.kind().as_str(),
                scope_id = scope.id(),
                parent_id = ?scope.parent_id(),
                "{event}"
            );
        } else {
            tracing::debug!(
                kind = scope.kind().as_str(),
                scope_id = scope.id(),
                parent_id = ?scope.parent_id(),
                "{event}"
            );
        }
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new(ScopeManagerConfig::default())
    }
}

impl Drop for ScopeManager {
    fn drop(&mut self) {
        if self.has_global_ended() {
            return;
        }
        match self.on_global_end() {
            Ok(transition) if !transition.is_clean() => {
                tracing::warn!(
                    "scope manager dropped; global end reported: {}",
                    transition.failures()
                );
            }
            Ok(_) | Err(_) => {}
        }
    }
}

fn require_id(kind: ScopeKind, id: &str) -> Result<(), ScopeError> {
    if id.is_empty() {
        tracing::warn!(kind = kind.as_str(), "rejected empty scope id");
        return Err(ScopeError::EmptyId { kind });
    }
    Ok(())
}

/// Removes and returns every entry, sorted by key.
fn drain<V>(table: &DashMap<String, V>) -> Vec<(String, V)> {
    let keys: Vec<String> = table.iter().map(|entry| entry.key().clone()).collect();
    let mut drained: Vec<(String, V)> = keys
        .into_iter()
        .filter_map(|key| table.remove(&key))
        .collect();
    drained.sort_by(|a, b| a.0.cmp(&b.0));
    drained
}

fn sorted_keys<V>(table: &DashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = table.iter().map(|entry| entry.key().clone()).collect();
    keys.sort();
    keys
}
