//! Per-thread record of the request scope each manager has open.
//!
//! Managers are explicit instances, so the thread-local slot is keyed by
//! manager id; several managers can serve the same thread independently.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::ScopeError;
use crate::listener::ListenerFailures;
use crate::scope::Scope;

use super::transition::Transition;
use super::ScopeManager;

#[derive(Debug, Clone)]
pub(crate) struct CurrentRequest {
    pub(crate) manager_id: u64,
    pub(crate) scope: Arc<Scope>,
    pub(crate) application_id: String,
    pub(crate) session_id: String,
}

thread_local! {
    static CURRENT: RefCell<Vec<CurrentRequest>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn get(manager_id: u64) -> Option<CurrentRequest> {
    CURRENT.with(|slots| {
        slots
            .borrow()
            .iter()
            .find(|c| c.manager_id == manager_id)
            .cloned()
    })
}

pub(crate) fn set(request: CurrentRequest) {
    CURRENT.with(|slots| {
        let mut slots = slots.borrow_mut();
        slots.retain(|c| c.manager_id != request.manager_id);
        slots.push(request);
    });
}

pub(crate) fn take(manager_id: u64) -> Option<CurrentRequest> {
    CURRENT.with(|slots| {
        let mut slots = slots.borrow_mut();
        let index = slots.iter().position(|c| c.manager_id == manager_id)?;
        Some(slots.swap_remove(index))
    })
}

/// Takes the slot only if it still holds `scope`.
pub(crate) fn take_if(manager_id: u64, scope: &Arc<Scope>) -> Option<CurrentRequest> {
    CURRENT.with(|slots| {
        let mut slots = slots.borrow_mut();
        let index = slots
            .iter()
            .position(|c| c.manager_id == manager_id && Arc::ptr_eq(&c.scope, scope))?;
        Some(slots.swap_remove(index))
    })
}

/// RAII guard for a request scope.
///
/// Ends the request when dropped, including during unwinding, so the request
/// scope is destroyed on every exit path. Call [`end`](Self::end) to observe
/// the outcome instead. The guard is tied to the thread that began the
/// request and is therefore neither `Send` nor `Sync`.
pub struct RequestScopeGuard<'a> {
    manager: &'a ScopeManager,
    scope: Arc<Scope>,
    begin_failures: ListenerFailures,
    ended: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> RequestScopeGuard<'a> {
    pub(crate) fn new(
        manager: &'a ScopeManager,
        scope: Arc<Scope>,
        begin_failures: ListenerFailures,
    ) -> Self {
        Self {
            manager,
            scope,
            begin_failures,
            ended: false,
            _thread_bound: PhantomData,
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Begin-listener failures collected while the request was set up.
    #[must_use]
    pub fn begin_failures(&self) -> &ListenerFailures {
        &self.begin_failures
    }

    /// Ends the request now and reports the outcome.
    ///
    /// # Errors
    ///
    /// See [`ScopeManager::on_request_end`].
    pub fn end(mut self) -> Result<Transition<()>, ScopeError> {
        self.ended = true;
        self.manager.end_request_scope(&self.scope)
    }
}

impl Drop for RequestScopeGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        match self.manager.end_request_scope(&self.scope) {
            Ok(transition) if !transition.is_clean() => {
                tracing::warn!(
                    scope_id = self.scope.id(),
                    "request ended with listener failures: {}",
                    transition.failures()
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(scope_id = self.scope.id(), "request guard drop: {err}");
            }
        }
    }
}
