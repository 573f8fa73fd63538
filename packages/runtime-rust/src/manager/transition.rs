use std::collections::HashMap;

use scopes_core::AttributeValue;

use crate::error::ScopeError;
use crate::listener::ListenerFailures;

/// Result of a completed lifecycle transition.
///
/// The transition itself always completed; `failures` lists the lifecycle
/// callbacks that errored or panicked along the way. Use
/// [`into_result`](Self::into_result) to treat any failure as an error.
#[derive(Debug)]
#[must_use = "listener failures are only reported through the returned transition"]
pub struct Transition<T> {
    value: T,
    failures: ListenerFailures,
}

impl<T> Transition<T> {
    pub(crate) fn new(value: T, failures: ListenerFailures) -> Self {
        Self { value, failures }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn failures(&self) -> &ListenerFailures {
        &self.failures
    }

    /// True if every callback succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_parts(self) -> (T, ListenerFailures) {
        (self.value, self.failures)
    }

    /// Returns the value, or `ScopeError::ListenerFailures` if any callback failed.
    ///
    /// # Errors
    ///
    /// `ScopeError::ListenerFailures` carrying every collected failure.
    pub fn into_result(self) -> Result<T, ScopeError> {
        if self.failures.is_empty() {
            Ok(self.value)
        } else {
            Err(ScopeError::ListenerFailures(self.failures))
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Transition<U> {
        Transition {
            value: f(self.value),
            failures: self.failures,
        }
    }
}

/// Renewal-aware attributes captured from a session right before it was
/// destroyed.
#[derive(Debug, Clone, Default)]
pub struct RenewalSnapshot {
    pub session_id: String,
    /// Renewal-aware attributes of the session scope itself.
    pub attributes: HashMap<String, AttributeValue>,
    /// Renewal-aware attributes of each session-application scope, by
    /// application id. Applications without any are omitted.
    pub session_applications: HashMap<String, HashMap<String, AttributeValue>>,
}

impl RenewalSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.session_applications.is_empty()
    }
}
