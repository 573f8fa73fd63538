use scopes_core::ScopeKind;

use crate::listener::ListenerFailures;

/// Errors returned by scope and manager operations.
///
/// Everything except `ListenerFailures` is a usage or state error: the
/// caller asked for something the current lifecycle state does not allow.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("{kind} scope id must not be empty")]
    EmptyId { kind: ScopeKind },
    #[error("attribute name must not be empty")]
    EmptyAttributeName,
    #[error("{kind} scope '{id}' is already initialized")]
    AlreadyInitialized { kind: ScopeKind, id: String },
    #[error("{kind} scope '{id}' is not initialized")]
    NotInitialized { kind: ScopeKind, id: String },
    #[error("{kind} scope '{id}' is already in destruction")]
    InDestruction { kind: ScopeKind, id: String },
    #[error("{kind} scope '{id}' is already destroyed")]
    AlreadyDestroyed { kind: ScopeKind, id: String },
    #[error("no {kind} scope with id '{id}'")]
    NotFound { kind: ScopeKind, id: String },
    #[error("no request scope is active on this thread")]
    NoActiveRequest,
    #[error("request scope '{id}' is still active on this thread")]
    RequestAlreadyActive { id: String },
    #[error("request id '{id}' is already in use")]
    DuplicateRequest { id: String },
    #[error("global scope has ended; no new scopes can begin")]
    GlobalScopeEnded,
    #[error(transparent)]
    ListenerFailures(#[from] ListenerFailures),
}

impl ScopeError {
    /// True for the "nothing to end" family: the target scope is missing or
    /// was already torn down by someone else.
    #[must_use]
    pub fn is_already_gone(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyDestroyed { .. }
                | Self::InDestruction { .. }
                | Self::NoActiveRequest
        )
    }
}
