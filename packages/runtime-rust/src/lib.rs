//! Scopes runtime: thread-safe lifecycle scopes, lifecycle listeners, and the
//! scope manager that owns them.

pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod scope;
pub mod telemetry;

pub use config::ScopeManagerConfig;
pub use error::ScopeError;
pub use listener::{
    FailureSource, LifecyclePhase, ListenerFailure, ListenerFailures, ListenerId,
    ListenerRegistry, ScopeLifecycleListener,
};
pub use manager::{RenewalSnapshot, RequestScopeGuard, ScopeManager, Transition};
pub use scope::{Scope, ScopeSnapshot};
pub use scopes_core::{
    AttributeContainer, AttributeValue, Change, RenewalAware, ScopeKind, ScopeObject, ScopeState,
    Value,
};
