//! Scope kinds and the scope lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five scope kinds, ordered from outermost to innermost.
///
/// Begin notifications follow this order; end notifications run in reverse
/// (children before parents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeKind {
    /// One per manager; outlives every other scope.
    Global,
    /// One per application id.
    Application,
    /// One per session id, shared by all applications of that session.
    Session,
    /// One per (session, application) pair; owned by its session.
    SessionApplication,
    /// One per in-flight request.
    Request,
}

impl ScopeKind {
    /// All kinds in begin order.
    pub const ALL: [ScopeKind; 5] = [
        ScopeKind::Global,
        ScopeKind::Application,
        ScopeKind::Session,
        ScopeKind::SessionApplication,
        ScopeKind::Request,
    ];

    /// Stable lowercase label, used for log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Application => "application",
            Self::Session => "session",
            Self::SessionApplication => "session_application",
            Self::Request => "request",
        }
    }

    /// The kind whose scope id a scope of this kind refers to as its parent.
    #[must_use]
    pub fn parent(self) -> Option<ScopeKind> {
        match self {
            Self::Global => None,
            Self::Application | Self::Session => Some(Self::Global),
            Self::SessionApplication | Self::Request => Some(Self::Session),
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope lifecycle state.
///
/// State machine: Constructed -> Valid -> InDestruction -> Destroyed.
/// Transitions are monotonic; no state is ever re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScopeState {
    /// Created but not yet initialized; attributes are not accessible.
    Constructed = 0,
    /// Initialized and usable.
    Valid = 1,
    /// Teardown callbacks are running.
    InDestruction = 2,
    /// Terminal state; attributes have been cleared.
    Destroyed = 3,
}

impl ScopeState {
    /// Decodes the `repr(u8)` discriminant, as stored in an atomic.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Constructed),
            1 => Some(Self::Valid),
            2 => Some(Self::InDestruction),
            3 => Some(Self::Destroyed),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Constructed, Self::Valid)
                | (Self::Valid, Self::InDestruction)
                | (Self::InDestruction, Self::Destroyed)
        )
    }

    /// Attributes can be read and written while valid and during teardown.
    #[must_use]
    pub fn allows_attribute_access(self) -> bool {
        matches!(self, Self::Valid | Self::InDestruction)
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Constructed => "constructed",
            Self::Valid => "valid",
            Self::InDestruction => "in_destruction",
            Self::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}
