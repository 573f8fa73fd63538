//! Scopes core: attribute values, the attribute container, and the scope
//! kind and state vocabulary shared by the runtime.

pub mod attribute;
pub mod kind;
pub mod types;

pub use attribute::{AsAny, AttributeContainer, AttributeValue, RenewalAware, ScopeObject};
pub use kind::{ScopeKind, ScopeState};
pub use types::{Change, Value};
