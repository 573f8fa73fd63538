//! Attribute values and the per-scope attribute container.
//!
//! [`AttributeContainer`] is a plain map with typed accessors. It performs no
//! synchronization of its own; the owning scope guards it with a lock.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::kind::ScopeKind;
use crate::types::{Change, Value};

// ---------------------------------------------------------------------------
// ScopeObject
// ---------------------------------------------------------------------------

/// Converts an `Arc` of a concrete type into `Arc<dyn Any>` for downcasting.
///
/// Blanket-implemented for every `Send + Sync + 'static` type; callers never
/// implement it by hand.
pub trait AsAny: Any + Send + Sync {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A shared object attribute with optional scope capabilities.
///
/// The default methods describe an attribute with no capabilities. Override
/// [`is_renewal_aware`](Self::is_renewal_aware) to have the object carried
/// over into a renewed session, and the destruction hooks to release
/// resources when the owning scope is torn down.
///
/// Used as `Arc<dyn ScopeObject>`.
pub trait ScopeObject: AsAny + fmt::Debug {
    /// Whether this attribute survives scope renewal.
    fn is_renewal_aware(&self) -> bool {
        false
    }

    /// Called once the owning scope is in destruction, before any
    /// [`on_scope_destruction`](Self::on_scope_destruction) hook runs.
    ///
    /// # Errors
    ///
    /// Errors are collected by the scope and reported after teardown; they do
    /// not stop other hooks.
    fn on_before_scope_destruction(&self, _kind: ScopeKind, _scope_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after every `on_before_scope_destruction` hook of the scope ran,
    /// while the attribute is still present.
    ///
    /// # Errors
    ///
    /// Errors are collected by the scope and reported after teardown.
    fn on_scope_destruction(&self, _kind: ScopeKind, _scope_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Wrapper that marks any value as renewal-aware.
///
/// ```
/// use scopes_core::{AttributeContainer, RenewalAware, Value};
///
/// let mut attrs = AttributeContainer::new();
/// attrs.set("user", RenewalAware::new(Value::from("alice")));
/// attrs.set("csrf", "token");
///
/// let renewed = attrs.renewal_aware();
/// assert!(renewed.contains_key("user"));
/// assert!(!renewed.contains_key("csrf"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalAware<T>(T);

impl<T> RenewalAware<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for RenewalAware<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> ScopeObject for RenewalAware<T> {
    fn is_renewal_aware(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// AttributeValue
// ---------------------------------------------------------------------------

/// A single attribute: either plain data or a shared object.
///
/// Cloning is cheap: plain values are cloned, objects share their `Arc`.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Plain data without capabilities.
    Plain(Value),
    /// Shared object, possibly renewal- or destruction-aware.
    Object(Arc<dyn ScopeObject>),
}

impl AttributeValue {
    /// Wraps a concrete object.
    pub fn object<T: ScopeObject>(object: T) -> Self {
        Self::Object(Arc::new(object))
    }

    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Plain(v) => Some(v),
            Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Arc<dyn ScopeObject>> {
        match self {
            Self::Plain(_) => None,
            Self::Object(o) => Some(o),
        }
    }

    /// Downcasts an object attribute to its concrete type.
    #[must_use]
    pub fn downcast<T: ScopeObject>(&self) -> Option<Arc<T>> {
        self.as_object()
            .and_then(|o| Arc::clone(o).into_any_arc().downcast::<T>().ok())
    }

    /// Plain values never carry capabilities; objects decide for themselves.
    #[must_use]
    pub fn is_renewal_aware(&self) -> bool {
        self.as_object().is_some_and(|o| o.is_renewal_aware())
    }
}

/// Plain values compare by content, objects by identity.
impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Plain(a), Self::Plain(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(v: Value) -> Self {
        Self::Plain(v)
    }
}

impl From<Arc<dyn ScopeObject>> for AttributeValue {
    fn from(o: Arc<dyn ScopeObject>) -> Self {
        Self::Object(o)
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> From<RenewalAware<T>> for AttributeValue {
    fn from(r: RenewalAware<T>) -> Self {
        Self::object(r)
    }
}

macro_rules! plain_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AttributeValue {
                fn from(v: $ty) -> Self {
                    Self::Plain(Value::from(v))
                }
            }
        )*
    };
}

plain_from!(bool, i32, i64, f64, &str, String, Vec<u8>);

// ---------------------------------------------------------------------------
// AttributeContainer
// ---------------------------------------------------------------------------

/// Name -> value map backing a scope's attributes.
///
/// Not internally synchronized.
#[derive(Debug, Clone, Default)]
pub struct AttributeContainer {
    attributes: HashMap<String, AttributeValue>,
}

impl AttributeContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    #[must_use]
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(AttributeValue::as_value)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get_value(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get_value(name).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get_value(name).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_value(name).and_then(Value::as_bool)
    }

    /// Returns the object stored under `name` if it has type `T`.
    #[must_use]
    pub fn get_object<T: ScopeObject>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(AttributeValue::downcast::<T>)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attribute names in unspecified order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Stores `value` under `name`.
    ///
    /// Returns `Unchanged` if an equal value was already present (plain values
    /// by content, objects by identity).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Change {
        let name = name.into();
        let value = value.into();
        if self.attributes.get(&name) == Some(&value) {
            return Change::Unchanged;
        }
        self.attributes.insert(name, value);
        Change::Changed
    }

    /// Stores every entry of `attributes`; changed if any single set changed.
    pub fn set_all<I, K, V>(&mut self, attributes: I) -> Change
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        attributes
            .into_iter()
            .fold(Change::Unchanged, |acc, (k, v)| acc.or(self.set(k, v)))
    }

    pub fn remove(&mut self, name: &str) -> Change {
        Change::from(self.attributes.remove(name).is_some())
    }

    /// Removes and returns the value stored under `name`.
    pub fn take(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Returns the value under `name`, inserting `init()` first if absent.
    pub fn compute_if_absent<F>(&mut self, name: impl Into<String>, init: F) -> &AttributeValue
    where
        F: FnOnce() -> AttributeValue,
    {
        self.attributes.entry(name.into()).or_insert_with(init)
    }

    pub fn clear(&mut self) -> Change {
        if self.attributes.is_empty() {
            return Change::Unchanged;
        }
        self.attributes.clear();
        Change::Changed
    }

    /// Copies of exactly the attributes whose value is renewal-aware.
    #[must_use]
    pub fn renewal_aware(&self) -> HashMap<String, AttributeValue> {
        self.attributes
            .iter()
            .filter(|(_, v)| v.is_renewal_aware())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Removes and returns exactly the renewal-aware attributes.
    pub fn take_renewal_aware(&mut self) -> HashMap<String, AttributeValue> {
        let names: Vec<String> = self
            .attributes
            .iter()
            .filter(|(_, v)| v.is_renewal_aware())
            .map(|(k, _)| k.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.attributes.remove_entry(&name))
            .collect()
    }

    /// All object attributes, for running destruction hooks outside a lock.
    #[must_use]
    pub fn objects(&self) -> Vec<(String, Arc<dyn ScopeObject>)> {
        self.attributes
            .iter()
            .filter_map(|(k, v)| v.as_object().map(|o| (k.clone(), Arc::clone(o))))
            .collect()
    }
}
