use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;

// ========================================
// Owned dynamic value
// ========================================

/// A single value travelling through the engine: a runtime type tag plus an
/// optional payload. `None` payload encodes a typed null, so "no value of
/// type T" keeps its type identity across strategy boundaries.
///
/// Payloads are `Send + Sync` so mapping futures can be driven from any task.
pub struct DynValue {
    key: TypeKey,
    payload: Option<Box<dyn Any + Send + Sync>>,
}

impl DynValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            payload: Some(Box::new(value)),
        }
    }

    /// A typed null of `T`.
    pub fn null<T: Any + Send + Sync>() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            payload: None,
        }
    }

    /// A typed null for a type only known at runtime.
    pub fn null_of(key: TypeKey) -> Self {
        Self { key, payload: None }
    }

    pub fn from_option<T: Any + Send + Sync>(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::new(v),
            None => Self::null::<T>(),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    pub fn is_null(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.key == TypeKey::of::<T>()
    }

    /// Borrowed view with the same type tag and null-ness.
    pub fn as_dyn(&self) -> DynRef<'_> {
        DynRef {
            key: self.key,
            payload: self.payload.as_deref(),
        }
    }

    fn mismatch<T: Any>(&self) -> MapError {
        MapError::TypeMismatch(format!(
            "expected '{}', found '{}'",
            TypeKey::of::<T>().name(),
            self.key.name()
        ))
    }

    /// Consumes the value. `Ok(None)` is a typed null of the right type.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Option<T>> {
        if !self.is::<T>() {
            return Err(self.mismatch::<T>());
        }
        match self.payload {
            None => Ok(None),
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(v) => Ok(Some(*v)),
                Err(_) => Err(MapError::TypeMismatch(format!(
                    "payload of '{}' does not match its type tag",
                    self.key.name()
                ))),
            },
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Result<Option<&T>> {
        if !self.is::<T>() {
            return Err(self.mismatch::<T>());
        }
        Ok(self.payload.as_deref().and_then(|p| p.downcast_ref::<T>()))
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Result<Option<&mut T>> {
        if !self.is::<T>() {
            return Err(self.mismatch::<T>());
        }
        Ok(self
            .payload
            .as_deref_mut()
            .and_then(|p| p.downcast_mut::<T>()))
    }

    /// Moves the payload out, leaving a typed null behind. Merge strategies
    /// use this to hand the destination to user code by value.
    pub fn take_payload<T: Any + Send + Sync>(&mut self) -> Result<Option<T>> {
        if !self.is::<T>() {
            return Err(self.mismatch::<T>());
        }
        match self.payload.take() {
            None => Ok(None),
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(v) => Ok(Some(*v)),
                Err(_) => Err(MapError::TypeMismatch(format!(
                    "payload of '{}' does not match its type tag",
                    self.key.name()
                ))),
            },
        }
    }
}

impl fmt::Debug for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "DynValue({}, null)", self.key)
        } else {
            write!(f, "DynValue({})", self.key)
        }
    }
}

// ========================================
// Borrowed dynamic value
// ========================================

/// Borrowed counterpart of [`DynValue`]. `Copy`, so composite chains can
/// hand the same source to several candidate strategies in turn.
#[derive(Clone, Copy)]
pub struct DynRef<'a> {
    key: TypeKey,
    payload: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> DynRef<'a> {
    pub fn new<T: Any + Send + Sync>(value: &'a T) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            payload: Some(value),
        }
    }

    pub fn null<T: Any + Send + Sync>() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            payload: None,
        }
    }

    pub fn null_of(key: TypeKey) -> Self {
        Self { key, payload: None }
    }

    pub fn from_option<T: Any + Send + Sync>(value: Option<&'a T>) -> Self {
        match value {
            Some(v) => Self::new(v),
            None => Self::null::<T>(),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    pub fn is_null(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.key == TypeKey::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Result<Option<&'a T>> {
        if !self.is::<T>() {
            return Err(MapError::TypeMismatch(format!(
                "expected '{}', found '{}'",
                TypeKey::of::<T>().name(),
                self.key.name()
            )));
        }
        Ok(self.payload.and_then(|p| p.downcast_ref::<T>()))
    }
}

impl fmt::Debug for DynRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "DynRef({}, null)", self.key)
        } else {
            write!(f, "DynRef({})", self.key)
        }
    }
}

// ========================================
// Key scalars
// ========================================

/// The closed set of scalar shapes an entity key component may take.
/// Narrow integer key fields widen into `Int`/`UInt`; floats are excluded
/// because keys must hash and compare exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyScalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    Uuid(Uuid),
    Time(DateTime<Utc>),
}

impl fmt::Display for KeyScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::UInt(u) => write!(f, "{}", u),
            Self::Text(s) => write!(f, "{}", s),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for KeyScalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for KeyScalar {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for KeyScalar {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for KeyScalar {
    fn from(u: u32) -> Self {
        Self::UInt(u64::from(u))
    }
}

impl From<u64> for KeyScalar {
    fn from(u: u64) -> Self {
        Self::UInt(u)
    }
}

impl From<String> for KeyScalar {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for KeyScalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Uuid> for KeyScalar {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

impl From<DateTime<Utc>> for KeyScalar {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

/// An entity key: one scalar per component, in declaration order. Two keys
/// with the same scalars in a different order are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(Vec<KeyScalar>);

impl EntityKey {
    pub fn new(components: Vec<KeyScalar>) -> Self {
        Self(components)
    }

    pub fn single(component: impl Into<KeyScalar>) -> Self {
        Self(vec![component.into()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> &[KeyScalar] {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}", c)?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<KeyScalar> for EntityKey {
    fn from_iter<I: IntoIterator<Item = KeyScalar>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
