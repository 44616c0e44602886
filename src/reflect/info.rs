use std::any::Any;
use std::cmp::Ordering;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;
use crate::core::value::{DynRef, DynValue, EntityKey, KeyScalar};
use crate::reflect::collections::{CollectionOps, DynCollection};
use crate::reflect::shape::TypeShape;

// ========================================
// Capability signatures
// ========================================

pub type CloneFn = fn(DynRef<'_>) -> Result<DynValue>;
pub type DefaultFn = fn() -> DynValue;
pub type EqFn = fn(DynRef<'_>, DynRef<'_>) -> Result<bool>;
pub type HashFn = fn(DynRef<'_>) -> Result<u64>;
pub type OrdFn = fn(DynRef<'_>, DynRef<'_>) -> Result<Ordering>;
pub type ExtractKeyFn = fn(DynRef<'_>) -> Result<Option<EntityKey>>;
pub type KeyFromFn = fn(&EntityKey) -> Result<Option<DynValue>>;

/// A named capability with ground shape arguments, the runtime stand-in for
/// "implements interface I<...>". Built-in capabilities are also mirrored
/// here under well-known names so templates can constrain on either form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ability {
    pub name: &'static str,
    pub args: Vec<TypeShape>,
}

pub mod ability {
    //! Well-known ability names attached automatically at registration.

    pub const CLONE: &str = "Clone";
    pub const DEFAULT: &str = "Default";
    pub const COPY: &str = "Copy";
    pub const EQ: &str = "Eq";
    pub const HASH: &str = "Hash";
    pub const ORD: &str = "Ord";
    pub const KEY: &str = "Key";
}

// ========================================
// TypeInfo
// ========================================

/// Everything the engine knows about one registered type: its shape, its
/// capability vtable and, for collections, the erased collection operations.
pub struct TypeInfo {
    pub(crate) key: TypeKey,
    pub(crate) shape: TypeShape,
    pub(crate) clone_value: Option<CloneFn>,
    pub(crate) default_value: Option<DefaultFn>,
    pub(crate) eq_values: Option<EqFn>,
    pub(crate) hash_value: Option<HashFn>,
    pub(crate) ord_values: Option<OrdFn>,
    pub(crate) copyable: bool,
    pub(crate) extract_key: Option<ExtractKeyFn>,
    pub(crate) key_from: Option<KeyFromFn>,
    pub(crate) key_components: Vec<TypeKey>,
    pub(crate) abilities: Vec<Ability>,
    pub(crate) collection: Option<CollectionOps>,
}

impl TypeInfo {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn shape(&self) -> &TypeShape {
        &self.shape
    }

    pub fn can_clone(&self) -> bool {
        self.clone_value.is_some()
    }

    pub fn clone_value(&self, value: DynRef<'_>) -> Result<DynValue> {
        match self.clone_value {
            Some(f) => f(value),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as cloneable",
                self.key.name()
            ))),
        }
    }

    pub fn can_default(&self) -> bool {
        self.default_value.is_some()
    }

    pub fn default_value(&self) -> Result<DynValue> {
        match self.default_value {
            Some(f) => Ok(f()),
            None => Err(MapError::ObjectCreation {
                type_name: self.key.name(),
            }),
        }
    }

    pub fn can_eq(&self) -> bool {
        self.eq_values.is_some()
    }

    pub fn eq_values(&self, a: DynRef<'_>, b: DynRef<'_>) -> Result<bool> {
        match self.eq_values {
            Some(f) => f(a, b),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as equatable",
                self.key.name()
            ))),
        }
    }

    pub fn can_hash(&self) -> bool {
        self.hash_value.is_some()
    }

    pub fn hash_value(&self, value: DynRef<'_>) -> Result<u64> {
        match self.hash_value {
            Some(f) => f(value),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as hashable",
                self.key.name()
            ))),
        }
    }

    pub fn can_ord(&self) -> bool {
        self.ord_values.is_some()
    }

    pub fn ord_values(&self, a: DynRef<'_>, b: DynRef<'_>) -> Result<Ordering> {
        match self.ord_values {
            Some(f) => f(a, b),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as ordered",
                self.key.name()
            ))),
        }
    }

    pub fn is_copyable(&self) -> bool {
        self.copyable
    }

    pub fn is_key_like(&self) -> bool {
        self.extract_key.is_some()
    }

    /// Ordered component types of this key type; empty if not key-like.
    pub fn key_components(&self) -> &[TypeKey] {
        &self.key_components
    }

    /// `Ok(None)` when the value is null.
    pub fn extract_key(&self, value: DynRef<'_>) -> Result<Option<EntityKey>> {
        match self.extract_key {
            Some(f) => f(value),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as key-like",
                self.key.name()
            ))),
        }
    }

    /// Rebuilds a value of this key type from extracted scalars. `None` if
    /// the scalars do not fit the component types.
    pub fn key_from(&self, key: &EntityKey) -> Result<Option<DynValue>> {
        match self.key_from {
            Some(f) => f(key),
            None => Err(MapError::Configuration(format!(
                "type '{}' is not registered as key-like",
                self.key.name()
            ))),
        }
    }

    pub fn has_ability(&self, name: &str, args: &[TypeShape]) -> bool {
        self.abilities
            .iter()
            .any(|a| a.name == name && a.args == args)
    }

    pub fn abilities(&self) -> &[Ability] {
        &self.abilities
    }

    pub fn collection(&self) -> Option<&CollectionOps> {
        self.collection.as_ref()
    }
}

// ========================================
// Capability helpers
// ========================================

pub(crate) fn clone_impl<T: Any + Send + Sync + Clone>(value: DynRef<'_>) -> Result<DynValue> {
    Ok(match value.downcast_ref::<T>()? {
        Some(v) => DynValue::new(v.clone()),
        None => DynValue::null::<T>(),
    })
}

pub(crate) fn default_impl<T: Any + Send + Sync + Default>() -> DynValue {
    DynValue::new(T::default())
}

pub(crate) fn eq_impl<T: Any + PartialEq>(a: DynRef<'_>, b: DynRef<'_>) -> Result<bool> {
    let a = a.downcast_ref::<T>()?;
    let b = b.downcast_ref::<T>()?;
    Ok(match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    })
}

pub(crate) fn hash_impl<T: Any + Hash>(value: DynRef<'_>) -> Result<u64> {
    let mut hasher = DefaultHasher::new();
    match value.downcast_ref::<T>()? {
        Some(v) => {
            1u8.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        None => 0u8.hash(&mut hasher),
    }
    Ok(hasher.finish())
}

// Nulls order last, matching how absent values sort elsewhere.
pub(crate) fn ord_impl<T: Any + Ord>(a: DynRef<'_>, b: DynRef<'_>) -> Result<Ordering> {
    let a = a.downcast_ref::<T>()?;
    let b = b.downcast_ref::<T>()?;
    Ok(match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    })
}

fn scalar_key_impl<T: KeyScalarLike>(value: DynRef<'_>) -> Result<Option<EntityKey>> {
    Ok(value
        .downcast_ref::<T>()?
        .map(|v| EntityKey::single(v.to_key_scalar())))
}

fn scalar_key_from_impl<T: KeyScalarLike>(key: &EntityKey) -> Result<Option<DynValue>> {
    if key.len() != 1 {
        return Ok(None);
    }
    Ok(T::from_key_scalar(&key.components()[0]).map(DynValue::new))
}

fn pair_key_impl<A: KeyScalarLike, B: KeyScalarLike>(value: DynRef<'_>) -> Result<Option<EntityKey>> {
    Ok(value.downcast_ref::<(A, B)>()?.map(|(a, b)| {
        EntityKey::new(vec![a.to_key_scalar(), b.to_key_scalar()])
    }))
}

fn pair_key_from_impl<A: KeyScalarLike, B: KeyScalarLike>(key: &EntityKey) -> Result<Option<DynValue>> {
    if key.len() != 2 {
        return Ok(None);
    }
    let a = A::from_key_scalar(&key.components()[0]);
    let b = B::from_key_scalar(&key.components()[1]);
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(DynValue::new((a, b))),
        _ => None,
    })
}

fn triple_key_impl<A: KeyScalarLike, B: KeyScalarLike, C: KeyScalarLike>(
    value: DynRef<'_>,
) -> Result<Option<EntityKey>> {
    Ok(value.downcast_ref::<(A, B, C)>()?.map(|(a, b, c)| {
        EntityKey::new(vec![a.to_key_scalar(), b.to_key_scalar(), c.to_key_scalar()])
    }))
}

fn triple_key_from_impl<A: KeyScalarLike, B: KeyScalarLike, C: KeyScalarLike>(
    key: &EntityKey,
) -> Result<Option<DynValue>> {
    if key.len() != 3 {
        return Ok(None);
    }
    let a = A::from_key_scalar(&key.components()[0]);
    let b = B::from_key_scalar(&key.components()[1]);
    let c = C::from_key_scalar(&key.components()[2]);
    Ok(match (a, b, c) {
        (Some(a), Some(b), Some(c)) => Some(DynValue::new((a, b, c))),
        _ => None,
    })
}

// ========================================
// Key-like scalar types
// ========================================

/// Types usable as entity key components. The impl set is closed on
/// purpose; every member hashes and compares exactly.
pub trait KeyScalarLike: Any + Send + Sync + Sized {
    fn to_key_scalar(&self) -> KeyScalar;
    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self>;
}

impl KeyScalarLike for bool {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Bool(*self)
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl KeyScalarLike for i32 {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Int(i64::from(*self))
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl KeyScalarLike for i64 {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Int(*self)
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl KeyScalarLike for u32 {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::UInt(u64::from(*self))
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::UInt(u) => u32::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl KeyScalarLike for u64 {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::UInt(*self)
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::UInt(u) => Some(*u),
            _ => None,
        }
    }
}

impl KeyScalarLike for String {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Text(self.clone())
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl KeyScalarLike for Uuid {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Uuid(*self)
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl KeyScalarLike for DateTime<Utc> {
    fn to_key_scalar(&self) -> KeyScalar {
        KeyScalar::Time(*self)
    }

    fn from_key_scalar(scalar: &KeyScalar) -> Option<Self> {
        match scalar {
            KeyScalar::Time(t) => Some(*t),
            _ => None,
        }
    }
}

// ========================================
// Registration builder
// ========================================

/// Per-type configuration collected before the registry is built. The
/// phantom parameter lets each capability method demand exactly the trait
/// bound it erases.
pub struct TypeInfoBuilder<T: Any + Send + Sync> {
    pub(crate) key: TypeKey,
    pub(crate) ctor: Option<(&'static str, Vec<TypeKey>)>,
    pub(crate) clone_value: Option<CloneFn>,
    pub(crate) default_value: Option<DefaultFn>,
    pub(crate) eq_values: Option<EqFn>,
    pub(crate) hash_value: Option<HashFn>,
    pub(crate) ord_values: Option<OrdFn>,
    pub(crate) copyable: bool,
    pub(crate) extract_key: Option<ExtractKeyFn>,
    pub(crate) key_from: Option<KeyFromFn>,
    pub(crate) key_components: Vec<TypeKey>,
    pub(crate) abilities: Vec<(&'static str, Vec<TypeKey>)>,
    pub(crate) collection: Option<CollectionOps>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> TypeInfoBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            ctor: None,
            clone_value: None,
            default_value: None,
            eq_values: None,
            hash_value: None,
            ord_values: None,
            copyable: false,
            extract_key: None,
            key_from: None,
            key_components: Vec::new(),
            abilities: Vec::new(),
            collection: None,
            _marker: PhantomData,
        }
    }

    pub fn cloneable(mut self) -> Self
    where
        T: Clone,
    {
        self.clone_value = Some(clone_impl::<T>);
        self
    }

    pub fn defaultable(mut self) -> Self
    where
        T: Default,
    {
        self.default_value = Some(default_impl::<T>);
        self
    }

    pub fn equatable(mut self) -> Self
    where
        T: PartialEq,
    {
        self.eq_values = Some(eq_impl::<T>);
        self
    }

    pub fn hashable(mut self) -> Self
    where
        T: Hash,
    {
        self.hash_value = Some(hash_impl::<T>);
        self
    }

    pub fn ordered(mut self) -> Self
    where
        T: Ord,
    {
        self.ord_values = Some(ord_impl::<T>);
        self
    }

    pub fn copyable(mut self) -> Self
    where
        T: Copy,
    {
        self.copyable = true;
        self.clone_value = Some(clone_impl::<T>);
        self
    }

    pub fn key_like(mut self) -> Self
    where
        T: KeyScalarLike,
    {
        self.extract_key = Some(scalar_key_impl::<T>);
        self.key_from = Some(scalar_key_from_impl::<T>);
        self.key_components = vec![TypeKey::of::<T>()];
        self
    }

    /// Declares a named ability with type arguments, matched by
    /// `Implements` template constraints.
    pub fn ability(mut self, name: &'static str, args: Vec<TypeKey>) -> Self {
        self.abilities.push((name, args));
        self
    }

    pub(crate) fn with_ctor(mut self, name: &'static str, args: Vec<TypeKey>) -> Self {
        self.ctor = Some((name, args));
        self
    }

    pub(crate) fn with_collection<C: DynCollection>(mut self) -> Self {
        self.collection = Some(CollectionOps::of::<C>());
        self.ctor = Some((C::CTOR, C::arg_keys()));
        self
    }

    pub(crate) fn with_pair_key<A: KeyScalarLike, B: KeyScalarLike>(mut self) -> Self {
        self.extract_key = Some(pair_key_impl::<A, B>);
        self.key_from = Some(pair_key_from_impl::<A, B>);
        self.key_components = vec![TypeKey::of::<A>(), TypeKey::of::<B>()];
        self
    }

    pub(crate) fn with_triple_key<A: KeyScalarLike, B: KeyScalarLike, C: KeyScalarLike>(
        mut self,
    ) -> Self {
        self.extract_key = Some(triple_key_impl::<A, B, C>);
        self.key_from = Some(triple_key_from_impl::<A, B, C>);
        self.key_components = vec![TypeKey::of::<A>(), TypeKey::of::<B>(), TypeKey::of::<C>()];
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_helper_treats_two_nulls_as_equal() {
        assert!(eq_impl::<i32>(DynRef::null::<i32>(), DynRef::null::<i32>()).unwrap());
        let one = 1;
        assert!(!eq_impl::<i32>(DynRef::new(&one), DynRef::null::<i32>()).unwrap());
    }

    #[test]
    fn ord_helper_sorts_nulls_last() {
        let one = 1;
        assert_eq!(
            ord_impl::<i32>(DynRef::null::<i32>(), DynRef::new(&one)).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn scalar_key_round_trip() {
        let id = 42_i32;
        let key = scalar_key_impl::<i32>(DynRef::new(&id)).unwrap().unwrap();
        let back = scalar_key_from_impl::<i32>(&key).unwrap().unwrap();
        assert_eq!(back.downcast::<i32>().unwrap(), Some(42));
    }

    #[test]
    fn pair_key_preserves_component_order() {
        let v = (7_i32, Uuid::nil());
        let key = pair_key_impl::<i32, Uuid>(DynRef::new(&v)).unwrap().unwrap();
        assert_eq!(key.components()[0], KeyScalar::Int(7));
        assert_eq!(key.components()[1], KeyScalar::Uuid(Uuid::nil()));

        // Swapped component types do not reconstruct.
        assert!(pair_key_from_impl::<Uuid, i32>(&key).unwrap().is_none());
    }

    #[test]
    fn narrow_scalar_rejects_out_of_range() {
        let key = EntityKey::single(i64::MAX);
        assert!(i32::from_key_scalar(&key.components()[0]).is_none());
    }
}
