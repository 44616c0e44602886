use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;
use crate::core::value::{DynRef, DynValue};
use crate::reflect::shape::ctor;

// ========================================
// Collection classification
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Positional, duplicates allowed.
    Sequence,
    /// Membership-based, deduplicating.
    Set,
    /// Key/value entries; element type is the entry pair.
    MapLike,
}

/// One element as seen while walking a collection. Sequences and sets lend
/// their elements out; map-likes clone each entry into an owned pair because
/// no contiguous `(K, V)` exists to borrow.
pub enum ElemView<'a> {
    Borrowed(DynRef<'a>),
    Owned(DynValue),
}

impl ElemView<'_> {
    pub fn as_dyn(&self) -> DynRef<'_> {
        match self {
            Self::Borrowed(r) => *r,
            Self::Owned(v) => v.as_dyn(),
        }
    }
}

// ========================================
// Erased collection operations
// ========================================

/// Type-erased handle on one collection type, stored in its `TypeInfo`.
/// All function pointers are monomorphized from a [`DynCollection`] impl.
#[derive(Clone)]
pub struct CollectionOps {
    pub elem: TypeKey,
    pub kind: CollectionKind,
    pub ordered: bool,
    /// `false` for frozen carriers that cannot accept merged elements.
    pub growable: bool,
    pub len: fn(DynRef<'_>) -> Result<usize>,
    pub iter: for<'a> fn(DynRef<'a>) -> Result<Box<dyn Iterator<Item = ElemView<'a>> + 'a>>,
    pub drain: fn(DynValue) -> Result<Vec<DynValue>>,
    pub build: fn(Vec<DynValue>) -> Result<DynValue>,
}

impl CollectionOps {
    pub fn of<C: DynCollection>() -> Self {
        Self {
            elem: TypeKey::of::<C::Elem>(),
            kind: C::KIND,
            ordered: C::ORDERED,
            growable: C::GROWABLE,
            len: len_impl::<C>,
            iter: iter_impl::<C>,
            drain: drain_impl::<C>,
            build: build_impl::<C>,
        }
    }

    pub fn empty(&self) -> Result<DynValue> {
        (self.build)(Vec::new())
    }
}

fn len_impl<C: DynCollection>(value: DynRef<'_>) -> Result<usize> {
    match value.downcast_ref::<C>()? {
        Some(c) => Ok(c.dyn_len()),
        None => Err(MapError::TypeMismatch(format!(
            "cannot take the length of a null '{}'",
            TypeKey::of::<C>().name()
        ))),
    }
}

fn iter_impl<C: DynCollection>(value: DynRef<'_>) -> Result<Box<dyn Iterator<Item = ElemView<'_>> + '_>> {
    match value.downcast_ref::<C>()? {
        Some(c) => Ok(c.dyn_iter()),
        None => Err(MapError::TypeMismatch(format!(
            "cannot iterate a null '{}'",
            TypeKey::of::<C>().name()
        ))),
    }
}

fn drain_impl<C: DynCollection>(value: DynValue) -> Result<Vec<DynValue>> {
    match value.downcast::<C>()? {
        Some(c) => Ok(c.dyn_drain().into_iter().map(DynValue::new).collect()),
        None => Ok(Vec::new()),
    }
}

fn build_impl<C: DynCollection>(items: Vec<DynValue>) -> Result<DynValue> {
    let mut elems = Vec::with_capacity(items.len());
    for item in items {
        match item.downcast::<C::Elem>()? {
            Some(e) => elems.push(e),
            None => {
                return Err(MapError::TypeMismatch(format!(
                    "null element while building '{}'",
                    TypeKey::of::<C>().name()
                )));
            }
        }
    }
    Ok(DynValue::new(C::dyn_build(elems)))
}

// ========================================
// Collection trait and standard impls
// ========================================

/// Implemented once per supported collection carrier. Registration erases
/// the impl into [`CollectionOps`].
pub trait DynCollection: Any + Send + Sync + Sized {
    type Elem: Any + Send + Sync;

    const CTOR: &'static str;
    const KIND: CollectionKind;
    const ORDERED: bool;
    const GROWABLE: bool = true;

    /// Type arguments in declaration order, for the registered shape.
    /// Map-likes report `[K, V]` even though their element is `(K, V)`.
    fn arg_keys() -> Vec<TypeKey>;

    fn dyn_len(&self) -> usize;
    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_>;
    fn dyn_drain(self) -> Vec<Self::Elem>;
    fn dyn_build(elems: Vec<Self::Elem>) -> Self;
}

impl<T: Any + Send + Sync> DynCollection for Vec<T> {
    type Elem = T;

    const CTOR: &'static str = ctor::VEC;
    const KIND: CollectionKind = CollectionKind::Sequence;
    const ORDERED: bool = true;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems
    }
}

impl<T: Any + Send + Sync> DynCollection for VecDeque<T> {
    type Elem = T;

    const CTOR: &'static str = ctor::VEC_DEQUE;
    const KIND: CollectionKind = CollectionKind::Sequence;
    const ORDERED: bool = true;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self.into_iter().collect()
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems.into_iter().collect()
    }
}

impl<T: Any + Send + Sync + Eq + Hash> DynCollection for HashSet<T> {
    type Elem = T;

    const CTOR: &'static str = ctor::HASH_SET;
    const KIND: CollectionKind = CollectionKind::Set;
    const ORDERED: bool = false;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self.into_iter().collect()
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems.into_iter().collect()
    }
}

impl<T: Any + Send + Sync + Ord> DynCollection for BTreeSet<T> {
    type Elem = T;

    const CTOR: &'static str = ctor::BTREE_SET;
    const KIND: CollectionKind = CollectionKind::Set;
    const ORDERED: bool = true;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self.into_iter().collect()
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems.into_iter().collect()
    }
}

impl<K, V> DynCollection for HashMap<K, V>
where
    K: Any + Send + Sync + Eq + Hash + Clone,
    V: Any + Send + Sync + Clone,
{
    type Elem = (K, V);

    const CTOR: &'static str = ctor::HASH_MAP;
    const KIND: CollectionKind = CollectionKind::MapLike;
    const ORDERED: bool = false;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<K>(), TypeKey::of::<V>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(
            self.iter()
                .map(|(k, v)| ElemView::Owned(DynValue::new((k.clone(), v.clone())))),
        )
    }

    fn dyn_drain(self) -> Vec<(K, V)> {
        self.into_iter().collect()
    }

    fn dyn_build(elems: Vec<(K, V)>) -> Self {
        elems.into_iter().collect()
    }
}

impl<K, V> DynCollection for BTreeMap<K, V>
where
    K: Any + Send + Sync + Ord + Clone,
    V: Any + Send + Sync + Clone,
{
    type Elem = (K, V);

    const CTOR: &'static str = ctor::BTREE_MAP;
    const KIND: CollectionKind = CollectionKind::MapLike;
    const ORDERED: bool = true;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<K>(), TypeKey::of::<V>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(
            self.iter()
                .map(|(k, v)| ElemView::Owned(DynValue::new((k.clone(), v.clone())))),
        )
    }

    fn dyn_drain(self) -> Vec<(K, V)> {
        self.into_iter().collect()
    }

    fn dyn_build(elems: Vec<(K, V)>) -> Self {
        elems.into_iter().collect()
    }
}

impl<T: Any + Send + Sync> DynCollection for Box<[T]> {
    type Elem = T;

    const CTOR: &'static str = ctor::BOXED_SLICE;
    const KIND: CollectionKind = CollectionKind::Sequence;
    const ORDERED: bool = true;
    const GROWABLE: bool = false;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self.into_vec()
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems.into_boxed_slice()
    }
}

// Shared slices cannot move their elements out, so draining clones.
impl<T: Any + Send + Sync + Clone> DynCollection for Arc<[T]> {
    type Elem = T;

    const CTOR: &'static str = ctor::SHARED_SLICE;
    const KIND: CollectionKind = CollectionKind::Sequence;
    const ORDERED: bool = true;
    const GROWABLE: bool = false;

    fn arg_keys() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }

    fn dyn_len(&self) -> usize {
        self.len()
    }

    fn dyn_iter(&self) -> Box<dyn Iterator<Item = ElemView<'_>> + '_> {
        Box::new(self.iter().map(|e| ElemView::Borrowed(DynRef::new(e))))
    }

    fn dyn_drain(self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    fn dyn_build(elems: Vec<T>) -> Self {
        elems.into()
    }
}
