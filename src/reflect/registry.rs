use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;
use crate::reflect::collections::DynCollection;
use crate::reflect::info::{Ability, KeyScalarLike, TypeInfo, TypeInfoBuilder, ability};
use crate::reflect::shape::{TypeShape, ctor};

// ========================================
// Built registry
// ========================================

/// Immutable lookup of everything registered about the mappable types.
/// Built once, shared behind `Arc` by the whole engine.
pub struct TypeRegistry {
    infos: HashMap<TypeId, Arc<TypeInfo>>,
    by_shape: HashMap<TypeShape, TypeId>,
}

impl TypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Builder pre-seeded with primitives, `String`, `Uuid` and UTC
    /// timestamps, with key extraction wired for every exact-comparing
    /// scalar.
    pub fn standard() -> RegistryBuilder {
        let mut b = RegistryBuilder::new();

        macro_rules! copy_scalar {
            ($($t:ty),+ $(,)?) => {
                $( b = b.register::<$t>(|t| t.copyable().defaultable().equatable().hashable().ordered()); )+
            };
        }
        macro_rules! key_scalar {
            ($($t:ty),+ $(,)?) => {
                $( b = b.register::<$t>(|t| t.copyable().defaultable().equatable().hashable().ordered().key_like()); )+
            };
        }

        copy_scalar!(i8, i16, i128, u8, u16, u128, usize, isize, char, ());
        key_scalar!(bool, i32, i64, u32, u64, Uuid);

        b = b.register::<f32>(|t| t.copyable().defaultable().equatable());
        b = b.register::<f64>(|t| t.copyable().defaultable().equatable());
        b = b.register::<String>(|t| {
            t.cloneable()
                .defaultable()
                .equatable()
                .hashable()
                .ordered()
                .key_like()
        });
        b = b.register::<DateTime<Utc>>(|t| t.copyable().equatable().hashable().ordered().key_like());
        b
    }

    pub fn get(&self, id: TypeId) -> Option<&Arc<TypeInfo>> {
        self.infos.get(&id)
    }

    pub fn get_key(&self, key: TypeKey) -> Option<&Arc<TypeInfo>> {
        self.infos.get(&key.id())
    }

    pub fn require(&self, key: TypeKey) -> Result<&Arc<TypeInfo>> {
        self.get_key(key).ok_or_else(|| {
            MapError::Configuration(format!("type '{}' is not registered", key.name()))
        })
    }

    /// Resolves a ground shape back to its registered type, the step that
    /// turns template bindings into concrete `TypeInfo`s.
    pub fn by_shape(&self, shape: &TypeShape) -> Option<&Arc<TypeInfo>> {
        self.by_shape.get(shape).and_then(|id| self.infos.get(id))
    }

    pub fn shape_of(&self, key: TypeKey) -> Option<&TypeShape> {
        self.get_key(key).map(|info| info.shape())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ========================================
// Builder
// ========================================

struct PendingType {
    key: TypeKey,
    ctor: Option<(&'static str, Vec<TypeKey>)>,
    clone_value: Option<crate::reflect::info::CloneFn>,
    default_value: Option<crate::reflect::info::DefaultFn>,
    eq_values: Option<crate::reflect::info::EqFn>,
    hash_value: Option<crate::reflect::info::HashFn>,
    ord_values: Option<crate::reflect::info::OrdFn>,
    copyable: bool,
    extract_key: Option<crate::reflect::info::ExtractKeyFn>,
    key_from: Option<crate::reflect::info::KeyFromFn>,
    key_components: Vec<TypeKey>,
    abilities: Vec<(&'static str, Vec<TypeKey>)>,
    collection: Option<crate::reflect::collections::CollectionOps>,
}

impl<T: Any + Send + Sync> From<TypeInfoBuilder<T>> for PendingType {
    fn from(b: TypeInfoBuilder<T>) -> Self {
        Self {
            key: b.key,
            ctor: b.ctor,
            clone_value: b.clone_value,
            default_value: b.default_value,
            eq_values: b.eq_values,
            hash_value: b.hash_value,
            ord_values: b.ord_values,
            copyable: b.copyable,
            extract_key: b.extract_key,
            key_from: b.key_from,
            key_components: b.key_components,
            abilities: b.abilities,
            collection: b.collection,
        }
    }
}

/// Collects type registrations and finalizes them into a [`TypeRegistry`].
/// Registering the same type twice replaces the earlier entry, so callers
/// can extend the standard scalars.
pub struct RegistryBuilder {
    pending: HashMap<TypeId, PendingType>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn register<T: Any + Send + Sync>(
        mut self,
        configure: impl FnOnce(TypeInfoBuilder<T>) -> TypeInfoBuilder<T>,
    ) -> Self {
        let built = configure(TypeInfoBuilder::<T>::new());
        self.pending.insert(TypeId::of::<T>(), built.into());
        self
    }

    /// Registers a collection carrier together with its erased operations.
    /// The element type gets no automatic registration; register it too if
    /// element mapping should see its capabilities.
    pub fn collection<C: DynCollection>(
        mut self,
        configure: impl FnOnce(TypeInfoBuilder<C>) -> TypeInfoBuilder<C>,
    ) -> Self {
        let built = configure(TypeInfoBuilder::<C>::new().with_collection::<C>());
        self.pending.insert(TypeId::of::<C>(), built.into());
        self
    }

    /// Registers `Option<T>` as a one-argument constructor shape.
    pub fn option_of<T>(self) -> Self
    where
        T: Any + Send + Sync + Clone + PartialEq,
    {
        self.register::<Option<T>>(|t| {
            t.cloneable()
                .defaultable()
                .equatable()
                .with_ctor(ctor::OPTION, vec![TypeKey::of::<T>()])
        })
    }

    /// Registers the pair `(A, B)` as a two-argument tuple shape.
    pub fn tuple2_of<A, B>(
        self,
        configure: impl FnOnce(TypeInfoBuilder<(A, B)>) -> TypeInfoBuilder<(A, B)>,
    ) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.register::<(A, B)>(|t| {
            configure(t.with_ctor(ctor::TUPLE2, vec![TypeKey::of::<A>(), TypeKey::of::<B>()]))
        })
    }

    pub fn tuple3_of<A, B, C>(
        self,
        configure: impl FnOnce(TypeInfoBuilder<(A, B, C)>) -> TypeInfoBuilder<(A, B, C)>,
    ) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
    {
        self.register::<(A, B, C)>(|t| {
            configure(t.with_ctor(
                ctor::TUPLE3,
                vec![TypeKey::of::<A>(), TypeKey::of::<B>(), TypeKey::of::<C>()],
            ))
        })
    }

    /// Registers `(A, B)` as a composite key type: component order is part
    /// of the key identity.
    pub fn key_pair_of<A, B>(self) -> Self
    where
        A: KeyScalarLike + Clone + PartialEq + Eq + std::hash::Hash,
        B: KeyScalarLike + Clone + PartialEq + Eq + std::hash::Hash,
    {
        self.tuple2_of::<A, B>(|t| {
            t.cloneable()
                .equatable()
                .hashable()
                .with_pair_key::<A, B>()
        })
    }

    pub fn key_triple_of<A, B, C>(self) -> Self
    where
        A: KeyScalarLike + Clone + PartialEq + Eq + std::hash::Hash,
        B: KeyScalarLike + Clone + PartialEq + Eq + std::hash::Hash,
        C: KeyScalarLike + Clone + PartialEq + Eq + std::hash::Hash,
    {
        self.tuple3_of::<A, B, C>(|t| {
            t.cloneable()
                .equatable()
                .hashable()
                .with_triple_key::<A, B, C>()
        })
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut shapes: HashMap<TypeId, TypeShape> = HashMap::new();
        for id in self.pending.keys() {
            let mut visiting = HashSet::new();
            Self::resolve_shape(*id, &self.pending, &mut shapes, &mut visiting)?;
        }

        let mut infos = HashMap::with_capacity(self.pending.len());
        let mut by_shape = HashMap::with_capacity(self.pending.len());

        for (id, p) in self.pending {
            let shape = shapes
                .get(&id)
                .cloned()
                .unwrap_or(TypeShape::Atom(p.key));

            if let Some(previous) = by_shape.insert(shape.clone(), id) {
                if previous != id {
                    return Err(MapError::Configuration(format!(
                        "types share the shape '{}'; constructor registrations must be unambiguous",
                        shape
                    )));
                }
            }

            let mut abilities: Vec<Ability> = p
                .abilities
                .into_iter()
                .map(|(name, args)| Ability {
                    name,
                    args: args
                        .into_iter()
                        .map(|k| shapes.get(&k.id()).cloned().unwrap_or(TypeShape::Atom(k)))
                        .collect(),
                })
                .collect();

            // Built-in capabilities double as zero-argument abilities.
            if p.clone_value.is_some() {
                abilities.push(Ability { name: ability::CLONE, args: Vec::new() });
            }
            if p.default_value.is_some() {
                abilities.push(Ability { name: ability::DEFAULT, args: Vec::new() });
            }
            if p.copyable {
                abilities.push(Ability { name: ability::COPY, args: Vec::new() });
            }
            if p.eq_values.is_some() {
                abilities.push(Ability { name: ability::EQ, args: Vec::new() });
            }
            if p.hash_value.is_some() {
                abilities.push(Ability { name: ability::HASH, args: Vec::new() });
            }
            if p.ord_values.is_some() {
                abilities.push(Ability { name: ability::ORD, args: Vec::new() });
            }
            if p.extract_key.is_some() {
                abilities.push(Ability { name: ability::KEY, args: Vec::new() });
            }

            let info = TypeInfo {
                key: p.key,
                shape,
                clone_value: p.clone_value,
                default_value: p.default_value,
                eq_values: p.eq_values,
                hash_value: p.hash_value,
                ord_values: p.ord_values,
                copyable: p.copyable,
                extract_key: p.extract_key,
                key_from: p.key_from,
                key_components: p.key_components,
                abilities,
                collection: p.collection,
            };
            infos.insert(id, Arc::new(info));
        }

        Ok(TypeRegistry { infos, by_shape })
    }

    fn resolve_shape(
        id: TypeId,
        pending: &HashMap<TypeId, PendingType>,
        shapes: &mut HashMap<TypeId, TypeShape>,
        visiting: &mut HashSet<TypeId>,
    ) -> Result<TypeShape> {
        if let Some(s) = shapes.get(&id) {
            return Ok(s.clone());
        }
        let Some(p) = pending.get(&id) else {
            // Callers only recurse into pending ids; unregistered ctor
            // arguments take the atom fallback at the call site.
            return Err(MapError::Configuration(
                "internal: shape requested for unregistered type".to_string(),
            ));
        };
        if !visiting.insert(id) {
            return Err(MapError::Configuration(format!(
                "recursive constructor registration for '{}'",
                p.key.name()
            )));
        }

        let shape = match &p.ctor {
            None => TypeShape::Atom(p.key),
            Some((name, args)) => {
                let mut arg_shapes = Vec::with_capacity(args.len());
                for arg in args {
                    let s = if pending.contains_key(&arg.id()) {
                        Self::resolve_shape(arg.id(), pending, shapes, visiting)?
                    } else {
                        TypeShape::Atom(*arg)
                    };
                    arg_shapes.push(s);
                }
                TypeShape::ctor(name, arg_shapes)
            }
        };

        visiting.remove(&id);
        shapes.insert(id, shape.clone());
        Ok(shape)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
