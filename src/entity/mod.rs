//! Key/entity boundary. Mapping between key values and persisted entities
//! needs three things from the outside world: a description of each entity's
//! key, a store that can look entities up, and a policy for how far that
//! lookup may reach. Everything here is consumed by the key/entity map
//! strategies; the engine itself never talks to persistence directly.

use std::any::Any;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::types::TypeKey;
use crate::core::value::{DynRef, DynValue, EntityKey, KeyScalar};
use crate::mapper::context::thin_ptr;

pub mod mappers;
pub mod store;

pub use mappers::{
    AsyncKeyToEntityMapper, EntityToKeyMapper, KeyToEntityMapper,
};
pub use store::InMemoryEntityStore;

// ========================================
// Retrieval policy
// ========================================

/// How far a key-to-entity lookup may reach. Exactly one mode applies per
/// mapping call: the per-call override when present, the mapper's default
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitiesRetrievalMode {
    /// Only tracked entities; an untracked key maps to null.
    Local,
    /// Tracked entities, then a fabricated stub attached as unchanged.
    LocalOrAttach,
    /// Tracked entities, then the backing store.
    LocalOrRemote,
    /// Always the backing store.
    Remote,
}

impl Default for EntitiesRetrievalMode {
    fn default() -> Self {
        Self::LocalOrRemote
    }
}

/// Per-call retrieval mode, beating the mapper default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetrievalModeOverride(pub EntitiesRetrievalMode);

/// Per-call store instance, beating the mapper default. Compared by
/// identity like the other override options.
#[derive(Clone)]
pub struct StoreOverride(pub Arc<dyn EntityStore>);

impl PartialEq for StoreOverride {
    fn eq(&self, other: &Self) -> bool {
        thin_ptr(&self.0) == thin_ptr(&other.0)
    }
}

impl Hash for StoreOverride {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin_ptr(&self.0).hash(state);
    }
}

#[derive(Clone)]
pub struct AsyncStoreOverride(pub Arc<dyn AsyncEntityStore>);

impl PartialEq for AsyncStoreOverride {
    fn eq(&self, other: &Self) -> bool {
        thin_ptr(&self.0) == thin_ptr(&other.0)
    }
}

impl Hash for AsyncStoreOverride {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin_ptr(&self.0).hash(state);
    }
}

// ========================================
// Entity descriptors
// ========================================

/// Describes how one entity type exposes its key: an ordered list of
/// component extractors, optionally a stub constructor for the attach path.
///
/// ```ignore
/// EntityDescriptor::<Order>::new()
///     .key(|o| o.customer_id)
///     .key(|o| o.line_no)
///     .stub(|key| Order::stub_from(key))
/// ```
pub struct EntityDescriptor<E> {
    extractors: Vec<Arc<dyn Fn(&E) -> KeyScalar + Send + Sync>>,
    stub: Option<Arc<dyn Fn(&EntityKey) -> anyhow::Result<E> + Send + Sync>>,
}

impl<E: Any + Send + Sync> EntityDescriptor<E> {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
            stub: None,
        }
    }

    /// Appends one key component. Call order is component order and it is
    /// significant: the same scalars in a different order form a different
    /// key.
    pub fn key<K, F>(mut self, extract: F) -> Self
    where
        K: Into<KeyScalar>,
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        self.extractors.push(Arc::new(move |e| extract(e).into()));
        self
    }

    /// Constructor for the `LocalOrAttach` fabrication path. An entity type
    /// without one cannot be attached as unchanged.
    pub fn stub<F>(mut self, fabricate: F) -> Self
    where
        F: Fn(&EntityKey) -> anyhow::Result<E> + Send + Sync + 'static,
    {
        self.stub = Some(Arc::new(fabricate));
        self
    }
}

impl<E: Any + Send + Sync> Default for EntityDescriptor<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased face of one descriptor, built once per entity type and
/// cached.
pub struct ErasedDescriptor {
    entity: TypeKey,
    components: usize,
    extract: Arc<dyn Fn(DynRef<'_>) -> Result<Option<EntityKey>> + Send + Sync>,
    stub: Option<Arc<dyn Fn(&EntityKey) -> anyhow::Result<DynValue> + Send + Sync>>,
}

impl ErasedDescriptor {
    pub fn entity(&self) -> TypeKey {
        self.entity
    }

    pub fn components(&self) -> usize {
        self.components
    }

    /// Key of the given entity value; `None` for a typed null.
    pub fn extract(&self, value: DynRef<'_>) -> Result<Option<EntityKey>> {
        (self.extract)(value)
    }

    /// True when the value carries exactly this key. Position matters, so a
    /// reordered composite never matches.
    pub fn matches(&self, value: DynRef<'_>, key: &EntityKey) -> Result<bool> {
        Ok(self.extract(value)?.as_ref() == Some(key))
    }

    pub fn can_fabricate(&self) -> bool {
        self.stub.is_some()
    }

    pub fn fabricate(&self, key: &EntityKey) -> Option<anyhow::Result<DynValue>> {
        self.stub.as_ref().map(|f| f(key))
    }
}

fn erase<E: Any + Send + Sync>(descriptor: &EntityDescriptor<E>) -> ErasedDescriptor {
    let extractors = descriptor.extractors.clone();
    let components = extractors.len();
    let extract = Arc::new(move |value: DynRef<'_>| -> Result<Option<EntityKey>> {
        match value.downcast_ref::<E>()? {
            Some(e) => Ok(Some(extractors.iter().map(|x| x(e)).collect())),
            None => Ok(None),
        }
    });
    let stub = descriptor.stub.clone().map(|fabricate| {
        let fabricate: Arc<dyn Fn(&EntityKey) -> anyhow::Result<DynValue> + Send + Sync> =
            Arc::new(move |key: &EntityKey| fabricate(key).map(DynValue::new));
        fabricate
    });
    ErasedDescriptor {
        entity: TypeKey::of::<E>(),
        components,
        extract,
        stub,
    }
}

type DescriptorThunk = Arc<dyn Fn() -> ErasedDescriptor + Send + Sync>;

/// All registered entity descriptors. Registration happens while building
/// the mapper; the erased extraction delegates are built on first use and
/// memoized for the registry's lifetime, never invalidated.
#[derive(Default)]
pub struct EntityDescriptors {
    thunks: HashMap<TypeKey, DescriptorThunk>,
    built: Mutex<HashMap<TypeKey, Arc<ErasedDescriptor>>>,
}

impl EntityDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<E: Any + Send + Sync>(mut self, descriptor: EntityDescriptor<E>) -> Self {
        let descriptor = Arc::new(descriptor);
        self.thunks.insert(
            TypeKey::of::<E>(),
            Arc::new(move || erase(descriptor.as_ref())),
        );
        self
    }

    pub fn contains(&self, entity: TypeKey) -> bool {
        self.thunks.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    /// Erased descriptor for the type, building and caching it on first
    /// use. The lock covers single cache operations only.
    pub fn resolve(&self, entity: TypeKey) -> Result<Option<Arc<ErasedDescriptor>>> {
        if let Some(hit) = self.built.lock()?.get(&entity) {
            return Ok(Some(hit.clone()));
        }
        let Some(thunk) = self.thunks.get(&entity) else {
            return Ok(None);
        };
        let built = Arc::new(thunk());
        let mut cache = self.built.lock()?;
        Ok(Some(cache.entry(entity).or_insert(built).clone()))
    }

    /// The behavioral equality predicate for one concrete key: true exactly
    /// for entity values carrying that key.
    pub fn key_predicate(
        &self,
        entity: TypeKey,
        key: EntityKey,
    ) -> Result<Option<Box<dyn Fn(DynRef<'_>) -> Result<bool> + Send + Sync>>> {
        let Some(descriptor) = self.resolve(entity)? else {
            return Ok(None);
        };
        Ok(Some(Box::new(move |value| descriptor.matches(value, &key))))
    }
}

// ========================================
// Store contracts
// ========================================

/// What the key/entity strategies need from a persistence collaborator.
/// Returned values are owned snapshots; entity types must be registered
/// cloneable for any store to hand them out.
pub trait EntityStore: Send + Sync {
    fn name(&self) -> &str;

    /// Everything currently tracked for one entity type.
    fn tracked(&self, entity: TypeKey) -> Result<Vec<DynValue>>;

    /// One tracked entity by key, or `None`.
    fn find_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>>;

    /// One entity from the backing store by key, or `None`.
    fn fetch_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>>;

    /// Fabricates a stub for the key and starts tracking it as unchanged.
    fn attach_unchanged(&self, entity: TypeKey, key: &EntityKey) -> Result<DynValue>;
}

#[async_trait]
pub trait AsyncEntityStore: Send + Sync {
    fn name(&self) -> &str;

    async fn tracked(&self, entity: TypeKey) -> Result<Vec<DynValue>>;

    async fn find_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>>;

    async fn fetch_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>>;

    async fn attach_unchanged(&self, entity: TypeKey, key: &EntityKey) -> Result<DynValue>;
}
