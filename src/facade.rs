//! The assembled mapper behind one typed entry surface.
//!
//! [`MapperBuilder`] wires the strategy chains: registered maps first, then
//! entity key resolution, collection reconciliation, identity, empty-source
//! and conversion fallbacks, each family once for the sync and once for the
//! async side. The built [`ObjectMapper`] threads every call through a fresh
//! root [`MappingContext`] carrying the chain itself as the nested-mapping
//! override, so user map code and collection elements re-enter the whole
//! chain instead of a single strategy.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{CacheSnapshot, MapDescriptor, MapProvider, MapSet, MapsBuilder, MapsConfig};
use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::entity::{
    AsyncEntityStore, AsyncKeyToEntityMapper, EntitiesRetrievalMode, EntityDescriptor,
    EntityDescriptors, EntityStore, EntityToKeyMapper, KeyToEntityMapper,
};
use crate::factory::ObjectFactory;
use crate::mapper::{
    AsyncCompositeMapper, AsyncMapper, AsyncMapperOverride, AsyncMergeCollectionMapper,
    AsyncMergeMapMapper, AsyncNewCollectionMapper, AsyncNewMapMapper, CompositeMapper,
    ConversionMapper, ConversionTable, EmptyMapper, FactoryContext, IdentityMapper, Mapper,
    MapperId, MapperOverride, MappingContext, MappingOptions, MergeCollectionMapper,
    MergeMapMapper, MergePolicy, NewCollectionMapper, NewMapMapper, Parallelism, ServiceBag,
    SyncBridge,
};
use crate::matcher::{MapsMatcher, Matcher};
use crate::reflect::registry::{RegistryBuilder, TypeRegistry};

// ========================================
// Call counters
// ========================================

#[derive(Default)]
struct CallCounters {
    new_calls: AtomicU64,
    merge_calls: AtomicU64,
    async_new_calls: AtomicU64,
    async_merge_calls: AtomicU64,
    failures: AtomicU64,
}

impl CallCounters {
    fn fail_on<T>(&self, out: Result<T>) -> Result<T> {
        if out.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        out
    }
}

/// Successful maps attributed to one strategy in the chain.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyHits {
    pub strategy: String,
    pub hits: u64,
}

/// Point-in-time counter snapshot, serializable for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MapperStats {
    pub new_calls: u64,
    pub merge_calls: u64,
    pub async_new_calls: u64,
    pub async_merge_calls: u64,
    pub failures: u64,
    pub strategy_hits: Vec<StrategyHits>,
    pub resolution_cache: CacheSnapshot,
}

struct CountingMapper {
    inner: Arc<dyn Mapper>,
    hits: Arc<AtomicU64>,
}

impl Mapper for CountingMapper {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn id(&self) -> MapperId {
        self.inner.id()
    }

    fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_new(pair, ctx)
    }

    fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_merge(pair, ctx)
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        let out = self.inner.map_new(source, pair, ctx);
        if out.is_ok() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        let out = self.inner.map_merge(source, dest, pair, ctx);
        if out.is_ok() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        out
    }
}

struct CountingAsyncMapper {
    inner: Arc<dyn AsyncMapper>,
    hits: Arc<AtomicU64>,
}

#[async_trait]
impl AsyncMapper for CountingAsyncMapper {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn id(&self) -> MapperId {
        self.inner.id()
    }

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_new(pair, ctx).await
    }

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_merge(pair, ctx).await
    }

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        let out = self.inner.map_new(source, pair, ctx).await;
        if out.is_ok() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    async fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        let out = self.inner.map_merge(source, dest, pair, ctx).await;
        if out.is_ok() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        out
    }
}

type Tallies = Vec<(String, Arc<AtomicU64>)>;

fn counted(tallies: &mut Tallies, inner: Arc<dyn Mapper>) -> Arc<dyn Mapper> {
    let hits = Arc::new(AtomicU64::new(0));
    tallies.push((inner.name().to_string(), hits.clone()));
    Arc::new(CountingMapper { inner, hits })
}

fn counted_async(tallies: &mut Tallies, inner: Arc<dyn AsyncMapper>) -> Arc<dyn AsyncMapper> {
    let hits = Arc::new(AtomicU64::new(0));
    tallies.push((inner.name().to_string(), hits.clone()));
    Arc::new(CountingAsyncMapper { inner, hits })
}

// ========================================
// Builder
// ========================================

/// Assembles an [`ObjectMapper`]: map registrations through the inner
/// [`MapsBuilder`], plus the chain-level defaults the config layer does not
/// know about: matcher, merge policy, parallelism, entity descriptors,
/// stores, services and custom creators.
pub struct MapperBuilder {
    maps: MapsBuilder,
    matcher: Option<Arc<dyn Matcher>>,
    merge_policy: Option<MergePolicy>,
    parallelism: Option<usize>,
    retrieval_mode: Option<EntitiesRetrievalMode>,
    reject_duplicate_entities: bool,
    descriptors: EntityDescriptors,
    store: Option<Arc<dyn EntityStore>>,
    async_store: Option<Arc<dyn AsyncEntityStore>>,
    services: ServiceBag,
    creators: Vec<Box<dyn FnOnce(ObjectFactory) -> ObjectFactory + Send>>,
}

impl MapperBuilder {
    pub fn new() -> Self {
        Self {
            maps: MapsBuilder::new(),
            matcher: None,
            merge_policy: None,
            parallelism: None,
            retrieval_mode: None,
            reject_duplicate_entities: true,
            descriptors: EntityDescriptors::new(),
            store: None,
            async_store: None,
            services: ServiceBag::new(),
            creators: Vec::new(),
        }
    }

    /// Extends the type registry beyond the standard scalars.
    pub fn types(mut self, f: impl FnOnce(RegistryBuilder) -> RegistryBuilder) -> Self {
        self.maps = self.maps.types(f);
        self
    }

    /// Extends the built-in conversion table.
    pub fn conversions(mut self, f: impl FnOnce(ConversionTable) -> ConversionTable) -> Self {
        self.maps = self.maps.conversions(f);
        self
    }

    pub fn provider(mut self, provider: impl MapProvider + 'static) -> Self {
        self.maps = self.maps.provider(provider);
        self
    }

    /// Adds maps and templates outside any provider.
    pub fn maps(mut self, f: impl FnOnce(MapSet) -> MapSet) -> Self {
        self.maps = self.maps.maps(f);
        self
    }

    pub fn resolution_cache(mut self, capacity: usize) -> Self {
        self.maps = self.maps.resolution_cache(capacity);
        self
    }

    /// Default matcher for collection merge reconciliation. Without this
    /// the registered match maps decide.
    pub fn matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    /// Default width for async collection element mapping.
    pub fn parallelism(mut self, width: usize) -> Self {
        self.parallelism = Some(width);
        self
    }

    /// Default entity retrieval mode, overridable per call.
    pub fn retrieval_mode(mut self, mode: EntitiesRetrievalMode) -> Self {
        self.retrieval_mode = Some(mode);
        self
    }

    /// Merging a key over a different existing entity resolves from the
    /// store instead of raising `DuplicateEntity`.
    pub fn resolve_duplicate_entities(mut self) -> Self {
        self.reject_duplicate_entities = false;
        self
    }

    /// Declares an entity type with its ordered key components.
    pub fn entity<E: Any + Send + Sync>(mut self, descriptor: EntityDescriptor<E>) -> Self {
        self.descriptors = self.descriptors.with(descriptor);
        self
    }

    pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn async_entity_store(mut self, store: Arc<dyn AsyncEntityStore>) -> Self {
        self.async_store = Some(store);
        self
    }

    /// Seeds a service resolvable from every mapping context.
    pub fn service<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.services = self.services.with(service);
        self
    }

    /// Custom destination constructor, shadowing the registered default.
    pub fn creator<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.creators
            .push(Box::new(move |factory| factory.with_creator::<T, _>(f)));
        self
    }

    pub fn build(self) -> Result<ObjectMapper> {
        let config = Arc::new(self.maps.build()?);
        let registry = config.registry().clone();
        let conversions = config.conversions().clone();

        let mut factory = ObjectFactory::new(registry.clone());
        for setup in self.creators {
            factory = setup(factory);
        }
        let factory = Arc::new(factory);

        let descriptors = Arc::new(self.descriptors);
        let matcher: Arc<dyn Matcher> = self
            .matcher
            .unwrap_or_else(|| Arc::new(MapsMatcher::new(config.clone())));

        let mut tallies = Tallies::new();

        let new_map = counted(&mut tallies, Arc::new(NewMapMapper::new(config.clone())));
        let merge_map = counted(&mut tallies, Arc::new(MergeMapMapper::new(config.clone())));

        let mut key_to_entity =
            KeyToEntityMapper::new(registry.clone(), descriptors.clone(), self.store.clone());
        if let Some(mode) = self.retrieval_mode {
            key_to_entity = key_to_entity.with_mode(mode);
        }
        if !self.reject_duplicate_entities {
            key_to_entity = key_to_entity.resolve_duplicates();
        }
        let key_to_entity = counted(&mut tallies, Arc::new(key_to_entity));

        let entity_to_key = counted(
            &mut tallies,
            Arc::new(EntityToKeyMapper::new(registry.clone(), descriptors.clone())),
        );
        let identity = counted(&mut tallies, Arc::new(IdentityMapper::new(registry.clone())));
        let empty = counted(&mut tallies, Arc::new(EmptyMapper::new(factory.clone())));
        let conversion = counted(
            &mut tallies,
            Arc::new(ConversionMapper::new(conversions.clone())),
        );

        // Collection elements normally route through the full chain via the
        // context override; this smaller chain answers when no override is
        // installed.
        let element_fallback: Arc<dyn Mapper> = Arc::new(CompositeMapper::new(
            "element-fallback",
            vec![
                new_map.clone(),
                merge_map.clone(),
                identity.clone(),
                conversion.clone(),
            ],
            factory.clone(),
        ));

        let new_collection = counted(
            &mut tallies,
            Arc::new(NewCollectionMapper::new(
                registry.clone(),
                element_fallback.clone(),
            )),
        );
        let merge_collection = counted(
            &mut tallies,
            Arc::new(MergeCollectionMapper::new(
                registry.clone(),
                element_fallback,
                matcher.clone(),
            )),
        );

        let chain: Arc<dyn Mapper> = Arc::new(CompositeMapper::new(
            "mapper",
            vec![
                new_map.clone(),
                merge_map.clone(),
                key_to_entity.clone(),
                entity_to_key.clone(),
                new_collection,
                merge_collection,
                identity.clone(),
                empty.clone(),
                conversion.clone(),
            ],
            factory.clone(),
        ));

        // Async chain: natively async strategies first, sync ones bridged.
        // The same counted instances ride both chains, so strategy tallies
        // stay whole-engine.
        let async_new_map = counted_async(
            &mut tallies,
            Arc::new(AsyncNewMapMapper::new(config.clone())),
        );
        let async_merge_map = counted_async(
            &mut tallies,
            Arc::new(AsyncMergeMapMapper::new(config.clone())),
        );

        let mut async_key_to_entity = AsyncKeyToEntityMapper::new(
            registry.clone(),
            descriptors.clone(),
            self.async_store.clone(),
        );
        if let Some(mode) = self.retrieval_mode {
            async_key_to_entity = async_key_to_entity.with_mode(mode);
        }
        if !self.reject_duplicate_entities {
            async_key_to_entity = async_key_to_entity.resolve_duplicates();
        }
        let async_key_to_entity = counted_async(&mut tallies, Arc::new(async_key_to_entity));

        let async_element_fallback: Arc<dyn AsyncMapper> = Arc::new(AsyncCompositeMapper::new(
            "async-element-fallback",
            vec![
                async_new_map.clone(),
                async_merge_map.clone(),
                Arc::new(SyncBridge::new(new_map.clone())),
                Arc::new(SyncBridge::new(merge_map.clone())),
                Arc::new(SyncBridge::new(identity.clone())),
                Arc::new(SyncBridge::new(conversion.clone())),
            ],
            factory.clone(),
        ));

        let async_new_collection = counted_async(
            &mut tallies,
            Arc::new(AsyncNewCollectionMapper::new(
                registry.clone(),
                async_element_fallback.clone(),
            )),
        );
        let async_merge_collection = counted_async(
            &mut tallies,
            Arc::new(AsyncMergeCollectionMapper::new(
                registry.clone(),
                async_element_fallback,
                matcher.clone(),
            )),
        );

        let async_chain: Arc<dyn AsyncMapper> = Arc::new(AsyncCompositeMapper::new(
            "async-mapper",
            vec![
                async_new_map,
                async_merge_map,
                Arc::new(SyncBridge::new(new_map)),
                Arc::new(SyncBridge::new(merge_map)),
                async_key_to_entity,
                Arc::new(SyncBridge::new(key_to_entity)),
                Arc::new(SyncBridge::new(entity_to_key)),
                async_new_collection,
                async_merge_collection,
                Arc::new(SyncBridge::new(identity)),
                Arc::new(SyncBridge::new(empty)),
                Arc::new(SyncBridge::new(conversion)),
            ],
            factory.clone(),
        ));

        let mut base_options = MappingOptions::new()
            .with(MapperOverride(chain.clone()))
            .with(AsyncMapperOverride(async_chain.clone()));
        if let Some(policy) = self.merge_policy {
            base_options = base_options.with(policy);
        }
        if let Some(width) = self.parallelism {
            base_options = base_options.with(Parallelism(width));
        }

        info!(
            registrations = config.describe().len(),
            entities = descriptors.len(),
            strategies = tallies.len(),
            "object mapper assembled"
        );

        Ok(ObjectMapper {
            config,
            registry,
            factory,
            descriptors,
            chain,
            async_chain,
            base_options,
            services: self.services,
            counters: Arc::new(CallCounters::default()),
            tallies: Arc::new(tallies),
        })
    }
}

impl Default for MapperBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ========================================
// Facade
// ========================================

/// One built mapping engine. Every call runs over a fresh root context, so
/// scoped state never leaks between calls; cloning shares all underlying
/// parts including the counters.
///
/// # Examples
///
/// ```
/// use dynamap::MapperBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mapper = MapperBuilder::new()
///     .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("#{n}")))))
///     .build()?;
///
/// let label: String = mapper.map(&7)?;
/// assert_eq!(label, "#7");
///
/// // Unregistered pairs still answer capability questions without mapping.
/// assert!(!mapper.can_map::<String, i32>()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ObjectMapper {
    config: Arc<MapsConfig>,
    registry: Arc<TypeRegistry>,
    factory: Arc<ObjectFactory>,
    descriptors: Arc<EntityDescriptors>,
    chain: Arc<dyn Mapper>,
    async_chain: Arc<dyn AsyncMapper>,
    base_options: MappingOptions,
    services: ServiceBag,
    counters: Arc<CallCounters>,
    tallies: Arc<Tallies>,
}

impl ObjectMapper {
    pub fn builder() -> MapperBuilder {
        MapperBuilder::new()
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<MapsConfig> {
        &self.config
    }

    pub fn factory(&self) -> &Arc<ObjectFactory> {
        &self.factory
    }

    pub fn descriptors(&self) -> &Arc<EntityDescriptors> {
        &self.descriptors
    }

    /// The full strategy chain, for driving the raw [`Mapper`] trait.
    pub fn mapper(&self) -> Arc<dyn Mapper> {
        self.chain.clone()
    }

    pub fn async_mapper(&self) -> Arc<dyn AsyncMapper> {
        self.async_chain.clone()
    }

    /// The options every call starts from.
    pub fn options(&self) -> &MappingOptions {
        &self.base_options
    }

    /// Fresh root context over the base options.
    pub fn context(&self) -> Arc<MappingContext> {
        MappingContext::root(self.base_options.clone(), self.services.clone())
    }

    // ---- capability

    pub fn can_map<A, B>(&self) -> Result<bool>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.can_map_pair(TypePair::of::<A, B>())
    }

    pub fn can_map_pair(&self, pair: TypePair) -> Result<bool> {
        self.chain.can_map_new(pair, &self.context())
    }

    pub fn can_merge<A, B>(&self) -> Result<bool>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.can_merge_pair(TypePair::of::<A, B>())
    }

    pub fn can_merge_pair(&self, pair: TypePair) -> Result<bool> {
        self.chain.can_map_merge(pair, &self.context())
    }

    // ---- sync mapping

    /// Maps a value, requiring a non-null result.
    pub fn map<A, B>(&self, source: &A) -> Result<B>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        let pair = TypePair::of::<A, B>();
        match self.map_opt::<A, B>(Some(source))? {
            Some(out) => Ok(out),
            None => Err(MapError::TypeMismatch(format!(
                "{pair} mapped to null where a value was required"
            ))),
        }
    }

    /// Null-aware mapping: a `None` source flows through the registered
    /// maps as a typed null.
    pub fn map_opt<A, B>(&self, source: Option<&A>) -> Result<Option<B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.map_with(source, |options| options)
    }

    /// Maps with per-call options layered over the base set.
    pub fn map_with<A, B, F>(&self, source: Option<&A>, configure: F) -> Result<Option<B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnOnce(MappingOptions) -> MappingOptions,
    {
        let out = self.map_dyn_with(
            DynRef::from_option(source),
            TypePair::of::<A, B>(),
            configure,
        )?;
        out.downcast::<B>()
    }

    pub fn map_dyn(&self, source: DynRef<'_>, pair: TypePair) -> Result<DynValue> {
        self.map_dyn_with(source, pair, |options| options)
    }

    pub fn map_dyn_with(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        configure: impl FnOnce(MappingOptions) -> MappingOptions,
    ) -> Result<DynValue> {
        self.counters.new_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root(configure(self.base_options.clone()), self.services.clone());
        self.counters.fail_on(self.chain.map_new(source, pair, &ctx))
    }

    // ---- sync merging

    /// Merges a value into an existing destination in place.
    pub fn merge<A, B>(&self, source: &A, dest: &mut B) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync + Clone,
    {
        let pair = TypePair::of::<A, B>();
        let mut slot = DynValue::new(dest.clone());
        self.merge_dyn(DynRef::new(source), &mut slot, pair)?;
        match slot.downcast::<B>()? {
            Some(updated) => {
                *dest = updated;
                Ok(())
            }
            None => Err(MapError::TypeMismatch(format!(
                "{pair} merged to null where a value was required"
            ))),
        }
    }

    /// Null-aware merge; `dest` ends up as whatever the maps left, null
    /// included.
    pub fn merge_opt<A, B>(&self, source: Option<&A>, dest: &mut Option<B>) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.merge_with(source, dest, |options| options)
    }

    pub fn merge_with<A, B, F>(
        &self,
        source: Option<&A>,
        dest: &mut Option<B>,
        configure: F,
    ) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnOnce(MappingOptions) -> MappingOptions,
    {
        let pair = TypePair::of::<A, B>();
        let mut slot = DynValue::from_option(dest.take());
        let outcome = self.merge_dyn_with(DynRef::from_option(source), &mut slot, pair, configure);
        match slot.downcast::<B>() {
            Ok(updated) => {
                *dest = updated;
                outcome
            }
            Err(e) => outcome.and(Err(e)),
        }
    }

    pub fn merge_dyn(&self, source: DynRef<'_>, dest: &mut DynValue, pair: TypePair) -> Result<()> {
        self.merge_dyn_with(source, dest, pair, |options| options)
    }

    pub fn merge_dyn_with(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        configure: impl FnOnce(MappingOptions) -> MappingOptions,
    ) -> Result<()> {
        self.counters.merge_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root(configure(self.base_options.clone()), self.services.clone());
        self.counters
            .fail_on(self.chain.map_merge(source, dest, pair, &ctx))
    }

    // ---- async mapping

    pub async fn map_async<A, B>(&self, source: Option<&A>) -> Result<Option<B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.map_async_with(source, |options| options).await
    }

    pub async fn map_async_with<A, B, F>(
        &self,
        source: Option<&A>,
        configure: F,
    ) -> Result<Option<B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnOnce(MappingOptions) -> MappingOptions,
    {
        let out = self
            .run_new_async(
                DynRef::from_option(source),
                TypePair::of::<A, B>(),
                configure(self.base_options.clone()),
                CancellationToken::new(),
            )
            .await?;
        out.downcast::<B>()
    }

    /// Async map tied to an external cancellation token.
    pub async fn map_async_with_token<A, B>(
        &self,
        source: Option<&A>,
        token: CancellationToken,
    ) -> Result<Option<B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        let out = self
            .run_new_async(
                DynRef::from_option(source),
                TypePair::of::<A, B>(),
                self.base_options.clone(),
                token,
            )
            .await?;
        out.downcast::<B>()
    }

    pub async fn map_dyn_async(&self, source: DynRef<'_>, pair: TypePair) -> Result<DynValue> {
        self.run_new_async(
            source,
            pair,
            self.base_options.clone(),
            CancellationToken::new(),
        )
        .await
    }

    async fn run_new_async(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        options: MappingOptions,
        token: CancellationToken,
    ) -> Result<DynValue> {
        self.counters.async_new_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(options, self.services.clone(), token);
        self.counters
            .fail_on(self.async_chain.map_new(source, pair, &ctx).await)
    }

    // ---- async merging

    pub async fn merge_async<A, B>(&self, source: Option<&A>, dest: &mut Option<B>) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        self.merge_async_with(source, dest, |options| options).await
    }

    pub async fn merge_async_with<A, B, F>(
        &self,
        source: Option<&A>,
        dest: &mut Option<B>,
        configure: F,
    ) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnOnce(MappingOptions) -> MappingOptions,
    {
        let pair = TypePair::of::<A, B>();
        let mut slot = DynValue::from_option(dest.take());
        let outcome = self
            .run_merge_async(
                DynRef::from_option(source),
                &mut slot,
                pair,
                configure(self.base_options.clone()),
                CancellationToken::new(),
            )
            .await;
        match slot.downcast::<B>() {
            Ok(updated) => {
                *dest = updated;
                outcome
            }
            Err(e) => outcome.and(Err(e)),
        }
    }

    pub async fn merge_async_with_token<A, B>(
        &self,
        source: Option<&A>,
        dest: &mut Option<B>,
        token: CancellationToken,
    ) -> Result<()>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        let pair = TypePair::of::<A, B>();
        let mut slot = DynValue::from_option(dest.take());
        let outcome = self
            .run_merge_async(
                DynRef::from_option(source),
                &mut slot,
                pair,
                self.base_options.clone(),
                token,
            )
            .await;
        match slot.downcast::<B>() {
            Ok(updated) => {
                *dest = updated;
                outcome
            }
            Err(e) => outcome.and(Err(e)),
        }
    }

    pub async fn merge_dyn_async(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
    ) -> Result<()> {
        self.run_merge_async(
            source,
            dest,
            pair,
            self.base_options.clone(),
            CancellationToken::new(),
        )
        .await
    }

    async fn run_merge_async(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        options: MappingOptions,
        token: CancellationToken,
    ) -> Result<()> {
        self.counters
            .async_merge_calls
            .fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(options, self.services.clone(), token);
        self.counters
            .fail_on(self.async_chain.map_merge(source, dest, pair, &ctx).await)
    }

    // ---- factories

    /// Precompiles a new-map entry point for one pair. The pair must be
    /// mappable now; the first call warms the resolution memo, later calls
    /// are cheap.
    pub fn new_factory<A, B>(&self) -> Result<NewMapFactory<A, B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        let pair = TypePair::of::<A, B>();
        if !self.can_map_pair(pair)? {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        Ok(NewMapFactory {
            chain: self.chain.clone(),
            async_chain: self.async_chain.clone(),
            options: self.base_options.with(FactoryContext),
            services: self.services.clone(),
            counters: self.counters.clone(),
            token: CancellationToken::new(),
            pair,
            _types: PhantomData,
        })
    }

    pub fn merge_factory<A, B>(&self) -> Result<MergeMapFactory<A, B>>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        let pair = TypePair::of::<A, B>();
        if !self.can_merge_pair(pair)? {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        Ok(MergeMapFactory {
            chain: self.chain.clone(),
            async_chain: self.async_chain.clone(),
            options: self.base_options.with(FactoryContext),
            services: self.services.clone(),
            counters: self.counters.clone(),
            token: CancellationToken::new(),
            pair,
            _types: PhantomData,
        })
    }

    // ---- observability

    pub fn stats(&self) -> MapperStats {
        MapperStats {
            new_calls: self.counters.new_calls.load(Ordering::Relaxed),
            merge_calls: self.counters.merge_calls.load(Ordering::Relaxed),
            async_new_calls: self.counters.async_new_calls.load(Ordering::Relaxed),
            async_merge_calls: self.counters.async_merge_calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            strategy_hits: self
                .tallies
                .iter()
                .map(|(strategy, hits)| StrategyHits {
                    strategy: strategy.clone(),
                    hits: hits.load(Ordering::Relaxed),
                })
                .collect(),
            resolution_cache: self.config.cache_stats(),
        }
    }

    pub fn stats_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.stats())
    }

    /// Every registered map, exact and open, in stable order.
    pub fn describe(&self) -> Vec<MapDescriptor> {
        self.config.describe()
    }

    pub fn describe_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.describe())
    }
}

// ========================================
// Typed factories
// ========================================

/// Long-lived single-pair new-map callable. Dropping the factory cancels
/// any async calls still in flight through it.
pub struct NewMapFactory<A, B> {
    chain: Arc<dyn Mapper>,
    async_chain: Arc<dyn AsyncMapper>,
    options: MappingOptions,
    services: ServiceBag,
    counters: Arc<CallCounters>,
    token: CancellationToken,
    pair: TypePair,
    _types: PhantomData<fn(&A) -> B>,
}

impl<A, B> std::fmt::Debug for NewMapFactory<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewMapFactory").finish_non_exhaustive()
    }
}

impl<A, B> NewMapFactory<A, B>
where
    A: Any + Send + Sync,
    B: Any + Send + Sync,
{
    pub fn pair(&self) -> TypePair {
        self.pair
    }

    pub fn call(&self, source: Option<&A>) -> Result<Option<B>> {
        self.counters.new_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(
            self.options.clone(),
            self.services.clone(),
            self.token.child_token(),
        );
        let out = self
            .counters
            .fail_on(self.chain.map_new(DynRef::from_option(source), self.pair, &ctx))?;
        out.downcast::<B>()
    }

    pub async fn call_async(&self, source: Option<&A>) -> Result<Option<B>> {
        self.counters.async_new_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(
            self.options.clone(),
            self.services.clone(),
            self.token.child_token(),
        );
        let out = self.counters.fail_on(
            self.async_chain
                .map_new(DynRef::from_option(source), self.pair, &ctx)
                .await,
        )?;
        out.downcast::<B>()
    }
}

impl<A, B> Drop for NewMapFactory<A, B> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Long-lived single-pair merge-map callable.
pub struct MergeMapFactory<A, B> {
    chain: Arc<dyn Mapper>,
    async_chain: Arc<dyn AsyncMapper>,
    options: MappingOptions,
    services: ServiceBag,
    counters: Arc<CallCounters>,
    token: CancellationToken,
    pair: TypePair,
    _types: PhantomData<fn(&A) -> B>,
}

impl<A, B> MergeMapFactory<A, B>
where
    A: Any + Send + Sync,
    B: Any + Send + Sync,
{
    pub fn pair(&self) -> TypePair {
        self.pair
    }

    pub fn call(&self, source: Option<&A>, dest: &mut Option<B>) -> Result<()> {
        self.counters.merge_calls.fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(
            self.options.clone(),
            self.services.clone(),
            self.token.child_token(),
        );
        let mut slot = DynValue::from_option(dest.take());
        let outcome = self.counters.fail_on(self.chain.map_merge(
            DynRef::from_option(source),
            &mut slot,
            self.pair,
            &ctx,
        ));
        match slot.downcast::<B>() {
            Ok(updated) => {
                *dest = updated;
                outcome
            }
            Err(e) => outcome.and(Err(e)),
        }
    }

    pub async fn call_async(&self, source: Option<&A>, dest: &mut Option<B>) -> Result<()> {
        self.counters
            .async_merge_calls
            .fetch_add(1, Ordering::Relaxed);
        let ctx = MappingContext::root_with_token(
            self.options.clone(),
            self.services.clone(),
            self.token.child_token(),
        );
        let mut slot = DynValue::from_option(dest.take());
        let outcome = self.counters.fail_on(
            self.async_chain
                .map_merge(DynRef::from_option(source), &mut slot, self.pair, &ctx)
                .await,
        );
        match slot.downcast::<B>() {
            Ok(updated) => {
                *dest = updated;
                outcome
            }
            Err(e) => outcome.and(Err(e)),
        }
    }
}

impl<A, B> Drop for MergeMapFactory<A, B> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered() -> ObjectMapper {
        MapperBuilder::new()
            .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("#{n}")))))
            .build()
            .unwrap()
    }

    #[test]
    fn maps_identity_without_any_registration() {
        let mapper = MapperBuilder::new().build().unwrap();
        let out: String = mapper.map(&String::from("same")).unwrap();
        assert_eq!(out, "same");
    }

    #[test]
    fn typed_map_prefers_registered_maps_over_conversions() {
        let mapper = numbered();
        // The standard table also renders i32 -> String; the registered
        // map must win.
        assert_eq!(mapper.map::<i32, String>(&7).unwrap(), "#7");
        assert_eq!(mapper.map_opt::<i32, String>(None).unwrap(), None);
    }

    #[test]
    fn merge_updates_the_destination_in_place() {
        let mapper = MapperBuilder::new()
            .maps(|m| {
                m.merge_map::<i32, Vec<i32>, _>(|n, d, _| {
                    let mut d = d.unwrap_or_default();
                    if let Some(n) = n {
                        d.push(*n);
                    }
                    Ok(Some(d))
                })
            })
            .build()
            .unwrap();
        let mut dest = vec![1, 2];
        mapper.merge(&5, &mut dest).unwrap();
        assert_eq!(dest, vec![1, 2, 5]);
    }

    #[test]
    fn collection_map_reuses_element_maps() {
        let mapper = MapperBuilder::new()
            .types(|t| {
                t.collection::<Vec<i32>>(|e| e.cloneable())
                    .collection::<Vec<String>>(|e| e.cloneable())
            })
            .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("#{n}")))))
            .build()
            .unwrap();
        let out: Vec<String> = mapper.map(&vec![1, 2, 3]).unwrap();
        assert_eq!(out, vec!["#1", "#2", "#3"]);
    }

    #[test]
    fn capability_questions_answer_without_mapping() {
        let mapper = numbered();
        assert!(mapper.can_map::<i32, String>().unwrap());
        assert!(!mapper.can_map::<String, i32>().unwrap());
        assert!(!mapper.can_merge::<String, i32>().unwrap());
    }

    #[test]
    fn stats_count_calls_and_strategy_hits() {
        let mapper = numbered();
        mapper.map::<i32, String>(&1).unwrap();
        mapper.map::<i32, String>(&2).unwrap();

        let stats = mapper.stats();
        assert_eq!(stats.new_calls, 2);
        assert_eq!(stats.failures, 0);
        let hits = stats
            .strategy_hits
            .iter()
            .find(|s| s.strategy == "new-map")
            .unwrap();
        assert_eq!(hits.hits, 2);

        let json = mapper.stats_json().unwrap();
        assert!(json.contains("new_calls"));
    }

    #[test]
    fn describe_lists_every_registration() {
        let mapper = numbered();
        let rows = mapper.describe();
        assert!(rows
            .iter()
            .any(|r| r.kind == "new" && r.from == "i32" && r.to.ends_with("String")));
        assert!(mapper.describe_json().unwrap().contains("\"new\""));
    }

    #[test]
    fn factory_verifies_the_pair_up_front() {
        let mapper = numbered();
        let factory = mapper.new_factory::<i32, String>().unwrap();
        assert_eq!(factory.call(Some(&3)).unwrap(), Some("#3".into()));
        assert_eq!(factory.call(None).unwrap(), None);

        assert!(mapper.new_factory::<String, i32>().unwrap_err().is_not_found());
    }

    #[test]
    fn async_map_drives_sync_registrations() {
        let mapper = numbered();
        let out = tokio_test::block_on(mapper.map_async::<i32, String>(Some(&4))).unwrap();
        assert_eq!(out, Some("#4".into()));
    }

    #[test]
    fn cancelled_token_stops_async_calls() {
        let mapper = numbered();
        let token = CancellationToken::new();
        token.cancel();
        let err = tokio_test::block_on(mapper.map_async_with_token::<i32, String>(Some(&4), token))
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn per_call_options_do_not_stick() {
        let mapper = MapperBuilder::new()
            .types(|t| t.collection::<Vec<i32>>(|e| e.cloneable().equatable()))
            .maps(|m| m.match_map::<i32, i32, _>(|a, b, _| Ok(a == b)))
            .build()
            .unwrap();

        // Keep unmatched destination elements for one call only.
        let mut dest = Some(vec![1, 2, 3]);
        mapper
            .merge_with(Some(&vec![2]), &mut dest, |o| {
                o.with(MergePolicy {
                    remove_unmatched: false,
                })
            })
            .unwrap();
        assert_eq!(dest, Some(vec![2, 1, 3]));

        // The next call is back on the default removal policy.
        let mut dest = Some(vec![1, 2, 3]);
        mapper.merge_opt(Some(&vec![2]), &mut dest).unwrap();
        assert_eq!(dest, Some(vec![2]));
    }
}
