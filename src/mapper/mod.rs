use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::core::error::Result;
use crate::core::types::TypePair;
use crate::core::value::{DynRef, DynValue};

pub mod async_collection;
pub mod async_composite;
pub mod async_strategies;
pub mod collection;
pub mod composite;
pub mod context;
pub mod strategies;

pub use async_collection::{AsyncMergeCollectionMapper, AsyncNewCollectionMapper};
pub use async_composite::AsyncCompositeMapper;
pub use async_strategies::{AsyncMergeMapMapper, AsyncNewMapMapper, SyncBridge};
pub use collection::{MergeCollectionMapper, NewCollectionMapper};
pub use composite::CompositeMapper;
pub use context::{
    AsyncMapperOverride, ContextOption, FactoryContext, MapScope, MapperOverride, MappingContext,
    MappingOptions, MatcherOverride, MergePolicy, NestedFrame, Parallelism, ServiceBag,
};
pub use strategies::{
    ConversionMapper, ConversionTable, EmptyMapper, IdentityMapper, MergeMapMapper, NewMapMapper,
};

// ========================================
// Erased map functions
// ========================================

/// Erased new-map: borrowed source in, owned destination out. User code
/// reports through `anyhow`; strategies fold causes into the engine error
/// taxonomy.
pub type DynNewFn =
    Arc<dyn Fn(DynRef<'_>, &MappingContext) -> anyhow::Result<DynValue> + Send + Sync>;

/// Erased merge-map: folds the source into the destination in place.
pub type DynMergeFn =
    Arc<dyn Fn(DynRef<'_>, &mut DynValue, &MappingContext) -> anyhow::Result<()> + Send + Sync>;

/// Erased match predicate.
pub type DynMatchFn =
    Arc<dyn Fn(DynRef<'_>, DynRef<'_>, &MappingContext) -> anyhow::Result<bool> + Send + Sync>;

pub type DynAsyncNewFn = Arc<
    dyn for<'a> Fn(DynRef<'a>, &'a MappingContext) -> BoxFuture<'a, anyhow::Result<DynValue>>
        + Send
        + Sync,
>;

pub type DynAsyncMergeFn = Arc<
    dyn for<'a> Fn(
            DynRef<'a>,
            &'a mut DynValue,
            &'a MappingContext,
        ) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;

// ========================================
// Mapper identity
// ========================================

pub type MapperId = u64;

static NEXT_MAPPER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id, used by the nested-context chain to recognize
/// re-entrant requests.
pub fn next_mapper_id() -> MapperId {
    NEXT_MAPPER_ID.fetch_add(1, Ordering::Relaxed)
}

// ========================================
// Strategy traits
// ========================================

/// One mapping strategy. `can_map_*` answers capability questions without
/// side effects; `map_*` performs the conversion. Raising `NotFound` from
/// `map_*` is the strategy's way of declining at invoke time, which
/// composite chains turn into "try the next candidate".
pub trait Mapper: Send + Sync {
    fn name(&self) -> &str;

    fn id(&self) -> MapperId;

    fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool>;

    fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool>;

    fn map_new(&self, source: DynRef<'_>, pair: TypePair, ctx: &MappingContext)
    -> Result<DynValue>;

    fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()>;
}

/// Async counterpart of [`Mapper`]. Cancellation rides in the context; an
/// implementation observing a cancelled token must return
/// [`MapError::Cancelled`](crate::core::MapError::Cancelled) unwrapped.
#[async_trait]
pub trait AsyncMapper: Send + Sync {
    fn name(&self) -> &str;

    fn id(&self) -> MapperId;

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool>;

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool>;

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue>;

    async fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()>;
}
