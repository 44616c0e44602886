use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::matcher::Matcher;
use crate::mapper::collection::collection_ops;
use crate::mapper::context::MappingContext;
use crate::mapper::{AsyncMapper, MapperId, next_mapper_id};
use crate::reflect::collections::ElemView;
use crate::reflect::registry::TypeRegistry;

/// Picks the first real element error in source order; `Cancelled` only
/// surfaces when no element failed for another reason, and travels
/// unwrapped.
fn settle(results: Vec<Result<DynValue>>, pair: TypePair, kind: MapKind) -> Result<Vec<DynValue>> {
    let mut cancelled = false;
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        match r {
            Ok(v) => out.push(v),
            Err(MapError::Cancelled) => cancelled = true,
            Err(e) => return Err(MapError::wrap_collection(pair, kind, e)),
        }
    }
    if cancelled {
        return Err(MapError::Cancelled);
    }
    Ok(out)
}

fn width_of(ctx: &MappingContext) -> Option<usize> {
    match ctx.parallelism() {
        Some(n) if n > 1 => Some(n),
        _ => None,
    }
}

// ========================================
// New
// ========================================

/// Async twin of the new-collection strategy. Without a [`Parallelism`]
/// option elements are mapped one after another; with one, up to that many
/// element maps run concurrently behind a semaphore, a failing element
/// cancels its in-flight siblings through a linked token, and results land
/// in source order regardless of completion order.
///
/// [`Parallelism`]: crate::mapper::context::Parallelism
pub struct AsyncNewCollectionMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    elements: Arc<dyn AsyncMapper>,
}

impl AsyncNewCollectionMapper {
    pub fn new(registry: Arc<TypeRegistry>, elements: Arc<dyn AsyncMapper>) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            elements,
        }
    }

    fn element_mapper(&self, ctx: &MappingContext) -> Arc<dyn AsyncMapper> {
        ctx.async_mapper_override()
            .unwrap_or_else(|| self.elements.clone())
    }
}

#[async_trait]
impl AsyncMapper for AsyncNewCollectionMapper {
    fn name(&self) -> &str {
        "async-new-collection"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let Some((src, dst)) = collection_ops(&self.registry, pair) else {
            return Ok(false);
        };
        let elem_pair = TypePair::new(src.elem, dst.elem);
        self.element_mapper(ctx).can_map_new(elem_pair, ctx).await
    }

    async fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        let Some((src_ops, dest_ops)) = collection_ops(&self.registry, pair) else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        let elem_pair = TypePair::new(src_ops.elem, dest_ops.elem);
        let mapper = self.element_mapper(ctx);
        if !mapper
            .can_map_new(elem_pair, ctx)
            .await
            .map_err(|e| MapError::wrap_collection(pair, MapKind::New, e))?
        {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        // Null is a valid result only for a pair whose elements just proved
        // mappable; otherwise null fails like any other source.
        if source.is_null() {
            return Ok(DynValue::null_of(pair.to));
        }

        let sources: Vec<ElemView<'_>> = (src_ops.iter)(source)?.collect();
        let items = match width_of(ctx) {
            Some(width) => {
                let sem = Semaphore::new(width);
                let linked = ctx.cancellation().child_token();
                let tasks = sources.iter().map(|elem| {
                    let sem = &sem;
                    let linked = &linked;
                    let mapper = &mapper;
                    async move {
                        let _permit = sem.acquire().await.map_err(|_| MapError::Cancelled)?;
                        if linked.is_cancelled() {
                            return Err(MapError::Cancelled);
                        }
                        ctx.check_cancelled()?;
                        match mapper.map_new(elem.as_dyn(), elem_pair, ctx).await {
                            Ok(v) => Ok(v),
                            Err(e) => {
                                if !e.is_cancelled() {
                                    linked.cancel();
                                }
                                Err(e)
                            }
                        }
                    }
                });
                settle(future::join_all(tasks).await, pair, MapKind::New)?
            }
            None => {
                let mut items = Vec::with_capacity(sources.len());
                for elem in &sources {
                    ctx.check_cancelled()?;
                    let mapped = mapper
                        .map_new(elem.as_dyn(), elem_pair, ctx)
                        .await
                        .map_err(|e| MapError::wrap_collection(pair, MapKind::New, e))?;
                    items.push(mapped);
                }
                items
            }
        };
        (dest_ops.build)(items)
    }

    async fn map_merge(
        &self,
        _source: DynRef<'_>,
        _dest: &mut DynValue,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<()> {
        Err(MapError::not_found(pair, MapKind::Merge))
    }
}

// ========================================
// Merge reconciliation
// ========================================

/// What the apply phase does with one source element once pairing has run.
enum Apply {
    MergeInto(DynValue),
    Fresh,
}

/// Async twin of the merge-collection strategy. Pairing runs first, against
/// the borrowed destination, so a matcher error changes nothing; the apply
/// phase then merges claimed pairs and creates the rest, sequentially or
/// concurrently like [`AsyncNewCollectionMapper`]. Once applying has begun
/// a failure leaves the destination typed-null rather than half
/// reconciled.
pub struct AsyncMergeCollectionMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    elements: Arc<dyn AsyncMapper>,
    matcher: Arc<dyn Matcher>,
}

impl AsyncMergeCollectionMapper {
    pub fn new(
        registry: Arc<TypeRegistry>,
        elements: Arc<dyn AsyncMapper>,
        matcher: Arc<dyn Matcher>,
    ) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            elements,
            matcher,
        }
    }

    fn element_mapper(&self, ctx: &MappingContext) -> Arc<dyn AsyncMapper> {
        ctx.async_mapper_override()
            .unwrap_or_else(|| self.elements.clone())
    }

    fn matcher(&self, ctx: &MappingContext) -> Arc<dyn Matcher> {
        ctx.matcher_override().unwrap_or_else(|| self.matcher.clone())
    }
}

#[async_trait]
impl AsyncMapper for AsyncMergeCollectionMapper {
    fn name(&self) -> &str {
        "async-merge-collection"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let Some((src, dst)) = collection_ops(&self.registry, pair) else {
            return Ok(false);
        };
        if !dst.growable {
            return Ok(false);
        }
        let elem_pair = TypePair::new(src.elem, dst.elem);
        let mapper = self.element_mapper(ctx);
        Ok(mapper.can_map_merge(elem_pair, ctx).await?
            || mapper.can_map_new(elem_pair, ctx).await?)
    }

    async fn map_new(
        &self,
        _source: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<DynValue> {
        Err(MapError::not_found(pair, MapKind::New))
    }

    async fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        let Some((src_ops, dest_ops)) = collection_ops(&self.registry, pair) else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        if !dest_ops.growable {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        let elem_pair = TypePair::new(src_ops.elem, dest_ops.elem);
        let mapper = self.element_mapper(ctx);
        let wrap = |e| MapError::wrap_collection(pair, MapKind::Merge, e);
        let elems_mappable = mapper.can_map_merge(elem_pair, ctx).await.map_err(wrap)?
            || mapper.can_map_new(elem_pair, ctx).await.map_err(wrap)?;
        if !elems_mappable {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        // Past this point the pair is valid, so a null source nulls the
        // destination instead of declining.
        if source.is_null() {
            *dest = DynValue::null_of(pair.to);
            return Ok(());
        }

        let matcher = self.matcher(ctx);

        let sources: Vec<ElemView<'_>> = (src_ops.iter)(source)?.collect();

        // Pairing phase, synchronous and read-only against the destination.
        let matcher_applies = matcher.can_match(elem_pair, ctx).map_err(wrap)?;
        let dest_len = if dest.is_null() {
            0
        } else {
            (dest_ops.len)(dest.as_dyn())?
        };
        let mut claimed = vec![false; dest_len];
        let mut pairing: Vec<Option<usize>> = Vec::with_capacity(sources.len());
        if matcher_applies && dest_len > 0 {
            let dest_elems: Vec<ElemView<'_>> = (dest_ops.iter)(dest.as_dyn())?.collect();
            for src_elem in &sources {
                ctx.check_cancelled()?;
                let mut hit = None;
                for (i, dest_elem) in dest_elems.iter().enumerate() {
                    if claimed[i] {
                        continue;
                    }
                    if matcher
                        .matches(src_elem.as_dyn(), dest_elem.as_dyn(), elem_pair, ctx)
                        .map_err(wrap)?
                    {
                        claimed[i] = true;
                        hit = Some(i);
                        break;
                    }
                }
                pairing.push(hit);
            }
        } else {
            pairing.resize(sources.len(), None);
        }

        // Apply phase.
        let taken = std::mem::replace(dest, DynValue::null_of(pair.to));
        let mut dest_items: Vec<Option<DynValue>> =
            (dest_ops.drain)(taken)?.into_iter().map(Some).collect();

        let mut plans = Vec::with_capacity(sources.len());
        for hit in pairing {
            match hit {
                Some(i) => {
                    let item = dest_items[i].take().ok_or_else(|| {
                        MapError::Configuration(
                            "internal: destination element claimed twice".to_string(),
                        )
                    })?;
                    plans.push(Apply::MergeInto(item));
                }
                None => plans.push(Apply::Fresh),
            }
        }

        let mut result = match width_of(ctx) {
            Some(width) => {
                let sem = Semaphore::new(width);
                let linked = ctx.cancellation().child_token();
                let tasks = sources.iter().zip(plans).map(|(src_elem, plan)| {
                    let sem = &sem;
                    let linked = &linked;
                    let mapper = &mapper;
                    async move {
                        let _permit = sem.acquire().await.map_err(|_| MapError::Cancelled)?;
                        if linked.is_cancelled() {
                            return Err(MapError::Cancelled);
                        }
                        ctx.check_cancelled()?;
                        let src_ref = src_elem.as_dyn();
                        let run = match plan {
                            Apply::MergeInto(mut item) => {
                                match mapper.map_merge(src_ref, &mut item, elem_pair, ctx).await {
                                    Ok(()) => Ok(item),
                                    Err(e) if e.is_not_found() => {
                                        mapper.map_new(src_ref, elem_pair, ctx).await
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                            Apply::Fresh => mapper.map_new(src_ref, elem_pair, ctx).await,
                        };
                        match run {
                            Ok(v) => Ok(v),
                            Err(e) => {
                                if !e.is_cancelled() {
                                    linked.cancel();
                                }
                                Err(e)
                            }
                        }
                    }
                });
                settle(future::join_all(tasks).await, pair, MapKind::Merge)?
            }
            None => {
                let mut result = Vec::with_capacity(sources.len());
                for (src_elem, plan) in sources.iter().zip(plans) {
                    ctx.check_cancelled()?;
                    let src_ref = src_elem.as_dyn();
                    let item = match plan {
                        Apply::MergeInto(mut item) => {
                            match mapper.map_merge(src_ref, &mut item, elem_pair, ctx).await {
                                Ok(()) => item,
                                Err(e) if e.is_not_found() => mapper
                                    .map_new(src_ref, elem_pair, ctx)
                                    .await
                                    .map_err(wrap)?,
                                Err(e) => return Err(wrap(e)),
                            }
                        }
                        Apply::Fresh => {
                            mapper.map_new(src_ref, elem_pair, ctx).await.map_err(wrap)?
                        }
                    };
                    result.push(item);
                }
                result
            }
        };

        let retained = dest_items.into_iter().flatten();
        if ctx.merge_policy().remove_unmatched {
            let dropped = retained.count();
            if dropped > 0 {
                debug!(pair = %pair, dropped, "removed unmatched destination elements");
            }
        } else {
            result.extend(retained);
        }

        *dest = (dest_ops.build)(result)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::config::MapsBuilder;
    use crate::matcher::EqualityMatcher;
    use crate::mapper::async_strategies::AsyncNewMapMapper;
    use crate::mapper::context::{MappingOptions, Parallelism, ServiceBag};
    use crate::reflect::registry::TypeRegistry;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::standard()
                .collection::<Vec<i32>>(|t| t.cloneable().equatable())
                .collection::<Vec<String>>(|t| t.cloneable().equatable())
                .build()
                .unwrap(),
        )
    }

    fn ctx_with(options: MappingOptions) -> Arc<MappingContext> {
        MappingContext::root(options, ServiceBag::new())
    }

    #[test]
    fn results_keep_source_order_under_parallelism() {
        // Earlier elements yield more, so they finish later.
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_new_map(|n: Option<i32>, _: &MappingContext| async move {
                        let n = n.unwrap_or_default();
                        for _ in 0..n {
                            tokio::task::yield_now().await;
                        }
                        Ok(Some(n.to_string()))
                    })
                })
                .build()
                .unwrap(),
        );
        let mapper = AsyncNewCollectionMapper::new(
            registry(),
            Arc::new(AsyncNewMapMapper::new(config)),
        );
        let ctx = ctx_with(MappingOptions::new().with(Parallelism(3)));
        tokio_test::block_on(async {
            let source = vec![5, 1, 0];
            let out = mapper
                .map_new(
                    DynRef::new(&source),
                    TypePair::of::<Vec<i32>, Vec<String>>(),
                    &ctx,
                )
                .await
                .unwrap();
            assert_eq!(
                out.downcast::<Vec<String>>().unwrap(),
                Some(vec!["5".into(), "1".into(), "0".into()])
            );
        });
    }

    #[test]
    fn failing_element_cancels_its_siblings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let config = Arc::new(
            MapsBuilder::new()
                .maps(move |m| {
                    let seen = seen.clone();
                    m.async_new_map(move |n: Option<i32>, _: &MappingContext| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            if n == Some(13) {
                                anyhow::bail!("unlucky element");
                            }
                            Ok(n.map(|n| n.to_string()))
                        }
                    })
                })
                .build()
                .unwrap(),
        );
        let mapper = AsyncNewCollectionMapper::new(
            registry(),
            Arc::new(AsyncNewMapMapper::new(config)),
        );
        // The failure lands before the third element starts, so its map
        // never runs.
        let ctx = ctx_with(MappingOptions::new().with(Parallelism(2)));
        tokio_test::block_on(async {
            let source = vec![1, 13, 7];
            let err = mapper
                .map_new(
                    DynRef::new(&source),
                    TypePair::of::<Vec<i32>, Vec<String>>(),
                    &ctx,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, MapError::CollectionFailure { .. }));
        });
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn merge_reconciles_with_async_elements() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_new_map(|n: Option<i32>, _: &MappingContext| async move { Ok(n) })
                })
                .build()
                .unwrap(),
        );
        let registry = registry();
        let mapper = AsyncMergeCollectionMapper::new(
            registry.clone(),
            Arc::new(AsyncNewMapMapper::new(config)),
            Arc::new(EqualityMatcher::new(registry)),
        );
        let ctx = ctx_with(MappingOptions::new());
        tokio_test::block_on(async {
            let source = vec![1, 2, 3];
            let mut dest = DynValue::new(vec![3, 4]);
            mapper
                .map_merge(
                    DynRef::new(&source),
                    &mut dest,
                    TypePair::of::<Vec<i32>, Vec<i32>>(),
                    &ctx,
                )
                .await
                .unwrap();
            assert_eq!(dest.downcast::<Vec<i32>>().unwrap(), Some(vec![1, 2, 3]));
        });
    }

    #[test]
    fn cancellation_surfaces_bare() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_new_map(|n: Option<i32>, _: &MappingContext| async move {
                        Ok(n.map(|n| n.to_string()))
                    })
                })
                .build()
                .unwrap(),
        );
        let mapper = AsyncNewCollectionMapper::new(
            registry(),
            Arc::new(AsyncNewMapMapper::new(config)),
        );
        let token = CancellationToken::new();
        token.cancel();
        let ctx = MappingContext::root_with_token(
            MappingOptions::new().with(Parallelism(4)),
            ServiceBag::new(),
            token,
        );
        tokio_test::block_on(async {
            let source = vec![1, 2];
            let err = mapper
                .map_new(
                    DynRef::new(&source),
                    TypePair::of::<Vec<i32>, Vec<String>>(),
                    &ctx,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, MapError::Cancelled));
        });
    }

    #[test]
    fn null_source_nulls_the_destination() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_new_map(|n: Option<i32>, _: &MappingContext| async move { Ok(n) })
                })
                .build()
                .unwrap(),
        );
        let registry = registry();
        let mapper = AsyncMergeCollectionMapper::new(
            registry.clone(),
            Arc::new(AsyncNewMapMapper::new(config)),
            Arc::new(EqualityMatcher::new(registry)),
        );
        let ctx = ctx_with(MappingOptions::new());
        tokio_test::block_on(async {
            let mut dest = DynValue::new(vec![9]);
            mapper
                .map_merge(
                    DynRef::null::<Vec<i32>>(),
                    &mut dest,
                    TypePair::of::<Vec<i32>, Vec<i32>>(),
                    &ctx,
                )
                .await
                .unwrap();
            assert!(dest.is_null());
            assert_eq!(dest.key(), crate::core::types::TypeKey::of::<Vec<i32>>());
        });
    }
}
