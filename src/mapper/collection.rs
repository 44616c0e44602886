use std::sync::Arc;

use tracing::debug;

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::matcher::Matcher;
use crate::mapper::context::MappingContext;
use crate::mapper::{Mapper, MapperId, next_mapper_id};
use crate::reflect::collections::{CollectionOps, ElemView};
use crate::reflect::registry::TypeRegistry;

pub(crate) fn collection_ops(
    registry: &TypeRegistry,
    pair: TypePair,
) -> Option<(CollectionOps, CollectionOps)> {
    let src = registry.get_key(pair.from)?.collection()?.clone();
    let dst = registry.get_key(pair.to)?.collection()?.clone();
    Some((src, dst))
}

// ========================================
// New
// ========================================

/// Maps a collection by mapping every element. Element mapping goes through
/// the context's mapper override when one is installed, so nested elements
/// see the whole strategy chain; otherwise the configured fallback runs.
pub struct NewCollectionMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    elements: Arc<dyn Mapper>,
}

impl NewCollectionMapper {
    pub fn new(registry: Arc<TypeRegistry>, elements: Arc<dyn Mapper>) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            elements,
        }
    }

    fn element_mapper(&self, ctx: &MappingContext) -> Arc<dyn Mapper> {
        ctx.mapper_override()
            .unwrap_or_else(|| self.elements.clone())
    }
}

impl Mapper for NewCollectionMapper {
    fn name(&self) -> &str {
        "new-collection"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let Some((src, dst)) = collection_ops(&self.registry, pair) else {
            return Ok(false);
        };
        let elem_pair = TypePair::new(src.elem, dst.elem);
        self.element_mapper(ctx).can_map_new(elem_pair, ctx)
    }

    fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    fn map_new(
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
            .map_err(|e| MapError::wrap_collection(pair, MapKind::New, e))?
        {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        // Null is a valid result only for a pair whose elements just proved
        // mappable; otherwise null fails like any other source.
        if source.is_null() {
            return Ok(DynValue::null_of(pair.to));
        }

        let mut items = Vec::new();
        for elem in (src_ops.iter)(source)? {
            ctx.check_cancelled()?;
            let mapped = mapper
                .map_new(elem.as_dyn(), elem_pair, ctx)
                .map_err(|e| MapError::wrap_collection(pair, MapKind::New, e))?;
            items.push(mapped);
        }
        (dest_ops.build)(items)
    }

    fn map_merge(
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

/// Reconciles a source collection into an existing destination instead of
/// rebuilding it blindly.
///
/// Each source element claims the first destination element the matcher
/// pairs it with; claimed pairs are updated by merging (falling back to a
/// fresh element map when no element merge exists), unclaimed source
/// elements are added, and unclaimed destination elements are removed or
/// retained according to [`MergePolicy`]. The result keeps source order,
/// with retained destination elements after it.
pub struct MergeCollectionMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    elements: Arc<dyn Mapper>,
    matcher: Arc<dyn Matcher>,
}

impl MergeCollectionMapper {
    pub fn new(
        registry: Arc<TypeRegistry>,
        elements: Arc<dyn Mapper>,
        matcher: Arc<dyn Matcher>,
    ) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            elements,
            matcher,
        }
    }

    fn element_mapper(&self, ctx: &MappingContext) -> Arc<dyn Mapper> {
        ctx.mapper_override()
            .unwrap_or_else(|| self.elements.clone())
    }

    fn matcher(&self, ctx: &MappingContext) -> Arc<dyn Matcher> {
        ctx.matcher_override().unwrap_or_else(|| self.matcher.clone())
    }
}

impl Mapper for MergeCollectionMapper {
    fn name(&self) -> &str {
        "merge-collection"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let Some((src, dst)) = collection_ops(&self.registry, pair) else {
            return Ok(false);
        };
        if !dst.growable {
            return Ok(false);
        }
        let elem_pair = TypePair::new(src.elem, dst.elem);
        let mapper = self.element_mapper(ctx);
        Ok(mapper.can_map_merge(elem_pair, ctx)? || mapper.can_map_new(elem_pair, ctx)?)
    }

    fn map_new(
        &self,
        _source: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<DynValue> {
        Err(MapError::not_found(pair, MapKind::New))
    }

    fn map_merge(
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
        let elems_mappable = mapper.can_map_merge(elem_pair, ctx).map_err(wrap)?
            || mapper.can_map_new(elem_pair, ctx).map_err(wrap)?;
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

        // Pairing phase, against borrowed destination elements. Touches
        // nothing, so matcher errors leave the destination intact.
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

        // Apply phase. Draining consumes the destination; on failure from
        // here on it is left typed-null rather than partially reconciled.
        let taken = std::mem::replace(dest, DynValue::null_of(pair.to));
        let mut dest_items: Vec<Option<DynValue>> =
            (dest_ops.drain)(taken)?.into_iter().map(Some).collect();

        let policy = ctx.merge_policy();
        let mut result = Vec::with_capacity(sources.len());
        for (src_elem, hit) in sources.iter().zip(pairing) {
            ctx.check_cancelled()?;
            let src_ref = src_elem.as_dyn();
            match hit {
                Some(i) => {
                    let mut item = dest_items[i].take().ok_or_else(|| {
                        MapError::Configuration(
                            "internal: destination element claimed twice".to_string(),
                        )
                    })?;
                    match mapper.map_merge(src_ref, &mut item, elem_pair, ctx) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            item = mapper.map_new(src_ref, elem_pair, ctx).map_err(wrap)?;
                        }
                        Err(e) => return Err(wrap(e)),
                    }
                    result.push(item);
                }
                None => {
                    let item = mapper.map_new(src_ref, elem_pair, ctx).map_err(wrap)?;
                    result.push(item);
                }
            }
        }

        let retained = dest_items.into_iter().flatten();
        if policy.remove_unmatched {
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
    use std::collections::HashMap;

    use crate::config::MapsBuilder;
    use crate::matcher::{FnMatcher, EmptyMatcher, EqualityMatcher};
    use crate::mapper::context::{MapperOverride, MappingOptions, MergePolicy, ServiceBag};
    use crate::mapper::strategies::{IdentityMapper, MergeMapMapper, NewMapMapper};

    fn ctx() -> Arc<MappingContext> {
        MappingContext::root(MappingOptions::new(), ServiceBag::new())
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::standard()
                .collection::<Vec<i32>>(|t| t.cloneable().equatable())
                .collection::<Vec<String>>(|t| t.cloneable().equatable())
                .collection::<Box<[i32]>>(|t| t.cloneable())
                .tuple2_of::<i32, String>(|t| t.cloneable().equatable())
                .collection::<HashMap<i32, String>>(|t| t.cloneable().equatable())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn maps_each_element_through_the_element_mapper() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("e{n}")))))
                .build()
                .unwrap(),
        );
        let mapper = NewCollectionMapper::new(registry(), Arc::new(NewMapMapper::new(config)));
        let ctx = ctx();
        let pair = TypePair::of::<Vec<i32>, Vec<String>>();
        assert!(mapper.can_map_new(pair, &ctx).unwrap());

        let src = vec![1, 2, 3];
        let out = mapper.map_new(DynRef::new(&src), pair, &ctx).unwrap();
        assert_eq!(
            out.downcast::<Vec<String>>().unwrap(),
            Some(vec!["e1".into(), "e2".into(), "e3".into()])
        );
    }

    #[test]
    fn null_source_collection_maps_to_null() {
        let reg = registry();
        let mapper = NewCollectionMapper::new(reg.clone(), Arc::new(IdentityMapper::new(reg)));
        let out = mapper
            .map_new(
                DynRef::null::<Vec<i32>>(),
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &ctx(),
            )
            .unwrap();
        assert!(out.is_null());
        assert!(out.is::<Vec<i32>>());
    }

    #[test]
    fn null_source_still_requires_mappable_elements() {
        let reg = registry();
        let mapper = NewCollectionMapper::new(reg.clone(), Arc::new(IdentityMapper::new(reg)));
        let err = mapper
            .map_new(
                DynRef::null::<Vec<i32>>(),
                TypePair::of::<Vec<i32>, Vec<String>>(),
                &ctx(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn element_mapping_goes_through_the_override() {
        struct PlusOne(MapperId);
        impl Mapper for PlusOne {
            fn name(&self) -> &str {
                "plus-one"
            }
            fn id(&self) -> MapperId {
                self.0
            }
            fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
                Ok(true)
            }
            fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
                Ok(false)
            }
            fn map_new(
                &self,
                source: DynRef<'_>,
                _pair: TypePair,
                _ctx: &MappingContext,
            ) -> Result<DynValue> {
                let n = source.downcast_ref::<i32>()?.copied().unwrap_or(0);
                Ok(DynValue::new(n + 1))
            }
            fn map_merge(
                &self,
                _source: DynRef<'_>,
                _dest: &mut DynValue,
                pair: TypePair,
                _ctx: &MappingContext,
            ) -> Result<()> {
                Err(MapError::not_found(pair, MapKind::Merge))
            }
        }

        let reg = registry();
        let mapper = NewCollectionMapper::new(reg.clone(), Arc::new(IdentityMapper::new(reg)));
        let root = ctx();
        let overridden =
            root.with_option(MapperOverride(Arc::new(PlusOne(next_mapper_id()))));

        let src = vec![1, 2];
        let out = mapper
            .map_new(
                DynRef::new(&src),
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &overridden,
            )
            .unwrap();
        assert_eq!(out.downcast::<Vec<i32>>().unwrap(), Some(vec![2, 3]));
    }

    #[test]
    fn merge_reconciles_matched_updates_adds_and_removals() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let ctx = ctx();
        let pair = TypePair::of::<Vec<i32>, Vec<i32>>();
        assert!(mapper.can_map_merge(pair, &ctx).unwrap());

        let src = vec![1, 2, 3];
        let mut dest = DynValue::new(vec![3, 4]);
        mapper
            .map_merge(DynRef::new(&src), &mut dest, pair, &ctx)
            .unwrap();
        // 3 matched and updated in place, 1 and 2 added, 4 removed.
        assert_eq!(dest.downcast::<Vec<i32>>().unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn merge_policy_can_retain_unmatched_destination_elements() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let root = ctx();
        let keep = root.with_option(MergePolicy {
            remove_unmatched: false,
        });

        let src = vec![1];
        let mut dest = DynValue::new(vec![9]);
        mapper
            .map_merge(
                DynRef::new(&src),
                &mut dest,
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &keep,
            )
            .unwrap();
        assert_eq!(dest.downcast::<Vec<i32>>().unwrap(), Some(vec![1, 9]));
    }

    #[test]
    fn empty_matcher_degenerates_to_replace_all() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg)),
            Arc::new(EmptyMatcher),
        );
        let src = vec![7];
        let mut dest = DynValue::new(vec![1, 2, 3]);
        mapper
            .map_merge(
                DynRef::new(&src),
                &mut dest,
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &ctx(),
            )
            .unwrap();
        assert_eq!(dest.downcast::<Vec<i32>>().unwrap(), Some(vec![7]));
    }

    #[test]
    fn matched_elements_merge_rather_than_rebuild() {
        let config = Arc::new(
            MapsBuilder::new()
                .types(|t| t.tuple2_of::<i32, String>(|b| b.cloneable().equatable()))
                .maps(|m| {
                    m.merge_map::<(i32, String), (i32, String), _>(|s, d, _| {
                        Ok(match (s, d) {
                            (Some(s), Some(d)) => Some((d.0, format!("{}+{}", s.1, d.1))),
                            (Some(s), None) => Some(s.clone()),
                            (None, d) => d,
                        })
                    })
                })
                .build()
                .unwrap(),
        );
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg,
            Arc::new(MergeMapMapper::new(config)),
            Arc::new(FnMatcher::new::<(i32, String), (i32, String), _>(
                |a, b, _| Ok(a.zip(b).is_some_and(|(a, b)| a.0 == b.0)),
            )),
        );

        let mut src = HashMap::new();
        src.insert(1, String::from("new"));
        let mut dst = HashMap::new();
        dst.insert(1, String::from("old"));
        let mut dest = DynValue::new(dst);

        mapper
            .map_merge(
                DynRef::new(&src),
                &mut dest,
                TypePair::of::<HashMap<i32, String>, HashMap<i32, String>>(),
                &ctx(),
            )
            .unwrap();
        let merged = dest.downcast::<HashMap<i32, String>>().unwrap().unwrap();
        assert_eq!(merged.get(&1).map(String::as_str), Some("new+old"));
    }

    #[test]
    fn adds_without_an_element_new_map_report_the_collection_pair() {
        let config = Arc::new(
            MapsBuilder::new()
                .types(|t| t.tuple2_of::<i32, String>(|b| b.cloneable().equatable()))
                .maps(|m| {
                    m.merge_map::<(i32, String), (i32, String), _>(|s, d, _| {
                        Ok(s.cloned().or(d))
                    })
                })
                .build()
                .unwrap(),
        );
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg,
            Arc::new(MergeMapMapper::new(config)),
            Arc::new(FnMatcher::new::<(i32, String), (i32, String), _>(
                |a, b, _| Ok(a.zip(b).is_some_and(|(a, b)| a.0 == b.0)),
            )),
        );

        // Key 2 matches nothing, so it must be added, and the element
        // mapper cannot create. The failure names the collection pair.
        let mut src = HashMap::new();
        src.insert(2, String::from("added"));
        let mut dest = DynValue::new(HashMap::<i32, String>::new());
        let collection_pair = TypePair::of::<HashMap<i32, String>, HashMap<i32, String>>();
        let err = mapper
            .map_merge(DynRef::new(&src), &mut dest, collection_pair, &ctx())
            .unwrap_err();
        match err {
            MapError::NotFound { pair: p, kind } => {
                assert_eq!(p, collection_pair);
                assert_eq!(kind, MapKind::Merge);
            }
            other => panic!("expected NotFound, got {other}"),
        }
    }

    #[test]
    fn null_source_merge_nulls_the_destination() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let mut dest = DynValue::new(vec![1, 2]);
        mapper
            .map_merge(
                DynRef::null::<Vec<i32>>(),
                &mut dest,
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &ctx(),
            )
            .unwrap();
        assert!(dest.is_null());
    }

    #[test]
    fn unmappable_elements_decline_merge_before_touching_the_destination() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let ctx = ctx();
        let pair = TypePair::of::<Vec<i32>, Vec<String>>();
        assert!(!mapper.can_map_merge(pair, &ctx).unwrap());

        let mut dest = DynValue::new(vec![String::from("keep")]);
        let err = mapper
            .map_merge(DynRef::null::<Vec<i32>>(), &mut dest, pair, &ctx)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            dest.downcast::<Vec<String>>().unwrap(),
            Some(vec![String::from("keep")])
        );
    }

    #[test]
    fn frozen_destination_declines_merge() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let ctx = ctx();
        let pair = TypePair::of::<Vec<i32>, Box<[i32]>>();
        assert!(!mapper.can_map_merge(pair, &ctx).unwrap());

        let src = vec![1];
        let mut dest = DynValue::new(vec![2].into_boxed_slice());
        let err = mapper
            .map_merge(DynRef::new(&src), &mut dest, pair, &ctx)
            .unwrap_err();
        assert!(err.is_not_found());
        // Untouched on decline.
        assert_eq!(
            dest.downcast::<Box<[i32]>>().unwrap(),
            Some(vec![2].into_boxed_slice())
        );
    }

    #[test]
    fn null_destination_merges_like_an_empty_collection() {
        let reg = registry();
        let mapper = MergeCollectionMapper::new(
            reg.clone(),
            Arc::new(IdentityMapper::new(reg.clone())),
            Arc::new(EqualityMatcher::new(reg)),
        );
        let src = vec![5];
        let mut dest = DynValue::null::<Vec<i32>>();
        mapper
            .map_merge(
                DynRef::new(&src),
                &mut dest,
                TypePair::of::<Vec<i32>, Vec<i32>>(),
                &ctx(),
            )
            .unwrap();
        assert_eq!(dest.downcast::<Vec<i32>>().unwrap(), Some(vec![5]));
    }
}
