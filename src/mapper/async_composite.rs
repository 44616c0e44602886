use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::factory::ObjectFactory;
use crate::mapper::context::{MappingContext, NestedFrame};
use crate::mapper::{AsyncMapper, MapperId, next_mapper_id};

/// Ordered chain of async strategies behind one [`AsyncMapper`] face, with
/// the same walk rules as the sync composite: `NotFound` moves to the next
/// member, any other error stops, and a fully declined new-map falls back
/// to create-and-merge guarded by a delegation frame.
pub struct AsyncCompositeMapper {
    name: String,
    id: MapperId,
    members: Vec<Arc<dyn AsyncMapper>>,
    factory: Arc<ObjectFactory>,
}

impl AsyncCompositeMapper {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<dyn AsyncMapper>>,
        factory: Arc<ObjectFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            id: next_mapper_id(),
            members,
            factory,
        }
    }

    pub fn members(&self) -> &[Arc<dyn AsyncMapper>] {
        &self.members
    }

    /// `kind` is `New` or `Merge`. Any member true wins; a failed probe
    /// leaves the question open and is reported as `CannotVerify`.
    async fn poll(&self, pair: TypePair, kind: MapKind, ctx: &MappingContext) -> Result<bool> {
        let mut uncertain = false;
        for member in &self.members {
            let probed = if kind == MapKind::New {
                member.can_map_new(pair, ctx).await
            } else {
                member.can_map_merge(pair, ctx).await
            };
            match probed {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        composite = %self.name,
                        member = member.name(),
                        pair = %pair,
                        error = %e,
                        "capability probe failed"
                    );
                    uncertain = true;
                }
            }
        }
        if uncertain {
            Err(MapError::CannotVerify { pair })
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl AsyncMapper for AsyncCompositeMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let direct = self.poll(pair, MapKind::New, ctx).await;
        if matches!(direct, Ok(true)) {
            return Ok(true);
        }
        let fallback = if self.factory.can_create(pair.to) {
            self.poll(pair, MapKind::Merge, ctx).await
        } else {
            Ok(false)
        };
        if matches!(fallback, Ok(true)) {
            return Ok(true);
        }
        direct?;
        fallback?;
        Ok(false)
    }

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.poll(pair, MapKind::Merge, ctx).await
    }

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        ctx.check_cancelled()?;
        for member in &self.members {
            match member.map_new(source, pair, ctx).await {
                Ok(value) => {
                    trace!(composite = %self.name, member = member.name(), pair = %pair, "mapped new");
                    return Ok(value);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        // Create-and-merge fallback, once per pair per delegation chain.
        if ctx.in_flight(self.id, pair, MapKind::New) || !self.factory.can_create(pair.to) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        let nested = ctx.nest(NestedFrame {
            mapper: self.id,
            pair,
            kind: MapKind::New,
        });
        let mut dest = self.factory.create(pair.to)?;
        match self.map_merge(source, &mut dest, pair, &nested).await {
            Ok(()) => {
                trace!(composite = %self.name, pair = %pair, "mapped new via create and merge");
                Ok(dest)
            }
            Err(e) if e.is_not_found() => Err(MapError::not_found(pair, MapKind::New)),
            Err(e) => Err(e),
        }
    }

    async fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        for member in &self.members {
            match member.map_merge(source, dest, pair, ctx).await {
                Ok(()) => {
                    trace!(composite = %self.name, member = member.name(), pair = %pair, "merged");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Err(MapError::not_found(pair, MapKind::Merge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::MapsBuilder;
    use crate::mapper::async_strategies::{AsyncMergeMapMapper, AsyncNewMapMapper, SyncBridge};
    use crate::mapper::context::{MappingOptions, ServiceBag};
    use crate::mapper::strategies::IdentityMapper;
    use crate::reflect::registry::TypeRegistry;

    fn ctx() -> Arc<MappingContext> {
        MappingContext::root(MappingOptions::new(), ServiceBag::new())
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::standard().build().unwrap())
    }

    #[test]
    fn walks_members_in_order() {
        let registry = registry();
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_new_map(|n: Option<i32>, _: &MappingContext| async move {
                        Ok(n.map(|n| format!("map:{n}")))
                    })
                })
                .build()
                .unwrap(),
        );
        // Identity declines i32 -> String, so the map-fn member handles it.
        let composite = AsyncCompositeMapper::new(
            "test",
            vec![
                Arc::new(SyncBridge::new(Arc::new(IdentityMapper::new(
                    registry.clone(),
                )))),
                Arc::new(AsyncNewMapMapper::new(config)),
            ],
            Arc::new(ObjectFactory::new(registry)),
        );
        let ctx = ctx();
        tokio_test::block_on(async {
            let seven = 7;
            let out = composite
                .map_new(DynRef::new(&seven), TypePair::of::<i32, String>(), &ctx)
                .await
                .unwrap();
            assert_eq!(out.downcast::<String>().unwrap(), Some("map:7".into()));
        });
    }

    #[test]
    fn declined_new_falls_back_to_create_and_merge() {
        let registry = registry();
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.async_merge_map(
                        |n: Option<i32>, d: Option<String>, _: &MappingContext| async move {
                            let mut d = d.unwrap_or_default();
                            if let Some(n) = n {
                                d.push_str(&format!("<{n}>"));
                            }
                            Ok(Some(d))
                        },
                    )
                })
                .build()
                .unwrap(),
        );
        let composite = AsyncCompositeMapper::new(
            "test",
            vec![Arc::new(AsyncMergeMapMapper::new(config))],
            Arc::new(ObjectFactory::new(registry)),
        );
        let ctx = ctx();
        tokio_test::block_on(async {
            let pair = TypePair::of::<i32, String>();
            assert!(composite.can_map_new(pair, &ctx).await.unwrap());
            let five = 5;
            let out = composite
                .map_new(DynRef::new(&five), pair, &ctx)
                .await
                .unwrap();
            assert_eq!(out.downcast::<String>().unwrap(), Some("<5>".into()));
        });
    }

    #[test]
    fn fallback_does_not_reenter_for_the_same_pair() {
        let registry = registry();
        let composite = AsyncCompositeMapper::new(
            "test",
            Vec::new(),
            Arc::new(ObjectFactory::new(registry)),
        );
        let ctx = ctx();
        tokio_test::block_on(async {
            let pair = TypePair::of::<i32, String>();
            let nested = ctx.nest(NestedFrame {
                mapper: composite.id(),
                pair,
                kind: MapKind::New,
            });
            let one = 1;
            let err = composite
                .map_new(DynRef::new(&one), pair, &nested)
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        });
    }

    #[test]
    fn cancelled_context_stops_before_any_member() {
        let registry = registry();
        let composite = AsyncCompositeMapper::new(
            "test",
            vec![Arc::new(SyncBridge::new(Arc::new(IdentityMapper::new(
                registry.clone(),
            ))))],
            Arc::new(ObjectFactory::new(registry)),
        );
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = MappingContext::root_with_token(MappingOptions::new(), ServiceBag::new(), token);
        tokio_test::block_on(async {
            let s = String::from("x");
            let err = composite
                .map_new(DynRef::new(&s), TypePair::of::<String, String>(), &ctx)
                .await
                .unwrap_err();
            assert!(matches!(err, MapError::Cancelled));
        });
    }
}
