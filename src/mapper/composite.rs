use std::sync::Arc;

use tracing::{trace, warn};

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::factory::ObjectFactory;
use crate::mapper::context::{MappingContext, NestedFrame};
use crate::mapper::{Mapper, MapperId, next_mapper_id};

/// Ordered chain of strategies behind one [`Mapper`] face.
///
/// Invocation walks the members in order; `NotFound` means "next candidate",
/// any other error stops the walk. When every member declines a new-map the
/// composite falls back to creating the destination and merge-mapping into
/// it. The fallback records a delegation frame so a re-entrant request for
/// the same pair is answered with `NotFound` instead of recursing.
pub struct CompositeMapper {
    name: String,
    id: MapperId,
    members: Vec<Arc<dyn Mapper>>,
    factory: Arc<ObjectFactory>,
}

impl CompositeMapper {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<dyn Mapper>>,
        factory: Arc<ObjectFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            id: next_mapper_id(),
            members,
            factory,
        }
    }

    pub fn members(&self) -> &[Arc<dyn Mapper>] {
        &self.members
    }

    /// Any member true wins; a member failing its probe leaves the question
    /// open, reported as `CannotVerify` rather than a silent `false`.
    fn poll(
        &self,
        pair: TypePair,
        probe: impl Fn(&dyn Mapper) -> Result<bool>,
    ) -> Result<bool> {
        let mut uncertain = false;
        for member in &self.members {
            match probe(member.as_ref()) {
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

impl Mapper for CompositeMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        let direct = self.poll(pair, |m| m.can_map_new(pair, ctx));
        if matches!(direct, Ok(true)) {
            return Ok(true);
        }
        let fallback = if self.factory.can_create(pair.to) {
            self.poll(pair, |m| m.can_map_merge(pair, ctx))
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

    fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.poll(pair, |m| m.can_map_merge(pair, ctx))
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        ctx.check_cancelled()?;
        for member in &self.members {
            match member.map_new(source, pair, ctx) {
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
        match self.map_merge(source, &mut dest, pair, &nested) {
            Ok(()) => {
                trace!(composite = %self.name, pair = %pair, "mapped new via create and merge");
                Ok(dest)
            }
            Err(e) if e.is_not_found() => Err(MapError::not_found(pair, MapKind::New)),
            Err(e) => Err(e),
        }
    }

    fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        for member in &self.members {
            match member.map_merge(source, dest, pair, ctx) {
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
    use crate::mapper::context::{MappingOptions, ServiceBag};
    use crate::mapper::strategies::{MergeMapMapper, NewMapMapper};
    use crate::reflect::registry::TypeRegistry;

    fn ctx() -> Arc<MappingContext> {
        MappingContext::root(MappingOptions::new(), ServiceBag::new())
    }

    fn factory() -> Arc<ObjectFactory> {
        Arc::new(ObjectFactory::new(Arc::new(
            TypeRegistry::standard().build().unwrap(),
        )))
    }

    struct Fixed {
        id: MapperId,
        output: &'static str,
    }

    impl Fixed {
        fn new(output: &'static str) -> Self {
            Self {
                id: next_mapper_id(),
                output,
            }
        }
    }

    impl Mapper for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn id(&self) -> MapperId {
            self.id
        }
        fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Ok(true)
        }
        fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Ok(false)
        }
        fn map_new(
            &self,
            _source: DynRef<'_>,
            _pair: TypePair,
            _ctx: &MappingContext,
        ) -> Result<DynValue> {
            Ok(DynValue::new(self.output.to_string()))
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

    struct Declining(MapperId);

    impl Declining {
        fn new() -> Self {
            Self(next_mapper_id())
        }
    }

    impl Mapper for Declining {
        fn name(&self) -> &str {
            "declining"
        }
        fn id(&self) -> MapperId {
            self.0
        }
        fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Ok(false)
        }
        fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Ok(false)
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
            _source: DynRef<'_>,
            _dest: &mut DynValue,
            pair: TypePair,
            _ctx: &MappingContext,
        ) -> Result<()> {
            Err(MapError::not_found(pair, MapKind::Merge))
        }
    }

    struct Broken(MapperId);

    impl Broken {
        fn new() -> Self {
            Self(next_mapper_id())
        }
    }

    impl Mapper for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn id(&self) -> MapperId {
            self.0
        }
        fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Err(MapError::Lock("probe lost its lock".to_string()))
        }
        fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
            Ok(false)
        }
        fn map_new(
            &self,
            _source: DynRef<'_>,
            pair: TypePair,
            _ctx: &MappingContext,
        ) -> Result<DynValue> {
            Err(MapError::Failure {
                pair,
                source: anyhow::anyhow!("member exploded"),
            })
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

    #[test]
    fn first_able_member_wins() {
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(Fixed::new("first")), Arc::new(Fixed::new("second"))],
            factory(),
        );
        let one = 1;
        let out = composite
            .map_new(DynRef::new(&one), TypePair::of::<i32, String>(), &ctx())
            .unwrap();
        assert_eq!(out.downcast::<String>().unwrap(), Some("first".into()));
    }

    #[test]
    fn not_found_flows_to_the_next_member() {
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(Declining::new()), Arc::new(Fixed::new("second"))],
            factory(),
        );
        let one = 1;
        let out = composite
            .map_new(DynRef::new(&one), TypePair::of::<i32, String>(), &ctx())
            .unwrap();
        assert_eq!(out.downcast::<String>().unwrap(), Some("second".into()));
    }

    #[test]
    fn real_failures_stop_the_walk() {
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(Broken::new()), Arc::new(Fixed::new("unreached"))],
            factory(),
        );
        let one = 1;
        let err = composite
            .map_new(DynRef::new(&one), TypePair::of::<i32, String>(), &ctx())
            .unwrap_err();
        assert!(matches!(err, MapError::Failure { .. }));
    }

    #[test]
    fn all_declining_falls_back_to_create_and_merge() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.merge_map::<i32, String, _>(|n, d, _| {
                        let mut d = d.unwrap_or_default();
                        if let Some(n) = n {
                            d.push_str(&format!("<{n}>"));
                        }
                        Ok(Some(d))
                    })
                })
                .build()
                .unwrap(),
        );
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(MergeMapMapper::new(config))],
            factory(),
        );
        let ctx = ctx();
        let pair = TypePair::of::<i32, String>();

        // can_map_new reflects the fallback.
        assert!(composite.can_map_new(pair, &ctx).unwrap());

        let five = 5;
        let out = composite.map_new(DynRef::new(&five), pair, &ctx).unwrap();
        assert_eq!(out.downcast::<String>().unwrap(), Some("<5>".into()));
    }

    #[test]
    fn fallback_does_not_reenter_for_the_same_pair() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| m.merge_map::<i32, String, _>(|_, d, _| Ok(d)))
                .build()
                .unwrap(),
        );
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(MergeMapMapper::new(config))],
            factory(),
        );
        let pair = TypePair::of::<i32, String>();
        let root = ctx();
        let re_entered = root.nest(NestedFrame {
            mapper: composite.id(),
            pair,
            kind: MapKind::New,
        });

        let five = 5;
        let err = composite
            .map_new(DynRef::new(&five), pair, &re_entered)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn probe_failures_surface_as_cannot_verify() {
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(Declining::new()), Arc::new(Broken::new())],
            factory(),
        );
        let pair = TypePair::of::<u128, u128>();
        let err = composite.can_map_new(pair, &ctx()).unwrap_err();
        assert!(matches!(err, MapError::CannotVerify { .. }));
    }

    #[test]
    fn a_positive_member_outweighs_a_broken_probe() {
        let composite = CompositeMapper::new(
            "test",
            vec![Arc::new(Broken::new()), Arc::new(Fixed::new("x"))],
            factory(),
        );
        let pair = TypePair::of::<i32, String>();
        assert!(composite.can_map_new(pair, &ctx()).unwrap());
    }

    #[test]
    fn new_map_beats_the_merge_fallback() {
        let config = Arc::new(
            MapsBuilder::new()
                .maps(|m| {
                    m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("new{n}"))))
                        .merge_map::<i32, String, _>(|n, d, _| {
                            let mut d = d.unwrap_or_default();
                            if let Some(n) = n {
                                d.push_str(&format!("merged{n}"));
                            }
                            Ok(Some(d))
                        })
                })
                .build()
                .unwrap(),
        );
        let composite = CompositeMapper::new(
            "test",
            vec![
                Arc::new(NewMapMapper::new(config.clone())),
                Arc::new(MergeMapMapper::new(config)),
            ],
            factory(),
        );
        let two = 2;
        let out = composite
            .map_new(DynRef::new(&two), TypePair::of::<i32, String>(), &ctx())
            .unwrap();
        assert_eq!(out.downcast::<String>().unwrap(), Some("new2".into()));
    }
}
