use std::any::Any;
use std::sync::Arc;

use crate::config::MapsConfig;
use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::DynRef;
use crate::mapper::DynMatchFn;
use crate::mapper::context::MappingContext;
use crate::reflect::registry::TypeRegistry;

/// Decides whether a source element and a destination element correspond,
/// the question collection merge reconciliation asks for every candidate
/// pairing.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this matcher can answer for the pair at all. `false` means
    /// "no correspondence defined", not "they differ".
    fn can_match(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool>;

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<bool>;
}

// ========================================
// Built-in matchers
// ========================================

/// Matches nothing. With this in place a collection merge degenerates to
/// remove-all plus add-all, which is the correct default when no match maps
/// are registered.
#[derive(Debug, Default)]
pub struct EmptyMatcher;

impl Matcher for EmptyMatcher {
    fn name(&self) -> &str {
        "empty"
    }

    fn can_match(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(true)
    }

    fn matches(
        &self,
        _source: DynRef<'_>,
        _dest: DynRef<'_>,
        _pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Same-type structural equality through the registered `PartialEq`
/// capability. Opt-in: useful for dedup-style merges of value types.
pub struct EqualityMatcher {
    registry: Arc<TypeRegistry>,
}

impl EqualityMatcher {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }
}

impl Matcher for EqualityMatcher {
    fn name(&self) -> &str {
        "equality"
    }

    fn can_match(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(pair.is_identity()
            && self
                .registry
                .get_key(pair.from)
                .is_some_and(|info| info.can_eq()))
    }

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<bool> {
        if !pair.is_identity() {
            return Err(MapError::not_found(pair, MapKind::Match));
        }
        let info = self.registry.require(pair.from)?;
        info.eq_values(source, dest)
    }
}

/// Wraps one typed predicate closure as a matcher for a single pair.
pub struct FnMatcher {
    name: String,
    pair: TypePair,
    fun: DynMatchFn,
}

impl FnMatcher {
    pub fn new<A, B, F>(f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(Option<&A>, Option<&B>, &MappingContext) -> anyhow::Result<bool>
            + Send
            + Sync
            + 'static,
    {
        let pair = TypePair::of::<A, B>();
        let fun: DynMatchFn = Arc::new(move |source, dest, ctx| {
            let a = source.downcast_ref::<A>()?;
            let b = dest.downcast_ref::<B>()?;
            f(a, b, ctx)
        });
        Self {
            name: format!("fn({pair})"),
            pair,
            fun,
        }
    }
}

impl Matcher for FnMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_match(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(pair == self.pair)
    }

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<bool> {
        if pair != self.pair {
            return Err(MapError::not_found(pair, MapKind::Match));
        }
        (self.fun)(source, dest, ctx).map_err(MapError::wrap_matcher)
    }
}

/// Answers from the registered match maps, templates included.
pub struct MapsMatcher {
    config: Arc<MapsConfig>,
}

impl MapsMatcher {
    pub fn new(config: Arc<MapsConfig>) -> Self {
        Self { config }
    }
}

impl Matcher for MapsMatcher {
    fn name(&self) -> &str {
        "maps"
    }

    fn can_match(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.config.resolve_match(pair)?.is_some())
    }

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<bool> {
        match self.config.resolve_match(pair)? {
            Some(fun) => fun(source, dest, ctx).map_err(MapError::wrap_matcher),
            None => Err(MapError::not_found(pair, MapKind::Match)),
        }
    }
}

/// Holds a matcher that may have failed to construct. While the failure is
/// held, `can_match` still claims every pair and `matches` raises it, so a
/// broken matcher surfaces at the first real question instead of silently
/// turning every merge into remove-all plus add-all.
pub struct SafeMatcher {
    state: std::result::Result<Arc<dyn Matcher>, Arc<MapError>>,
}

impl SafeMatcher {
    pub fn new(inner: Result<Arc<dyn Matcher>>) -> Self {
        Self {
            state: inner.map_err(Arc::new),
        }
    }
}

impl Matcher for SafeMatcher {
    fn name(&self) -> &str {
        match &self.state {
            Ok(inner) => inner.name(),
            Err(_) => "safe(failed)",
        }
    }

    fn can_match(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        match &self.state {
            Ok(inner) => inner.can_match(pair, ctx),
            Err(_) => Ok(true),
        }
    }

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<bool> {
        match &self.state {
            Ok(inner) => inner.matches(source, dest, pair, ctx),
            Err(e) => Err(MapError::MatcherFailure {
                source: anyhow::anyhow!("{e}"),
            }),
        }
    }
}

/// Ordered chain of matchers; the first member able to answer the pair
/// decides. No member able to answer means no match map exists for the
/// pair.
pub struct HierarchicalMatcher {
    name: String,
    members: Vec<Arc<dyn Matcher>>,
}

impl HierarchicalMatcher {
    pub fn new(members: Vec<Arc<dyn Matcher>>) -> Self {
        Self {
            name: "hierarchical".to_string(),
            members,
        }
    }

    pub fn named(name: impl Into<String>, members: Vec<Arc<dyn Matcher>>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

impl Matcher for HierarchicalMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_match(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        for m in &self.members {
            if m.can_match(pair, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn matches(
        &self,
        source: DynRef<'_>,
        dest: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<bool> {
        for m in &self.members {
            if m.can_match(pair, ctx)? {
                return m.matches(source, dest, pair, ctx);
            }
        }
        Err(MapError::not_found(pair, MapKind::Match))
    }
}
