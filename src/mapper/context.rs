use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::matcher::Matcher;
use crate::mapper::{AsyncMapper, Mapper, MapperId};

// ========================================
// Context options
// ========================================

/// A per-call option carried in [`MappingOptions`]. Implemented for free by
/// any `Hash + PartialEq` type; the fingerprint lets structurally equal
/// option bags share one derived context.
pub trait ContextOption: Any + Send + Sync {
    fn fingerprint(&self) -> u64;
    fn eq_option(&self, other: &dyn ContextOption) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T> ContextOption for T
where
    T: Any + Send + Sync + Hash + PartialEq,
{
    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<T>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn eq_option(&self, other: &dyn ContextOption) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|o| self == o)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Immutable bag of options, keyed by option type. One option of each type;
/// adding replaces. Cloning is cheap and shares structure.
#[derive(Clone, Default)]
pub struct MappingOptions {
    entries: im::HashMap<TypeId, Arc<dyn ContextOption>>,
}

impl MappingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: ContextOption>(&self, option: T) -> Self {
        Self {
            entries: self.entries.update(TypeId::of::<T>(), Arc::new(option)),
        }
    }

    pub fn without<T: ContextOption>(&self) -> Self {
        Self {
            entries: self.entries.without(&TypeId::of::<T>()),
        }
    }

    pub fn get<T: ContextOption>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|o| o.as_any().downcast_ref::<T>())
    }

    pub fn contains<T: ContextOption>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural hash, stable across insertion orders.
    pub fn fingerprint(&self) -> u64 {
        let mut keys: Vec<&TypeId> = self.entries.keys().collect();
        keys.sort();
        let mut hasher = DefaultHasher::new();
        for key in keys {
            key.hash(&mut hasher);
            if let Some(entry) = self.entries.get(key) {
                entry.fingerprint().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    pub fn structural_eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(key, entry)| {
            other
                .entries
                .get(key)
                .is_some_and(|o| entry.eq_option(o.as_ref()))
        })
    }
}

// ========================================
// Built-in options
// ========================================

/// Routes nested mapping through a substitute mapper, usually installed by
/// a composite so user map code re-enters the whole chain.
#[derive(Clone)]
pub struct MapperOverride(pub Arc<dyn Mapper>);

impl PartialEq for MapperOverride {
    fn eq(&self, other: &Self) -> bool {
        thin_ptr(&self.0) == thin_ptr(&other.0)
    }
}

impl Hash for MapperOverride {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin_ptr(&self.0).hash(state);
    }
}

#[derive(Clone)]
pub struct AsyncMapperOverride(pub Arc<dyn AsyncMapper>);

impl PartialEq for AsyncMapperOverride {
    fn eq(&self, other: &Self) -> bool {
        thin_ptr(&self.0) == thin_ptr(&other.0)
    }
}

impl Hash for AsyncMapperOverride {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin_ptr(&self.0).hash(state);
    }
}

/// Substitute match predicate source for collection reconciliation.
#[derive(Clone)]
pub struct MatcherOverride(pub Arc<dyn Matcher>);

impl PartialEq for MatcherOverride {
    fn eq(&self, other: &Self) -> bool {
        thin_ptr(&self.0) == thin_ptr(&other.0)
    }
}

impl Hash for MatcherOverride {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin_ptr(&self.0).hash(state);
    }
}

pub(crate) fn thin_ptr<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

/// Collection merge behavior toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergePolicy {
    /// Remove destination elements no source element matched.
    pub remove_unmatched: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            remove_unmatched: true,
        }
    }
}

/// Upper bound on concurrently mapped elements in async collection maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Parallelism(pub usize);

/// Marks a context as created for a long-lived map factory, a hint that
/// per-call work is worth precomputing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FactoryContext;

// ========================================
// Scope
// ========================================

/// Typed service bag seeded at build time and handed to every map call.
#[derive(Clone, Default)]
pub struct ServiceBag {
    services: im::HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(&self, service: Arc<T>) -> Self {
        Self {
            services: self.services.update(TypeId::of::<T>(), service),
        }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|s| s.downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Identity of one top-level mapping call. Every context derived within
/// that call shares the same scope instance, so scoped services resolve to
/// the same objects all the way down; the next top-level call gets a fresh
/// one.
pub struct MapScope {
    id: Uuid,
    services: ServiceBag,
}

impl MapScope {
    fn new(services: ServiceBag) -> Self {
        Self {
            id: Uuid::new_v4(),
            services,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }
}

// ========================================
// Nested call chain
// ========================================

/// One delegation step recorded while strategies call into each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NestedFrame {
    pub mapper: MapperId,
    pub pair: TypePair,
    pub kind: MapKind,
}

struct NestedChain {
    frame: NestedFrame,
    hash: u64,
    parent: Option<Arc<NestedChain>>,
}

impl NestedChain {
    fn push(parent: Option<&Arc<NestedChain>>, frame: NestedFrame) -> Arc<NestedChain> {
        let mut hasher = DefaultHasher::new();
        frame.hash(&mut hasher);
        if let Some(p) = parent {
            p.hash.hash(&mut hasher);
        }
        Arc::new(NestedChain {
            frame,
            hash: hasher.finish(),
            parent: parent.cloned(),
        })
    }

    fn contains(&self, frame: &NestedFrame) -> bool {
        if self.frame == *frame {
            return true;
        }
        match &self.parent {
            Some(p) => p.contains(frame),
            None => false,
        }
    }

    fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    fn chain_eq(a: &Arc<NestedChain>, b: &Arc<NestedChain>) -> bool {
        if Arc::ptr_eq(a, b) {
            return true;
        }
        if a.frame != b.frame {
            return false;
        }
        match (&a.parent, &b.parent) {
            (None, None) => true,
            (Some(pa), Some(pb)) => Self::chain_eq(pa, pb),
            _ => false,
        }
    }
}

// ========================================
// Mapping context
// ========================================

struct RootState {
    cancellation: CancellationToken,
    derived: Mutex<HashMap<u64, Weak<MappingContext>>>,
}

/// Per-call state threaded through every strategy: the option bag, the call
/// scope, the nested delegation chain and the cancellation token.
///
/// Contexts are immutable; "changing" one derives a child. Derivations are
/// memoized per top-level call, so repeated structurally equal derivations
/// return the same `Arc` while it is alive.
pub struct MappingContext {
    options: MappingOptions,
    scope: Arc<MapScope>,
    chain: Option<Arc<NestedChain>>,
    root: Arc<RootState>,
}

impl MappingContext {
    /// Entry point for one top-level call: fresh scope, empty chain.
    pub fn root(options: MappingOptions, services: ServiceBag) -> Arc<Self> {
        Self::root_with_token(options, services, CancellationToken::new())
    }

    pub fn root_with_token(
        options: MappingOptions,
        services: ServiceBag,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            scope: Arc::new(MapScope::new(services)),
            chain: None,
            root: Arc::new(RootState {
                cancellation,
                derived: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &MappingOptions {
        &self.options
    }

    pub fn scope(&self) -> &Arc<MapScope> {
        &self.scope
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.scope.service::<T>()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.root.cancellation
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.root.cancellation.is_cancelled() {
            Err(MapError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn mapper_override(&self) -> Option<Arc<dyn Mapper>> {
        self.options.get::<MapperOverride>().map(|o| o.0.clone())
    }

    pub fn async_mapper_override(&self) -> Option<Arc<dyn AsyncMapper>> {
        self.options
            .get::<AsyncMapperOverride>()
            .map(|o| o.0.clone())
    }

    pub fn matcher_override(&self) -> Option<Arc<dyn Matcher>> {
        self.options.get::<MatcherOverride>().map(|o| o.0.clone())
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.options.get::<MergePolicy>().copied().unwrap_or_default()
    }

    pub fn parallelism(&self) -> Option<usize> {
        self.options.get::<Parallelism>().map(|p| p.0)
    }

    /// True when the identical request is already running further up the
    /// chain; strategies answer it with `NotFound` instead of recursing
    /// forever.
    pub fn in_flight(&self, mapper: MapperId, pair: TypePair, kind: MapKind) -> bool {
        let frame = NestedFrame { mapper, pair, kind };
        self.chain.as_ref().is_some_and(|c| c.contains(&frame))
    }

    pub fn depth(&self) -> usize {
        self.chain.as_ref().map_or(0, |c| c.depth())
    }

    /// Derives a child context with one more delegation frame.
    pub fn nest(&self, frame: NestedFrame) -> Arc<MappingContext> {
        let chain = NestedChain::push(self.chain.as_ref(), frame);
        self.derive(self.options.clone(), Some(chain))
    }

    /// Derives a child context with an option added or replaced.
    pub fn with_option<T: ContextOption>(&self, option: T) -> Arc<MappingContext> {
        self.derive(self.options.with(option), self.chain.clone())
    }

    /// Derives a child context with both a new frame and extra options, the
    /// common shape for composite delegation.
    pub fn nest_with(&self, frame: NestedFrame, options: MappingOptions) -> Arc<MappingContext> {
        let chain = NestedChain::push(self.chain.as_ref(), frame);
        self.derive(options, Some(chain))
    }

    fn derive(
        &self,
        options: MappingOptions,
        chain: Option<Arc<NestedChain>>,
    ) -> Arc<MappingContext> {
        let mut hasher = DefaultHasher::new();
        options.fingerprint().hash(&mut hasher);
        chain.as_ref().map_or(0, |c| c.hash).hash(&mut hasher);
        let key = hasher.finish();

        let mut memo = match self.root.derived.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(weak) = memo.get(&key) {
            if let Some(existing) = weak.upgrade() {
                let chains_match = match (&existing.chain, &chain) {
                    (None, None) => true,
                    (Some(a), Some(b)) => NestedChain::chain_eq(a, b),
                    _ => false,
                };
                if chains_match && existing.options.structural_eq(&options) {
                    return existing;
                }
            }
        }

        let ctx = Arc::new(MappingContext {
            options,
            scope: self.scope.clone(),
            chain,
            root: self.root.clone(),
        });
        memo.insert(key, Arc::downgrade(&ctx));
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(mapper: MapperId) -> NestedFrame {
        NestedFrame {
            mapper,
            pair: TypePair::of::<i32, String>(),
            kind: MapKind::New,
        }
    }

    #[test]
    fn options_bag_replaces_by_type() {
        let opts = MappingOptions::new()
            .with(Parallelism(4))
            .with(Parallelism(8));
        assert_eq!(opts.len(), 1);
        assert_eq!(opts.get::<Parallelism>(), Some(&Parallelism(8)));
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = MappingOptions::new()
            .with(Parallelism(4))
            .with(MergePolicy::default());
        let b = MappingOptions::new()
            .with(MergePolicy::default())
            .with(Parallelism(4));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.structural_eq(&b));

        let c = b.with(Parallelism(9));
        assert!(!a.structural_eq(&c));
    }

    #[test]
    fn nested_scope_is_stable_within_one_call() {
        let root = MappingContext::root(MappingOptions::new(), ServiceBag::new());
        let child = root.nest(frame(1));
        let grandchild = child.nest(frame(2));
        assert!(Arc::ptr_eq(root.scope(), child.scope()));
        assert!(Arc::ptr_eq(child.scope(), grandchild.scope()));

        let other_call = MappingContext::root(MappingOptions::new(), ServiceBag::new());
        assert!(!Arc::ptr_eq(root.scope(), other_call.scope()));
        assert_ne!(root.scope().id(), other_call.scope().id());
    }

    #[test]
    fn structurally_equal_derivations_share_one_context() {
        let root = MappingContext::root(MappingOptions::new(), ServiceBag::new());
        let a = root.with_option(Parallelism(4));
        let b = root.with_option(Parallelism(4));
        assert!(Arc::ptr_eq(&a, &b));

        let c = root.with_option(Parallelism(5));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn in_flight_detects_request_already_running() {
        let root = MappingContext::root(MappingOptions::new(), ServiceBag::new());
        let pair = TypePair::of::<i32, String>();
        let child = root.nest(NestedFrame {
            mapper: 7,
            pair,
            kind: MapKind::New,
        });

        assert!(child.in_flight(7, pair, MapKind::New));
        assert!(!child.in_flight(7, pair, MapKind::Merge));
        assert!(!child.in_flight(8, pair, MapKind::New));
        assert!(!root.in_flight(7, pair, MapKind::New));
    }

    #[test]
    fn service_bag_resolves_by_type() {
        let services = ServiceBag::new().with(Arc::new(String::from("db-handle")));
        let root = MappingContext::root(MappingOptions::new(), services);
        let nested = root.nest(frame(3));
        let svc = nested.service::<String>().unwrap();
        assert_eq!(svc.as_str(), "db-handle");
        assert!(nested.service::<i32>().is_none());
    }

    #[test]
    fn check_cancelled_reports_token_state() {
        let token = CancellationToken::new();
        let root = MappingContext::root_with_token(
            MappingOptions::new(),
            ServiceBag::new(),
            token.clone(),
        );
        assert!(root.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(root.check_cancelled(), Err(MapError::Cancelled)));
    }
}
