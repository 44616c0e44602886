use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::template::{Constraint, MapTemplate, TemplateArgs, TemplateFactory};
use crate::config::{MapOrigin, MapsConfig, RegisteredMap};
use crate::core::error::{MapError, Result};
use crate::core::types::TypePair;
use crate::core::value::DynValue;
use crate::mapper::context::MappingContext;
use crate::mapper::strategies::ConversionTable;
use crate::mapper::{
    DynAsyncMergeFn, DynAsyncNewFn, DynMatchFn, DynMergeFn, DynNewFn,
};
use crate::reflect::registry::{RegistryBuilder, TypeRegistry};
use crate::reflect::shape::TypeShape;

// ========================================
// Providers
// ========================================

/// A named bundle of map registrations, the declarative way to contribute
/// maps. Declared maps and maps added directly on the builder carry equal
/// priority; a pair registered twice in either place fails the build.
pub trait MapProvider: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, maps: MapSet) -> MapSet;
}

// ========================================
// Map set
// ========================================

enum PendingEntry {
    New(TypePair, DynNewFn),
    Merge(TypePair, DynMergeFn),
    Match(TypePair, DynMatchFn),
    AsyncNew(TypePair, DynAsyncNewFn),
    AsyncMerge(TypePair, DynAsyncMergeFn),
    Template(MapTemplate),
}

/// Collects registrations from one origin. All typed closures speak
/// `Option` on both sides, so null sources and null results keep their
/// meaning end to end.
pub struct MapSet {
    origin: MapOrigin,
    entries: Vec<PendingEntry>,
}

impl MapSet {
    fn new(origin: MapOrigin) -> Self {
        Self {
            origin,
            entries: Vec::new(),
        }
    }

    /// Registers a new-map for the closed pair `A` to `B`.
    pub fn new_map<A, B, F>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(Option<&A>, &MappingContext) -> anyhow::Result<Option<B>> + Send + Sync + 'static,
    {
        let fun: DynNewFn = Arc::new(move |src, ctx| {
            let a = src.downcast_ref::<A>()?;
            Ok(DynValue::from_option(f(a, ctx)?))
        });
        self.entries
            .push(PendingEntry::New(TypePair::of::<A, B>(), fun));
        self
    }

    /// Registers a merge-map. The closure owns the destination for its run
    /// and returns what the destination becomes.
    pub fn merge_map<A, B, F>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(Option<&A>, Option<B>, &MappingContext) -> anyhow::Result<Option<B>>
            + Send
            + Sync
            + 'static,
    {
        let fun: DynMergeFn = Arc::new(move |src, dest, ctx| {
            let a = src.downcast_ref::<A>()?;
            let d = dest.take_payload::<B>()?;
            let out = f(a, d, ctx)?;
            *dest = DynValue::from_option(out);
            Ok(())
        });
        self.entries
            .push(PendingEntry::Merge(TypePair::of::<A, B>(), fun));
        self
    }

    /// Registers a match predicate for collection reconciliation.
    pub fn match_map<A, B, F>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(Option<&A>, Option<&B>, &MappingContext) -> anyhow::Result<bool>
            + Send
            + Sync
            + 'static,
    {
        let fun: DynMatchFn = Arc::new(move |src, dest, ctx| {
            let a = src.downcast_ref::<A>()?;
            let b = dest.downcast_ref::<B>()?;
            f(a, b, ctx)
        });
        self.entries
            .push(PendingEntry::Match(TypePair::of::<A, B>(), fun));
        self
    }

    /// Async new-map. The closure runs synchronously with the context in
    /// scope and returns the future to await; anything the future needs
    /// from the context (services are `Arc`s) is read before it is built:
    ///
    /// ```ignore
    /// maps.async_new_map(|id: Option<UserId>, ctx: &MappingContext| {
    ///     let db = ctx.service::<Db>();
    ///     async move {
    ///         Ok(match (id, db) {
    ///             (Some(id), Some(db)) => db.find_user(id).await?,
    ///             _ => None,
    ///         })
    ///     }
    /// })
    /// ```
    pub fn async_new_map<A, B, F, Fut>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync + Clone,
        B: Any + Send + Sync,
        F: Fn(Option<A>, &MappingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<B>>> + Send + 'static,
    {
        let fun: DynAsyncNewFn = Arc::new(move |src, ctx| {
            let arg = match src.downcast_ref::<A>() {
                Ok(a) => a.cloned(),
                Err(e) => return Box::pin(async move { Err(e.into()) }),
            };
            let fut = f(arg, ctx);
            Box::pin(async move { Ok(DynValue::from_option(fut.await?)) })
        });
        self.entries
            .push(PendingEntry::AsyncNew(TypePair::of::<A, B>(), fun));
        self
    }

    /// Async merge-map; the destination is moved into the closure and the
    /// future returns what it becomes.
    pub fn async_merge_map<A, B, F, Fut>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync + Clone,
        B: Any + Send + Sync,
        F: Fn(Option<A>, Option<B>, &MappingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<B>>> + Send + 'static,
    {
        let fun: DynAsyncMergeFn = Arc::new(move |src, dest, ctx| {
            let arg = match src.downcast_ref::<A>() {
                Ok(a) => a.cloned(),
                Err(e) => return Box::pin(async move { Err(e.into()) }),
            };
            let taken = match dest.take_payload::<B>() {
                Ok(d) => d,
                Err(e) => return Box::pin(async move { Err(e.into()) }),
            };
            let fut = f(arg, taken, ctx);
            Box::pin(async move {
                let out = fut.await?;
                *dest = DynValue::from_option(out);
                Ok(())
            })
        });
        self.entries
            .push(PendingEntry::AsyncMerge(TypePair::of::<A, B>(), fun));
        self
    }

    /// Registers an open new-map over shape variables. The factory runs
    /// once per distinct matched pair; returning `NotFound` declines the
    /// pair and lets less specific candidates try.
    pub fn new_template<F>(
        self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: F,
    ) -> Self
    where
        F: Fn(&TemplateArgs) -> Result<DynNewFn> + Send + Sync + 'static,
    {
        self.push_template(name, from, to, constraints, TemplateFactory::New(Arc::new(factory)))
    }

    pub fn merge_template<F>(
        self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: F,
    ) -> Self
    where
        F: Fn(&TemplateArgs) -> Result<DynMergeFn> + Send + Sync + 'static,
    {
        self.push_template(
            name,
            from,
            to,
            constraints,
            TemplateFactory::Merge(Arc::new(factory)),
        )
    }

    pub fn match_template<F>(
        self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: F,
    ) -> Self
    where
        F: Fn(&TemplateArgs) -> Result<DynMatchFn> + Send + Sync + 'static,
    {
        self.push_template(
            name,
            from,
            to,
            constraints,
            TemplateFactory::Match(Arc::new(factory)),
        )
    }

    pub fn async_new_template<F>(
        self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: F,
    ) -> Self
    where
        F: Fn(&TemplateArgs) -> Result<DynAsyncNewFn> + Send + Sync + 'static,
    {
        self.push_template(
            name,
            from,
            to,
            constraints,
            TemplateFactory::AsyncNew(Arc::new(factory)),
        )
    }

    pub fn async_merge_template<F>(
        self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: F,
    ) -> Self
    where
        F: Fn(&TemplateArgs) -> Result<DynAsyncMergeFn> + Send + Sync + 'static,
    {
        self.push_template(
            name,
            from,
            to,
            constraints,
            TemplateFactory::AsyncMerge(Arc::new(factory)),
        )
    }

    fn push_template(
        mut self,
        name: impl Into<String>,
        from: TypeShape,
        to: TypeShape,
        constraints: Vec<(u8, Constraint)>,
        factory: TemplateFactory,
    ) -> Self {
        self.entries.push(PendingEntry::Template(MapTemplate {
            name: name.into(),
            from,
            to,
            constraints,
            factory,
            index: 0,
        }));
        self
    }
}

// ========================================
// Builder
// ========================================

/// Assembles a [`MapsConfig`]: type registrations, conversions, providers
/// and additional maps. Duplicate pairs in the same family are a build
/// error regardless of which origin contributed them.
pub struct MapsBuilder {
    registry: Option<RegistryBuilder>,
    conversions: Option<ConversionTable>,
    providers: Vec<Arc<dyn MapProvider>>,
    additional: Vec<MapSet>,
    cache_capacity: usize,
}

impl MapsBuilder {
    pub fn new() -> Self {
        Self {
            registry: Some(TypeRegistry::standard()),
            conversions: Some(ConversionTable::standard()),
            providers: Vec::new(),
            additional: Vec::new(),
            cache_capacity: 256,
        }
    }

    /// Extends the type registry.
    pub fn types(mut self, f: impl FnOnce(RegistryBuilder) -> RegistryBuilder) -> Self {
        self.registry = self.registry.take().map(f);
        self
    }

    /// Extends the conversion table.
    pub fn conversions(mut self, f: impl FnOnce(ConversionTable) -> ConversionTable) -> Self {
        self.conversions = self.conversions.take().map(f);
        self
    }

    pub fn provider(mut self, provider: impl MapProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Adds maps outside any provider.
    pub fn maps(mut self, f: impl FnOnce(MapSet) -> MapSet) -> Self {
        self.additional.push(f(MapSet::new(MapOrigin::Additional)));
        self
    }

    /// Capacity of the template resolution memo.
    pub fn resolution_cache(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn build(mut self) -> Result<MapsConfig> {
        let registry = Arc::new(
            self.registry
                .take()
                .unwrap_or_else(TypeRegistry::standard)
                .build()?,
        );
        let conversions = Arc::new(self.conversions.take().unwrap_or_else(ConversionTable::standard));

        let mut sets: Vec<MapSet> = Vec::new();
        for provider in &self.providers {
            let set = provider.configure(MapSet::new(MapOrigin::Provider(
                provider.name().to_string(),
            )));
            sets.push(set);
        }
        sets.append(&mut self.additional);

        let mut new_maps: HashMap<TypePair, RegisteredMap<DynNewFn>> = HashMap::new();
        let mut merge_maps: HashMap<TypePair, RegisteredMap<DynMergeFn>> = HashMap::new();
        let mut match_maps: HashMap<TypePair, RegisteredMap<DynMatchFn>> = HashMap::new();
        let mut async_new_maps: HashMap<TypePair, RegisteredMap<DynAsyncNewFn>> = HashMap::new();
        let mut async_merge_maps: HashMap<TypePair, RegisteredMap<DynAsyncMergeFn>> =
            HashMap::new();
        let mut templates: Vec<Arc<MapTemplate>> = Vec::new();

        fn insert<F>(
            family: &'static str,
            table: &mut HashMap<TypePair, RegisteredMap<F>>,
            pair: TypePair,
            fun: F,
            origin: &MapOrigin,
        ) -> Result<()> {
            if let Some(existing) = table.get(&pair) {
                return Err(MapError::Configuration(format!(
                    "duplicate {family} map for {pair}: registered by {} and {}",
                    existing.origin, origin
                )));
            }
            table.insert(
                pair,
                RegisteredMap {
                    fun,
                    origin: origin.clone(),
                },
            );
            Ok(())
        }

        for set in sets {
            let origin = set.origin;
            for entry in set.entries {
                match entry {
                    PendingEntry::New(pair, fun) => {
                        insert("new", &mut new_maps, pair, fun, &origin)?;
                    }
                    PendingEntry::Merge(pair, fun) => {
                        insert("merge", &mut merge_maps, pair, fun, &origin)?;
                    }
                    PendingEntry::Match(pair, fun) => {
                        insert("match", &mut match_maps, pair, fun, &origin)?;
                    }
                    PendingEntry::AsyncNew(pair, fun) => {
                        insert("async new", &mut async_new_maps, pair, fun, &origin)?;
                    }
                    PendingEntry::AsyncMerge(pair, fun) => {
                        insert("async merge", &mut async_merge_maps, pair, fun, &origin)?;
                    }
                    PendingEntry::Template(mut template) => {
                        template.index = templates.len();
                        templates.push(Arc::new(template));
                    }
                }
            }
        }

        info!(
            types = registry.len(),
            exact_maps = new_maps.len()
                + merge_maps.len()
                + match_maps.len()
                + async_new_maps.len()
                + async_merge_maps.len(),
            templates = templates.len(),
            "maps configuration built"
        );

        Ok(MapsConfig::new(
            registry,
            conversions,
            new_maps,
            merge_maps,
            match_maps,
            async_new_maps,
            async_merge_maps,
            templates,
            self.cache_capacity,
        ))
    }
}

impl Default for MapsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
