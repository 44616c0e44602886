use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use tracing::trace;

use crate::core::error::Result;
use crate::core::types::TypePair;
use crate::mapper::strategies::ConversionTable;
use crate::mapper::{DynAsyncMergeFn, DynAsyncNewFn, DynMatchFn, DynMergeFn, DynNewFn};
use crate::reflect::registry::TypeRegistry;

pub mod builder;
pub mod template;

pub use builder::{MapProvider, MapSet, MapsBuilder};
pub use template::{Constraint, MapTemplate, TemplateArgs, TemplateFactory, TemplateKind};

// ========================================
// Registered maps
// ========================================

/// Where a map came from, kept for diagnostics. Declared and additional
/// maps carry equal weight at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapOrigin {
    Provider(String),
    Additional,
    Template(String),
}

impl std::fmt::Display for MapOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(name) => write!(f, "provider '{name}'"),
            Self::Additional => f.write_str("additional maps"),
            Self::Template(name) => write!(f, "template '{name}'"),
        }
    }
}

pub(crate) struct RegisteredMap<F> {
    pub fun: F,
    pub origin: MapOrigin,
}

/// One row of [`MapsConfig::describe`].
#[derive(Debug, Clone, Serialize)]
pub struct MapDescriptor {
    pub kind: &'static str,
    pub from: String,
    pub to: String,
    pub origin: MapOrigin,
}

// ========================================
// Resolution cache plumbing
// ========================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ResolveKey {
    pair: TypePair,
    kind: TemplateKind,
}

#[derive(Clone)]
enum ResolvedSlot {
    New(Option<DynNewFn>),
    Merge(Option<DynMergeFn>),
    Match(Option<DynMatchFn>),
    AsyncNew(Option<DynAsyncNewFn>),
    AsyncMerge(Option<DynAsyncMergeFn>),
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Resolution cache counters, exposed through the facade stats.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

// ========================================
// MapsConfig
// ========================================

/// The immutable outcome of building a mapper: every exact map keyed by
/// pair, every template in registration order, the type registry and the
/// conversion table, plus a bounded memo of template resolutions.
///
/// Exact maps always win over templates. Among matching templates the
/// specificity order decides, and a template factory may still decline a
/// pair at manufacture time, in which case the next candidate is tried.
pub struct MapsConfig {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) conversions: Arc<ConversionTable>,
    pub(crate) new_maps: HashMap<TypePair, RegisteredMap<DynNewFn>>,
    pub(crate) merge_maps: HashMap<TypePair, RegisteredMap<DynMergeFn>>,
    pub(crate) match_maps: HashMap<TypePair, RegisteredMap<DynMatchFn>>,
    pub(crate) async_new_maps: HashMap<TypePair, RegisteredMap<DynAsyncNewFn>>,
    pub(crate) async_merge_maps: HashMap<TypePair, RegisteredMap<DynAsyncMergeFn>>,
    pub(crate) templates: Vec<Arc<MapTemplate>>,
    resolved: Mutex<LruCache<ResolveKey, ResolvedSlot>>,
    stats: CacheStats,
}

impl std::fmt::Debug for MapsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapsConfig").finish_non_exhaustive()
    }
}

impl MapsConfig {
    pub(crate) fn new(
        registry: Arc<TypeRegistry>,
        conversions: Arc<ConversionTable>,
        new_maps: HashMap<TypePair, RegisteredMap<DynNewFn>>,
        merge_maps: HashMap<TypePair, RegisteredMap<DynMergeFn>>,
        match_maps: HashMap<TypePair, RegisteredMap<DynMatchFn>>,
        async_new_maps: HashMap<TypePair, RegisteredMap<DynAsyncNewFn>>,
        async_merge_maps: HashMap<TypePair, RegisteredMap<DynAsyncMergeFn>>,
        templates: Vec<Arc<MapTemplate>>,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            conversions,
            new_maps,
            merge_maps,
            match_maps,
            async_new_maps,
            async_merge_maps,
            templates,
            resolved: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn conversions(&self) -> &Arc<ConversionTable> {
        &self.conversions
    }

    pub fn resolve_new(&self, pair: TypePair) -> Result<Option<DynNewFn>> {
        if let Some(m) = self.new_maps.get(&pair) {
            return Ok(Some(m.fun.clone()));
        }
        let key = ResolveKey {
            pair,
            kind: TemplateKind::New,
        };
        if let Some(slot) = self.cache_get(key)? {
            if let ResolvedSlot::New(f) = slot {
                return Ok(f);
            }
        }
        let mut found = None;
        self.scan_templates(pair, TemplateKind::New, |template, args| {
            let TemplateFactory::New(factory) = &template.factory else {
                return Ok(false);
            };
            match factory(args) {
                Ok(fun) => {
                    found = Some(fun);
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })?;
        self.cache_put(key, ResolvedSlot::New(found.clone()))?;
        Ok(found)
    }

    pub fn resolve_merge(&self, pair: TypePair) -> Result<Option<DynMergeFn>> {
        if let Some(m) = self.merge_maps.get(&pair) {
            return Ok(Some(m.fun.clone()));
        }
        let key = ResolveKey {
            pair,
            kind: TemplateKind::Merge,
        };
        if let Some(slot) = self.cache_get(key)? {
            if let ResolvedSlot::Merge(f) = slot {
                return Ok(f);
            }
        }
        let mut found = None;
        self.scan_templates(pair, TemplateKind::Merge, |template, args| {
            let TemplateFactory::Merge(factory) = &template.factory else {
                return Ok(false);
            };
            match factory(args) {
                Ok(fun) => {
                    found = Some(fun);
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })?;
        self.cache_put(key, ResolvedSlot::Merge(found.clone()))?;
        Ok(found)
    }

    pub fn resolve_match(&self, pair: TypePair) -> Result<Option<DynMatchFn>> {
        if let Some(m) = self.match_maps.get(&pair) {
            return Ok(Some(m.fun.clone()));
        }
        let key = ResolveKey {
            pair,
            kind: TemplateKind::Match,
        };
        if let Some(slot) = self.cache_get(key)? {
            if let ResolvedSlot::Match(f) = slot {
                return Ok(f);
            }
        }
        let mut found = None;
        self.scan_templates(pair, TemplateKind::Match, |template, args| {
            let TemplateFactory::Match(factory) = &template.factory else {
                return Ok(false);
            };
            match factory(args) {
                Ok(fun) => {
                    found = Some(fun);
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })?;
        self.cache_put(key, ResolvedSlot::Match(found.clone()))?;
        Ok(found)
    }

    /// Async resolution prefers natively async registrations and falls
    /// back to driving a sync map inside a ready future.
    pub fn resolve_new_async(&self, pair: TypePair) -> Result<Option<DynAsyncNewFn>> {
        if let Some(m) = self.async_new_maps.get(&pair) {
            return Ok(Some(m.fun.clone()));
        }
        let key = ResolveKey {
            pair,
            kind: TemplateKind::AsyncNew,
        };
        if let Some(slot) = self.cache_get(key)? {
            if let ResolvedSlot::AsyncNew(f) = slot {
                return Ok(f);
            }
        }
        let mut found: Option<DynAsyncNewFn> = None;
        self.scan_templates(pair, TemplateKind::AsyncNew, |template, args| {
            let TemplateFactory::AsyncNew(factory) = &template.factory else {
                return Ok(false);
            };
            match factory(args) {
                Ok(fun) => {
                    found = Some(fun);
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })?;
        if found.is_none() {
            if let Some(sync_fn) = self.resolve_new(pair)? {
                let wrapped: DynAsyncNewFn = Arc::new(move |src, ctx| {
                    let f = sync_fn.clone();
                    Box::pin(async move { f(src, ctx) })
                });
                found = Some(wrapped);
            }
        }
        self.cache_put(key, ResolvedSlot::AsyncNew(found.clone()))?;
        Ok(found)
    }

    pub fn resolve_merge_async(&self, pair: TypePair) -> Result<Option<DynAsyncMergeFn>> {
        if let Some(m) = self.async_merge_maps.get(&pair) {
            return Ok(Some(m.fun.clone()));
        }
        let key = ResolveKey {
            pair,
            kind: TemplateKind::AsyncMerge,
        };
        if let Some(slot) = self.cache_get(key)? {
            if let ResolvedSlot::AsyncMerge(f) = slot {
                return Ok(f);
            }
        }
        let mut found: Option<DynAsyncMergeFn> = None;
        self.scan_templates(pair, TemplateKind::AsyncMerge, |template, args| {
            let TemplateFactory::AsyncMerge(factory) = &template.factory else {
                return Ok(false);
            };
            match factory(args) {
                Ok(fun) => {
                    found = Some(fun);
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })?;
        if found.is_none() {
            if let Some(sync_fn) = self.resolve_merge(pair)? {
                let wrapped: DynAsyncMergeFn = Arc::new(move |src, dest, ctx| {
                    let f = sync_fn.clone();
                    Box::pin(async move { f(src, dest, ctx) })
                });
                found = Some(wrapped);
            }
        }
        self.cache_put(key, ResolvedSlot::AsyncMerge(found.clone()))?;
        Ok(found)
    }

    /// Walks matching templates in specificity order, stopping when the
    /// visitor reports success.
    fn scan_templates(
        &self,
        pair: TypePair,
        kind: TemplateKind,
        mut visit: impl FnMut(&MapTemplate, &TemplateArgs) -> Result<bool>,
    ) -> Result<()> {
        let (Some(from_shape), Some(to_shape)) = (
            self.registry.shape_of(pair.from).cloned(),
            self.registry.shape_of(pair.to).cloned(),
        ) else {
            // Unregistered types can still have exact maps; templates
            // simply cannot see them.
            return Ok(());
        };

        let mut candidates: Vec<(&Arc<MapTemplate>, TemplateArgs)> = Vec::new();
        for template in &self.templates {
            if template.factory.kind() != kind {
                continue;
            }
            if let Some(args) = template.try_match(
                pair,
                &from_shape,
                &to_shape,
                &self.registry,
                &self.conversions,
            ) {
                candidates.push((template, args));
            }
        }
        candidates.sort_by_key(|(t, _)| t.specificity());

        for (template, args) in &candidates {
            trace!(template = %template.name, pair = %pair, "trying map template");
            if visit(template, args)? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn cache_get(&self, key: ResolveKey) -> Result<Option<ResolvedSlot>> {
        let mut cache = self.resolved.lock()?;
        match cache.get(&key) {
            Some(slot) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(slot.clone()))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn cache_put(&self, key: ResolveKey, slot: ResolvedSlot) -> Result<()> {
        self.resolved.lock()?.put(key, slot);
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheSnapshot {
        let entries = self.resolved.lock().map(|c| c.len()).unwrap_or(0);
        CacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Every registration, exact and open, for diagnostics and the facade's
    /// describe output.
    pub fn describe(&self) -> Vec<MapDescriptor> {
        fn pair_row<F>(
            kind: &'static str,
            pair: &TypePair,
            m: &RegisteredMap<F>,
        ) -> MapDescriptor {
            MapDescriptor {
                kind,
                from: pair.from.name().to_string(),
                to: pair.to.name().to_string(),
                origin: m.origin.clone(),
            }
        }

        let mut rows = Vec::new();
        for (pair, m) in &self.new_maps {
            rows.push(pair_row("new", pair, m));
        }
        for (pair, m) in &self.merge_maps {
            rows.push(pair_row("merge", pair, m));
        }
        for (pair, m) in &self.match_maps {
            rows.push(pair_row("match", pair, m));
        }
        for (pair, m) in &self.async_new_maps {
            rows.push(pair_row("async_new", pair, m));
        }
        for (pair, m) in &self.async_merge_maps {
            rows.push(pair_row("async_merge", pair, m));
        }
        for t in &self.templates {
            let kind = match t.factory.kind() {
                TemplateKind::New => "new_template",
                TemplateKind::Merge => "merge_template",
                TemplateKind::Match => "match_template",
                TemplateKind::AsyncNew => "async_new_template",
                TemplateKind::AsyncMerge => "async_merge_template",
            };
            rows.push(MapDescriptor {
                kind,
                from: t.from.to_string(),
                to: t.to.to_string(),
                origin: MapOrigin::Template(t.name.clone()),
            });
        }
        rows.sort_by(|a, b| (a.kind, &a.from, &a.to).cmp(&(b.kind, &b.from, &b.to)));
        rows
    }
}
