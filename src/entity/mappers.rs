use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypeKey, TypePair};
use crate::core::value::{DynRef, DynValue, EntityKey};
use crate::entity::{
    AsyncEntityStore, AsyncStoreOverride, EntitiesRetrievalMode, EntityDescriptors, EntityStore,
    RetrievalModeOverride, StoreOverride,
};
use crate::mapper::context::MappingContext;
use crate::mapper::{AsyncMapper, Mapper, MapperId, next_mapper_id};
use crate::reflect::registry::TypeRegistry;

fn wrong_entity(pair: TypePair, store: &str, got: &DynValue) -> MapError {
    MapError::TypeMismatch(format!(
        "store '{}' returned '{}' for {}",
        store,
        got.type_name(),
        pair
    ))
}

// ========================================
// Key -> entity
// ========================================

/// Resolves key values (scalar or tuple) to registered entities through a
/// store, honoring the retrieval mode. A missing entity maps to a typed
/// null; merging over an entity that carries a different key is a
/// duplicate under the default policy.
pub struct KeyToEntityMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    descriptors: Arc<EntityDescriptors>,
    store: Option<Arc<dyn EntityStore>>,
    mode: EntitiesRetrievalMode,
    reject_duplicates: bool,
}

impl KeyToEntityMapper {
    pub fn new(
        registry: Arc<TypeRegistry>,
        descriptors: Arc<EntityDescriptors>,
        store: Option<Arc<dyn EntityStore>>,
    ) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            descriptors,
            store,
            mode: EntitiesRetrievalMode::default(),
            reject_duplicates: true,
        }
    }

    pub fn with_mode(mut self, mode: EntitiesRetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Merge over a different existing entity resolves from the store
    /// instead of raising `DuplicateEntity`.
    pub fn resolve_duplicates(mut self) -> Self {
        self.reject_duplicates = false;
        self
    }

    fn store_for(&self, ctx: &MappingContext) -> Option<Arc<dyn EntityStore>> {
        ctx.options()
            .get::<StoreOverride>()
            .map(|o| o.0.clone())
            .or_else(|| self.store.clone())
    }

    fn mode_for(&self, ctx: &MappingContext) -> EntitiesRetrievalMode {
        ctx.options()
            .get::<RetrievalModeOverride>()
            .map(|o| o.0)
            .unwrap_or(self.mode)
    }

    fn handles(&self, pair: TypePair, ctx: &MappingContext) -> bool {
        self.registry
            .get_key(pair.from)
            .is_some_and(|info| info.is_key_like())
            && self.descriptors.contains(pair.to)
            && self.store_for(ctx).is_some()
    }

    fn key_of(&self, source: DynRef<'_>, pair: TypePair) -> Result<Option<EntityKey>> {
        match self.registry.get_key(pair.from) {
            Some(info) if info.is_key_like() => info.extract_key(source),
            _ => Err(MapError::not_found(pair, MapKind::New)),
        }
    }

    fn retrieve(
        &self,
        store: &Arc<dyn EntityStore>,
        mode: EntitiesRetrievalMode,
        entity: TypeKey,
        key: &EntityKey,
    ) -> Result<Option<DynValue>> {
        match mode {
            EntitiesRetrievalMode::Local => store.find_by_key(entity, key),
            EntitiesRetrievalMode::LocalOrAttach => match store.find_by_key(entity, key)? {
                Some(found) => Ok(Some(found)),
                None => store.attach_unchanged(entity, key).map(Some),
            },
            EntitiesRetrievalMode::LocalOrRemote => match store.find_by_key(entity, key)? {
                Some(found) => Ok(Some(found)),
                None => store.fetch_by_key(entity, key),
            },
            EntitiesRetrievalMode::Remote => store.fetch_by_key(entity, key),
        }
    }
}

impl Mapper for KeyToEntityMapper {
    fn name(&self) -> &str {
        "key-to-entity"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair, ctx))
    }

    fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair, ctx))
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        ctx.check_cancelled()?;
        let Some(store) = self.store_for(ctx) else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        if !self.descriptors.contains(pair.to) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        let Some(key) = self.key_of(source, pair)? else {
            return Ok(DynValue::null_of(pair.to));
        };
        let mode = self.mode_for(ctx);
        trace!(pair = %pair, key = %key, ?mode, "resolving entity by key");
        match self.retrieve(&store, mode, pair.to, &key)? {
            Some(entity) if entity.key() == pair.to => Ok(entity),
            Some(other) => Err(wrong_entity(pair, store.name(), &other)),
            None => Ok(DynValue::null_of(pair.to)),
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
        let Some(store) = self.store_for(ctx) else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        let Some(descriptor) = self.descriptors.resolve(pair.to)? else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        if dest.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "merge destination for {} is '{}'",
                pair,
                dest.type_name()
            )));
        }
        let Some(key) = self.key_of(source, pair)? else {
            *dest = DynValue::null_of(pair.to);
            return Ok(());
        };
        if !dest.is_null() {
            if descriptor.matches(dest.as_dyn(), &key)? {
                return Ok(());
            }
            if self.reject_duplicates {
                return Err(MapError::DuplicateEntity {
                    type_name: pair.to.name(),
                    key: key.to_string(),
                });
            }
        }
        let resolved = self.retrieve(&store, self.mode_for(ctx), pair.to, &key)?;
        *dest = resolved.unwrap_or_else(|| DynValue::null_of(pair.to));
        Ok(())
    }
}

// ========================================
// Entity -> key
// ========================================

/// Extracts an entity's key and renders it as the destination key type.
/// Needs no store; the descriptor and the destination's key vtable carry
/// the whole conversion.
pub struct EntityToKeyMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    descriptors: Arc<EntityDescriptors>,
}

impl EntityToKeyMapper {
    pub fn new(registry: Arc<TypeRegistry>, descriptors: Arc<EntityDescriptors>) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            descriptors,
        }
    }

    fn handles(&self, pair: TypePair) -> bool {
        self.descriptors.contains(pair.from)
            && self
                .registry
                .get_key(pair.to)
                .is_some_and(|info| info.is_key_like())
    }

    fn key_value(&self, source: DynRef<'_>, pair: TypePair) -> Result<DynValue> {
        let Some(descriptor) = self.descriptors.resolve(pair.from)? else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        let Some(key) = descriptor.extract(source)? else {
            return Ok(DynValue::null_of(pair.to));
        };
        let info = self.registry.require(pair.to)?;
        match info.key_from(&key)? {
            Some(value) => Ok(value),
            None => Err(MapError::TypeMismatch(format!(
                "key [{}] of '{}' does not fit '{}'",
                key,
                pair.from.name(),
                pair.to.name()
            ))),
        }
    }
}

impl Mapper for EntityToKeyMapper {
    fn name(&self) -> &str {
        "entity-to-key"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair))
    }

    fn can_map_merge(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair))
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        ctx.check_cancelled()?;
        if !self.handles(pair) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        self.key_value(source, pair)
    }

    fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        if !self.handles(pair) {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        if dest.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "merge destination for {} is '{}'",
                pair,
                dest.type_name()
            )));
        }
        *dest = self.key_value(source, pair)?;
        Ok(())
    }
}

// ========================================
// Async key -> entity
// ========================================

/// Async twin of [`KeyToEntityMapper`], against an [`AsyncEntityStore`].
pub struct AsyncKeyToEntityMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
    descriptors: Arc<EntityDescriptors>,
    store: Option<Arc<dyn AsyncEntityStore>>,
    mode: EntitiesRetrievalMode,
    reject_duplicates: bool,
}

impl AsyncKeyToEntityMapper {
    pub fn new(
        registry: Arc<TypeRegistry>,
        descriptors: Arc<EntityDescriptors>,
        store: Option<Arc<dyn AsyncEntityStore>>,
    ) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
            descriptors,
            store,
            mode: EntitiesRetrievalMode::default(),
            reject_duplicates: true,
        }
    }

    pub fn with_mode(mut self, mode: EntitiesRetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn resolve_duplicates(mut self) -> Self {
        self.reject_duplicates = false;
        self
    }

    fn store_for(&self, ctx: &MappingContext) -> Option<Arc<dyn AsyncEntityStore>> {
        ctx.options()
            .get::<AsyncStoreOverride>()
            .map(|o| o.0.clone())
            .or_else(|| self.store.clone())
    }

    fn mode_for(&self, ctx: &MappingContext) -> EntitiesRetrievalMode {
        ctx.options()
            .get::<RetrievalModeOverride>()
            .map(|o| o.0)
            .unwrap_or(self.mode)
    }

    fn handles(&self, pair: TypePair, ctx: &MappingContext) -> bool {
        self.registry
            .get_key(pair.from)
            .is_some_and(|info| info.is_key_like())
            && self.descriptors.contains(pair.to)
            && self.store_for(ctx).is_some()
    }

    fn key_of(&self, source: DynRef<'_>, pair: TypePair) -> Result<Option<EntityKey>> {
        match self.registry.get_key(pair.from) {
            Some(info) if info.is_key_like() => info.extract_key(source),
            _ => Err(MapError::not_found(pair, MapKind::New)),
        }
    }

    async fn retrieve(
        &self,
        store: &Arc<dyn AsyncEntityStore>,
        mode: EntitiesRetrievalMode,
        entity: TypeKey,
        key: &EntityKey,
    ) -> Result<Option<DynValue>> {
        match mode {
            EntitiesRetrievalMode::Local => store.find_by_key(entity, key).await,
            EntitiesRetrievalMode::LocalOrAttach => match store.find_by_key(entity, key).await? {
                Some(found) => Ok(Some(found)),
                None => store.attach_unchanged(entity, key).await.map(Some),
            },
            EntitiesRetrievalMode::LocalOrRemote => match store.find_by_key(entity, key).await? {
                Some(found) => Ok(Some(found)),
                None => store.fetch_by_key(entity, key).await,
            },
            EntitiesRetrievalMode::Remote => store.fetch_by_key(entity, key).await,
        }
    }
}

#[async_trait]
impl AsyncMapper for AsyncKeyToEntityMapper {
    fn name(&self) -> &str {
        "async-key-to-entity"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair, ctx))
    }

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        Ok(self.handles(pair, ctx))
    }

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        ctx.check_cancelled()?;
        let Some(store) = self.store_for(ctx) else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        if !self.descriptors.contains(pair.to) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        let Some(key) = self.key_of(source, pair)? else {
            return Ok(DynValue::null_of(pair.to));
        };
        let mode = self.mode_for(ctx);
        trace!(pair = %pair, key = %key, ?mode, "resolving entity by key");
        match self.retrieve(&store, mode, pair.to, &key).await? {
            Some(entity) if entity.key() == pair.to => Ok(entity),
            Some(other) => Err(wrong_entity(pair, store.name(), &other)),
            None => Ok(DynValue::null_of(pair.to)),
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
        let Some(store) = self.store_for(ctx) else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        let Some(descriptor) = self.descriptors.resolve(pair.to)? else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        if dest.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "merge destination for {} is '{}'",
                pair,
                dest.type_name()
            )));
        }
        let Some(key) = self.key_of(source, pair)? else {
            *dest = DynValue::null_of(pair.to);
            return Ok(());
        };
        if !dest.is_null() {
            if descriptor.matches(dest.as_dyn(), &key)? {
                return Ok(());
            }
            if self.reject_duplicates {
                return Err(MapError::DuplicateEntity {
                    type_name: pair.to.name(),
                    key: key.to_string(),
                });
            }
        }
        let resolved = self.retrieve(&store, self.mode_for(ctx), pair.to, &key).await?;
        *dest = resolved.unwrap_or_else(|| DynValue::null_of(pair.to));
        Ok(())
    }
}
