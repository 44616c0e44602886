use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MapsConfig;
use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::mapper::context::MappingContext;
use crate::mapper::{AsyncMapper, Mapper, MapperId, next_mapper_id};

/// Runs registered async new-maps. Resolution falls back to driving a sync
/// registration inside a ready future, so a pair registered only
/// synchronously is still mappable here.
pub struct AsyncNewMapMapper {
    id: MapperId,
    config: Arc<MapsConfig>,
}

impl AsyncNewMapMapper {
    pub fn new(config: Arc<MapsConfig>) -> Self {
        Self {
            id: next_mapper_id(),
            config,
        }
    }
}

#[async_trait]
impl AsyncMapper for AsyncNewMapMapper {
    fn name(&self) -> &str {
        "async-new-map"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.config.resolve_new_async(pair)?.is_some())
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
        let Some(fun) = self.config.resolve_new_async(pair)? else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        let out = fun(source, ctx)
            .await
            .map_err(|e| MapError::wrap_failure(pair, e))?;
        if out.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "async new-map for {pair} produced '{}'",
                out.type_name()
            )));
        }
        Ok(out)
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

/// Async counterpart of the merge-map strategy.
pub struct AsyncMergeMapMapper {
    id: MapperId,
    config: Arc<MapsConfig>,
}

impl AsyncMergeMapMapper {
    pub fn new(config: Arc<MapsConfig>) -> Self {
        Self {
            id: next_mapper_id(),
            config,
        }
    }
}

#[async_trait]
impl AsyncMapper for AsyncMergeMapMapper {
    fn name(&self) -> &str {
        "async-merge-map"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    async fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    async fn can_map_merge(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.config.resolve_merge_async(pair)?.is_some())
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
        let Some(fun) = self.config.resolve_merge_async(pair)? else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        if dest.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "async merge destination for {pair} is '{}'",
                dest.type_name()
            )));
        }
        fun(source, dest, ctx)
            .await
            .map_err(|e| MapError::wrap_failure(pair, e))
    }
}

/// Lends a synchronous strategy to an async chain. Identity is shared with
/// the wrapped mapper so delegation frames recorded through either face
/// refer to the same strategy.
pub struct SyncBridge {
    inner: Arc<dyn Mapper>,
}

impl SyncBridge {
    pub fn new(inner: Arc<dyn Mapper>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AsyncMapper for SyncBridge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn id(&self) -> MapperId {
        self.inner.id()
    }

    async fn can_map_new(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_new(pair, ctx)
    }

    async fn can_map_merge(&self, pair: TypePair, ctx: &MappingContext) -> Result<bool> {
        self.inner.can_map_merge(pair, ctx)
    }

    async fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<DynValue> {
        self.inner.map_new(source, pair, ctx)
    }

    async fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        ctx: &MappingContext,
    ) -> Result<()> {
        self.inner.map_merge(source, dest, pair, ctx)
    }
}
