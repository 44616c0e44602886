use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::config::MapsConfig;
use crate::core::error::{MapError, Result};
use crate::core::types::{MapKind, TypePair};
use crate::core::value::{DynRef, DynValue};
use crate::factory::ObjectFactory;
use crate::mapper::context::MappingContext;
use crate::mapper::{Mapper, MapperId, next_mapper_id};
use crate::reflect::registry::TypeRegistry;

// ========================================
// Conversion table
// ========================================

pub type ConvertFn = Arc<dyn Fn(DynRef<'_>) -> anyhow::Result<DynValue> + Send + Sync>;

lazy_static! {
    static ref STANDARD_CONVERSIONS: ConversionTable = ConversionTable::build_standard();
}

/// Directed conversions between registered types, applied by
/// [`ConversionMapper`] and consulted by `ConvertibleTo` template
/// constraints. Cloning shares the erased functions.
#[derive(Clone, Default)]
pub struct ConversionTable {
    entries: HashMap<TypePair, ConvertFn>,
}

impl ConversionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in set: lossless numeric widenings plus scalar to
    /// `String` rendering.
    pub fn standard() -> Self {
        STANDARD_CONVERSIONS.clone()
    }

    fn build_standard() -> Self {
        let mut t = Self::new();

        macro_rules! widen {
            ($($from:ty => $to:ty),+ $(,)?) => {
                $( t = t.convert::<$from, $to, _>(|v| <$to>::from(*v)); )+
            };
        }
        macro_rules! render {
            ($($from:ty),+ $(,)?) => {
                $( t = t.convert::<$from, String, _>(|v| v.to_string()); )+
            };
        }

        widen!(
            i8 => i16, i8 => i32, i8 => i64, i8 => i128,
            i16 => i32, i16 => i64, i16 => i128,
            i32 => i64, i32 => i128,
            i64 => i128,
            u8 => u16, u8 => u32, u8 => u64, u8 => u128,
            u16 => u32, u16 => u64, u16 => u128,
            u32 => u64, u32 => u128,
            u64 => u128,
            u8 => i16, u8 => i32, u8 => i64, u8 => i128,
            u16 => i32, u16 => i64, u16 => i128,
            u32 => i64, u32 => i128,
            u64 => i128,
            i8 => f32, i8 => f64,
            i16 => f32, i16 => f64,
            i32 => f64,
            u8 => f32, u8 => f64,
            u16 => f32, u16 => f64,
            u32 => f64,
            f32 => f64,
        );
        render!(
            bool, char,
            i8, i16, i32, i64, i128, isize,
            u8, u16, u32, u64, u128, usize,
            f32, f64,
            uuid::Uuid, chrono::DateTime<chrono::Utc>,
        );
        t
    }

    /// Registers an infallible conversion. Null converts to null without
    /// calling the function.
    pub fn convert<A, B, F>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(&A) -> B + Send + Sync + 'static,
    {
        self.entries.insert(
            TypePair::of::<A, B>(),
            Arc::new(move |src| {
                Ok(match src.downcast_ref::<A>()? {
                    Some(a) => DynValue::new(f(a)),
                    None => DynValue::null::<B>(),
                })
            }),
        );
        self
    }

    /// Fallible variant for conversions that can refuse a value.
    pub fn try_convert<A, B, F>(mut self, f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(&A) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        self.entries.insert(
            TypePair::of::<A, B>(),
            Arc::new(move |src| {
                Ok(match src.downcast_ref::<A>()? {
                    Some(a) => DynValue::new(f(a)?),
                    None => DynValue::null::<B>(),
                })
            }),
        );
        self
    }

    pub fn can_convert(&self, pair: TypePair) -> bool {
        self.entries.contains_key(&pair)
    }

    pub fn get(&self, pair: TypePair) -> Option<ConvertFn> {
        self.entries.get(&pair).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ========================================
// Map-fn strategies
// ========================================

/// Runs registered new-maps, exact or template-manufactured.
pub struct NewMapMapper {
    id: MapperId,
    config: Arc<MapsConfig>,
}

impl NewMapMapper {
    pub fn new(config: Arc<MapsConfig>) -> Self {
        Self {
            id: next_mapper_id(),
            config,
        }
    }
}

impl Mapper for NewMapMapper {
    fn name(&self) -> &str {
        "new-map"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.config.resolve_new(pair)?.is_some())
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
        let Some(fun) = self.config.resolve_new(pair)? else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        let out = fun(source, ctx).map_err(|e| MapError::wrap_failure(pair, e))?;
        if out.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "new-map for {pair} produced '{}'",
                out.type_name()
            )));
        }
        Ok(out)
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

/// Runs registered merge-maps against an existing destination.
pub struct MergeMapMapper {
    id: MapperId,
    config: Arc<MapsConfig>,
}

impl MergeMapMapper {
    pub fn new(config: Arc<MapsConfig>) -> Self {
        Self {
            id: next_mapper_id(),
            config,
        }
    }
}

impl Mapper for MergeMapMapper {
    fn name(&self) -> &str {
        "merge-map"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    fn can_map_merge(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.config.resolve_merge(pair)?.is_some())
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
        let Some(fun) = self.config.resolve_merge(pair)? else {
            return Err(MapError::not_found(pair, MapKind::Merge));
        };
        if dest.key() != pair.to {
            return Err(MapError::TypeMismatch(format!(
                "merge destination for {pair} is '{}'",
                dest.type_name()
            )));
        }
        fun(source, dest, ctx).map_err(|e| MapError::wrap_failure(pair, e))
    }
}

// ========================================
// Identity
// ========================================

/// Clones a value onto itself: handles every identity pair whose type is
/// registered cloneable. Null stays null.
pub struct IdentityMapper {
    id: MapperId,
    registry: Arc<TypeRegistry>,
}

impl IdentityMapper {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            id: next_mapper_id(),
            registry,
        }
    }

    fn cloneable(&self, pair: TypePair) -> bool {
        pair.is_identity()
            && self
                .registry
                .get_key(pair.from)
                .is_some_and(|info| info.can_clone())
    }
}

impl Mapper for IdentityMapper {
    fn name(&self) -> &str {
        "identity"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.cloneable(pair))
    }

    fn can_map_merge(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.cloneable(pair))
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<DynValue> {
        if !self.cloneable(pair) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        let info = self.registry.require(pair.from)?;
        info.clone_value(source)
    }

    fn map_merge(
        &self,
        source: DynRef<'_>,
        dest: &mut DynValue,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<()> {
        if !self.cloneable(pair) {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        let info = self.registry.require(pair.from)?;
        *dest = info.clone_value(source)?;
        Ok(())
    }
}

// ========================================
// Empty source
// ========================================

/// Maps the unit type to anything creatable: new produces a fresh
/// destination, merge from unit leaves the destination untouched.
pub struct EmptyMapper {
    id: MapperId,
    factory: Arc<ObjectFactory>,
}

impl EmptyMapper {
    pub fn new(factory: Arc<ObjectFactory>) -> Self {
        Self {
            id: next_mapper_id(),
            factory,
        }
    }

    fn unit_source(pair: TypePair) -> bool {
        pair.from == crate::core::types::TypeKey::of::<()>()
    }
}

impl Mapper for EmptyMapper {
    fn name(&self) -> &str {
        "empty"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(Self::unit_source(pair) && self.factory.can_create(pair.to))
    }

    fn can_map_merge(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(Self::unit_source(pair))
    }

    fn map_new(
        &self,
        _source: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<DynValue> {
        if !Self::unit_source(pair) {
            return Err(MapError::not_found(pair, MapKind::New));
        }
        self.factory.create(pair.to)
    }

    fn map_merge(
        &self,
        _source: DynRef<'_>,
        _dest: &mut DynValue,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<()> {
        if !Self::unit_source(pair) {
            return Err(MapError::not_found(pair, MapKind::Merge));
        }
        Ok(())
    }
}

// ========================================
// Conversions
// ========================================

/// Applies table conversions. New only; converting over an existing
/// destination would silently discard it, so merge declines.
pub struct ConversionMapper {
    id: MapperId,
    conversions: Arc<ConversionTable>,
}

impl ConversionMapper {
    pub fn new(conversions: Arc<ConversionTable>) -> Self {
        Self {
            id: next_mapper_id(),
            conversions,
        }
    }
}

impl Mapper for ConversionMapper {
    fn name(&self) -> &str {
        "conversion"
    }

    fn id(&self) -> MapperId {
        self.id
    }

    fn can_map_new(&self, pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(self.conversions.can_convert(pair))
    }

    fn can_map_merge(&self, _pair: TypePair, _ctx: &MappingContext) -> Result<bool> {
        Ok(false)
    }

    fn map_new(
        &self,
        source: DynRef<'_>,
        pair: TypePair,
        _ctx: &MappingContext,
    ) -> Result<DynValue> {
        let Some(fun) = self.conversions.get(pair) else {
            return Err(MapError::not_found(pair, MapKind::New));
        };
        fun(source).map_err(|e| MapError::wrap_failure(pair, e))
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
