// ============================================================================
// Dynamap Library
// ============================================================================

pub mod config;
pub mod core;
pub mod entity;
pub mod facade;
pub mod factory;
pub mod mapper;
pub mod matcher;
pub mod prelude;
pub mod reflect;

// Re-export main types for convenience
pub use crate::core::{
    DynRef, DynValue, EntityKey, KeyScalar, MapError, MapKind, Result, TypeKey, TypePair,
};
pub use crate::facade::{
    MapperBuilder, MapperStats, MergeMapFactory, NewMapFactory, ObjectMapper, StrategyHits,
};

// Re-export the engine surface for callers wiring strategies by hand
pub use crate::config::{CacheSnapshot, MapDescriptor, MapProvider, MapSet, MapsBuilder, MapsConfig};
pub use crate::entity::{
    AsyncEntityStore, EntitiesRetrievalMode, EntityDescriptor, EntityDescriptors, EntityStore,
    InMemoryEntityStore,
};
pub use crate::factory::ObjectFactory;
pub use crate::mapper::{
    AsyncMapper, Mapper, MappingContext, MappingOptions, MergePolicy, Parallelism, ServiceBag,
};
pub use crate::matcher::Matcher;
pub use crate::reflect::{RegistryBuilder, TypeRegistry};
