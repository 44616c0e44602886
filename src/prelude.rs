//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` is the stable default for callers that just map values.
//! `advanced` is an explicit escape hatch for engine internals.

pub mod dx {
    //! Stable high-level surface for mapping-first application code.
    //!
    //! Intended usage in app code:
    //! - `MapperBuilder` bootstrap with typed map registrations,
    //! - `ObjectMapper` for mapping, merging and capability questions,
    //! - per-call tuning through `MappingOptions`.
    pub use crate::entity::RetrievalModeOverride;
    pub use crate::{
        DynRef, DynValue, EntitiesRetrievalMode, EntityDescriptor, EntityKey, MapError, MapKind,
        MapperBuilder, MapperStats, MappingOptions, MergeMapFactory, MergePolicy, NewMapFactory,
        ObjectMapper, Parallelism, Result, TypeKey, TypePair,
    };
}

pub mod advanced {
    //! Escape hatch for the engine internals behind the facade.
    //!
    //! App-level product code should normally stay on `prelude::dx`.
    pub use crate::config;
    pub use crate::config::{MapProvider, MapSet, MapsBuilder, MapsConfig};
    pub use crate::entity::{
        AsyncEntityStore, AsyncStoreOverride, EntityDescriptors, EntityStore, InMemoryEntityStore,
        StoreOverride,
    };
    pub use crate::factory::ObjectFactory;
    pub use crate::mapper;
    pub use crate::mapper::{
        AsyncMapper, AsyncMapperOverride, CompositeMapper, Mapper, MapperOverride, MappingContext,
        MatcherOverride, ServiceBag,
    };
    pub use crate::matcher::{EqualityMatcher, FnMatcher, MapsMatcher, Matcher, SafeMatcher};
    pub use crate::reflect::{RegistryBuilder, TypeRegistry};
}
