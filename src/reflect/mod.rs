pub mod collections;
pub mod info;
pub mod registry;
pub mod shape;

pub use collections::{CollectionKind, CollectionOps, DynCollection, ElemView};
pub use info::{Ability, KeyScalarLike, TypeInfo, TypeInfoBuilder, ability};
pub use registry::{RegistryBuilder, TypeRegistry};
pub use shape::{Bindings, TypeShape, ctor, unify};
