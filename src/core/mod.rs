pub mod error;
pub mod types;
pub mod value;

pub use error::{MapError, Result};
pub use types::{MapKind, TypeKey, TypePair};
pub use value::{DynRef, DynValue, EntityKey, KeyScalar};
