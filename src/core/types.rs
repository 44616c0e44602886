use std::any::{Any, TypeId, type_name};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime identity of a mappable type: its `TypeId` plus the compiler's
/// type name for diagnostics. Equality and hashing follow the `TypeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn from_parts(id: TypeId, name: &'static str) -> Self {
        Self { id, name }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, for compact log lines.
    /// `alloc::vec::Vec<i32>` stays intact past the generic bracket.
    pub fn short_name(&self) -> &'static str {
        let head = self.name.split('<').next().unwrap_or(self.name);
        match head.rfind("::") {
            Some(idx) => &self.name[idx + 2..],
            None => self.name,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// An ordered (source, destination) pair of types. The unit every map
/// registration, resolution and error message is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypePair {
    pub from: TypeKey,
    pub to: TypeKey,
}

impl TypePair {
    pub fn of<A: Any, B: Any>() -> Self {
        Self {
            from: TypeKey::of::<A>(),
            to: TypeKey::of::<B>(),
        }
    }

    pub fn new(from: TypeKey, to: TypeKey) -> Self {
        Self { from, to }
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for TypePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' to '{}'", self.from, self.to)
    }
}

/// The three families of conversions the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    /// Produce a fresh destination from a source.
    New,
    /// Fold a source into an existing destination.
    Merge,
    /// Decide whether a source and a destination correspond.
    Match,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MapKind::New => "new",
            MapKind::Merge => "merge",
            MapKind::Match => "match",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_key_identity_follows_type_id() {
        assert_eq!(TypeKey::of::<Vec<i32>>(), TypeKey::of::<Vec<i32>>());
        assert_ne!(TypeKey::of::<Vec<i32>>(), TypeKey::of::<Vec<i64>>());
    }

    #[test]
    fn short_name_strips_module_path() {
        assert_eq!(TypeKey::of::<String>().short_name(), "String");
        assert_eq!(TypeKey::of::<i32>().short_name(), "i32");
        // Generic arguments survive, only the leading path is trimmed.
        assert!(TypeKey::of::<Vec<i32>>().short_name().starts_with("Vec<"));
    }

    #[test]
    fn pair_display_reads_from_to() {
        let text = TypePair::of::<i32, String>().to_string();
        assert_eq!(text, "'i32' to 'String'");
    }
}
