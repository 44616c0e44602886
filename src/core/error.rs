use thiserror::Error;

use crate::core::types::{MapKind, TypePair};

/// Error taxonomy of the mapping engine.
///
/// `NotFound` is part of normal control flow: strategies raise it to mean
/// "this pair is not mine", and composite resolution consumes it to try the
/// next candidate. Everything else is a genuine failure.
#[derive(Error, Debug)]
pub enum MapError {
    /// No applicable conversion exists for the requested pair.
    #[error("no {kind} map from {pair}")]
    NotFound { pair: TypePair, kind: MapKind },

    /// A located conversion function ran and raised an unexpected error.
    #[error("mapping {pair} failed")]
    Failure {
        pair: TypePair,
        #[source]
        source: anyhow::Error,
    },

    /// An element failed while reconciling a collection; one layer is added
    /// per enclosing collection depth.
    #[error("mapping collection {pair} failed while processing an element")]
    CollectionFailure {
        pair: TypePair,
        #[source]
        source: Box<MapError>,
    },

    /// A match predicate raised an error.
    #[error("match predicate failed")]
    MatcherFailure {
        #[source]
        source: anyhow::Error,
    },

    /// A type could not be instantiated. Consumed internally to trigger
    /// strategy fallback, rarely surfaced to end callers.
    #[error("cannot construct an instance of '{type_name}'")]
    ObjectCreation { type_name: &'static str },

    /// A capability query could not be answered either way. Distinct from
    /// `false`: callers must surface this rather than skip a usable map.
    #[error("cannot verify whether {pair} is mappable")]
    CannotVerify { pair: TypePair },

    /// Cooperative cancellation. Always propagates unwrapped.
    #[error("mapping was cancelled")]
    Cancelled,

    /// A merge resolved an entity whose key does not match the destination
    /// key, under the reject-duplicates policy.
    #[error("duplicate entity of type '{type_name}' for key [{key}]")]
    DuplicateEntity { type_name: &'static str, key: String },

    /// A value crossed a typed boundary with the wrong runtime type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("lock error: {0}")]
    Lock(String),

    /// Construction-time error (conflicting registrations, unknown types).
    /// Never raised after a mapper is built.
    #[error("invalid mapper configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, MapError>;

impl<T> From<std::sync::PoisonError<T>> for MapError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl MapError {
    pub fn not_found(pair: TypePair, kind: MapKind) -> Self {
        Self::NotFound { pair, kind }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wraps an error raised by user map code into `Failure`, honoring the
    /// pass-through rules: `NotFound`, `Cancelled`, `Failure` and
    /// `CollectionFailure` travel unwrapped so cause chains never duplicate
    /// across nesting levels.
    pub fn wrap_failure(pair: TypePair, cause: anyhow::Error) -> Self {
        match cause.downcast::<MapError>() {
            Ok(inner) => match inner {
                e @ (Self::NotFound { .. }
                | Self::Cancelled
                | Self::Failure { .. }
                | Self::CollectionFailure { .. }) => e,
                other => Self::Failure {
                    pair,
                    source: other.into(),
                },
            },
            Err(cause) => Self::Failure { pair, source: cause },
        }
    }

    /// Wraps a per-element error into `CollectionFailure` for the enclosing
    /// collection pair. Cancellation passes through; an element-level
    /// `NotFound` becomes `NotFound` for the collection pair itself (the
    /// element map that resolution promised turned out not to apply).
    pub fn wrap_collection(pair: TypePair, kind: MapKind, element_error: MapError) -> Self {
        match element_error {
            Self::Cancelled => Self::Cancelled,
            Self::NotFound { .. } => Self::NotFound { pair, kind },
            other => Self::CollectionFailure {
                pair,
                source: Box::new(other),
            },
        }
    }

    /// Wraps a match predicate error, keeping the cause chain intact.
    pub fn wrap_matcher(cause: anyhow::Error) -> Self {
        match cause.downcast::<MapError>() {
            Ok(e @ (Self::Cancelled | Self::MatcherFailure { .. })) => e,
            Ok(other) => Self::MatcherFailure {
                source: other.into(),
            },
            Err(cause) => Self::MatcherFailure { source: cause },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> TypePair {
        TypePair::of::<i32, String>()
    }

    #[test]
    fn wrap_failure_keeps_not_found_unwrapped() {
        let inner = MapError::not_found(pair(), MapKind::New);
        let wrapped = MapError::wrap_failure(pair(), anyhow::Error::new(inner));
        assert!(wrapped.is_not_found());
    }

    #[test]
    fn wrap_failure_keeps_cancellation_unwrapped() {
        let wrapped = MapError::wrap_failure(pair(), anyhow::Error::new(MapError::Cancelled));
        assert!(wrapped.is_cancelled());
    }

    #[test]
    fn wrap_failure_wraps_foreign_errors_once() {
        let cause = anyhow::anyhow!("boom");
        let wrapped = MapError::wrap_failure(pair(), cause);
        let MapError::Failure { source, .. } = &wrapped else {
            panic!("expected Failure, got {wrapped:?}");
        };
        assert_eq!(source.to_string(), "boom");

        // Re-wrapping the same failure must not add another layer.
        let again = MapError::wrap_failure(pair(), anyhow::Error::new(wrapped));
        let MapError::Failure { source, .. } = &again else {
            panic!("expected Failure");
        };
        assert_eq!(source.to_string(), "boom");
    }

    #[test]
    fn wrap_collection_translates_element_not_found() {
        let element = MapError::not_found(TypePair::of::<i32, String>(), MapKind::New);
        let collection_pair = TypePair::of::<Vec<i32>, Vec<String>>();
        let wrapped = MapError::wrap_collection(collection_pair, MapKind::New, element);
        match wrapped {
            MapError::NotFound { pair: p, .. } => assert_eq!(p, collection_pair),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn wrap_collection_nests_one_layer_per_depth() {
        let leaf = MapError::Failure {
            pair: pair(),
            source: anyhow::anyhow!("element exploded"),
        };
        let inner_pair = TypePair::of::<Vec<i32>, Vec<String>>();
        let outer_pair = TypePair::of::<Vec<Vec<i32>>, Vec<Vec<String>>>();

        let one = MapError::wrap_collection(inner_pair, MapKind::New, leaf);
        let two = MapError::wrap_collection(outer_pair, MapKind::New, one);

        let MapError::CollectionFailure { source, .. } = &two else {
            panic!("expected CollectionFailure");
        };
        assert!(matches!(**source, MapError::CollectionFailure { .. }));
    }
}
