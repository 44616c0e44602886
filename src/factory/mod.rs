use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;
use crate::core::value::DynValue;
use crate::reflect::registry::TypeRegistry;

pub type CreatorFn = Arc<dyn Fn() -> Result<DynValue> + Send + Sync>;

/// Creates destination instances for strategies that need one: merge
/// fallbacks, empty-source mapping and collection reconciliation.
///
/// Resolution order is custom creator, registered default, then empty
/// collection. Anything else is an `ObjectCreation` error, which composite
/// chains consume as "try the next strategy".
pub struct ObjectFactory {
    registry: Arc<TypeRegistry>,
    creators: HashMap<TypeId, CreatorFn>,
}

impl ObjectFactory {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            creators: HashMap::new(),
        }
    }

    /// Installs a custom creator for `T`, shadowing its registered default.
    pub fn with_creator<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.creators.insert(
            TypeId::of::<T>(),
            Arc::new(move || Ok(DynValue::new(f()))),
        );
        self
    }

    /// Fallible creator variant for types whose construction can refuse.
    pub fn with_fallible_creator<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.creators
            .insert(TypeId::of::<T>(), Arc::new(move || Ok(DynValue::new(f()?))));
        self
    }

    pub fn can_create(&self, key: TypeKey) -> bool {
        if self.creators.contains_key(&key.id()) {
            return true;
        }
        match self.registry.get_key(key) {
            Some(info) => info.can_default() || info.collection().is_some(),
            None => false,
        }
    }

    pub fn create(&self, key: TypeKey) -> Result<DynValue> {
        if let Some(creator) = self.creators.get(&key.id()) {
            return creator();
        }
        if let Some(info) = self.registry.get_key(key) {
            if info.can_default() {
                return info.default_value();
            }
            if let Some(ops) = info.collection() {
                return ops.empty();
            }
        }
        Err(MapError::ObjectCreation {
            type_name: key.name(),
        })
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::standard()
                .collection::<Vec<i32>>(|t| t.cloneable())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn creates_defaults_for_registered_types() {
        let factory = ObjectFactory::new(registry());
        let v = factory.create(TypeKey::of::<String>()).unwrap();
        assert_eq!(v.downcast::<String>().unwrap(), Some(String::new()));
    }

    #[test]
    fn creates_empty_collections_without_default_registration() {
        let factory = ObjectFactory::new(registry());
        let v = factory.create(TypeKey::of::<Vec<i32>>()).unwrap();
        assert_eq!(v.downcast::<Vec<i32>>().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn custom_creator_shadows_default() {
        let factory = ObjectFactory::new(registry()).with_creator::<i32, _>(|| 41);
        let v = factory.create(TypeKey::of::<i32>()).unwrap();
        assert_eq!(v.downcast::<i32>().unwrap(), Some(41));
    }

    #[test]
    fn unknown_type_is_an_object_creation_error() {
        struct Opaque;
        let factory = ObjectFactory::new(registry());
        let err = factory.create(TypeKey::of::<Opaque>()).unwrap_err();
        assert!(matches!(err, MapError::ObjectCreation { .. }));
        assert!(!factory.can_create(TypeKey::of::<Opaque>()));
    }
}
