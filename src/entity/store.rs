use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::core::error::{MapError, Result};
use crate::core::types::TypeKey;
use crate::core::value::{DynValue, EntityKey};
use crate::entity::{AsyncEntityStore, EntityDescriptors, EntityStore, ErasedDescriptor};
use crate::reflect::registry::TypeRegistry;

/// One tracked entity with its access metadata.
struct Tracked {
    value: DynValue,
    attached_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    hits: u64,
}

#[derive(Default)]
struct Bucket {
    local: Vec<Tracked>,
    remote: Vec<DynValue>,
}

/// Reference store: a change-tracker style local side plus a seedable
/// "backing store" side, both in memory. It pins down the tracking
/// semantics the key/entity strategies rely on and backs their tests;
/// a real persistence adapter implements the same traits.
pub struct InMemoryEntityStore {
    name: String,
    registry: Arc<TypeRegistry>,
    descriptors: Arc<EntityDescriptors>,
    buckets: Mutex<HashMap<TypeKey, Bucket>>,
}

impl InMemoryEntityStore {
    pub fn new(registry: Arc<TypeRegistry>, descriptors: Arc<EntityDescriptors>) -> Self {
        Self {
            name: "in-memory".to_string(),
            registry,
            descriptors,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn descriptor(&self, entity: TypeKey) -> Result<Arc<ErasedDescriptor>> {
        self.descriptors.resolve(entity)?.ok_or_else(|| {
            MapError::Configuration(format!(
                "no entity descriptor registered for '{}'",
                entity.name()
            ))
        })
    }

    fn clone_of(&self, value: &DynValue) -> Result<DynValue> {
        self.registry.require(value.key())?.clone_value(value.as_dyn())
    }

    fn key_of(&self, descriptor: &ErasedDescriptor, value: &DynValue) -> Result<EntityKey> {
        descriptor.extract(value.as_dyn())?.ok_or_else(|| {
            MapError::TypeMismatch(format!(
                "cannot track a null '{}'",
                descriptor.entity().name()
            ))
        })
    }

    /// Starts tracking an entity. A second entity with the same key is a
    /// policy violation.
    pub fn track(&self, entity: DynValue) -> Result<()> {
        let descriptor = self.descriptor(entity.key())?;
        let key = self.key_of(&descriptor, &entity)?;
        let mut buckets = self.buckets.lock()?;
        let bucket = buckets.entry(entity.key()).or_default();
        for tracked in &bucket.local {
            if descriptor.matches(tracked.value.as_dyn(), &key)? {
                return Err(MapError::DuplicateEntity {
                    type_name: entity.key().name(),
                    key: key.to_string(),
                });
            }
        }
        debug!(
            "{}: tracking '{}' [{}]",
            self.name,
            entity.key().short_name(),
            key
        );
        let now = Utc::now();
        bucket.local.push(Tracked {
            value: entity,
            attached_at: now,
            last_access: now,
            hits: 0,
        });
        Ok(())
    }

    /// Seeds the backing-store side. An existing entity under the same key
    /// is replaced.
    pub fn seed_remote(&self, entity: DynValue) -> Result<()> {
        let descriptor = self.descriptor(entity.key())?;
        let key = self.key_of(&descriptor, &entity)?;
        let mut buckets = self.buckets.lock()?;
        let bucket = buckets.entry(entity.key()).or_default();
        for existing in bucket.remote.iter_mut() {
            if descriptor.matches(existing.as_dyn(), &key)? {
                *existing = entity;
                return Ok(());
            }
        }
        bucket.remote.push(entity);
        Ok(())
    }

    /// How often the tracked entity under this key has been handed out.
    pub fn access_count(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<u64>> {
        let descriptor = self.descriptor(entity)?;
        let buckets = self.buckets.lock()?;
        let Some(bucket) = buckets.get(&entity) else {
            return Ok(None);
        };
        for tracked in &bucket.local {
            if descriptor.matches(tracked.value.as_dyn(), key)? {
                return Ok(Some(tracked.hits));
            }
        }
        Ok(None)
    }

    pub fn attached_at(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DateTime<Utc>>> {
        let descriptor = self.descriptor(entity)?;
        let buckets = self.buckets.lock()?;
        let Some(bucket) = buckets.get(&entity) else {
            return Ok(None);
        };
        for tracked in &bucket.local {
            if descriptor.matches(tracked.value.as_dyn(), key)? {
                return Ok(Some(tracked.attached_at));
            }
        }
        Ok(None)
    }
}

impl EntityStore for InMemoryEntityStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracked(&self, entity: TypeKey) -> Result<Vec<DynValue>> {
        let buckets = self.buckets.lock()?;
        let Some(bucket) = buckets.get(&entity) else {
            return Ok(Vec::new());
        };
        bucket
            .local
            .iter()
            .map(|t| self.clone_of(&t.value))
            .collect()
    }

    fn find_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>> {
        let descriptor = self.descriptor(entity)?;
        let mut buckets = self.buckets.lock()?;
        let Some(bucket) = buckets.get_mut(&entity) else {
            return Ok(None);
        };
        for tracked in bucket.local.iter_mut() {
            if descriptor.matches(tracked.value.as_dyn(), key)? {
                tracked.last_access = Utc::now();
                tracked.hits += 1;
                debug!(
                    "{}: local hit for '{}' [{}]",
                    self.name,
                    entity.short_name(),
                    key
                );
                return self.clone_of(&tracked.value).map(Some);
            }
        }
        Ok(None)
    }

    /// Queries the backing-store side. A hit starts being tracked, unless
    /// an entity with that key already is; the tracked one then wins, the
    /// way a change tracker resolves the same race.
    fn fetch_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>> {
        let descriptor = self.descriptor(entity)?;
        let mut buckets = self.buckets.lock()?;
        let bucket = buckets.entry(entity).or_default();
        for tracked in bucket.local.iter_mut() {
            if descriptor.matches(tracked.value.as_dyn(), key)? {
                tracked.last_access = Utc::now();
                tracked.hits += 1;
                return self.clone_of(&tracked.value).map(Some);
            }
        }
        let mut fetched = None;
        for e in &bucket.remote {
            if descriptor.matches(e.as_dyn(), key)? {
                fetched = Some(self.clone_of(e)?);
                break;
            }
        }
        let Some(fetched) = fetched else {
            debug!(
                "{}: no '{}' for [{}] in the backing store",
                self.name,
                entity.short_name(),
                key
            );
            return Ok(None);
        };
        let now = Utc::now();
        bucket.local.push(Tracked {
            value: self.clone_of(&fetched)?,
            attached_at: now,
            last_access: now,
            hits: 1,
        });
        debug!(
            "{}: fetched '{}' [{}], now tracked",
            self.name,
            entity.short_name(),
            key
        );
        Ok(Some(fetched))
    }

    fn attach_unchanged(&self, entity: TypeKey, key: &EntityKey) -> Result<DynValue> {
        let descriptor = self.descriptor(entity)?;
        let mut buckets = self.buckets.lock()?;
        let bucket = buckets.entry(entity).or_default();
        for tracked in &bucket.local {
            if descriptor.matches(tracked.value.as_dyn(), key)? {
                return Err(MapError::DuplicateEntity {
                    type_name: entity.name(),
                    key: key.to_string(),
                });
            }
        }
        let Some(made) = descriptor.fabricate(key) else {
            return Err(MapError::Configuration(format!(
                "entity '{}' has no stub constructor for attach",
                entity.name()
            )));
        };
        let stub = match made {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "{}: stub constructor for '{}' failed: {e:#}",
                    self.name,
                    entity.short_name()
                );
                return Err(MapError::ObjectCreation {
                    type_name: entity.name(),
                });
            }
        };
        if !descriptor.matches(stub.as_dyn(), key)? {
            return Err(MapError::Configuration(format!(
                "stub for '{}' does not carry the key it was built from",
                entity.name()
            )));
        }
        let out = self.clone_of(&stub)?;
        let now = Utc::now();
        bucket.local.push(Tracked {
            value: stub,
            attached_at: now,
            last_access: now,
            hits: 1,
        });
        debug!(
            "{}: attached stub '{}' [{}] as unchanged",
            self.name,
            entity.short_name(),
            key
        );
        Ok(out)
    }
}

#[async_trait]
impl AsyncEntityStore for InMemoryEntityStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tracked(&self, entity: TypeKey) -> Result<Vec<DynValue>> {
        EntityStore::tracked(self, entity)
    }

    async fn find_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>> {
        EntityStore::find_by_key(self, entity, key)
    }

    async fn fetch_by_key(&self, entity: TypeKey, key: &EntityKey) -> Result<Option<DynValue>> {
        EntityStore::fetch_by_key(self, entity, key)
    }

    async fn attach_unchanged(&self, entity: TypeKey, key: &EntityKey) -> Result<DynValue> {
        EntityStore::attach_unchanged(self, entity, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::KeyScalar;
    use crate::entity::EntityDescriptor;

    #[derive(Clone, PartialEq, Debug)]
    struct Customer {
        id: i64,
        name: String,
    }

    fn setup() -> InMemoryEntityStore {
        let registry = Arc::new(
            TypeRegistry::standard()
                .register::<Customer>(|t| t.cloneable().equatable())
                .build()
                .unwrap(),
        );
        let descriptors = Arc::new(
            EntityDescriptors::new().with(
                EntityDescriptor::<Customer>::new()
                    .key(|c| c.id)
                    .stub(|key| {
                        let id = match key.components() {
                            [KeyScalar::Int(id)] => *id,
                            other => anyhow::bail!("bad customer key: {other:?}"),
                        };
                        Ok(Customer {
                            id,
                            name: String::new(),
                        })
                    }),
            ),
        );
        InMemoryEntityStore::new(registry, descriptors)
    }

    #[test]
    fn tracked_entities_are_found_locally() {
        let store = setup();
        store
            .track(DynValue::new(Customer {
                id: 7,
                name: "Ada".into(),
            }))
            .unwrap();
        let key = EntityKey::single(7i64);
        let found = EntityStore::find_by_key(&store, TypeKey::of::<Customer>(), &key)
            .unwrap()
            .unwrap();
        assert_eq!(
            found.downcast::<Customer>().unwrap().map(|c| c.name),
            Some("Ada".into())
        );
        assert_eq!(
            store.access_count(TypeKey::of::<Customer>(), &key).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn double_tracking_one_key_is_rejected() {
        let store = setup();
        let customer = Customer {
            id: 1,
            name: "x".into(),
        };
        store.track(DynValue::new(customer.clone())).unwrap();
        let err = store.track(DynValue::new(customer)).unwrap_err();
        assert!(matches!(err, MapError::DuplicateEntity { .. }));
    }

    #[test]
    fn fetch_tracks_the_backing_store_hit() {
        let store = setup();
        store
            .seed_remote(DynValue::new(Customer {
                id: 3,
                name: "remote".into(),
            }))
            .unwrap();
        let key = EntityKey::single(3i64);
        assert!(EntityStore::find_by_key(&store, TypeKey::of::<Customer>(), &key)
            .unwrap()
            .is_none());
        let fetched = EntityStore::fetch_by_key(&store, TypeKey::of::<Customer>(), &key)
            .unwrap()
            .unwrap();
        assert!(fetched.downcast::<Customer>().unwrap().is_some());
        // Now local: a second lookup does not need the backing store.
        assert!(EntityStore::find_by_key(&store, TypeKey::of::<Customer>(), &key)
            .unwrap()
            .is_some());
    }

    #[test]
    fn attach_fabricates_a_tracked_stub() {
        let store = setup();
        let key = EntityKey::single(12i64);
        let stub = EntityStore::attach_unchanged(&store, TypeKey::of::<Customer>(), &key).unwrap();
        assert_eq!(
            stub.downcast::<Customer>().unwrap().map(|c| c.id),
            Some(12)
        );
        assert_eq!(
            EntityStore::tracked(&store, TypeKey::of::<Customer>())
                .unwrap()
                .len(),
            1
        );
        let err =
            EntityStore::attach_unchanged(&store, TypeKey::of::<Customer>(), &key).unwrap_err();
        assert!(matches!(err, MapError::DuplicateEntity { .. }));
    }
}
