//! Typed, versioned access to one kind of definition.

use std::marker::PhantomData;

use kiln_core::{Environment, Function, HttpTrigger, Metadata};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{JsonTable, MetadataStore};
use crate::tables::*;

/// Namespace used when a definition does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A definition kind stored in its own table.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable kind, used in errors and logs.
    const KIND: &'static str;
    const TABLE: JsonTable;

    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Kind-specific checks run before every write.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Resource for Function {
    const KIND: &'static str = "function";
    const TABLE: JsonTable = FUNCTIONS;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), String> {
        if self.spec.environment_name.is_empty() {
            return Err("environmentName is required".into());
        }
        self.spec
            .deployment
            .content()
            .map_err(|e| format!("deployment package: {e}"))?;
        if self.spec.source != Default::default() {
            self.spec
                .source
                .content()
                .map_err(|e| format!("source package: {e}"))?;
        }
        Ok(())
    }
}

impl Resource for Environment {
    const KIND: &'static str = "environment";
    const TABLE: JsonTable = ENVIRONMENTS;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), String> {
        if self.spec.runtime.image.is_empty() {
            return Err("runtime.image is required".into());
        }
        if !self.spec.runtime.load_endpoint_path.starts_with('/') {
            return Err("runtime.loadEndpointPath must start with '/'".into());
        }
        Ok(())
    }
}

impl Resource for HttpTrigger {
    const KIND: &'static str = "httptrigger";
    const TABLE: JsonTable = HTTP_TRIGGERS;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), String> {
        if self.spec.relative_url.is_empty() {
            return Err("relativeUrl is required".into());
        }
        if self.spec.function_ref.ref_type != "name" {
            return Err(format!(
                "unsupported function reference type {:?}",
                self.spec.function_ref.ref_type
            ));
        }
        if self.spec.function_ref.name.is_empty() {
            return Err("functionRef.name is required".into());
        }
        Ok(())
    }
}

/// CRUD over one resource kind.
///
/// `create` assigns a fresh `uid` and starts `resourceVersion` at 1;
/// `update` keeps the `uid` and increments the version. Both run as a
/// single redb write transaction, so concurrent writers never hand out
/// the same version twice.
pub struct Repository<R> {
    store: MetadataStore,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _kind: PhantomData,
        }
    }
}

impl<R: Resource> Repository<R> {
    pub(crate) fn new(store: MetadataStore) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    /// Store a new definition. Fails if the name is taken.
    pub fn create(&self, mut obj: R) -> StoreResult<R> {
        let key = prepare::<R>(&mut obj)?;
        let created = self.store.upsert(R::TABLE, &key, |current: Option<R>| {
            if current.is_some() {
                return Err(StoreError::NameExists {
                    kind: R::KIND,
                    key: key.clone(),
                });
            }
            let meta = obj.metadata_mut();
            meta.uid = uuid::Uuid::new_v4().to_string();
            meta.resource_version = "1".to_string();
            Ok(obj)
        })?;
        info!(kind = R::KIND, %key, uid = %created.metadata().uid, "created");
        Ok(created)
    }

    /// Replace an existing definition, bumping its resource version.
    pub fn update(&self, mut obj: R) -> StoreResult<R> {
        let key = prepare::<R>(&mut obj)?;
        let updated = self.store.upsert(R::TABLE, &key, |current: Option<R>| {
            let current = current.ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                key: key.clone(),
            })?;
            let previous = current.metadata();
            let next_version = previous.resource_version.parse::<u64>().unwrap_or(0) + 1;
            let meta = obj.metadata_mut();
            meta.uid = previous.uid.clone();
            meta.resource_version = next_version.to_string();
            Ok(obj)
        })?;
        info!(
            kind = R::KIND,
            %key,
            version = %updated.metadata().resource_version,
            "updated"
        );
        Ok(updated)
    }

    pub fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<R>> {
        self.store.read(R::TABLE, &key_of(namespace, name))
    }

    /// Like [`get`](Self::get), but a missing definition is an error.
    pub fn require(&self, namespace: &str, name: &str) -> StoreResult<R> {
        self.get(namespace, name)?.ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            key: key_of(namespace, name),
        })
    }

    /// List definitions, optionally restricted to one namespace.
    pub fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<R>> {
        let prefix = namespace.map(|ns| format!("{ns}/")).unwrap_or_default();
        self.store.scan(R::TABLE, &prefix)
    }

    /// Delete a definition. Returns true if it existed.
    pub fn delete(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        let key = key_of(namespace, name);
        let existed = self.store.remove(R::TABLE, &key)?;
        debug!(kind = R::KIND, %key, existed, "deleted");
        Ok(existed)
    }
}

fn key_of(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("{namespace}/{name}")
}

/// Default the namespace, validate, and return the table key.
fn prepare<R: Resource>(obj: &mut R) -> StoreResult<String> {
    let invalid = |reason: String| StoreError::Invalid {
        kind: R::KIND,
        reason,
    };
    let meta = obj.metadata_mut();
    if meta.namespace.is_empty() {
        meta.namespace = DEFAULT_NAMESPACE.to_string();
    }
    check_name("metadata.name", &meta.name).map_err(invalid)?;
    check_name("metadata.namespace", &meta.namespace).map_err(invalid)?;
    let key = meta.table_key();
    obj.validate().map_err(invalid)?;
    Ok(key)
}

fn check_name(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} is required"));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(format!("{field} {value:?} is not a valid name"));
    }
    Ok(())
}
