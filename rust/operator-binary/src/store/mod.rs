//! Access to the desired-state store (the Kubernetes API server).
//!
//! Reconcilers only talk to the store through [`Store`], so that they can be exercised against
//! [`memory::MemoryStore`] in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::NamespaceResourceScope,
    kube::{
        api::{DeleteParams, Patch, PatchParams, PostParams},
        Api, Resource,
    },
};

#[cfg(test)]
pub mod memory;

/// Anything that the operator reads or writes.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}
impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: String },

    #[snafu(display("{object} does not exist"))]
    NotFound { object: String },

    #[snafu(display("object has no {field}"))]
    IncompleteMetadata { field: &'static str },

    #[snafu(display("failed to {verb} {object}"))]
    Kube {
        source: stackable_operator::kube::Error,
        verb: &'static str,
        object: String,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the write lost an optimistic concurrency race and should be retried from a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// Human-readable identity of an object, used in errors and logs.
pub fn describe<K: Object>(namespace: &str, name: &str) -> String {
    format!("{} {namespace}/{name}", K::kind(&()))
}

/// Extracts the `(namespace, name)` of an object that is about to be written.
pub fn identity<K: Object>(obj: &K) -> Result<(String, String)> {
    let meta = obj.meta();
    Ok((
        meta.namespace
            .clone()
            .context(IncompleteMetadataSnafu { field: "namespace" })?,
        meta.name
            .clone()
            .context(IncompleteMetadataSnafu { field: "name" })?,
    ))
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Fails with [`Error::Conflict`] if the object already exists.
    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces the object, failing with [`Error::Conflict`] unless `obj`'s resource version is
    /// still the current one.
    async fn update<K: Object>(&self, obj: &K) -> Result<K>;

    /// Requests deletion. Deleting an object that does not exist succeeds.
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Creates the object, or takes ownership of all fields set in `obj` if it already exists.
    async fn apply<K: Object>(&self, obj: &K) -> Result<K>;

    /// Sets a single annotation without touching anything else.
    async fn annotate<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<K>;
}

/// [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: stackable_operator::kube::Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: &stackable_operator::client::Client, field_manager: &str) -> Self {
        Self {
            client: client.as_kube_client(),
            field_manager: field_manager.to_string(),
        }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kube_error(
    err: stackable_operator::kube::Error,
    verb: &'static str,
    object: String,
) -> Error {
    match &err {
        stackable_operator::kube::Error::Api(response) if response.code == 409 => {
            Error::Conflict { object }
        }
        stackable_operator::kube::Error::Api(response) if response.code == 404 => {
            Error::NotFound { object }
        }
        _ => Error::Kube {
            source: err,
            verb,
            object,
        },
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|err| kube_error(err, "get", describe::<K>(namespace, name)))
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|err| kube_error(err, "create", describe::<K>(&namespace, &name)))
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|err| kube_error(err, "update", describe::<K>(&namespace, &name)))
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(stackable_operator::kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(kube_error(err, "delete", describe::<K>(namespace, name))),
        }
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        self.api::<K>(&namespace)
            .patch(
                &name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(obj),
            )
            .await
            .map_err(|err| kube_error(err, "apply", describe::<K>(&namespace, &name)))
    }

    async fn annotate<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<K> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        self.api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| kube_error(err, "annotate", describe::<K>(namespace, name)))
    }
}

