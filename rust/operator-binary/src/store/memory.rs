//! In-memory [`Store`] that mimics the API server semantics the reconcilers rely on:
//! optimistic concurrency, finalizers blocking deletion, and owner reference garbage collection.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{describe, identity, Error, Object, Result, Store};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    writes: BTreeMap<Key, usize>,
    rejected_creates: BTreeSet<Key>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn has_finalizers(obj: &Value) -> bool {
    obj["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|finalizers| !finalizers.is_empty())
}

fn is_deleting(obj: &Value) -> bool {
    !obj["metadata"]["deletionTimestamp"].is_null()
}

impl State {
    fn bump(&mut self, key: &Key, obj: &mut Value) {
        self.next_version += 1;
        obj["metadata"]["resourceVersion"] = json!(self.next_version.to_string());
        *self.writes.entry(key.clone()).or_default() += 1;
    }

    /// Deletes `key`, or marks it as deleting while finalizers are present.
    fn delete(&mut self, key: &Key) {
        let Some(mut obj) = self.objects.remove(key) else {
            return;
        };
        if has_finalizers(&obj) {
            if !is_deleting(&obj) {
                obj["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
                self.bump(key, &mut obj);
            }
            self.objects.insert(key.clone(), obj);
            return;
        }
        self.collect_garbage(&obj);
    }

    fn collect_garbage(&mut self, owner: &Value) {
        let Some(uid) = owner["metadata"]["uid"].as_str() else {
            return;
        };
        let dependents = self
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj["metadata"]["ownerReferences"]
                    .as_array()
                    .is_some_and(|refs| refs.iter().any(|r| r["uid"] == uid))
            })
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for dependent in dependents {
            self.delete(&dependent);
        }
    }
}

impl MemoryStore {
    /// Inserts `obj` as-is, assigning a uid and resource version.
    pub fn insert<K: Object>(&self, obj: &K) -> K {
        let (namespace, name) = identity(obj).unwrap();
        let key = key::<K>(&namespace, &name);
        let mut value = serde_json::to_value(obj).unwrap();
        let mut state = self.state.lock().unwrap();
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{namespace}-{name}"));
        }
        state.bump(&key, &mut value);
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn get_now<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// How often the object has been written since the store was created.
    pub fn writes<K: Object>(&self, namespace: &str, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .writes
            .get(&key::<K>(namespace, name))
            .copied()
            .unwrap_or_default()
    }

    /// Requests deletion the way `kubectl delete` would.
    pub fn request_deletion<K: Object>(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .delete(&key::<K>(namespace, name));
    }

    /// Makes every create of the object fail, as if another writer had just created it.
    pub fn reject_creates<K: Object>(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_creates
            .insert(key::<K>(namespace, name));
    }

    /// Removes an object without involving finalizers or owners, as if deleted by a user with
    /// `--cascade=orphan` after its finalizers were stripped.
    pub fn remove<K: Object>(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&key::<K>(namespace, name));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.get_now(namespace, name))
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key::<K>(&namespace, &name);
        let exists = {
            let state = self.state.lock().unwrap();
            state.objects.contains_key(&key) || state.rejected_creates.contains(&key)
        };
        if exists {
            return Err(Error::Conflict {
                object: describe::<K>(&namespace, &name),
            });
        }
        Ok(self.insert(obj))
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key::<K>(&namespace, &name);
        let object = describe::<K>(&namespace, &name);
        let mut state = self.state.lock().unwrap();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                object: object.clone(),
            })?;
        let mut value = serde_json::to_value(obj).unwrap();
        if value["metadata"]["resourceVersion"] != current["metadata"]["resourceVersion"] {
            return Err(Error::Conflict { object });
        }
        value["metadata"]["uid"] = current["metadata"]["uid"].clone();
        value["metadata"]["deletionTimestamp"] = current["metadata"]["deletionTimestamp"].clone();
        state.bump(&key, &mut value);
        if is_deleting(&value) && !has_finalizers(&value) {
            state.objects.remove(&key);
            state.collect_garbage(&value);
        } else {
            state.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        self.request_deletion::<K>(namespace, name);
        Ok(())
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key::<K>(&namespace, &name);
        let patch = serde_json::to_value(obj).unwrap();
        let mut state = self.state.lock().unwrap();
        let Some(mut value) = state.objects.get(&key).cloned() else {
            drop(state);
            return Ok(self.insert(obj));
        };
        merge(&mut value, &patch);
        state.bump(&key, &mut value);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn annotate<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<K> {
        let store_key = self::key::<K>(namespace, name);
        let mut state = self.state.lock().unwrap();
        let mut obj = state
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                object: describe::<K>(namespace, name),
            })?;
        merge(
            &mut obj,
            &json!({ "metadata": { "annotations": { key: value } } }),
        );
        state.bump(&store_key, &mut obj);
        state.objects.insert(store_key, obj.clone());
        Ok(serde_json::from_value(obj).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::{
        k8s_openapi::{
            api::core::v1::{ConfigMap, Secret},
            apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
        },
        kube::Resource,
    };

    use super::MemoryStore;
    use crate::store::Store;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::default();
        let created = store.create(&config_map("a")).await.unwrap();
        let mut first = created.clone();
        first.data = Some([("k".to_string(), "1".to_string())].into());
        store.update(&first).await.unwrap();
        let mut second = created;
        second.data = Some([("k".to_string(), "2".to_string())].into());
        assert!(store.update(&second).await.unwrap_err().is_conflict());
        assert!(store.create(&config_map("a")).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn finalizers_block_deletion_and_owners_cascade() {
        let store = MemoryStore::default();
        let mut owner = config_map("owner");
        owner.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
        let owner = store.create(&owner).await.unwrap();
        let uid = owner.meta().uid.clone().unwrap();
        let mut dependent = Secret {
            metadata: ObjectMeta {
                name: Some("dependent".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "ConfigMap".to_string(),
                    name: "owner".to_string(),
                    uid,
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        dependent = store.create(&dependent).await.unwrap();

        store.delete::<ConfigMap>("default", "owner").await.unwrap();
        let mut owner = store.get_now::<ConfigMap>("default", "owner").unwrap();
        assert!(owner.metadata.deletion_timestamp.is_some());
        assert!(store.get_now::<Secret>("default", "dependent").is_some());

        owner.metadata.finalizers = None;
        store.update(&owner).await.unwrap();
        assert!(store.get_now::<ConfigMap>("default", "owner").is_none());
        assert!(store.get_now::<Secret>("default", "dependent").is_none());
        assert!(dependent.metadata.resource_version.is_some());
    }

    #[tokio::test]
    async fn apply_merges_and_annotate_keeps_data() {
        let store = MemoryStore::default();
        let mut cm = config_map("a");
        cm.data = Some([("a".to_string(), "1".to_string())].into());
        store.apply(&cm).await.unwrap();
        cm.data = Some([("b".to_string(), "2".to_string())].into());
        store.apply(&cm).await.unwrap();
        let cm: ConfigMap = store
            .annotate("default", "a", "example.com/dirty", "true")
            .await
            .unwrap();
        let data = cm.data.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(
            cm.metadata.annotations.unwrap()["example.com/dirty"],
            "true"
        );
        assert!(store
            .annotate::<ConfigMap>("default", "missing", "k", "v")
            .await
            .is_err());
    }
}
