use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use serde_json::Value;

use crate::error::StoreError;
use crate::watch::WatchHandle;

/// A small key/value store backed by a dedicated ConfigMap, shared by every
/// plugin on the controller. Values round-trip through JSON so plugins can
/// save structured data, not just strings; the ConfigMap itself still only
/// holds strings, same as any other ConfigMap.
///
/// The store watches its own backing ConfigMap so that writes from another
/// replica of the same controller (or `kubectl edit`) show up here too,
/// without a restart.
///
/// `init` is all-or-nothing: it either returns a fully usable `Store` or an
/// error, never a `Store` that still needs to finish loading. There is no
/// partially-initialized state to track, so unlike the config and plugin
/// lifecycles this type has no `is_initialized` flag of its own; callers
/// that need to retry a failed `init` just call it again.
pub struct Store {
    client: Client,
    namespace: String,
    name: String,
    cache: Arc<RwLock<HashMap<String, Value>>>,
    watch: tokio::sync::Mutex<WatchHandle<ConfigMap>>,
}

impl Store {
    pub async fn init(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Arc<Self>, StoreError> {
        let namespace = namespace.into();
        let name = name.into();
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
        let cache: Arc<RwLock<HashMap<String, Value>>> = Arc::new(RwLock::new(HashMap::new()));

        match api.get_opt(&name).await? {
            Some(cm) => replace_from(&cache, &cm),
            None => {
                let empty = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                api.create(&PostParams::default(), &empty).await?;
            }
        }

        let watch_cache = cache.clone();
        let watch = WatchHandle::new(
            api.clone(),
            watcher::Config::default().fields(&format!("metadata.name={name}")),
            move |event| apply_event(&watch_cache, event),
        );

        Ok(Arc::new(Self {
            client,
            namespace,
            name,
            cache,
            watch: tokio::sync::Mutex::new(watch),
        }))
    }

    /// Reads `key`, or `None` if unset.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache
            .read()
            .expect("store cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Writes `key` both to the in-memory cache and to the backing
    /// ConfigMap via a merge patch.
    pub async fn set(&self, key: String, value: Value) -> Result<(), StoreError> {
        let serialized =
            serde_json::to_string(&value).map_err(|source| StoreError::Encode {
                key: key.clone(),
                source,
            })?;

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut data = serde_json::Map::new();
        data.insert(key, Value::String(serialized));
        let patch = serde_json::json!({ "data": data });
        api.patch(&self.name, &PatchParams::apply("kite"), &Patch::Merge(&patch))
            .await?;

        // The cache is reconciled by the store's own watch on its next
        // advance, not updated here; callers must tolerate read-after-write
        // lag bounded by watch latency.
        Ok(())
    }

    /// Advances the store's own watch on its backing ConfigMap for up to
    /// `budget`. Called once per controller tick alongside plugin watches.
    pub async fn advance(&self, budget: Duration) -> Result<(), watcher::Error> {
        use crate::watch::DynWatch;
        self.watch.lock().await.advance(budget).await
    }
}

fn replace_from(cache: &Arc<RwLock<HashMap<String, Value>>>, cm: &ConfigMap) {
    let mut guard = cache.write().expect("store cache lock poisoned");
    guard.clear();
    if let Some(data) = &cm.data {
        for (key, raw) in data {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            guard.insert(key.clone(), value);
        }
    }
}

fn apply_event(cache: &Arc<RwLock<HashMap<String, Value>>>, event: Event<ConfigMap>) {
    match event {
        Event::Applied(cm) => replace_from(cache, &cm),
        Event::Deleted(_) => cache.write().expect("store cache lock poisoned").clear(),
        Event::Restarted(list) => match list.last() {
            Some(cm) => replace_from(cache, cm),
            None => cache.write().expect("store cache lock poisoned").clear(),
        },
    }
}
