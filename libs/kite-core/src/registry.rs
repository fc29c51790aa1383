use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared mapping from string key to opaque value, used to pass objects
/// between plugins (a shared HTTP client, a cache handle, ...) without the
/// controller knowing their concrete types.
///
/// The controller may read and write through [`Registry`] directly;
/// plugins only ever see a [`RegistryView`], which can read but not write.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(key)
    }

    pub fn view(&self) -> RegistryView {
        RegistryView {
            inner: self.clone(),
        }
    }
}

/// Read-only handle to a [`Registry`], handed to plugins.
#[derive(Clone)]
pub struct RegistryView {
    inner: Registry,
}

impl RegistryView {
    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.get(key)
    }

    pub fn get_as<T: 'static + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|v| v.downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_can_read_what_controller_wrote() {
        let registry = Registry::new();
        registry.set("greeting", Arc::new(String::from("hello")));
        let view = registry.view();
        let value = view.get_as::<String>("greeting").unwrap();
        assert_eq!(*value, "hello");
    }

    #[test]
    fn missing_key_is_none() {
        let registry = Registry::new();
        assert!(registry.view().get("absent").is_none());
    }
}
