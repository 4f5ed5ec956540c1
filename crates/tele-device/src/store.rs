//! Observable hierarchical store
//!
//! A path-addressed JSON container backing a device's configuration and
//! live state. Mutations commit under the lock and notify subscribers
//! afterwards, so concurrent readers never observe a torn state and
//! observers always see the committed value.

use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::debug;

use crate::registry::{CallbackRegistry, Registration};

/// Change notification delivered to store observers
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Path of the mutated subtree (empty for the root)
    pub path: Vec<String>,
    /// Committed value at that path (`Null` after a removal)
    pub value: Value,
}

/// Path-addressed JSON store with change notification
pub struct ObservableStore {
    root: Mutex<Value>,
    observers: CallbackRegistry<StoreEvent>,
}

impl ObservableStore {
    /// Create a store holding `initial` as its root value
    pub fn new(initial: Value) -> Self {
        Self {
            root: Mutex::new(initial),
            observers: CallbackRegistry::new(),
        }
    }

    /// Clone of the whole root value
    pub fn snapshot(&self) -> Value {
        self.lock_root().clone()
    }

    /// Clone of the subtree at `path`; `None` when the path is absent
    pub fn get(&self, path: &[&str]) -> Option<Value> {
        let root = self.lock_root();
        let mut node = &*root;
        for key in path {
            node = node.as_object()?.get(*key)?;
        }
        Some(node.clone())
    }

    /// Replace the subtree at `path`, creating intermediate objects
    ///
    /// An empty path replaces the root. Observers are notified after the
    /// mutation is committed.
    pub fn set(&self, path: &[&str], value: Value) {
        {
            let mut root = self.lock_root();
            *node_at_mut(&mut root, path) = value.clone();
        }
        self.notify(path, value);
    }

    /// Delete the subtree at `path`
    ///
    /// Returns whether anything was removed; observers are notified with
    /// `Null` on removal.
    pub fn remove(&self, path: &[&str]) -> bool {
        let Some((leaf, parent_path)) = path.split_last() else {
            // Removing the root resets it to an empty object
            self.set(&[], Value::Object(Map::new()));
            return true;
        };

        let removed = {
            let mut root = self.lock_root();
            node_at_mut_existing(&mut root, parent_path)
                .and_then(|node| node.as_object_mut())
                .and_then(|map| map.remove(*leaf))
                .is_some()
        };

        if removed {
            self.notify(path, Value::Null);
        } else {
            debug!("remove on missing path {}", path.join("/"));
        }
        removed
    }

    /// Atomic read-modify-write of the subtree at `path`
    ///
    /// `f` receives the current value (or `None` when absent) and returns
    /// the replacement; the whole exchange happens under the store lock.
    pub fn update(&self, path: &[&str], f: impl FnOnce(Option<&Value>) -> Value) {
        let value = {
            let mut root = self.lock_root();
            let node = node_at_mut(&mut root, path);
            let value = f(if node.is_null() { None } else { Some(node) });
            *node = value.clone();
            value
        };
        self.notify(path, value);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Registration {
        self.observers.register(callback)
    }

    fn notify(&self, path: &[&str], value: Value) {
        self.observers.notify(&StoreEvent {
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        });
    }

    fn lock_root(&self) -> std::sync::MutexGuard<'_, Value> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Navigate to `path`, replacing non-object intermediates with objects
fn node_at_mut<'a>(root: &'a mut Value, path: &[&str]) -> &'a mut Value {
    let mut node = root;
    for key in path {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            unreachable!()
        };
        node = map.entry(key.to_string()).or_insert(Value::Null);
    }
    node
}

/// Navigate to `path` without creating anything; `None` when absent
fn node_at_mut_existing<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    let mut node = root;
    for key in path {
        node = node.as_object_mut()?.get_mut(*key)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use serde_json::json;

    use super::*;

    #[test]
    fn test_set_then_get_is_deep_equal() {
        let store = ObservableStore::new(json!({}));
        let value = json!({"nested": {"list": [1, 2, 3]}, "flag": true});

        store.set(&["a", "b"], value.clone());
        assert_eq!(store.get(&["a", "b"]), Some(value));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let store = ObservableStore::new(json!({}));
        store.set(&["x", "y", "z"], json!(42));
        assert_eq!(store.snapshot(), json!({"x": {"y": {"z": 42}}}));
    }

    #[test]
    fn test_empty_path_addresses_root() {
        let store = ObservableStore::new(json!({"old": 1}));
        assert_eq!(store.get(&[]), Some(json!({"old": 1})));

        store.set(&[], json!({"new": 2}));
        assert_eq!(store.snapshot(), json!({"new": 2}));
    }

    #[test]
    fn test_remove_makes_get_not_found() {
        let store = ObservableStore::new(json!({"a": {"b": 1, "c": 2}}));

        assert!(store.remove(&["a", "b"]));
        assert_eq!(store.get(&["a", "b"]), None);
        assert_eq!(store.get(&["a", "c"]), Some(json!(2)));
    }

    #[test]
    fn test_remove_missing_path_is_false() {
        let store = ObservableStore::new(json!({"a": 1}));
        assert!(!store.remove(&["a", "b", "c"]));
        assert!(!store.remove(&["missing"]));
        assert_eq!(store.snapshot(), json!({"a": 1}));
    }

    #[test]
    fn test_observer_sees_committed_value() {
        let store = Arc::new(ObservableStore::new(json!({})));
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let store_cb = store.clone();
        let seen_cb = seen.clone();
        let _reg = store.subscribe(move |event| {
            // The mutation is committed before observers run
            let committed = store_cb.get(&["k"]);
            seen_cb
                .lock()
                .unwrap()
                .push((event.path.clone(), event.value.clone(), committed));
        });

        store.set(&["k"], json!("v"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                vec!["k".to_string()],
                json!("v"),
                Some(json!("v"))
            )]
        );
    }

    #[test]
    fn test_remove_notifies_with_null() {
        let store = ObservableStore::new(json!({"k": 1}));
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let seen_cb = seen.clone();
        let _reg = store.subscribe(move |event| {
            seen_cb.lock().unwrap().push(event.value.clone());
        });

        store.remove(&["k"]);
        assert_eq!(seen.lock().unwrap().as_slice(), &[Value::Null]);
    }

    #[test]
    fn test_update_reads_current_value() {
        let store = ObservableStore::new(json!({"count": 2}));

        store.update(&["count"], |current| {
            let current = current.and_then(Value::as_i64).unwrap_or(0);
            json!(current + 1)
        });
        assert_eq!(store.get(&["count"]), Some(json!(3)));

        store.update(&["absent"], |current| {
            assert!(current.is_none());
            json!(1)
        });
        assert_eq!(store.get(&["absent"]), Some(json!(1)));
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let store = ObservableStore::new(json!({}));
        let seen = Arc::new(StdMutex::new(0usize));

        let seen_cb = seen.clone();
        let reg = store.subscribe(move |_| {
            *seen_cb.lock().unwrap() += 1;
        });

        store.set(&["a"], json!(1));
        drop(reg);
        store.set(&["a"], json!(2));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
