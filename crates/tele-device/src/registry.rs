//! Multi-subscriber callback registry
//!
//! Generic notification fan-out with RAII subscription tokens. `notify`
//! invokes a snapshot of the registrations taken under the lock and runs
//! the callbacks outside it, so registrations added or dropped during a
//! fan-out never affect the in-flight notification.

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Fan-out registry of `Fn(&T)` subscribers
pub struct CallbackRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 1,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback; dropping the returned token detaches it
    pub fn register(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Registration
    where
        T: 'static,
    {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        Registration {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).callbacks.retain(|(cid, _)| *cid != id);
                }
            })),
        }
    }

    /// Invoke every currently-registered callback with `event`
    pub fn notify(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    /// Whether no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Subscription token returned by [`CallbackRegistry::register`]
///
/// Dropping the token removes the callback, including while a `notify`
/// fan-out is running on another thread and during unwinding.
pub struct Registration {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").finish()
    }
}

fn lock<T>(mutex: &Mutex<RegistryInner<T>>) -> std::sync::MutexGuard<'_, RegistryInner<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
