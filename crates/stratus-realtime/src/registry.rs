// Topic key -> callbacks, with a lock-free read snapshot for dispatch.
//
// Mutations take the live map's mutex and republish an immutable snapshot
// before releasing it. The read loop only ever loads the snapshot, so a
// subscriber added or removed mid-dispatch never changes the callback list
// being iterated.
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Wrap a closure as a registrable callback. Keep the returned handle to
/// remove this exact registration later.
pub fn callback<T, F>(f: F) -> Callback<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_callback<T>(a: &Callback<T>, b: &Callback<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Outcome of a removal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Removed {
    /// At least one callback was removed.
    pub changed: bool,
    /// Keys that lost their last callback and were deleted.
    pub emptied: Vec<String>,
}

type Snapshot<T> = HashMap<String, Arc<[Callback<T>]>>;

pub struct SubscriptionRegistry<T> {
    live: Mutex<HashMap<String, Vec<Callback<T>>>>,
    snapshot: ArcSwap<Snapshot<T>>,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Returns `true` when this is the first callback for `key`.
    pub fn add(&self, key: &str, callback: Callback<T>) -> bool {
        let mut live = self.live.lock();
        let entry = live.entry(key.to_string()).or_default();
        let first = entry.is_empty();
        entry.push(callback);
        self.rebuild_snapshot(&live);
        first
    }

    pub fn remove_all(&self, key: &str) -> Removed {
        self.remove_keys(|candidate| candidate == key)
    }

    pub fn remove_by_prefix(&self, prefix: &str) -> Removed {
        self.remove_keys(|candidate| candidate.starts_with(prefix))
    }

    /// Remove every key for `topic`: the bare topic and any `topic?...` variant.
    pub fn remove_topic(&self, topic: &str) -> Removed {
        let prefix = format!("{topic}?");
        self.remove_keys(|candidate| candidate == topic || candidate.starts_with(&prefix))
    }

    /// Remove one registration of `callback` under exactly `key`. Registering
    /// the same callback twice needs two removals.
    pub fn remove_callback(&self, key: &str, callback: &Callback<T>) -> Removed {
        let mut live = self.live.lock();
        let mut removed = Removed::default();
        if let Some(entry) = live.get_mut(key)
            && let Some(index) = entry.iter().position(|cb| same_callback(cb, callback))
        {
            entry.remove(index);
            removed.changed = true;
            if entry.is_empty() {
                live.remove(key);
                removed.emptied.push(key.to_string());
            }
        }
        if removed.changed {
            self.rebuild_snapshot(&live);
        }
        removed
    }

    /// Remove every registration of `callback` across all keys for `topic`.
    pub fn remove_listener(&self, topic: &str, callback: &Callback<T>) -> Removed {
        let prefix = format!("{topic}?");
        let mut live = self.live.lock();
        let mut removed = Removed::default();
        for (key, entry) in live.iter_mut() {
            if key != topic && !key.starts_with(&prefix) {
                continue;
            }
            let before = entry.len();
            entry.retain(|cb| !same_callback(cb, callback));
            if entry.len() != before {
                removed.changed = true;
                if entry.is_empty() {
                    removed.emptied.push(key.clone());
                }
            }
        }
        for key in &removed.emptied {
            live.remove(key);
        }
        if removed.changed {
            self.rebuild_snapshot(&live);
        }
        removed.emptied.sort();
        removed
    }

    pub fn clear(&self) -> Removed {
        self.remove_keys(|_| true)
    }

    /// Sorted snapshot of the keys with at least one callback.
    pub fn keys(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut keys: Vec<String> = snapshot.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshot.load().contains_key(key)
    }

    pub fn callbacks(&self, key: &str) -> Option<Arc<[Callback<T>]>> {
        self.snapshot.load().get(key).cloned()
    }

    /// Invoke every callback for `key` in registration order and return how
    /// many ran. A panicking callback is isolated: delivery continues with the
    /// next one and the panic is not propagated.
    pub fn deliver(&self, key: &str, payload: &T) -> usize {
        let Some(callbacks) = self.callbacks(key) else {
            return 0;
        };
        for cb in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| cb(payload))).is_err() {
                t_counter!("stratus_callback_failures_total").increment(1);
            }
        }
        callbacks.len()
    }

    fn remove_keys(&self, matches: impl Fn(&str) -> bool) -> Removed {
        let mut live = self.live.lock();
        let mut emptied: Vec<String> = live
            .keys()
            .filter(|key| matches(key.as_str()))
            .cloned()
            .collect();
        if emptied.is_empty() {
            return Removed::default();
        }
        for key in &emptied {
            live.remove(key);
        }
        self.rebuild_snapshot(&live);
        emptied.sort();
        Removed {
            changed: true,
            emptied,
        }
    }

    fn rebuild_snapshot(&self, live: &HashMap<String, Vec<Callback<T>>>) {
        let mut snapshot = HashMap::with_capacity(live.len());
        for (key, callbacks) in live.iter() {
            if callbacks.is_empty() {
                continue;
            }
            snapshot.insert(key.clone(), Arc::from(callbacks.as_slice()));
        }
        self.snapshot.store(Arc::new(snapshot));
    }
}
