use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StrandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    Add,
    Update,
    Remove,
}

pub type ObserverId = u64;

type Observer<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe string-keyed map that notifies observers after each change.
///
/// Observers run after the map lock is released, in registration order.
pub struct ObservableMap<V> {
    kind: &'static str,
    items: RwLock<HashMap<String, V>>,
    observers: RwLock<Vec<(ObserverId, RegistryEvent, Observer<V>)>>,
    next_observer: AtomicU64,
}

impl<V: Clone> ObservableMap<V> {
    /// `kind` names the item type in errors ("listener", "sync unit")
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn on<F>(&self, event: RegistryEvent, callback: F) -> ObserverId
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        write(&self.observers).push((id, event, Arc::new(callback)));
        id
    }

    pub fn off(&self, id: ObserverId) -> bool {
        let mut observers = write(&self.observers);
        let before = observers.len();
        observers.retain(|(observer_id, _, _)| *observer_id != id);
        observers.len() != before
    }

    fn notify(&self, event: RegistryEvent, key: &str, value: &V) {
        let observers: Vec<Observer<V>> = read(&self.observers)
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(key, value);
        }
    }

    /// Insert a new entry, failing if the key exists
    pub fn insert_new(&self, key: &str, value: V) -> Result<(), StrandError> {
        {
            let mut items = write(&self.items);
            if items.contains_key(key) {
                return Err(StrandError::DuplicatedId(format!(
                    "{} '{}' already exists",
                    self.kind, key
                )));
            }
            items.insert(key.to_string(), value.clone());
        }
        self.notify(RegistryEvent::Add, key, &value);
        Ok(())
    }

    /// Insert or replace an entry
    pub fn upsert(&self, key: &str, value: V) {
        let existed = write(&self.items)
            .insert(key.to_string(), value.clone())
            .is_some();
        let event = if existed {
            RegistryEvent::Update
        } else {
            RegistryEvent::Add
        };
        self.notify(event, key, &value);
    }

    /// Merge into an existing entry, or insert `value` when absent
    pub fn upsert_with<F>(&self, key: &str, value: V, merge: F) -> V
    where
        F: FnOnce(&mut V, V),
    {
        let (event, snapshot) = {
            let mut items = write(&self.items);
            match items.get_mut(key) {
                Some(existing) => {
                    merge(existing, value);
                    (RegistryEvent::Update, existing.clone())
                }
                None => {
                    items.insert(key.to_string(), value.clone());
                    (RegistryEvent::Add, value)
                }
            }
        };
        self.notify(event, key, &snapshot);
        snapshot
    }

    /// Mutate an existing entry in place
    pub fn update<R, F>(&self, key: &str, f: F) -> Result<R, StrandError>
    where
        F: FnOnce(&mut V) -> R,
    {
        let (result, snapshot) = {
            let mut items = write(&self.items);
            let value = items.get_mut(key).ok_or_else(|| {
                StrandError::NotFound(format!("{} '{}' not found", self.kind, key))
            })?;
            let result = f(value);
            (result, value.clone())
        };
        self.notify(RegistryEvent::Update, key, &snapshot);
        Ok(result)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = write(&self.items).remove(key);
        if let Some(value) = &removed {
            self.notify(RegistryEvent::Remove, key, value);
        }
        removed
    }

    /// Remove every entry matching `predicate`
    pub fn remove_where<P>(&self, predicate: P) -> Vec<V>
    where
        P: Fn(&V) -> bool,
    {
        let removed: Vec<(String, V)> = {
            let mut items = write(&self.items);
            let keys: Vec<String> = items
                .iter()
                .filter(|(_, v)| predicate(v))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| items.remove(&k).map(|v| (k, v)))
                .collect()
        };
        for (key, value) in &removed {
            self.notify(RegistryEvent::Remove, key, value);
        }
        removed.into_iter().map(|(_, v)| v).collect()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        read(&self.items).get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        read(&self.items).contains_key(key)
    }

    pub fn len(&self) -> usize {
        read(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.items).is_empty()
    }

    /// Entries matching `predicate`, sorted by key
    pub fn filter<P>(&self, predicate: P) -> Vec<V>
    where
        P: Fn(&V) -> bool,
    {
        let items = read(&self.items);
        let mut matched: Vec<(&String, &V)> = items.iter().filter(|(_, v)| predicate(v)).collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        matched.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.filter(|_| true)
    }
}
