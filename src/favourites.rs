//! Favourite devices.
//!
//! The list is kept in a [`PreferenceStore`] under a single key so it survives
//! restarts when the store is persistent. Changes are broadcast to
//! subscribers, including changes written to the store by someone else.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ble::platform::DeviceId;

/// Key the favourite list is stored under.
pub const FAVOURITES_KEY: &str = "favourites";

/// Key/value storage for string lists.
#[cfg_attr(test, mockall::automock)]
pub trait PreferenceStore: Send + Sync {
    /// Stored list for `key`, if any.
    fn get(&self, key: &str) -> Option<Vec<String>>;

    /// Replace the list stored for `key`.
    fn set(&self, key: &str, values: Vec<String>);

    /// Keys written to the store, if it can report them.
    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// Non-persistent [`PreferenceStore`].
#[derive(Debug)]
pub struct MemoryPreferenceStore {
    values: RwLock<HashMap<String, Vec<String>>>,
    changed: broadcast::Sender<String>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(32);
        Self {
            values: RwLock::new(HashMap::new()),
            changed,
        }
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<Vec<String>> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, values: Vec<String>) {
        self.values.write().insert(key.to_string(), values);
        let _ = self.changed.send(key.to_string());
    }

    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changed.subscribe())
    }
}

/// A change to the favourite list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FavouritesChange {
    Added(DeviceId),
    Removed(DeviceId),
}

/// Ordered set of favourite device identifiers.
pub struct Favourites {
    store: Arc<dyn PreferenceStore>,
    /// List as last seen by this handle. Held across every read-modify-write.
    known: Mutex<Vec<String>>,
    changes: broadcast::Sender<FavouritesChange>,
}

impl Favourites {
    /// Create over a store, picking up whatever it already holds.
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        let (changes, _) = broadcast::channel(32);
        let known = Mutex::new(store.get(FAVOURITES_KEY).unwrap_or_default());
        Self {
            store,
            known,
            changes,
        }
    }

    /// Favourites in insertion order.
    pub fn list(&self) -> Vec<DeviceId> {
        self.load().into_iter().map(DeviceId::new).collect()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.load().iter().any(|s| s == id.as_str())
    }

    /// Add a device. Returns false if it was already a favourite.
    pub fn add(&self, id: &DeviceId) -> bool {
        let mut known = self.known.lock();
        let mut values = self.load();
        if values.iter().any(|s| s == id.as_str()) {
            return false;
        }

        values.push(id.to_string());
        self.store.set(FAVOURITES_KEY, values.clone());
        debug!("Added favourite {}", id);
        self.commit(&mut known, values);
        true
    }

    /// Remove a device. Returns false if it was not a favourite.
    pub fn remove(&self, id: &DeviceId) -> bool {
        let mut known = self.known.lock();
        let mut values = self.load();
        let before = values.len();
        values.retain(|s| s != id.as_str());
        if values.len() == before {
            return false;
        }

        self.store.set(FAVOURITES_KEY, values.clone());
        debug!("Removed favourite {}", id);
        self.commit(&mut known, values);
        true
    }

    /// Flip membership. Returns whether the device is now a favourite.
    pub fn toggle(&self, id: &DeviceId) -> bool {
        if self.remove(id) {
            false
        } else {
            self.add(id)
        }
    }

    /// Re-read the store and broadcast whatever changed since this handle
    /// last looked.
    pub fn refresh(&self) -> Vec<FavouritesChange> {
        let mut known = self.known.lock();
        let values = self.load();
        self.commit(&mut known, values)
    }

    /// Follow writes made to the store through other handles.
    ///
    /// Returns `None` if the store cannot report changes. The task ends when
    /// the last `Arc` to this `Favourites` is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.store.changes()?;
        let favourites = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(key) if key != FAVOURITES_KEY => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let Some(favourites) = favourites.upgrade() else {
                    break;
                };
                favourites.refresh();
            }
            trace!("Favourites watcher ended");
        }))
    }

    /// Subscribe to list changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FavouritesChange> {
        self.changes.subscribe()
    }

    fn load(&self) -> Vec<String> {
        self.store.get(FAVOURITES_KEY).unwrap_or_default()
    }

    /// Record `values` as the known list and broadcast the difference.
    fn commit(&self, known: &mut Vec<String>, values: Vec<String>) -> Vec<FavouritesChange> {
        let mut changes: Vec<FavouritesChange> = known
            .iter()
            .filter(|s| !values.contains(*s))
            .map(|s| FavouritesChange::Removed(DeviceId::new(s.as_str())))
            .collect();
        changes.extend(
            values
                .iter()
                .filter(|s| !known.contains(*s))
                .map(|s| FavouritesChange::Added(DeviceId::new(s.as_str()))),
        );
        *known = values;

        for change in &changes {
            let _ = self.changes.send(change.clone());
        }
        changes
    }
}

impl std::fmt::Debug for Favourites {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Favourites")
            .field("list", &self.list())
            .finish()
    }
}
