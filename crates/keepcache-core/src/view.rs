//! In-memory read view of the cached keeps, kept in sync with the store.
//!
//! Reads never touch the store: the view is loaded once when the cache is
//! initialized and [`KeepWriter`] updates it after every successful write.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CacheError;
use crate::store::KeepStore;
use crate::types::{Keep, KeepStatus, StatusKind};

#[derive(Default)]
struct ViewState {
    keeps: Vec<Keep>,
    /// address → position in `keeps`
    index: HashMap<String, usize>,
}

/// Snapshot-friendly, insertion-ordered keep list with an address index.
#[derive(Default)]
pub struct KeepView {
    state: RwLock<ViewState>,
}

impl KeepView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from the store's keep list. Later duplicates of an
    /// address are ignored.
    pub fn from_keeps(keeps: Vec<Keep>) -> Self {
        let view = Self::new();
        {
            let mut state = view.write();
            for keep in keeps {
                Self::push(&mut state, keep);
            }
        }
        view
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(state: &mut ViewState, keep: Keep) -> bool {
        if state.index.contains_key(&keep.address) {
            return false;
        }
        state.index.insert(keep.address.clone(), state.keeps.len());
        state.keeps.push(keep);
        true
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read().index.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<Keep> {
        let state = self.read();
        state.index.get(address).map(|&i| state.keeps[i].clone())
    }

    /// All keeps in insertion order, optionally only those of one kind.
    pub fn list(&self, filter: Option<StatusKind>) -> Vec<Keep> {
        self.read()
            .keeps
            .iter()
            .filter(|k| filter.map_or(true, |kind| k.status.kind() == kind))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().keeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, keep: Keep) -> bool {
        Self::push(&mut self.write(), keep)
    }

    fn set_status(&self, address: &str, status: KeepStatus) {
        let mut state = self.write();
        if let Some(&i) = state.index.get(address) {
            state.keeps[i].status = status;
        }
    }
}

/// Writes through to the store first, then to the view.
pub struct KeepWriter {
    store: Arc<dyn KeepStore>,
    view: Arc<KeepView>,
}

impl KeepWriter {
    pub fn new(store: Arc<dyn KeepStore>, view: Arc<KeepView>) -> Self {
        Self { store, view }
    }

    pub fn view(&self) -> &KeepView {
        &self.view
    }

    /// Persist a newly fetched keep. Returns `false` if the address was
    /// already cached, in which case nothing is written.
    pub async fn insert(&self, keep: Keep) -> Result<bool, CacheError> {
        if self.view.contains(&keep.address) {
            return Ok(false);
        }
        let inserted = self.store.insert_keep(keep.clone()).await?;
        // The store may already hold the keep (e.g. written by an earlier,
        // interrupted cycle); the view must reflect it either way.
        self.view.insert(keep);
        Ok(inserted)
    }

    /// Persist a status change.
    ///
    /// Returns `false` without writing when the status kind is unchanged,
    /// and [`CacheError::StatusReversion`] when the change would leave a
    /// terminal status.
    pub async fn update_status(&self, address: &str, status: KeepStatus) -> Result<bool, CacheError> {
        let current = self
            .view
            .get(address)
            .ok_or_else(|| CacheError::Other(format!("keep {address} is not cached")))?
            .status;

        if current.kind() == status.kind() {
            return Ok(false);
        }
        if !current.can_transition_to(&status) {
            return Err(CacheError::StatusReversion {
                address: address.to_string(),
                from: current.kind(),
                to: status.kind(),
            });
        }

        self.store.update_status(address, status).await?;
        self.view.set_status(address, status);
        Ok(true)
    }
}
