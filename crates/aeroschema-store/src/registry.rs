//! Workspace id → store resolution.

use std::collections::HashMap;
#[cfg(feature = "duckdb")]
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::{CatalogStore, MemoryStore, StoreError};

/// Where workspace stores live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    /// One `<workspace>.duckdb` file per workspace under this directory.
    #[cfg(feature = "duckdb")]
    DuckDb { data_dir: PathBuf },
}

/// Hands out one shared store per workspace, opening it on first use.
pub struct WorkspaceRegistry {
    backend: Backend,
    stores: Mutex<HashMap<String, Arc<dyn CatalogStore>>>,
}

impl WorkspaceRegistry {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Backend::Memory)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The store for `workspace`. Ids are restricted to ASCII
    /// alphanumerics, `-` and `_` so they are safe as file names.
    pub fn open(&self, workspace: &str) -> Result<Arc<dyn CatalogStore>, StoreError> {
        validate_workspace(workspace)?;
        let mut stores = self.stores.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(store) = stores.get(workspace) {
            return Ok(Arc::clone(store));
        }
        let store: Arc<dyn CatalogStore> = match &self.backend {
            Backend::Memory => Arc::new(MemoryStore::new(workspace)),
            #[cfg(feature = "duckdb")]
            Backend::DuckDb { data_dir } => {
                std::fs::create_dir_all(data_dir)?;
                let path = data_dir.join(format!("{workspace}.duckdb"));
                Arc::new(crate::DuckStore::open(workspace, &path)?)
            }
        };
        info!(workspace, backend = ?self.backend, "workspace store opened");
        stores.insert(workspace.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Workspaces opened so far, sorted.
    pub fn workspaces(&self) -> Result<Vec<String>, StoreError> {
        let stores = self.stores.lock().map_err(|_| StoreError::Poisoned)?;
        let mut ids: Vec<String> = stores.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

fn validate_workspace(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidWorkspace(id.to_string()))
    }
}
