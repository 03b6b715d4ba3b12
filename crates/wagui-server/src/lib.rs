pub mod broadcaster;
pub mod config;
pub mod cop;
pub mod error;
pub mod follower;
pub mod gate;
pub mod process;
pub mod routes;
pub mod state;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wag_storage::{StorageError, WagStore};

pub const IN_MEMORY_DB: &str = ":memory:";

/// The store is only locked for synchronous work, never across an `.await`.
pub type SharedStore = Arc<Mutex<WagStore>>;

pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, WagStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens the database at `db_path`, creating its parent directory.
pub fn open_store(db_path: &str) -> Result<WagStore, StorageError> {
    if db_path == IN_MEMORY_DB {
        return WagStore::open_in_memory();
    }
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    WagStore::open(db_path)
}
