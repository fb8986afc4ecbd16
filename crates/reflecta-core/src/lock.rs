//! Per-ID lock table: fair mutual exclusion with reference-counted entry
//! removal, guaranteeing a total write order (and thus monotone `Generation`)
//! for every individual record ID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

struct Entry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refcount: usize,
}

/// Owned so it can live inside an `Arc<TypeConfig<T>>` and be shared freely
/// across the tasks handling concurrent requests for the same type.
pub struct LockTable {
    table: Mutex<HashMap<String, Entry>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires exclusive access to `id`. Create does not call this: it has
    /// no prior state to race against.
    pub async fn acquire(self: &Arc<Self>, id: &str) -> LockGuard {
        let entry_mutex = {
            let mut table = self.table.lock().expect("lock table poisoned");
            let entry = table.entry(id.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            entry.mutex.clone()
        };

        let permit = entry_mutex.lock_owned().await;

        LockGuard {
            table: self.clone(),
            id: id.to_string(),
            _permit: permit,
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.table.lock().expect("lock table poisoned").len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of a Replace/Update/Delete. Dropping it releases the
/// per-ID mutex; field declaration order below matters (see `Drop` impl).
pub struct LockGuard {
    table: Arc<LockTable>,
    id: String,
    // Must be declared last: Rust drops fields in declaration order after
    // `Drop::drop` runs, so the table-mutex bookkeeping below always
    // completes before this releases the entry mutex.
    _permit: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut table = self.table.table.lock().expect("lock table poisoned");
        if let Some(entry) = table.get_mut(&self.id) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                table.remove(&self.id);
            }
        }
    }
}
