use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, RwLock};

use uuid::Uuid;

use crate::period::Period;
use crate::rating::RatingScope;

/// Process-wide locks serializing writers of one aggregate row.
/// The consumer and the reconciliation job both take the row's lock before
/// reading and persisting, so read-modify-write cycles never interleave.
static SCOPE_LOCKS: LazyLock<RwLock<HashMap<String, Arc<Mutex<()>>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn lock_key(asset_id: &Uuid, period: &Period, scope: &RatingScope) -> String {
    format!(
        "{scope}|{asset_id}|{}|{}",
        period.start().timestamp(),
        period.end().timestamp()
    )
}

/// Acquires the lock guarding one (asset, window, scope) aggregate.
/// Creates a new lock for the key if one doesn't exist.
pub(crate) async fn get_scope_lock(
    asset_id: &Uuid,
    period: &Period,
    scope: &RatingScope,
) -> Arc<Mutex<()>> {
    let key = lock_key(asset_id, period, scope);

    // First try to get an existing lock with the read lock (most common case)
    {
        let locks_read = SCOPE_LOCKS.read().await;
        if let Some(lock) = locks_read.get(&key) {
            return lock.clone();
        }
    }

    // If the lock doesn't exist, acquire the write lock and create it
    let mut locks_write = SCOPE_LOCKS.write().await;
    locks_write
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}
