use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use skala_core::progress::ProgressSnapshot;

/// Cached draft plus the material needed to authorize a read without
/// touching the database: the resume token hash and the attempt owner.
#[derive(Debug, Clone)]
pub struct CachedDraft {
    pub token_hash: String,
    pub owner_user_id: Option<Uuid>,
    pub owner_anon_id: Option<String>,
    pub snapshot: ProgressSnapshot,
}

/// In-process cache-aside layer over the durable draft store.
///
/// Entries expire together with the draft they mirror; a miss or an expired
/// entry falls through to the database. Entries are only inserted after the
/// durable write succeeded, so the cache can be dropped at any time without
/// losing progress.
#[derive(Clone, Default)]
pub struct DraftCache {
    inner: Arc<RwLock<HashMap<Uuid, CachedDraft>>>,
}

impl DraftCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, attempt_id: Uuid) -> Option<CachedDraft> {
        let cached = {
            let map = self.inner.read().await;
            map.get(&attempt_id).cloned()
        };
        match cached {
            Some(entry) if entry.snapshot.expires_at > Utc::now() => Some(entry),
            Some(_) => {
                // Expired entry: evict lazily so the map does not pin dead drafts.
                self.inner.write().await.remove(&attempt_id);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, entry: CachedDraft) {
        self.inner
            .write()
            .await
            .insert(entry.snapshot.attempt_id, entry);
    }

    pub async fn invalidate(&self, attempt_id: Uuid) {
        self.inner.write().await.remove(&attempt_id);
    }

    /// Drop every expired entry. Called from a periodic background task.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.snapshot.expires_at > now);
        before - map.len()
    }
}
