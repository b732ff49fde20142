use crate::error::EngineError;
use crate::protocol::ProtocolSession;
use crate::types::events::GroupMetadata;
use crate::types::jid::Jid;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    fetched_at: Instant,
    meta: GroupMetadata,
}

/// TTL cache of group metadata. Reads never block on a fresh entry; a
/// stale entry is served as-is while a background refresh replaces it,
/// so staleness is bounded by the TTL rather than eliminated. Refresh
/// failures leave the old value in place.
pub struct GroupMetadataCache {
    entries: DashMap<Jid, CacheEntry>,
    ttl: Duration,
}

impl GroupMetadataCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        })
    }

    pub fn insert(&self, meta: GroupMetadata) {
        self.entries.insert(
            meta.id.clone(),
            CacheEntry {
                fetched_at: Instant::now(),
                meta,
            },
        );
    }

    pub fn invalidate(&self, jid: &Jid) {
        self.entries.remove(jid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn known_groups(&self) -> Vec<Jid> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Returns the cached value and whether it is past the TTL.
    fn peek(&self, jid: &Jid) -> Option<(GroupMetadata, bool)> {
        self.entries
            .get(jid)
            .map(|entry| (entry.meta.clone(), entry.fetched_at.elapsed() > self.ttl))
    }

    /// Fetches authoritative metadata and overwrites the entry with a
    /// fresh timestamp. On failure the existing entry (if any) is left
    /// untouched.
    pub async fn refresh(
        &self,
        session: &Arc<dyn ProtocolSession>,
        jid: &Jid,
    ) -> Result<GroupMetadata, EngineError> {
        match session.fetch_group_metadata(jid).await {
            Ok(meta) => {
                self.insert(meta.clone());
                Ok(meta)
            }
            Err(e) => {
                let err = EngineError::CacheRefresh {
                    jid: jid.to_string(),
                    source: e,
                };
                warn!(target: "GroupCache", "{err}");
                Err(err)
            }
        }
    }

    pub fn spawn_refresh(self: &Arc<Self>, session: Arc<dyn ProtocolSession>, jid: Jid) {
        let cache = self.clone();
        tokio::spawn(async move {
            let _ = cache.refresh(&session, &jid).await;
        });
    }

    /// Cache lookup. Fresh hit: returned immediately. Stale hit: the old
    /// value is returned and a background refresh is kicked off. Miss:
    /// fetched inline (None when the fetch fails).
    pub async fn get(
        self: &Arc<Self>,
        session: &Arc<dyn ProtocolSession>,
        jid: &Jid,
    ) -> Option<GroupMetadata> {
        if !jid.is_group() {
            return None;
        }

        match self.peek(jid) {
            Some((meta, false)) => Some(meta),
            Some((meta, true)) => {
                debug!(target: "GroupCache", "Entry for {jid} expired, refreshing in background");
                self.spawn_refresh(session.clone(), jid.clone());
                Some(meta)
            }
            None => self.refresh(session, jid).await.ok(),
        }
    }

    /// Forced refresh of every joined group. Called by the periodic
    /// sweep, which bounds worst-case staleness independent of reads.
    pub async fn force_refresh_all(&self, session: &Arc<dyn ProtocolSession>) {
        debug!(target: "GroupCache", "Forcing update of group metadata cache");
        let groups = match session.fetch_joined_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(target: "GroupCache", "Failed to list joined groups for sweep: {e}");
                return;
            }
        };

        for group in groups {
            let _ = self.refresh(session, &group.id).await;
        }
    }
}
