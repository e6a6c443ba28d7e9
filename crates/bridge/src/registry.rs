//! Explicit registry of live players, keyed by texture id.
//!
//! Owned by the bridge: entries are created on `openVideo`, removed on `dispose` or a
//! failed open, and dropped wholesale by `clearAll` when the host resets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use video_player::PlaybackSession;

use crate::texture::PixelBufferTexture;

/// One live player: the engine session plus the texture it renders into.
#[derive(Clone)]
pub struct PlayerEntry {
    pub session: Arc<PlaybackSession>,
    pub texture: Arc<PixelBufferTexture>,
}

pub struct PlayerRegistry {
    next_id: AtomicI64,
    players: Mutex<HashMap<i64, PlayerEntry>>,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            players: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, PlayerEntry>> {
        self.players.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id and register the entry built by `make`.
    ///
    /// The registry lock is held while `make` runs, so lookups of the new id from other
    /// threads wait until the entry is visible. `make` must not touch the registry.
    pub fn create<F>(&self, make: F) -> Result<i64>
    where
        F: FnOnce(i64) -> Result<PlayerEntry>,
    {
        let mut players = self.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = make(id)?;
        players.insert(id, entry);
        tracing::debug!(texture_id = id, players = players.len(), "player registered");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Option<PlayerEntry> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Unregister `id`. Shutting the session down is up to the caller.
    pub fn remove(&self, id: i64) -> Option<PlayerEntry> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(texture_id = id, "player unregistered");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted ids of all registered players.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Shut down and drop every player. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<(i64, PlayerEntry)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::info!(texture_id = id, "old player found, shutting down");
            entry.session.detach_consumer();
            entry.session.shutdown();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HostEvents;
    use video_player::config::EngineConfig;
    use video_player::media::MediaLocator;
    use video_player::synthetic::{SyntheticConfig, SyntheticSubsystem};
    use video_player::OpenOptions;

    fn entry(subsystem: &Arc<SyntheticSubsystem>, id: i64) -> PlayerEntry {
        let (events, _rx) = HostEvents::channel();
        let session = PlaybackSession::open(
            subsystem.clone(),
            EngineConfig::default(),
            MediaLocator::new("synthetic://registry?resolve_delay_ms=1000"),
            OpenOptions {
                session_id: Some(id),
                ..OpenOptions::default()
            },
            |_| {},
        );
        PlayerEntry {
            session: Arc::new(session),
            texture: Arc::new(PixelBufferTexture::new(id, events)),
        }
    }

    #[test]
    fn create_allocates_increasing_ids() {
        let subsystem = SyntheticSubsystem::new(SyntheticConfig::default()).unwrap();
        let registry = PlayerRegistry::new();
        let a = registry.create(|id| Ok(entry(&subsystem, id))).unwrap();
        let b = registry.create(|id| Ok(entry(&subsystem, id))).unwrap();
        assert!(b > a);
        assert_eq!(registry.ids(), vec![a, b]);
        assert_eq!(registry.get(b).unwrap().session.id(), b);
    }

    #[test]
    fn failed_create_registers_nothing() {
        let registry = PlayerRegistry::new();
        assert!(
            registry
                .create(|_| Err(anyhow::anyhow!("no texture")))
                .is_err()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_and_clear_all() {
        let subsystem = SyntheticSubsystem::new(SyntheticConfig::default()).unwrap();
        let registry = PlayerRegistry::new();
        let a = registry.create(|id| Ok(entry(&subsystem, id))).unwrap();
        let b = registry.create(|id| Ok(entry(&subsystem, id))).unwrap();

        let removed = registry.remove(a).unwrap();
        assert!(registry.remove(a).is_none());
        assert!(!registry.contains(a));
        assert!(!removed.session.is_shut_down());

        let survivor = registry.get(b).unwrap();
        assert_eq!(registry.clear_all(), 1);
        assert!(registry.is_empty());
        assert!(survivor.session.is_shut_down());
    }
}
