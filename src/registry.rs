//! Sharded Session Registry
//!
//! Sessions are spread over a fixed number of `RwLock<HashMap>` shards picked
//! by the xxh3 hash of the client id, so registration on one shard never
//! waits behind another and lookups on the hot path take only a read lock.
//! Sessions are never removed: an inactive session keeps its window and can
//! be reactivated by a later registration with the same id.

use crate::config::EnsembleConfig;
use crate::error::{EngineError, Result};
use crate::session::Session;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

type Shard = RwLock<HashMap<String, Arc<Session>>>;

/// Outcome of a successful [`SessionRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    Created(Arc<Session>),
    /// An inactive session was switched back on with its window intact
    Reactivated(Arc<Session>),
}

impl Registration {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::Created(s) | Self::Reactivated(s) => s,
        }
    }

    pub fn into_session(self) -> Arc<Session> {
        match self {
            Self::Created(s) | Self::Reactivated(s) => s,
        }
    }

    pub fn is_reactivation(&self) -> bool {
        matches!(self, Self::Reactivated(_))
    }
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_creations: u64,
    pub total_reactivations: u64,
    pub total_deactivations: u64,
}

pub struct SessionRegistry {
    shards: Vec<Shard>,
    creations: AtomicU64,
    reactivations: AtomicU64,
    deactivations: AtomicU64,
}

impl SessionRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            creations: AtomicU64::new(0),
            reactivations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, client_id: &str) -> &Shard {
        let hash = xxhash_rust::xxh3::xxh3_64(client_id.as_bytes());
        &self.shards[(hash as usize) % self.shards.len()]
    }

    fn read(shard: &Shard) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        shard.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(shard: &Shard) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        shard.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a session, or reactivates an inactive one.
    ///
    /// Reactivation keeps the existing window, detectors and configuration;
    /// `window_size` and `config` only apply to new sessions. Registering an
    /// id that is currently active fails with `DuplicateSession` and leaves
    /// the registry unchanged.
    pub fn register(
        &self,
        client_id: &str,
        window_size: usize,
        config: &EnsembleConfig,
    ) -> Result<Registration> {
        let mut shard = Self::write(self.shard(client_id));

        if let Some(existing) = shard.get(client_id) {
            if existing.reactivate() {
                self.reactivations.fetch_add(1, Ordering::Relaxed);
                info!(client_id = %client_id, "Session reactivated.");
                return Ok(Registration::Reactivated(Arc::clone(existing)));
            }
            return Err(EngineError::DuplicateSession(client_id.to_string()));
        }

        let session = Arc::new(Session::new(client_id, window_size, config.clone())?);
        shard.insert(client_id.to_string(), Arc::clone(&session));
        self.creations.fetch_add(1, Ordering::Relaxed);
        info!(client_id = %client_id, window = window_size, "Session registered.");
        Ok(Registration::Created(session))
    }

    /// Marks the session inactive. Returns `true` if this call changed its
    /// status, `false` if it was already inactive.
    pub fn deactivate(&self, client_id: &str) -> Result<bool> {
        let session = self.lookup(client_id)?;
        let changed = session.deactivate();
        if changed {
            self.deactivations.fetch_add(1, Ordering::Relaxed);
            info!(client_id = %client_id, "Session deactivated.");
        }
        Ok(changed)
    }

    pub fn lookup(&self, client_id: &str) -> Result<Arc<Session>> {
        Self::read(self.shard(client_id))
            .get(client_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(client_id.to_string()))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        Self::read(self.shard(client_id)).contains_key(client_id)
    }

    pub fn list_active(&self) -> BTreeSet<String> {
        self.shards
            .iter()
            .flat_map(|shard| {
                Self::read(shard)
                    .values()
                    .filter(|s| s.is_active())
                    .map(|s| s.client_id().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| Self::read(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let (total, active) = self.shards.iter().fold((0, 0), |(total, active), shard| {
            let map = Self::read(shard);
            (
                total + map.len(),
                active + map.values().filter(|s| s.is_active()).count(),
            )
        });
        RegistryStats {
            total_sessions: total,
            active_sessions: active,
            total_creations: self.creations.load(Ordering::Relaxed),
            total_reactivations: self.reactivations.load(Ordering::Relaxed),
            total_deactivations: self.deactivations.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(16)
    }
}
