//! Provider registry: snapshot-published provider set with per-provider
//! round-robin key rotation and optional concurrency limits.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{
    config::ProviderConfig,
    error::{RelayError, RelayResult},
};

/// Runtime state for one provider.
pub struct ProviderHandle {
    pub config: ProviderConfig,
    cursor: AtomicUsize,
    limiter: Option<Arc<Semaphore>>,
    queued: AtomicUsize,
    queue_depth: usize,
}

impl ProviderHandle {
    fn new(config: ProviderConfig, queue_depth: usize) -> Self {
        let limiter = config
            .limit
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            config,
            cursor: AtomicUsize::new(0),
            limiter,
            queued: AtomicUsize::new(0),
            queue_depth,
        }
    }

    /// Next API key, round-robin.
    pub fn next_key(&self) -> Option<String> {
        let keys = &self.config.api_keys;
        if keys.is_empty() {
            return None;
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(keys[cursor % keys.len()].clone())
    }

    /// Acquire an in-flight slot. Unlimited providers return `None`
    /// immediately; limited providers queue up to the configured depth
    /// and reject beyond it.
    pub async fn acquire(&self) -> RelayResult<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        if let Ok(permit) = Arc::clone(limiter).try_acquire_owned() {
            return Ok(Some(permit));
        }

        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.queue_depth {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            debug!(provider = %self.config.name, "Limit queue full");
            return Err(RelayError::RateLimited);
        }

        let permit = Arc::clone(limiter).acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        permit
            .map(Some)
            .map_err(|_| RelayError::Internal("provider limiter closed".to_string()))
    }
}

/// Read-mostly provider set. Writes rebuild and publish a new snapshot.
pub struct ProviderRegistry {
    set: RwLock<Arc<Vec<Arc<ProviderHandle>>>>,
    version: AtomicU64,
    queue_depth: usize,
}

impl ProviderRegistry {
    pub fn new(configs: Vec<ProviderConfig>, queue_depth: usize) -> RelayResult<Self> {
        for config in &configs {
            config.validate()?;
        }
        let handles = configs
            .into_iter()
            .map(|c| Arc::new(ProviderHandle::new(c, queue_depth)))
            .collect();
        Ok(Self {
            set: RwLock::new(Arc::new(handles)),
            version: AtomicU64::new(1),
            queue_depth,
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Arc<Vec<Arc<ProviderHandle>>> {
        Arc::clone(&self.set.read())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.snapshot()
            .iter()
            .find(|h| h.config.name == name)
            .cloned()
    }

    /// Configs ordered by `sort` then name, for the admin list.
    pub fn list(&self) -> Vec<ProviderConfig> {
        let mut configs: Vec<ProviderConfig> = self
            .snapshot()
            .iter()
            .map(|h| h.config.clone())
            .collect();
        configs.sort_by(|a, b| a.sort.cmp(&b.sort).then_with(|| a.name.cmp(&b.name)));
        configs
    }

    /// Insert or replace one provider. Round-robin and limiter state for
    /// that provider restart from scratch.
    pub fn upsert(&self, config: ProviderConfig) -> RelayResult<()> {
        config.validate()?;
        let mut guard = self.set.write();
        let mut next: Vec<Arc<ProviderHandle>> = guard
            .iter()
            .filter(|h| h.config.name != config.name)
            .cloned()
            .collect();
        next.push(Arc::new(ProviderHandle::new(config, self.queue_depth)));
        *guard = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.set.write();
        let before = guard.len();
        let next: Vec<Arc<ProviderHandle>> = guard
            .iter()
            .filter(|h| h.config.name != name)
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            *guard = Arc::new(next);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> RelayResult<bool> {
        let current = {
            let guard = self.set.read();
            guard.iter().find(|h| h.config.name == name).cloned()
        };
        let Some(handle) = current else {
            return Ok(false);
        };
        let mut config = handle.config.clone();
        config.enabled = enabled;
        if enabled {
            config.validate()?;
        }
        self.upsert(config)?;
        Ok(true)
    }

    /// Replace the whole set (config document replacement).
    pub fn replace_all(&self, configs: Vec<ProviderConfig>) -> RelayResult<()> {
        for config in &configs {
            config.validate()?;
        }
        let handles: Vec<Arc<ProviderHandle>> = configs
            .into_iter()
            .map(|c| Arc::new(ProviderHandle::new(c, self.queue_depth)))
            .collect();
        *self.set.write() = Arc::new(handles);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
