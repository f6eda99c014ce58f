//! In-memory [`Storage`] backend: a process-local map with a TTL wheel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::interval;

use super::{SetOptions, Storage, Subscription};
use crate::Result;

const CHANNEL_CAPACITY: usize = 64;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// In-process `Storage` implementation backed by a [`DashMap`]. Expired
/// entries are removed lazily on access and by a periodic reaper task
/// spawned by [`MemoryStorage::new`].
pub struct MemoryStorage {
    map: Arc<DashMap<String, Entry>>,
    channels: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
    _reaper_shutdown: broadcast::Sender<()>,
}

impl MemoryStorage {
    /// Construct a fresh, empty store and spawn its background reaper.
    #[must_use]
    pub fn new() -> Self {
        let map: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_reaper(Arc::clone(&map), shutdown_tx.subscribe());
        Self {
            map,
            channels: Arc::new(DashMap::new()),
            _reaper_shutdown: shutdown_tx,
        }
    }

    fn channel(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reaper(map: Arc<DashMap<String, Entry>>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    map.retain(|_, entry| !entry.is_expired(now));
                }
                _ = shutdown.recv() => {
                    tracing::debug!("memory storage reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(entry) = self.map.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.map.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> Result<()> {
        let now = Instant::now();
        let exists = self
            .map
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now));

        if opts.if_not_exists && exists {
            return Ok(());
        }
        if opts.if_exists && !exists {
            return Ok(());
        }

        let expires_at = opts.ttl_seconds.map(|s| now + Duration::from_secs(s));
        self.map.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self.map.get(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let now = Instant::now();
        if let Some(mut entry) = self.map.get_mut(key) {
            if entry.is_expired(now) {
                return Ok(false);
            }
            entry.expires_at = Some(now + Duration::from_secs(ttl_seconds));
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        Ok(self.map.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                return None;
            }
            entry
                .expires_at
                .map(|exp| exp.saturating_duration_since(now).as_secs())
        }))
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| Entry {
            value: b"0".to_vec(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            entry.value = b"0".to_vec();
            entry.expires_at = None;
        }
        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let next = current + amount;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .map
            .iter()
            .filter(|e| !e.is_expired(now) && super::glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<u64> {
        Ok(self.channel(channel).send(message).unwrap_or(0) as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(self.channel(channel).subscribe())
    }
}
