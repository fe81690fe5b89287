//! Per-resource read cache
//!
//! Bounded-TTL cache keyed by `"type/id"`, with single-flight loading and
//! pending-write coalescing. Concurrent reads of a missing key share one
//! provider call; writes that land while a load is in flight accumulate in a
//! patch that overlays the loaded resource, so cached entries are never
//! stale with respect to local writes.
//!
//! The cache emits an event stream (`hit`, `miss`, `set`, `update`,
//! `expire`, `clear`) that the CRUD core uses to bind resource-channel
//! subscription lifetime to entry lifetime.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{CrudError, Result};
use crate::query::Query;
use crate::schema::Resource;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// A read was served from a resident entry.
    Hit,
    /// A read found no entry and launched the provider.
    Miss,
    /// A provider completed and the entry became resident.
    Set,
    /// A write was reconciled into an entry.
    Update,
    /// An entry reached the end of its TTL.
    Expire,
    /// An entry was dropped after an upstream change.
    Clear,
}

/// One cache lifecycle event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// What happened.
    pub kind: CacheEventKind,
    /// The `"type/id"` path of the affected entry.
    pub resource_path: String,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Reads served from resident entries.
    pub hits: u64,
    /// Reads that launched a provider.
    pub misses: u64,
}

type Waiter = oneshot::Sender<Result<Option<Resource>>>;

struct PendingLoad {
    patch: Map<String, Value>,
    waiters: Vec<Waiter>,
}

struct ResidentEntry {
    resource: Option<Resource>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

enum EntryState {
    Pending(PendingLoad),
    Resident(ResidentEntry),
}

struct CacheInner {
    entries: Mutex<HashMap<String, EntryState>>,
    events: broadcast::Sender<CacheEvent>,
    duration: Duration,
    disabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    next_generation: AtomicU64,
}

/// Thread-safe resource cache handle.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    /// Create a cache whose entries live for `duration` after their last
    /// set or hit.
    pub fn new(duration: Duration, disabled: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                events,
                duration,
                disabled,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to the cache event stream.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Current hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Idempotent read under concurrency.
    ///
    /// Resolves from the cache when possible; otherwise the first caller
    /// runs `provider` and every concurrent caller for the same path shares
    /// its outcome. Queries without a `{type, id}` pair bypass the cache.
    pub async fn pass<F, Fut>(&self, query: &Query, provider: F) -> Result<Option<Resource>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Resource>>>,
    {
        let path = match query.resource_path() {
            Some(path) if !self.inner.disabled => path,
            _ => return provider().await,
        };

        let waiter = {
            let mut entries = self.inner.entries.lock();
            match entries.entry(path.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    EntryState::Resident(entry) => {
                        let generation = self.next_generation();
                        entry.generation = generation;
                        if let Some(timer) = entry.timer.take() {
                            timer.abort();
                        }
                        entry.timer = Some(self.schedule_expiry(&path, generation));
                        let resource = entry.resource.clone();
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        self.emit(CacheEventKind::Hit, &path);
                        return Ok(resource);
                    }
                    EntryState::Pending(load) => {
                        let (tx, rx) = oneshot::channel();
                        load.waiters.push(tx);
                        Some(rx)
                    }
                },
                Entry::Vacant(vacant) => {
                    vacant.insert(EntryState::Pending(PendingLoad {
                        patch: Map::new(),
                        waiters: Vec::new(),
                    }));
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    self.emit(CacheEventKind::Miss, &path);
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(CrudError::Database(
                    "Cache load was interrupted".to_string(),
                )),
            };
        }

        match provider().await {
            Ok(resource) => Ok(self.complete_load(&path, resource)),
            Err(err) => {
                self.fail_load(&path, &err);
                Err(err)
            }
        }
    }

    /// Reconcile a write into the cache.
    ///
    /// While a load is pending the fields accumulate in its patch so the
    /// next completion sees the overlay; on a resident entry the fields are
    /// written directly onto the resource.
    pub fn update(&self, query: &Query) {
        let Some(path) = query.resource_path() else {
            return;
        };
        let Some(Value::Object(fields)) = &query.value else {
            return;
        };

        let mut entries = self.inner.entries.lock();
        match entries.get_mut(&path) {
            Some(EntryState::Pending(load)) => {
                for (field, value) in fields {
                    load.patch.insert(field.clone(), value.clone());
                }
                self.emit(CacheEventKind::Update, &path);
            }
            Some(EntryState::Resident(entry)) => {
                if let Some(resource) = entry.resource.as_mut() {
                    for (field, value) in fields {
                        resource.insert(field.clone(), value.clone());
                    }
                }
                self.emit(CacheEventKind::Update, &path);
            }
            None => {}
        }
    }

    /// Drop an entry after an upstream change.
    ///
    /// Pending loads stay registered so their waiters resolve; only the
    /// resident state is removed.
    pub fn clear(&self, query: &Query) {
        let Some(path) = query.resource_path() else {
            return;
        };
        self.clear_path(&path);
    }

    /// [`ResourceCache::clear`] addressed by raw path.
    pub fn clear_path(&self, path: &str) {
        let removed = {
            let mut entries = self.inner.entries.lock();
            if matches!(entries.get(path), Some(EntryState::Resident(_))) {
                entries.remove(path)
            } else {
                None
            }
        };
        if let Some(EntryState::Resident(entry)) = removed {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        self.emit(CacheEventKind::Clear, path);
    }

    /// Whether a resident entry exists for `path`.
    pub fn contains(&self, path: &str) -> bool {
        matches!(
            self.inner.entries.lock().get(path),
            Some(EntryState::Resident(_))
        )
    }

    fn complete_load(&self, path: &str, resource: Option<Resource>) -> Option<Resource> {
        let (stored, waiters) = {
            let mut entries = self.inner.entries.lock();
            match entries.remove(path) {
                Some(EntryState::Pending(load)) => {
                    let mut stored = resource;
                    if !load.patch.is_empty() {
                        let mut base = stored.unwrap_or_default();
                        for (field, value) in load.patch {
                            base.insert(field, value);
                        }
                        stored = Some(base);
                    }
                    let generation = self.next_generation();
                    entries.insert(
                        path.to_string(),
                        EntryState::Resident(ResidentEntry {
                            resource: stored.clone(),
                            generation,
                            timer: Some(self.schedule_expiry(path, generation)),
                        }),
                    );
                    self.emit(CacheEventKind::Set, path);
                    (stored, load.waiters)
                }
                other => {
                    if let Some(state) = other {
                        entries.insert(path.to_string(), state);
                    }
                    (resource, Vec::new())
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(stored.clone()));
        }
        stored
    }

    fn fail_load(&self, path: &str, err: &CrudError) {
        let waiters = {
            let mut entries = self.inner.entries.lock();
            match entries.remove(path) {
                Some(EntryState::Pending(load)) => load.waiters,
                other => {
                    if let Some(state) = other {
                        entries.insert(path.to_string(), state);
                    }
                    Vec::new()
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn schedule_expiry(&self, path: &str, generation: u64) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let path = path.to_string();
        let duration = self.inner.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut entries = inner.entries.lock();
                let current = matches!(
                    entries.get(&path),
                    Some(EntryState::Resident(entry)) if entry.generation == generation
                );
                if current {
                    entries.remove(&path);
                }
                current
            };
            if expired {
                debug!(resource = %path, "cache entry expired");
                let _ = inner.events.send(CacheEvent {
                    kind: CacheEventKind::Expire,
                    resource_path: path,
                });
            }
        })
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, kind: CacheEventKind, path: &str) {
        let _ = self.inner.events.send(CacheEvent {
            kind,
            resource_path: path.to_string(),
        });
    }
}
