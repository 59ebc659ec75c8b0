//! Call deduplication for expensive queries.
//!
//! When several callers ask for the same thing at once (say, three views
//! refreshing the installed list), only one producer runs and every caller
//! receives the same `Arc` result.
//!
//! ```text
//! caller A ─┐
//!           │                         producer
//! caller B ─┼──► TaskRecycler ───────► (runs once)
//!           │        │                     │
//! caller C ─┘        ▼                     ▼
//!               [A, B, C share      Arc<T> / Arc<error>
//!                one result] ◄─────────────┘
//! ```
//!
//! Registration goes through the `DashMap` entry API so two racing callers
//! can never both become producers. Completed results stay attachable for the
//! caller-supplied cache time; eviction runs on tasks owned by the context's
//! [`TaskTracker`] and stops when its shutdown token fires.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::errors::{Result, UnipackError};

/// What every attached caller receives. Both sides are shared, read-only views.
pub type Recycled<T> = std::result::Result<Arc<T>, Arc<UnipackError>>;

/// Identity of a deduplicated call: who, which method, which arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub scope: String,
    pub method: &'static str,
    pub args: Vec<String>,
}

impl CallKey {
    pub fn new(scope: &str, method: &'static str) -> Self {
        Self {
            scope: scope.to_lowercase(),
            method,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}({})", self.scope, self.method, self.args.join(", "))
    }
}

struct Slot<T> {
    generation: u64,
    call: Shared<BoxFuture<'static, Recycled<T>>>,
    /// Set once the call settled with a non-zero cache time.
    expires_at: Arc<OnceLock<Instant>>,
}

impl<T> Slot<T> {
    fn is_expired(&self) -> bool {
        self.expires_at
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }
}

/// Counters for monitoring how much work deduplication saves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecyclerStats {
    pub total_calls: u64,
    /// Calls that attached to existing work instead of starting their own.
    pub attached_calls: u64,
    pub executions: u64,
    pub cached_entries: usize,
}

/// Collapses concurrent identical calls into one execution.
pub struct TaskRecycler<T> {
    entries: Arc<DashMap<CallKey, Slot<T>>>,
    next_generation: AtomicU64,
    total_calls: AtomicU64,
    attached_calls: AtomicU64,
    executions: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl<T> fmt::Debug for TaskRecycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecycler")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Default for TaskRecycler<T> {
    fn default() -> Self {
        Self::new(TaskTracker::new(), CancellationToken::new())
    }
}

impl<T: Send + Sync + 'static> TaskRecycler<T> {
    /// Eviction tasks are spawned on `tasks` and cut short by `shutdown`.
    pub fn new(tasks: TaskTracker, shutdown: CancellationToken) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            attached_calls: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            tasks,
            shutdown,
        }
    }

    /// Runs `producer`, or attaches to an identical call that is in flight or
    /// still cached.
    ///
    /// After completion the result stays attachable for `cache_time`;
    /// `Duration::ZERO` evicts it as soon as it settles. Errors are cached
    /// the same way as successes.
    pub async fn run_or_attach<F, Fut>(
        &self,
        key: CallKey,
        cache_time: Duration,
        producer: F,
    ) -> Recycled<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let call = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) if !occupied.get().is_expired() => {
                self.attached_calls.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "Attaching to existing call");
                occupied.get().call.clone()
            }
            entry => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let entries = Arc::clone(&self.entries);
                let settled_key = key.clone();
                let call = producer()
                    .map(move |result| {
                        // Uncached calls leave the map the moment they settle,
                        // before any caller observes the result.
                        if cache_time.is_zero() {
                            entries.remove_if(&settled_key, |_, slot| {
                                slot.generation == generation
                            });
                        }
                        result.map(Arc::new).map_err(Arc::new)
                    })
                    .boxed()
                    .shared();
                let slot = Slot {
                    generation,
                    call: call.clone(),
                    expires_at: Arc::new(OnceLock::new()),
                };
                let expires_at = Arc::clone(&slot.expires_at);
                match entry {
                    Entry::Occupied(mut stale) => {
                        trace!(%key, "Replacing expired call");
                        stale.insert(slot);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(slot);
                    }
                }
                self.executions.fetch_add(1, Ordering::Relaxed);
                debug!(%key, generation, "Starting new call");
                self.schedule_eviction(key, generation, call.clone(), expires_at, cache_time);
                call
            }
        };

        call.await
    }

    /// Drives the call to completion and evicts it once a non-zero cache time
    /// ran out.
    fn schedule_eviction(
        &self,
        key: CallKey,
        generation: u64,
        call: Shared<BoxFuture<'static, Recycled<T>>>,
        expires_at: Arc<OnceLock<Instant>>,
        cache_time: Duration,
    ) {
        let entries = Arc::clone(&self.entries);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let failed = call.await.is_err();
            if !cache_time.is_zero() {
                let _ = expires_at.set(Instant::now() + cache_time);
                tokio::select! {
                    _ = tokio::time::sleep(cache_time) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
            if entries
                .remove_if(&key, |_, slot| slot.generation == generation)
                .is_some()
            {
                trace!(%key, generation, failed, "Evicted call");
            }
        });
    }

    /// Drops the cached entry for `key`. Work already in flight keeps running
    /// for the callers attached to it; new callers start over.
    pub fn invalidate(&self, key: &CallKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!(%key, "Invalidated call");
        }
        removed
    }

    /// Drops every entry whose scope matches, e.g. all listings of one manager.
    pub fn invalidate_scope(&self, scope: &str) -> usize {
        let scope = scope.to_lowercase();
        let before = self.entries.len();
        self.entries.retain(|key, _| key.scope != scope);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(%scope, removed, "Invalidated calls for scope");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            attached_calls: self.attached_calls.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            cached_entries: self.entries.len(),
        }
    }
}
