//! # In-flight Registry
//!
//! Coalesces concurrent identical computations: while a computation for a
//! key is running, every other caller for that key awaits the same shared
//! result instead of starting its own.
//!
//! Computations run as spawned tasks. A caller that stops waiting does not
//! cancel the work, so whatever it populates (usually the cache) still
//! lands for the others.
//!
//! # Invariant
//!
//! At most one computation per key is registered at any instant. The entry
//! is removed when the computation settles, or after the safety timeout if
//! it has not settled by then. The timeout runs inside the computation's
//! own task and is dropped with it. Removal is generation-checked so a late
//! release never evicts a newer computation for the same key.

use crate::error::Aborted;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Safety eviction delay for computations that never settle.
pub const DEFAULT_SAFETY_TIMEOUT: Duration = Duration::from_secs(10);

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Slot {
    generation: u64,
    /// A `SharedResult<T, E>` for the types the slot was created with.
    future: Box<dyn Any + Send + Sync>,
}

#[derive(Clone)]
pub struct InflightRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    generations: Arc<AtomicU64>,
    safety_timeout: Duration,
}

impl Default for InflightRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_TIMEOUT)
    }
}

impl InflightRegistry {
    pub fn new(safety_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            safety_timeout,
        }
    }

    /// Number of computations currently registered.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.slots.lock().await.contains_key(key)
    }

    /// Run `compute` for `key`, or join the computation already running
    /// for it.
    ///
    /// A key registered with different result types is not shared; the new
    /// caller runs its own computation unregistered.
    pub async fn run<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + From<Aborted> + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(slot) => match slot.future.downcast_ref::<SharedResult<T, E>>() {
                    Some(existing) => existing.clone(),
                    None => {
                        tracing::warn!(key, "in-flight key reused with a different result type");
                        drop(slots);
                        return spawn_detached(compute()).await;
                    }
                },
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let shared = self.spawn(key, generation, compute());
                    slots.insert(
                        key.to_string(),
                        Slot {
                            generation,
                            future: Box::new(shared.clone()),
                        },
                    );
                    shared
                }
            }
        };
        shared.await
    }

    fn spawn<T, E, Fut>(&self, key: &str, generation: u64, work: Fut) -> SharedResult<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + From<Aborted> + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let registry = self.clone();
        let owned_key = key.to_string();
        let timeout = self.safety_timeout;
        let task = tokio::spawn(async move {
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => {
                    registry.release(&owned_key, generation).await;
                    return result;
                }
                _ = tokio::time::sleep(timeout) => {}
            }
            if registry.release(&owned_key, generation).await {
                tracing::warn!(
                    key = %owned_key,
                    timeout_secs = timeout.as_secs(),
                    "in-flight computation outlived the safety timeout; evicted"
                );
            }
            work.await
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(E::from(Aborted(e.to_string()))),
            }
        }
        .boxed()
        .shared()
    }

    /// Remove the entry for `key` if it still belongs to `generation`.
    async fn release(&self, key: &str, generation: u64) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.get(key).is_some_and(|s| s.generation == generation) {
            slots.remove(key);
            true
        } else {
            false
        }
    }
}

async fn spawn_detached<T, E, Fut>(work: Fut) -> Result<T, E>
where
    T: Send + 'static,
    E: From<Aborted> + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(e) => Err(E::from(Aborted(e.to_string()))),
    }
}
