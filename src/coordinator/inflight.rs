//! In-flight request coalescing.
//!
//! Concurrent callers asking for the same key share one future. The future
//! is also spawned, so it runs to completion and clears its entry even when
//! every caller goes away. Each entry carries a generation so a finished
//! request only removes its own entry, never a newer one started for the
//! same key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

pub(crate) type SharedRequest<T> = Shared<BoxFuture<'static, T>>;

pub(crate) struct RequestCoalescer<T: Clone> {
    inflight: Mutex<HashMap<String, (u64, SharedRequest<T>)>>,
    generation: AtomicU64,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Join the request in flight for `key`, or start one with `start`.
    /// The flag is `true` when an existing request was joined.
    pub(crate) fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> (SharedRequest<T>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let mut inflight = self.inflight.lock();
        if let Some((_, running)) = inflight.get(key) {
            return (running.clone(), true);
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let shared = self.wrap(vec![key.to_string()], generation, start());
        inflight.insert(key.to_string(), (generation, shared.clone()));
        (shared, false)
    }

    /// Join every in-flight request covering one of `keys`. The keys nothing
    /// covers are handed to `start` as one group and share a single new
    /// request. Returns the distinct requests to await and the number of
    /// keys that were joined.
    pub(crate) fn join_or_start_many<F>(self: &Arc<Self>, keys: &[String], start: F) -> (Vec<SharedRequest<T>>, usize)
    where
        F: FnOnce(Vec<String>) -> BoxFuture<'static, T>,
    {
        let mut inflight = self.inflight.lock();
        let mut seen = Vec::new();
        let mut requests = Vec::new();
        let mut uncovered = Vec::new();
        let mut joined = 0;

        for key in keys {
            match inflight.get(key) {
                Some((generation, running)) => {
                    joined += 1;
                    if !seen.contains(generation) {
                        seen.push(*generation);
                        requests.push(running.clone());
                    }
                }
                None => uncovered.push(key.clone()),
            }
        }

        if !uncovered.is_empty() {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let shared = self.wrap(uncovered.clone(), generation, start(uncovered.clone()));
            for key in uncovered {
                inflight.insert(key, (generation, shared.clone()));
            }
            requests.push(shared);
        }
        (requests, joined)
    }

    fn wrap(self: &Arc<Self>, keys: Vec<String>, generation: u64, work: BoxFuture<'static, T>) -> SharedRequest<T> {
        let coalescer = Arc::clone(self);
        let shared = async move {
            let output = work.await;
            coalescer.finish(&keys, generation);
            output
        }
        .boxed()
        .shared();
        tokio::spawn(shared.clone());
        shared
    }

    fn finish(&self, keys: &[String], generation: u64) {
        let mut inflight = self.inflight.lock();
        for key in keys {
            if inflight.get(key).is_some_and(|(g, _)| *g == generation) {
                inflight.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}
