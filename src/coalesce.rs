//! Single-flight request coalescing.
//!
//! Prevents the "thundering herd" problem: when multiple requests arrive
//! for the same uncached key concurrently, only one origin fetch is issued
//! and every waiter receives its result. Generic over the fetch result type
//! so the handler can coalesce on its own outcome type (origin response
//! plus the cache-status tag it ultimately serves with).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

struct CoalescerInner<T> {
    in_flight: DashMap<String, broadcast::Sender<Result<T, String>>>,
    max_waiters: usize,
}

/// Keyed single-flight coalescer over origin fetches.
pub struct RequestCoalescer<T> {
    inner: Arc<CoalescerInner<T>>,
}

impl<T> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    pub fn new(max_waiters: usize) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                in_flight: DashMap::new(),
                max_waiters,
            }),
        }
    }

    /// Returns `Fetch` if the caller should perform the origin fetch itself
    /// (and must call `complete`/`complete_error` on the returned guard), or
    /// `Wait` if another task is already fetching this key.
    pub fn try_acquire(&self, cache_key: &str) -> AcquireResult<T> {
        if let Some(sender) = self.inner.in_flight.get(cache_key) {
            let receiver = sender.subscribe();
            debug!(cache_key = %cache_key, "coalescing with in-flight origin fetch");
            return AcquireResult::Wait(receiver);
        }

        let (tx, _) = broadcast::channel(self.inner.max_waiters);
        self.inner.in_flight.insert(cache_key.to_string(), tx);

        debug!(cache_key = %cache_key, "acquired origin fetch lock");
        AcquireResult::Fetch(FetchGuard {
            cache_key: cache_key.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> CoalesceStats {
        let in_flight_requests = self.inner.in_flight.len();
        let total_waiters = self
            .inner
            .in_flight
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum();

        CoalesceStats {
            in_flight_requests,
            total_waiters,
        }
    }
}

pub enum AcquireResult<T> {
    Fetch(FetchGuard<T>),
    Wait(broadcast::Receiver<Result<T, String>>),
}

/// Guard held by the leader of a coalesced fetch. Notifies all waiters on
/// completion; if dropped without completing (panic, cancellation), sends
/// an error so joiners are never left hanging.
pub struct FetchGuard<T> {
    cache_key: String,
    inner: Arc<CoalescerInner<T>>,
}

impl<T: Clone> FetchGuard<T> {
    pub fn complete(self, response: T) {
        self.complete_internal(Ok(response));
    }

    pub fn complete_error(self, error: String) {
        self.complete_internal(Err(error));
    }

    fn complete_internal(self, result: Result<T, String>) {
        if let Some((_, sender)) = self.inner.in_flight.remove(&self.cache_key) {
            let waiter_count = sender.receiver_count();
            if waiter_count > 0 {
                info!(
                    cache_key = %self.cache_key,
                    waiters = waiter_count,
                    "notifying coalesced waiters"
                );
            }
            let _ = sender.send(result);
        }
        std::mem::forget(self);
    }
}

impl<T> Drop for FetchGuard<T> {
    fn drop(&mut self) {
        if let Some((_, sender)) = self.inner.in_flight.remove(&self.cache_key) {
            let _ = sender.send(Err("request was cancelled".to_string()));
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CoalesceStats {
    pub in_flight_requests: usize,
    pub total_waiters: usize,
}
