//! Idempotency Cache (4.J): deduplicates unsafe requests keyed by
//! `(method, path, Idempotency-Key)`. Each key is `in-flight` until the
//! first request completes, then `complete` for the rest of its TTL.
//! Replays with the same key and body-digest get the captured response back
//! verbatim; replays with the same key but a different digest are a 409.

use crate::error::Error;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct CapturedResponse {
    pub status: u16,
    pub body: Value,
}

struct Completed {
    body_digest: String,
    response: CapturedResponse,
    expires_at: Instant,
}

enum Entry {
    InFlight { body_digest: String, notify: Arc<Notify> },
    Completed(Completed),
}

/// What the caller should do with the request it's holding.
pub enum Claim<'a> {
    /// No matching entry existed (or the prior holder abandoned it without
    /// completing): run the handler, then call `Guard::complete`.
    Proceed(Guard<'a>),
    /// A prior identical request already finished; return this verbatim
    /// without running the handler again.
    Replay(CapturedResponse),
}

pub struct IdempotencyCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        IdempotencyCache { entries: DashMap::new(), ttl }
    }

    pub fn cache_key(method: &str, path: &str, idempotency_key: &str) -> String {
        format!("{method}|{path}|{idempotency_key}")
    }

    pub fn digest(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    /// Claims `cache_key` for `body_digest`, waiting out any in-flight
    /// duplicate before deciding. A request whose digest doesn't match an
    /// existing entry (in-flight or completed) for the same key is a 409.
    pub async fn begin(&self, cache_key: String, body_digest: &str) -> Result<Claim<'_>, Error> {
        loop {
            let wait_on = match self.entries.entry(cache_key.clone()) {
                MapEntry::Vacant(v) => {
                    let notify = Arc::new(Notify::new());
                    v.insert(Entry::InFlight {
                        body_digest: body_digest.to_string(),
                        notify: notify.clone(),
                    });
                    return Ok(Claim::Proceed(Guard {
                        cache: self,
                        key: cache_key,
                        body_digest: body_digest.to_string(),
                        notify,
                        completed: false,
                    }));
                }
                MapEntry::Occupied(o) => match o.get() {
                    Entry::Completed(c) => {
                        if c.body_digest != body_digest {
                            return Err(Error::conflict(
                                "Idempotency-Key reused with a different request body",
                            ));
                        }
                        return Ok(Claim::Replay(c.response.clone()));
                    }
                    Entry::InFlight { body_digest: existing, notify } => {
                        if existing != body_digest {
                            return Err(Error::conflict(
                                "Idempotency-Key reused with a different request body",
                            ));
                        }
                        notify.clone()
                    }
                },
            };

            wait_on.notified().await;
        }
    }

    /// Drops entries whose TTL has lapsed. In-flight entries are never swept
    /// here; they end via `Guard::complete` or `Guard`'s drop.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, v| match v {
            Entry::Completed(c) => c.expires_at > now,
            Entry::InFlight { .. } => true,
        });
    }
}

/// Held by the caller that won the race to process a new `(key, digest)`
/// pair. Must call `complete` once the handler finishes; if dropped first
/// (panic, cancellation) the entry is released so a retry can proceed
/// instead of waiting forever on a holder that will never finish.
pub struct Guard<'a> {
    cache: &'a IdempotencyCache,
    key: String,
    body_digest: String,
    notify: Arc<Notify>,
    completed: bool,
}

impl<'a> Guard<'a> {
    pub fn complete(mut self, response: CapturedResponse) {
        self.cache.entries.insert(
            self.key.clone(),
            Entry::Completed(Completed {
                body_digest: self.body_digest.clone(),
                response,
                expires_at: Instant::now() + self.cache.ttl,
            }),
        );
        self.completed = true;
        self.notify.notify_waiters();
    }
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        if !self.completed {
            self.cache.entries.remove(&self.key);
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_request_proceeds_and_replay_returns_captured_response() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let key = IdempotencyCache::cache_key("POST", "/widgets", "abc");
        let digest = IdempotencyCache::digest(b"{}");

        let claim = cache.begin(key.clone(), &digest).await.unwrap();
        let Claim::Proceed(guard) = claim else { panic!("expected Proceed") };
        guard.complete(CapturedResponse { status: 201, body: json!({"id": "w1"}) });

        let claim2 = cache.begin(key, &digest).await.unwrap();
        let Claim::Replay(resp) = claim2 else { panic!("expected Replay") };
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, json!({"id": "w1"}));
    }

    #[tokio::test]
    async fn different_digest_same_key_is_conflict() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let key = IdempotencyCache::cache_key("POST", "/widgets", "abc");
        let claim = cache.begin(key.clone(), "d1").await.unwrap();
        let Claim::Proceed(guard) = claim else { panic!("expected Proceed") };
        guard.complete(CapturedResponse { status: 201, body: json!({}) });

        let err = cache.begin(key, "d2").await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn concurrent_in_flight_waits_then_replays() {
        let cache = Arc::new(IdempotencyCache::new(Duration::from_secs(60)));
        let key = IdempotencyCache::cache_key("POST", "/widgets", "abc");
        let digest = IdempotencyCache::digest(b"{}");

        let claim = cache.begin(key.clone(), &digest).await.unwrap();
        let Claim::Proceed(guard) = claim else { panic!("expected Proceed") };

        let cache2 = cache.clone();
        let key2 = key.clone();
        let digest2 = digest.clone();
        let waiter = tokio::spawn(async move { cache2.begin(key2, &digest2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        guard.complete(CapturedResponse { status: 200, body: json!({"ok": true}) });
        let claim2 = waiter.await.unwrap().unwrap();
        let Claim::Replay(resp) = claim2 else { panic!("expected Replay") };
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn dropped_guard_releases_entry_for_retry() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let key = IdempotencyCache::cache_key("POST", "/widgets", "abc");
        let digest = IdempotencyCache::digest(b"{}");

        {
            let claim = cache.begin(key.clone(), &digest).await.unwrap();
            let Claim::Proceed(_guard) = claim else { panic!("expected Proceed") };
            // _guard dropped here without completing.
        }

        let claim2 = cache.begin(key, &digest).await.unwrap();
        assert!(matches!(claim2, Claim::Proceed(_)));
    }

    #[tokio::test]
    async fn sweep_expired_drops_stale_completed_entries() {
        let cache = IdempotencyCache::new(Duration::from_millis(10));
        let key = IdempotencyCache::cache_key("POST", "/widgets", "abc");
        let digest = IdempotencyCache::digest(b"{}");
        let claim = cache.begin(key.clone(), &digest).await.unwrap();
        let Claim::Proceed(guard) = claim else { panic!("expected Proceed") };
        guard.complete(CapturedResponse { status: 201, body: json!({}) });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep_expired();

        let claim2 = cache.begin(key, &digest).await.unwrap();
        assert!(matches!(claim2, Claim::Proceed(_)));
    }
}
