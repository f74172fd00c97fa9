//! Sharded, TTL-bounded DNS cache keyed by `(name, qtype, qclass)`, with
//! single-flight deduplication of concurrent misses and EDNS backwards-fixup
//! on serve (§4.4).

use std::collections::HashMap;
use std::collections::hash_map::{Entry as MapEntry, RandomState};
use std::hash::{BuildHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dns_types::{DomainName, Query, RecordClass, RecordType, Request, Response, Transport, Ttl};
use futures::FutureExt;
use futures::future::Shared;
use lru::LruCache;
use parking_lot::Mutex;

/// §6 default capacity.
pub const DEFAULT_CAPACITY: u32 = 1024;
/// §6 default TTL cap.
pub const DEFAULT_MAX_TTL: Ttl = Ttl::from_secs(600);

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("upstream transport error: {0}")]
    Transport(Arc<dns_types::Error>),
}

type BoxedExchange = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, Error>> + Send>>;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    name: DomainName,
    qtype: RecordType,
    qclass: RecordClass,
}

impl Key {
    fn of(query: &Query) -> Self {
        Key { name: query.domain(), qtype: query.qtype(), qclass: query.qclass() }
    }
}

struct CacheEntry {
    expiry: Instant,
    message: Response,
}

/// Process-wide, set-once hash seed shared by every shard/single-flight
/// lookup in this cache instance's process (§5: "the NAT and cache hash
/// seeds" are the only other global state besides the bind-to-ifindex
/// latch).
fn hash_seed() -> &'static RandomState {
    static SEED: OnceLock<RandomState> = OnceLock::new();
    SEED.get_or_init(RandomState::new)
}

fn hash_key(key: &Key) -> u64 {
    let mut hasher = hash_seed().build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

/// `min(16, next_power_of_two(available_parallelism))`: the spec does not
/// pin a shard count, and `freelru.NewSharded` likewise derives one from
/// the capacity rather than hard-coding it (§9 Open Question).
fn shard_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).next_power_of_two().min(16)
}

/// Sharded LRU keyed by `(name, qtype, qclass)`, TTL-bounded, with
/// single-flight coalescing of concurrent misses (§4.4).
pub struct Cache {
    shards: Vec<Mutex<LruCache<Key, CacheEntry>>>,
    min_ttl: Ttl,
    max_ttl: Ttl,
    inflight: Mutex<HashMap<u64, Shared<BoxedExchange>>>,
}

impl Cache {
    pub fn new(capacity: u32, min_ttl: Ttl, max_ttl: Ttl) -> Self {
        let shard_count = shard_count();
        let per_shard = NonZeroUsize::new((capacity as usize).max(shard_count) / shard_count).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count).map(|_| Mutex::new(LruCache::new(per_shard))).collect();

        Self { shards, min_ttl: min_ttl.min(max_ttl), max_ttl, inflight: Mutex::new(HashMap::new()) }
    }

    fn shard_for(&self, key: &Key) -> &Mutex<LruCache<Key, CacheEntry>> {
        let idx = (hash_key(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// §4.4 `LoadOrStore`. `request` is whatever shape the caller received
    /// off the wire; only the single-question shape is ever cached or
    /// deduplicated — zero questions short-circuits to a synthetic
    /// `FORMERR`, and more than one bypasses the cache and is forwarded to
    /// the constructor directly.
    pub async fn load_or_store(&self, request: &Request, transport: Arc<dyn Transport>) -> Result<Response, Error> {
        let query = match request {
            Request::NoQuestion { id } => return Ok(Response::formerr_for_id(*id)),
            Request::Multiple { bytes, .. } => {
                let raw = transport.exchange_raw(bytes).await.map_err(|e| Error::Transport(Arc::new(e)))?;
                return Response::parse_passthrough(raw).map_err(|e| Error::Transport(Arc::new(e)));
            }
            Request::Single(query) => query,
        };

        self.load_or_store_query(query, transport).await
    }

    /// The common path: `request` is already known to carry exactly one
    /// question. This is what `dns-client`'s `Lookup`/`Exchange` call
    /// directly, since every query it builds is already single-question.
    pub async fn load_or_store_query(&self, query: &Query, transport: Arc<dyn Transport>) -> Result<Response, Error> {
        let key = Key::of(query);
        let request_id = query.id();

        if let Some(response) = self.serve_live(&key, request_id, query) {
            return Ok(response);
        }

        let hash = hash_key(&key);
        let owned_query = query.clone();

        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.entry(hash) {
                MapEntry::Occupied(occupied) => occupied.get().clone(),
                MapEntry::Vacant(vacant) => {
                    let fut: BoxedExchange = Box::pin(async move {
                        let response = transport.exchange(&owned_query).await.map_err(|e| Error::Transport(Arc::new(e)))?;
                        Ok(response)
                    });
                    vacant.insert(fut.shared()).clone()
                }
            }
        };

        let result = shared.await;
        self.inflight.lock().remove(&hash);

        let response = result?;
        // Every racer that shares this constructor's result reaches this
        // line independently, so a NOERROR response is stored once per
        // racer rather than once per miss. `store` is idempotent (same
        // key, same data) so the redundancy is harmless; the alternative
        // of storing inside the single-flight future itself would need an
        // `Arc<Self>` receiver instead of `&self`.
        if response.response_code() == dns_types::ResponseCode::NOERROR {
            self.store(&response);
        }

        let response = response.with_id(request_id);
        Ok(response.edns_backwards_fixup(query.edns()))
    }

    /// Looks up a live entry and serves it with rewritten id/TTLs and
    /// EDNS fixup, or `None` on a miss/expiry (in which case any stale
    /// entry is removed).
    fn serve_live(&self, key: &Key, request_id: u16, query: &Query) -> Option<Response> {
        let mut shard = self.shard_for(key).lock();
        let now = Instant::now();

        let expiry = shard.get(key)?.expiry;
        if expiry <= now {
            shard.pop(key);
            return None;
        }

        let remaining = expiry.duration_since(now);
        if remaining.as_secs() < 1 {
            shard.pop(key);
            return None;
        }

        let ttl = Ttl::from_secs(remaining.as_secs() as u32);
        let message = shard.get(key)?.message.clone();
        let response = message.with_rewritten_ttls(ttl, request_id);
        Some(response.edns_backwards_fixup(query.edns()))
    }

    /// §4.4 `Store`: TTL is the minimum across Answer∪Ns∪Extra, clamped to
    /// `[min_ttl, max_ttl]`; TTLs ≤ 1s are rejected.
    pub fn store(&self, message: &Response) -> bool {
        if message.question_count() != 1 {
            return false;
        }

        let Some(ttl) = message.min_ttl() else { return false };
        let ttl = ttl.clamp(self.min_ttl, self.max_ttl);
        if ttl.as_secs() <= 1 {
            return false;
        }

        let key = Key { name: message.domain(), qtype: message.qtype(), qclass: message.qclass() };
        let expiry = Instant::now() + std::time::Duration::from_secs(ttl.as_secs().into());

        self.shard_for(&key).lock().put(key, CacheEntry { expiry, message: message.clone() });
        true
    }

    pub fn clear(&self) -> usize {
        self.shards.iter().map(|shard| std::mem::take(&mut *shard.lock()).len()).sum()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Ttl::from_secs(0), DEFAULT_MAX_TTL)
    }
}
