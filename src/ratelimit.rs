//! Per-source sliding-window rate limiting.
//!
//! Sharded by source IP the way the upstream router core shards its
//! `ShardedLruCache` in `app/gateway_fast.rs`, swapping the LRU-capacity
//! eviction for time-window eviction and `RwLock<LruCache>` for a plain
//! `Mutex<HashMap>` since every operation here both reads and mutates.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const SHARDS: usize = 16;

struct Shard {
    buckets: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

pub struct RateLimiter {
    shards: Vec<Shard>,
    limit: u32,
    window: Duration,
    fallopen_count: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let shards = (0..SHARDS).map(|_| Shard { buckets: Mutex::new(HashMap::new()) }).collect();
        RateLimiter { shards, limit, window, fallopen_count: AtomicU64::new(0) }
    }

    fn shard_for(&self, ip: &IpAddr) -> &Shard {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Appends the current timestamp, evicts stale entries, and permits the
    /// request only if the bucket length stays within `limit`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let shard = self.shard_for(&ip);
        let mut buckets = match shard.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.fallopen_count.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert_with(VecDeque::new);
        evict_stale(bucket, now, self.window);

        bucket.push_back(now);
        if bucket.len() <= self.limit as usize {
            true
        } else {
            bucket.pop_back();
            false
        }
    }

    /// Drops empty and fully-stale buckets across all shards.
    pub fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            if let Ok(mut buckets) = shard.buckets.lock() {
                buckets.retain(|_, bucket| {
                    evict_stale(bucket, now, self.window);
                    !bucket.is_empty()
                });
            }
        }
    }

    pub fn fallopen_count(&self) -> u64 {
        self.fallopen_count.load(Ordering::Relaxed)
    }
}

fn evict_stale(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = bucket.front() {
        if now.duration_since(front) > window {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

static INSTANCE: OnceLock<RateLimiter> = OnceLock::new();

pub fn init(limit: u32, window: Duration) {
    let _ = INSTANCE.set(RateLimiter::new(limit, window));
}

pub fn get() -> &'static RateLimiter {
    INSTANCE.get().expect("ratelimit::init must run before ratelimit::get")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn different_ips_have_independent_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.allow(a));
        assert!(limiter.allow(b));
        assert!(!limiter.allow(a));
    }

    #[test]
    fn sweep_removes_empty_buckets() {
        let limiter = RateLimiter::new(100, Duration::from_millis(1));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        let shard = limiter.shard_for(&ip);
        let buckets = shard.buckets.lock().unwrap();
        assert!(!buckets.contains_key(&ip));
    }

    #[test]
    fn hundredth_request_succeeds_101st_denied() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }
}
