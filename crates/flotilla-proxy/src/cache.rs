//! Route cache — bounded TTL/LRU map from (tier, slug) to a target URL.
//!
//! Entries are immutable once created: invalidation and refresh replace
//! them wholesale, never mutate in place. The whole structure sits behind a
//! mutex; eviction order and TTL checks are not safe under unsynchronized
//! concurrent mutation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::host::{RouteKey, Tier};

/// A cached routing decision.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub target_url: String,
    /// Backend-native status observed at lookup time, for diagnostics.
    pub native_status: String,
    created_at: Instant,
}

struct Slot {
    entry: CacheEntry,
    last_used: Instant,
}

/// Bounded TTL/LRU route cache.
pub struct RouteCache {
    slots: Mutex<HashMap<RouteKey, Slot>>,
    ttl: Duration,
    capacity: usize,
}

impl RouteCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fetch a live entry, refreshing its LRU position. Expired entries are
    /// dropped on read.
    pub fn get(&self, key: &RouteKey) -> Option<CacheEntry> {
        let mut slots = self.slots.lock().expect("route cache lock");
        let now = Instant::now();
        match slots.get_mut(key) {
            Some(slot) if now.duration_since(slot.entry.created_at) < self.ttl => {
                slot.last_used = now;
                Some(slot.entry.clone())
            }
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a fresh entry, evicting the least-recently-used slot at
    /// capacity.
    pub fn insert(&self, key: RouteKey, target_url: String, native_status: String) {
        let mut slots = self.slots.lock().expect("route cache lock");
        let now = Instant::now();

        if !slots.contains_key(&key) && slots.len() >= self.capacity {
            if let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone())
            {
                debug!(slug = %oldest.slug, "evicting LRU route cache entry");
                slots.remove(&oldest);
            }
        }

        slots.insert(
            key,
            Slot {
                entry: CacheEntry {
                    target_url,
                    native_status,
                    created_at: now,
                },
                last_used: now,
            },
        );
    }

    /// Drop cached routes for a slug; with a tier, only that tier's entry.
    pub fn invalidate(&self, slug: &str, tier: Option<Tier>) {
        let mut slots = self.slots.lock().expect("route cache lock");
        slots.retain(|key, _| {
            !(key.slug == slug && tier.is_none_or(|t| key.tier == t))
        });
        debug!(slug, ?tier, "route cache invalidated");
    }

    /// Drop everything.
    pub fn flush(&self) {
        let mut slots = self.slots.lock().expect("route cache lock");
        let count = slots.len();
        slots.clear();
        debug!(count, "route cache flushed");
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("route cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tier: Tier, slug: &str) -> RouteKey {
        RouteKey {
            tier,
            slug: slug.to_string(),
        }
    }

    fn insert(cache: &RouteCache, tier: Tier, slug: &str, url: &str) {
        cache.insert(key(tier, slug), url.to_string(), "active".to_string());
    }

    #[test]
    fn hit_within_ttl() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "foo", "http://a.example");

        let entry = cache.get(&key(Tier::Apps, "foo")).unwrap();
        assert_eq!(entry.target_url, "http://a.example");
    }

    #[test]
    fn expired_entry_is_dropped_on_read() {
        let cache = RouteCache::new(Duration::ZERO, 8);
        insert(&cache, Tier::Apps, "foo", "http://a.example");

        assert!(cache.get(&key(Tier::Apps, "foo")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn tiers_are_distinct_keys() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "foo", "http://app.example");
        insert(&cache, Tier::Agents, "foo", "http://agent.example");

        assert_eq!(
            cache.get(&key(Tier::Apps, "foo")).unwrap().target_url,
            "http://app.example"
        );
        assert_eq!(
            cache.get(&key(Tier::Agents, "foo")).unwrap().target_url,
            "http://agent.example"
        );
    }

    #[test]
    fn invalidate_slug_drops_both_tiers() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "foo", "http://a.example");
        insert(&cache, Tier::Agents, "foo", "http://b.example");
        insert(&cache, Tier::Apps, "bar", "http://c.example");

        cache.invalidate("foo", None);
        assert!(cache.get(&key(Tier::Apps, "foo")).is_none());
        assert!(cache.get(&key(Tier::Agents, "foo")).is_none());
        assert!(cache.get(&key(Tier::Apps, "bar")).is_some());
    }

    #[test]
    fn invalidate_single_tier() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "foo", "http://a.example");
        insert(&cache, Tier::Agents, "foo", "http://b.example");

        cache.invalidate("foo", Some(Tier::Apps));
        assert!(cache.get(&key(Tier::Apps, "foo")).is_none());
        assert!(cache.get(&key(Tier::Agents, "foo")).is_some());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = RouteCache::new(Duration::from_secs(30), 2);
        insert(&cache, Tier::Apps, "a", "http://a.example");
        insert(&cache, Tier::Apps, "b", "http://b.example");

        // Touch "a" so "b" becomes the LRU entry.
        cache.get(&key(Tier::Apps, "a")).unwrap();

        insert(&cache, Tier::Apps, "c", "http://c.example");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(Tier::Apps, "a")).is_some());
        assert!(cache.get(&key(Tier::Apps, "b")).is_none());
        assert!(cache.get(&key(Tier::Apps, "c")).is_some());
    }

    #[test]
    fn reinsert_replaces_wholesale() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "foo", "http://old.example");
        insert(&cache, Tier::Apps, "foo", "http://new.example");

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&key(Tier::Apps, "foo")).unwrap().target_url,
            "http://new.example"
        );
    }

    #[test]
    fn flush_empties_the_cache() {
        let cache = RouteCache::new(Duration::from_secs(30), 8);
        insert(&cache, Tier::Apps, "a", "http://a.example");
        insert(&cache, Tier::Apps, "b", "http://b.example");

        cache.flush();
        assert!(cache.is_empty());
    }
}
