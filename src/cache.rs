//! Process-wide byte cache for downloaded DICOM instances, keyed by SOP
//! Instance UID. Entries expire after a TTL and are evicted least-recently
//! used when an insert would exceed the byte budget.

use crate::config::InstanceCacheConfig;
use crate::types::UI;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

struct CachedInstance {
	payload: Bytes,
	created_at: Instant,
	/// Monotone access stamp; smallest value = least recently used.
	last_accessed: u64,
}

struct CacheInner {
	entries: HashMap<UI, CachedInstance>,
	current_bytes: u64,
	max_bytes: u64,
	ttl: Duration,
	enabled: bool,
	access_clock: u64,
}

impl CacheInner {
	fn next_stamp(&mut self) -> u64 {
		self.access_clock += 1;
		self.access_clock
	}

	fn remove(&mut self, sop_instance_uid: &str) -> Option<CachedInstance> {
		let removed = self.entries.remove(sop_instance_uid);
		if let Some(entry) = &removed {
			self.current_bytes -= entry.payload.len() as u64;
		}
		removed
	}

	/// Evicts the least-recently-used entry. Returns false on an empty cache.
	fn evict_one(&mut self) -> bool {
		let victim = self
			.entries
			.iter()
			.min_by_key(|(_, entry)| entry.last_accessed)
			.map(|(uid, _)| uid.clone());

		victim.is_some_and(|uid| {
			self.remove(&uid);
			true
		})
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
	pub entries: usize,
	pub current_bytes: u64,
	pub max_bytes: u64,
	pub enabled: bool,
}

impl CacheStats {
	pub fn hit_rate(&self) -> f64 {
		let total = self.hits + self.misses;
		if total == 0 {
			0.0
		} else {
			self.hits as f64 / total as f64
		}
	}
}

pub struct InstanceCache {
	inner: Mutex<CacheInner>,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

impl InstanceCache {
	pub fn new(config: &InstanceCacheConfig) -> Self {
		Self::with_limits(
			config.max_size_mb * BYTES_PER_MB,
			Duration::from_secs(config.ttl_minutes * 60),
			config.enabled,
		)
	}

	pub fn with_limits(max_bytes: u64, ttl: Duration, enabled: bool) -> Self {
		Self {
			inner: Mutex::new(CacheInner {
				entries: HashMap::new(),
				current_bytes: 0,
				max_bytes,
				ttl,
				enabled,
				access_clock: 0,
			}),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}

	pub fn get(&self, sop_instance_uid: &str) -> Option<Bytes> {
		let mut inner = self.inner.lock().expect("instance cache lock poisoned");
		if !inner.enabled {
			self.misses.fetch_add(1, Ordering::Relaxed);
			return None;
		}

		let expired = inner
			.entries
			.get(sop_instance_uid)
			.is_some_and(|entry| entry.created_at.elapsed() > inner.ttl);
		if expired {
			inner.remove(sop_instance_uid);
		}

		let stamp = inner.next_stamp();
		match inner.entries.get_mut(sop_instance_uid) {
			Some(entry) => {
				entry.last_accessed = stamp;
				self.hits.fetch_add(1, Ordering::Relaxed);
				Some(entry.payload.clone())
			}
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				None
			}
		}
	}

	pub fn put(&self, sop_instance_uid: &str, payload: Bytes) {
		let mut inner = self.inner.lock().expect("instance cache lock poisoned");
		if !inner.enabled {
			return;
		}

		// Replacement: drop the old payload from the accounting first.
		inner.remove(sop_instance_uid);

		let incoming = payload.len() as u64;
		while inner.current_bytes + incoming > inner.max_bytes && !inner.entries.is_empty() {
			if inner.evict_one() {
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}
		if inner.current_bytes + incoming > inner.max_bytes {
			debug!(
				sop_instance_uid,
				size = incoming,
				"Payload exceeds the cache budget on its own, not caching"
			);
			return;
		}

		let stamp = inner.next_stamp();
		inner.current_bytes += incoming;
		inner.entries.insert(
			UI::from(sop_instance_uid),
			CachedInstance {
				payload,
				created_at: Instant::now(),
				last_accessed: stamp,
			},
		);
	}

	pub fn remove(&self, sop_instance_uid: &str) {
		let mut inner = self.inner.lock().expect("instance cache lock poisoned");
		inner.remove(sop_instance_uid);
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock().expect("instance cache lock poisoned");
		inner.entries.clear();
		inner.current_bytes = 0;
	}

	/// Applies new limits at runtime, shrinking the cache if needed.
	/// Disabling drops all entries.
	pub fn configure(&self, max_size_mb: u64, ttl_minutes: u64, enabled: bool) {
		let mut inner = self.inner.lock().expect("instance cache lock poisoned");
		inner.max_bytes = max_size_mb * BYTES_PER_MB;
		inner.ttl = Duration::from_secs(ttl_minutes * 60);
		inner.enabled = enabled;

		if !enabled {
			inner.entries.clear();
			inner.current_bytes = 0;
			return;
		}

		while inner.current_bytes > inner.max_bytes && !inner.entries.is_empty() {
			if inner.evict_one() {
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	pub fn stats(&self) -> CacheStats {
		let inner = self.inner.lock().expect("instance cache lock poisoned");
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			entries: inner.entries.len(),
			current_bytes: inner.current_bytes,
			max_bytes: inner.max_bytes,
			enabled: inner.enabled,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn payload(len: usize) -> Bytes {
		Bytes::from(vec![0u8; len])
	}

	#[test]
	fn lru_eviction_on_byte_budget() {
		let cache = InstanceCache::with_limits(300, Duration::from_secs(60), true);
		cache.put("A", payload(120));
		cache.put("B", payload(120));
		cache.put("C", payload(120));

		let stats = cache.stats();
		assert_eq!(stats.evictions, 1);
		assert_eq!(stats.current_bytes, 240);
		assert_eq!(stats.entries, 2);
		assert!(cache.get("A").is_none());
		assert!(cache.get("B").is_some());
		assert!(cache.get("C").is_some());
	}

	#[test]
	fn recently_read_entries_survive_eviction() {
		let cache = InstanceCache::with_limits(300, Duration::from_secs(60), true);
		cache.put("A", payload(120));
		cache.put("B", payload(120));
		// Touch A so B becomes the eviction victim.
		assert!(cache.get("A").is_some());
		cache.put("C", payload(120));

		assert!(cache.get("A").is_some());
		assert!(cache.get("B").is_none());
	}

	#[test]
	fn ttl_expiry_counts_as_miss() {
		let cache = InstanceCache::with_limits(1024, Duration::ZERO, true);
		cache.put("A", payload(10));
		std::thread::sleep(Duration::from_millis(5));

		assert!(cache.get("A").is_none());
		let stats = cache.stats();
		assert_eq!(stats.misses, 1);
		assert_eq!(stats.entries, 0);
		assert_eq!(stats.current_bytes, 0);
	}

	#[test]
	fn replacement_adjusts_byte_accounting() {
		let cache = InstanceCache::with_limits(1024, Duration::from_secs(60), true);
		cache.put("A", payload(100));
		cache.put("A", payload(50));

		let stats = cache.stats();
		assert_eq!(stats.entries, 1);
		assert_eq!(stats.current_bytes, 50);
	}

	#[test]
	fn disabled_cache_is_inert() {
		let cache = InstanceCache::with_limits(1024, Duration::from_secs(60), false);
		cache.put("A", payload(10));
		assert!(cache.get("A").is_none());
		assert_eq!(cache.stats().entries, 0);
	}

	#[test]
	fn oversized_payload_is_not_cached() {
		let cache = InstanceCache::with_limits(100, Duration::from_secs(60), true);
		cache.put("A", payload(50));
		cache.put("B", payload(500));

		let stats = cache.stats();
		assert_eq!(stats.entries, 0);
		assert_eq!(stats.current_bytes, 0);
		assert_eq!(stats.evictions, 1);
	}

	#[test]
	fn hit_rate_is_zero_without_traffic() {
		let cache = InstanceCache::with_limits(1024, Duration::from_secs(60), true);
		assert!((cache.stats().hit_rate() - 0.0).abs() < f64::EPSILON);

		cache.put("A", payload(10));
		let _ = cache.get("A");
		let _ = cache.get("missing");
		assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
	}
}
