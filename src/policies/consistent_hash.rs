//! Consistent hashing with bounded load (CHWBL)
//!
//! Every endpoint owns `replication` virtual points on a 64-bit ring placed at
//! `xxh64(name ‖ i)`. A lookup hashes the key, starts at the first point at or
//! after that hash (wrapping) and walks the ring until it meets an endpoint
//! that serves the requested adapter and whose in-flight count stays under
//! `((total + 1) / n) * load_factor`. When every candidate is over the bound the
//! first adapter match wins, so affinity is kept instead of blocking.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::core::endpoint_group::Endpoint;
use crate::metrics::DispatcherMetrics;

pub const DEFAULT_REPLICATION: u32 = 256;

pub fn hash_key(key: &str) -> u64 {
    xxh64(key.as_bytes(), 0)
}

fn replica_hash(name: &str, replica: u32) -> u64 {
    hash_key(&format!("{name}{replica}"))
}

/// `true` when an endpoint carrying `load` requests can take one more.
pub fn load_ok(load: i64, total_load: i64, endpoint_count: usize, load_factor: f64) -> bool {
    if total_load == 0 {
        return true;
    }
    // +1 accounts for the request being placed
    let avg_load = (total_load + 1) as f64 / endpoint_count as f64;
    (load + 1) as f64 <= avg_load * load_factor
}

/// Hash ring mapping virtual point hashes to endpoint names
#[derive(Debug, Clone)]
pub struct HashRing {
    replication: u32,
    ring: BTreeMap<u64, String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION)
    }
}

impl HashRing {
    pub fn new(replication: u32) -> Self {
        Self {
            replication: replication.max(1),
            ring: BTreeMap::new(),
        }
    }

    pub fn replication(&self) -> u32 {
        self.replication
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Sorted virtual point hashes
    pub fn hashes(&self) -> Vec<u64> {
        self.ring.keys().copied().collect()
    }

    pub fn add(&mut self, name: &str) {
        for i in 0..self.replication {
            self.ring.insert(replica_hash(name, i), name.to_string());
        }
    }

    pub fn remove(&mut self, name: &str) {
        for i in 0..self.replication {
            let h = replica_hash(name, i);
            if self.ring.get(&h).is_some_and(|owner| owner == name) {
                self.ring.remove(&h);
            }
        }
    }

    /// Rebuild with a different replication factor for the same endpoints.
    pub fn rebuild<'a>(&mut self, replication: u32, names: impl Iterator<Item = &'a String>) {
        self.replication = replication.max(1);
        self.ring.clear();
        let mut count = 0;
        for name in names {
            self.add(name);
            count += 1;
        }
        info!(
            "Rebuilt hash ring with {} endpoints and {} virtual nodes",
            count,
            self.ring.len()
        );
    }

    /// Bounded-load lookup. Returns the selected endpoint name, or `None` when
    /// no endpoint serves `adapter`.
    pub fn lookup<'a>(
        &'a self,
        key: &str,
        adapter: &str,
        load_factor: f64,
        endpoints: &HashMap<String, Endpoint>,
        total_in_flight: i64,
    ) -> Option<&'a str> {
        if self.ring.is_empty() {
            return None;
        }

        let h = hash_key(key);
        let start = self.ring.range(h..).chain(self.ring.range(..h));

        let mut default: Option<&'a str> = None;
        for (step, (point, name)) in start.enumerate() {
            if step == 0 {
                DispatcherMetrics::record_hash_lookup_initial(name);
            }
            let Some(endpoint) = endpoints.get(name) else {
                continue;
            };
            if !endpoint.serves(adapter) {
                continue;
            }
            if default.is_none() {
                default = Some(name);
            }
            if load_ok(
                endpoint.in_flight(),
                total_in_flight,
                endpoints.len(),
                load_factor,
            ) {
                debug!(
                    "CHWBL: key hash={:016x} point={:016x} -> endpoint='{}' after {} steps",
                    h,
                    point,
                    name,
                    step + 1
                );
                DispatcherMetrics::record_hash_lookup_iterations(step + 1);
                DispatcherMetrics::record_hash_lookup_final(name);
                return Some(name);
            }
        }

        if let Some(name) = default {
            DispatcherMetrics::record_hash_lookup_iterations(self.ring.len());
            DispatcherMetrics::record_hash_lookup_final(name);
            DispatcherMetrics::record_hash_lookup_default(name);
        }
        default
    }
}
