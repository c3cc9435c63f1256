use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::StorageSettings;
use crate::core::gateway::ClusterResource;
use crate::core::queue::StorageMode;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Free bytes per pool for one run. Signed so an over-committed fallback
/// pick shows up as negative headroom instead of wrapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageStats {
    free: BTreeMap<String, i64>,
}

impl StorageStats {
    /// Builds the map from `/cluster/resources?type=storage`, keeping only
    /// pools on `node` that report their available bytes.
    pub fn from_resources(resources: &[ClusterResource], node: &str) -> Self {
        let free = resources
            .iter()
            .filter_map(|resource| match resource {
                ClusterResource::Storage {
                    node: pool_node,
                    storage,
                    avail: Some(avail),
                    ..
                } if pool_node == node => Some((storage.clone(), clamp(*avail))),
                _ => None,
            })
            .collect();
        Self { free }
    }

    pub fn from_free<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            free: pools.into_iter().map(|(name, bytes)| (name.into(), clamp(bytes))).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn free(&self, storage: &str) -> Option<i64> {
        self.free.get(storage).copied()
    }

    pub fn pools(&self) -> impl Iterator<Item = &str> {
        self.free.keys().map(String::as_str)
    }

    fn reserve(&mut self, storage: &str, bytes: u64) {
        if let Some(free) = self.free.get_mut(storage) {
            *free -= clamp(bytes);
        }
    }
}

fn clamp(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// One create item asking for a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRequest {
    pub item_id: String,
    pub mode: StorageMode,
    /// Pool chosen by the operator, meaningful for manual items only.
    pub storage: Option<String>,
    pub estimate_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageAssignment {
    pub item_id: String,
    pub storage: String,
    pub mode: StorageMode,
}

/// Greedy best-fit pool picker. Manual reservations are booked first so the
/// auto picks see the real remaining headroom.
#[derive(Debug, Clone)]
pub struct StorageAllocator {
    stats: StorageStats,
    candidates: Vec<String>,
    auto_select_best: bool,
    default_storage: String,
}

impl StorageAllocator {
    pub fn new(settings: &StorageSettings, stats: StorageStats) -> Self {
        let enabled_live: Vec<String> = settings
            .enabled
            .iter()
            .filter(|pool| stats.free(pool).is_some())
            .cloned()
            .collect();

        let candidates = if !enabled_live.is_empty() {
            enabled_live
        } else if !stats.is_empty() {
            stats.pools().map(str::to_string).collect()
        } else if !settings.enabled.is_empty() {
            settings.enabled.clone()
        } else {
            vec![settings.default_storage.clone()]
        };

        debug!(?candidates, "storage candidates resolved");
        Self {
            stats,
            candidates,
            auto_select_best: settings.auto_select_best,
            default_storage: settings.default_storage.clone(),
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    /// Assigns a pool to every request, preserving input order in the
    /// result.
    pub fn allocate(&mut self, requests: &[StorageRequest]) -> Vec<StorageAssignment> {
        let mut assigned: Vec<Option<StorageAssignment>> = vec![None; requests.len()];

        for (slot, request) in requests.iter().enumerate() {
            if request.mode != StorageMode::Manual {
                continue;
            }
            let storage = request
                .storage
                .clone()
                .unwrap_or_else(|| self.default_storage.clone());
            self.stats.reserve(&storage, request.estimate_bytes);
            debug!(item_id = %request.item_id, %storage, "manual storage reserved");
            assigned[slot] = Some(StorageAssignment {
                item_id: request.item_id.clone(),
                storage,
                mode: StorageMode::Manual,
            });
        }

        for (slot, request) in requests.iter().enumerate() {
            if request.mode != StorageMode::Auto {
                continue;
            }
            let storage = if self.auto_select_best {
                self.pick(request.estimate_bytes)
            } else {
                self.default_storage.clone()
            };
            self.stats.reserve(&storage, request.estimate_bytes);
            info!(
                item_id = %request.item_id,
                %storage,
                remaining = ?self.stats.free(&storage),
                "auto storage assigned"
            );
            assigned[slot] = Some(StorageAssignment {
                item_id: request.item_id.clone(),
                storage,
                mode: StorageMode::Auto,
            });
        }

        assigned.into_iter().flatten().collect()
    }

    /// Largest free pool that fits, else largest free pool, else the first
    /// configured candidate when there is no telemetry at all.
    pub fn pick(&self, estimate_bytes: u64) -> String {
        let estimate = clamp(estimate_bytes);
        let mut best_fit: Option<(&str, i64)> = None;
        let mut largest: Option<(&str, i64)> = None;

        for candidate in &self.candidates {
            let Some(free) = self.stats.free(candidate) else {
                continue;
            };
            if largest.map_or(true, |(_, top)| free > top) {
                largest = Some((candidate.as_str(), free));
            }
            if free >= estimate && best_fit.map_or(true, |(_, top)| free > top) {
                best_fit = Some((candidate.as_str(), free));
            }
        }

        if let Some((pool, _)) = best_fit {
            return pool.to_string();
        }
        if let Some((pool, free)) = largest {
            warn!(pool, free, estimate, "no storage fits the estimate, using the largest pool");
            return pool.to_string();
        }
        self.candidates
            .first()
            .cloned()
            .unwrap_or_else(|| self.default_storage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: &[&str]) -> StorageSettings {
        StorageSettings {
            enabled: enabled.iter().map(|s| s.to_string()).collect(),
            auto_select_best: true,
            default_storage: "local-lvm".to_string(),
            format: None,
        }
    }

    fn auto(id: &str, gib: u64) -> StorageRequest {
        StorageRequest {
            item_id: id.to_string(),
            mode: StorageMode::Auto,
            storage: None,
            estimate_bytes: gib * GIB,
        }
    }

    #[test]
    fn both_items_land_on_the_only_pool_that_fits_then_the_larger_one() {
        let stats = StorageStats::from_free([("pool-a", 50 * GIB), ("pool-b", 200 * GIB)]);
        let mut allocator = StorageAllocator::new(&settings(&["pool-a", "pool-b"]), stats);

        let out = allocator.allocate(&[auto("one", 128), auto("two", 128)]);

        assert_eq!(out[0].storage, "pool-b");
        assert_eq!(out[1].storage, "pool-b");
        let expected = (200 * GIB) as i64 - 2 * (128 * GIB) as i64;
        assert_eq!(allocator.stats().free("pool-b"), Some(expected));
        assert_eq!(allocator.stats().free("pool-a"), Some((50 * GIB) as i64));
    }

    #[test]
    fn auto_items_spread_once_the_largest_pool_shrinks() {
        let stats = StorageStats::from_free([("a", 300 * GIB), ("b", 250 * GIB)]);
        let mut allocator = StorageAllocator::new(&settings(&["a", "b"]), stats);

        let out = allocator.allocate(&[auto("1", 100), auto("2", 100), auto("3", 100)]);
        let pools: Vec<&str> = out.iter().map(|a| a.storage.as_str()).collect();
        assert_eq!(pools, ["a", "b", "a"]);
    }

    #[test]
    fn manual_reservations_shape_the_auto_picks() {
        let stats = StorageStats::from_free([("a", 300 * GIB), ("b", 250 * GIB)]);
        let mut allocator = StorageAllocator::new(&settings(&["a", "b"]), stats);

        let manual = StorageRequest {
            item_id: "m".into(),
            mode: StorageMode::Manual,
            storage: Some("a".into()),
            estimate_bytes: 100 * GIB,
        };
        // the auto item comes first in the queue but manual is booked first
        let out = allocator.allocate(&[auto("x", 100), manual]);

        assert_eq!(out[0].item_id, "x");
        assert_eq!(out[0].storage, "b");
        assert_eq!(out[1].storage, "a");
        assert_eq!(out[1].mode, StorageMode::Manual);
    }

    #[test]
    fn never_overcommits_when_a_fitting_pool_exists() {
        let stats = StorageStats::from_free([("small", 40 * GIB), ("big", 60 * GIB), ("mid", 45 * GIB)]);
        let allocator = StorageAllocator::new(&settings(&["small", "big", "mid"]), stats);
        assert_eq!(allocator.pick(42 * GIB), "big");
        assert_eq!(allocator.pick(100 * GIB), "big");
    }

    #[test]
    fn enabled_pools_missing_from_telemetry_fall_back_to_known_pools() {
        let stats = StorageStats::from_free([("zfs", 10 * GIB)]);
        let allocator = StorageAllocator::new(&settings(&["ceph"]), stats);
        assert_eq!(allocator.candidates(), ["zfs".to_string()]);
    }

    #[test]
    fn without_telemetry_the_first_configured_candidate_wins() {
        let allocator = StorageAllocator::new(&settings(&["ceph", "nfs"]), StorageStats::default());
        assert_eq!(allocator.pick(1), "ceph");
    }

    #[test]
    fn auto_select_disabled_uses_the_default_pool() {
        let mut cfg = settings(&["a", "b"]);
        cfg.auto_select_best = false;
        cfg.default_storage = "a".into();
        let stats = StorageStats::from_free([("a", 10 * GIB), ("b", 500 * GIB)]);
        let mut allocator = StorageAllocator::new(&cfg, stats);
        let out = allocator.allocate(&[auto("1", 5)]);
        assert_eq!(out[0].storage, "a");
    }

    #[test]
    fn stats_only_keep_pools_on_the_target_node() {
        let resources = vec![
            ClusterResource::Storage {
                node: "pve".into(),
                storage: "local-lvm".into(),
                avail: Some(5),
                total: Some(10),
            },
            ClusterResource::Storage {
                node: "other".into(),
                storage: "remote".into(),
                avail: Some(50),
                total: None,
            },
            ClusterResource::Qemu {
                node: "pve".into(),
                vmid: 100,
                name: None,
            },
        ];
        let stats = StorageStats::from_resources(&resources, "pve");
        assert_eq!(stats.free("local-lvm"), Some(5));
        assert_eq!(stats.free("remote"), None);
    }
}
