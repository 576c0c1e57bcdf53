//! SCO cache configuration surface.

use std::path::PathBuf;

/// One backing directory plus its capacity budget. `size` of
/// `u64::MAX` means "whatever the filesystem holds".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointConfig {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoCacheConfig {
    /// Free-space level at which cleanup starts evicting and the
    /// mountpoint starts choking ingest.
    #[serde(default = "defaults::trigger_gap")]
    pub trigger_gap: u64,

    /// Free-space level cleanup evicts towards. Must exceed the
    /// trigger gap.
    #[serde(default = "defaults::backoff_gap")]
    pub backoff_gap: u64,

    /// Weight added per recorded access; determines how quickly old
    /// access patterns decay relative to fresh ones.
    #[serde(default = "defaults::discount_factor")]
    pub discount_factor: f32,

    /// Base per-write delay applied while a mountpoint is choking.
    #[serde(default = "defaults::datastore_throttle_usecs")]
    pub datastore_throttle_usecs: u32,

    pub scocache_mount_points: Vec<MountPointConfig>,
}

mod defaults {
    pub(super) fn trigger_gap() -> u64 {
        256 << 20
    }

    pub(super) fn backoff_gap() -> u64 {
        512 << 20
    }

    pub(super) fn discount_factor() -> f32 {
        1.0e-4
    }

    pub(super) fn datastore_throttle_usecs() -> u32 {
        4000
    }
}

/// A rejected or suspicious configuration value, keyed by parameter
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigProblem {
    pub param: &'static str,
    pub reason: String,
}

impl ConfigProblem {
    pub fn new(param: &'static str, reason: impl Into<String>) -> Self {
        ConfigProblem {
            param,
            reason: reason.into(),
        }
    }
}

impl ScoCacheConfig {
    /// Validate a configuration before constructing a cache from it.
    pub fn check(&self) -> Vec<ConfigProblem> {
        let mut problems = Vec::new();

        if self.backoff_gap <= self.trigger_gap {
            problems.push(ConfigProblem::new(
                "backoff_gap",
                format!(
                    "must exceed trigger_gap ({} <= {})",
                    self.backoff_gap, self.trigger_gap
                ),
            ));
        }

        if self.scocache_mount_points.is_empty() {
            problems.push(ConfigProblem::new(
                "scocache_mount_points",
                "at least one mountpoint is required",
            ));
        }

        for mp in &self.scocache_mount_points {
            if mp.size == 0 {
                problems.push(ConfigProblem::new(
                    "scocache_mount_points",
                    format!("{}: capacity must be > 0", mp.path.display()),
                ));
            }
        }

        problems
    }

    /// Validate a config update against the running one. Mountpoints
    /// cannot be removed (or added) at runtime; a restart picks up
    /// such changes.
    pub fn check_update(&self, new: &ScoCacheConfig) -> Vec<ConfigProblem> {
        let mut problems = new.check();

        for mp in &self.scocache_mount_points {
            if !new.scocache_mount_points.iter().any(|m| m.path == mp.path) {
                problems.push(ConfigProblem::new(
                    "scocache_mount_points",
                    format!(
                        "removing mountpoint {} at runtime is not supported",
                        mp.path.display()
                    ),
                ));
            }
        }

        for mp in &new.scocache_mount_points {
            if !self.scocache_mount_points.iter().any(|m| m.path == mp.path) {
                problems.push(ConfigProblem::new(
                    "scocache_mount_points",
                    format!(
                        "adding mountpoint {} at runtime is not supported",
                        mp.path.display()
                    ),
                ));
            }
        }

        problems
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(paths: &[&str]) -> ScoCacheConfig {
        ScoCacheConfig {
            trigger_gap: 1 << 20,
            backoff_gap: 2 << 20,
            discount_factor: defaults::discount_factor(),
            datastore_throttle_usecs: defaults::datastore_throttle_usecs(),
            scocache_mount_points: paths
                .iter()
                .map(|p| MountPointConfig {
                    path: PathBuf::from(p),
                    size: 1 << 30,
                })
                .collect(),
        }
    }

    #[test]
    fn gaps_must_be_ordered() {
        let mut cfg = config(&["/mnt/a"]);
        cfg.backoff_gap = cfg.trigger_gap;
        assert_eq!(cfg.check()[0].param, "backoff_gap");
    }

    #[test]
    fn mountpoint_removal_is_reported() {
        let old = config(&["/mnt/a", "/mnt/b"]);
        let new = config(&["/mnt/a"]);

        let problems = old.check_update(&new);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].reason.contains("/mnt/b"));
        assert!(problems[0].reason.contains("not supported"));
    }

    #[test]
    fn unchanged_update_is_clean() {
        let cfg = config(&["/mnt/a", "/mnt/b"]);
        assert!(cfg.check_update(&cfg.clone()).is_empty());
    }
}
