//! Router and local-node configuration surface.

use crate::object::{ClusterId, ClusterNodeConfig, NodeId};

pub use volgrid::config::ConfigProblem;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Microseconds to sleep between retries of transiently failing
    /// engine I/O.
    #[serde(default = "defaults::local_io_sleep_before_retry_usecs")]
    pub local_io_sleep_before_retry_usecs: u64,

    /// Retries before a transient engine fault is surfaced.
    #[serde(default = "defaults::local_io_retries")]
    pub local_io_retries: u32,

    /// Clusters per SCO for newly created volumes.
    #[serde(default = "defaults::sco_multiplier")]
    pub sco_multiplier: u32,

    /// Seconds between sweeps dropping unused per-object locks.
    #[serde(default = "defaults::lock_reaper_interval_secs")]
    pub lock_reaper_interval_secs: u64,
}

impl Default for LocalNodeConfig {
    fn default() -> LocalNodeConfig {
        LocalNodeConfig {
            local_io_sleep_before_retry_usecs: defaults::local_io_sleep_before_retry_usecs(),
            local_io_retries: defaults::local_io_retries(),
            sco_multiplier: defaults::sco_multiplier(),
            lock_reaper_interval_secs: defaults::lock_reaper_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// This node's id; must appear in `nodes`.
    pub id: NodeId,
    pub cluster_id: ClusterId,

    /// Cluster topology, including this node. Canonical node order is
    /// the order of node ids, not of this list.
    pub nodes: Vec<ClusterNodeConfig>,

    /// Redirects after which a remote volume is considered for auto
    /// migration. 0 disables.
    #[serde(default)]
    pub volume_read_threshold: u64,
    #[serde(default)]
    pub volume_write_threshold: u64,
    #[serde(default)]
    pub file_read_threshold: u64,
    #[serde(default)]
    pub file_write_threshold: u64,

    /// Once past the threshold, only every n-th redirect checks the
    /// local volume potential. Must be > 0.
    #[serde(default = "defaults::check_local_volume_potential_period")]
    pub check_local_volume_potential_period: u64,

    /// Bound on waiting for a remote to sync its volume to the
    /// backend during a transfer. 0 waits forever.
    #[serde(default = "defaults::backend_sync_timeout_ms")]
    pub backend_sync_timeout_ms: u64,

    /// Reply timeout of a transfer request.
    #[serde(default = "defaults::migrate_timeout_ms")]
    pub migrate_timeout_ms: u64,

    /// Reply timeout of redirected data requests.
    #[serde(default = "defaults::redirect_timeout_ms")]
    pub redirect_timeout_ms: u64,

    /// Steal attempts after a remote timeout before giving up.
    #[serde(default = "defaults::redirect_retries")]
    pub redirect_retries: u32,

    /// Times the router refetches the registration and retries an
    /// operation that could not find its object.
    #[serde(default = "defaults::routing_retries")]
    pub routing_retries: u32,

    #[serde(default = "defaults::min_workers")]
    pub min_workers: u16,
    #[serde(default = "defaults::max_workers")]
    pub max_workers: u16,

    #[serde(default = "defaults::registry_cache_capacity")]
    pub registry_cache_capacity: usize,

    #[serde(default)]
    pub local: LocalNodeConfig,
}

mod defaults {
    pub(super) fn local_io_sleep_before_retry_usecs() -> u64 {
        100_000
    }

    pub(super) fn local_io_retries() -> u32 {
        600
    }

    pub(super) fn sco_multiplier() -> u32 {
        1024
    }

    pub(super) fn lock_reaper_interval_secs() -> u64 {
        8 * 3600
    }

    pub(super) fn check_local_volume_potential_period() -> u64 {
        1
    }

    pub(super) fn backend_sync_timeout_ms() -> u64 {
        10_000
    }

    pub(super) fn migrate_timeout_ms() -> u64 {
        60_000
    }

    pub(super) fn redirect_timeout_ms() -> u64 {
        10_000
    }

    pub(super) fn redirect_retries() -> u32 {
        2
    }

    pub(super) fn routing_retries() -> u32 {
        10
    }

    pub(super) fn min_workers() -> u16 {
        4
    }

    pub(super) fn max_workers() -> u16 {
        16
    }

    pub(super) fn registry_cache_capacity() -> usize {
        1024
    }
}

impl RouterConfig {
    pub fn node_config(&self, node_id: &NodeId) -> Option<&ClusterNodeConfig> {
        self.nodes.iter().find(|n| &n.node_id == node_id)
    }

    pub fn check(&self) -> Vec<ConfigProblem> {
        let mut problems = Vec::new();

        if self.min_workers == 0 {
            problems.push(ConfigProblem::new("min_workers", "value must be > 0"));
        }

        if self.max_workers < self.min_workers {
            problems.push(ConfigProblem::new(
                "max_workers",
                "value must be >= min_workers",
            ));
        }

        if self.check_local_volume_potential_period == 0 {
            problems.push(ConfigProblem::new(
                "check_local_volume_potential_period",
                "value must be > 0",
            ));
        }

        if self.node_config(&self.id).is_none() {
            problems.push(ConfigProblem::new(
                "id",
                format!("node {} is not part of the cluster topology", self.id),
            ));
        }

        problems
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> RouterConfig {
        RouterConfig {
            id: NodeId::new("a"),
            cluster_id: ClusterId::new("cluster"),
            nodes: vec![ClusterNodeConfig {
                node_id: NodeId::new("a"),
                host: "127.0.0.1".into(),
                message_port: 12345,
                failovercache_port: 12346,
            }],
            volume_read_threshold: 0,
            volume_write_threshold: 0,
            file_read_threshold: 0,
            file_write_threshold: 0,
            check_local_volume_potential_period: 1,
            backend_sync_timeout_ms: 1000,
            migrate_timeout_ms: 1000,
            redirect_timeout_ms: 1000,
            redirect_retries: 2,
            routing_retries: 2,
            min_workers: 2,
            max_workers: 4,
            registry_cache_capacity: 16,
            local: LocalNodeConfig::default(),
        }
    }

    #[test]
    fn worker_bounds_are_checked() {
        let mut cfg = config();
        cfg.min_workers = 0;
        assert!(cfg.check().iter().any(|p| p.param == "min_workers"));

        let mut cfg = config();
        cfg.max_workers = 1;
        cfg.min_workers = 2;
        assert!(cfg.check().iter().any(|p| p.param == "max_workers"));
    }

    #[test]
    fn potential_period_must_be_positive() {
        let mut cfg = config();
        cfg.check_local_volume_potential_period = 0;
        assert!(!cfg.check().is_empty());
    }

    #[test]
    fn own_node_must_be_in_topology() {
        let mut cfg = config();
        cfg.id = NodeId::new("elsewhere");
        assert!(cfg.check().iter().any(|p| p.param == "id"));
    }
}
