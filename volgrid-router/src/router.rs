//! Per-cluster entry point for volume operations.
//!
//! Every data operation is routed to the node the registry lists as
//! the object's owner: the local node executes it, a remote one gets
//! it over the message channel. Misdirected requests refetch the
//! registration and retry; a timed-out remote may get its volume
//! stolen (if the registry agrees it is offline); sustained redirects
//! trigger auto-migration towards the caller.

use crate::{
    config::{ConfigProblem, RouterConfig},
    engine::{ContainerDriver, VolumeEngine},
    events::{Event, EventPublisher},
    local::{CloneFileFlags, DtlTopology, LocalNode, ScrubCounts},
    node::{ClusterNode, RemoteNode},
    object::{ClusterId, ClusterNodeConfig, NodeId, Object, ObjectId, ObjectType, SnapshotName},
    pool::{Handler, WorkerPool},
    protocol::{self, Frame, RequestKind, ResponseKind},
    registry::{
        CachedObjectRegistry, ClusterRegistry, FailoverCacheConfig, FailoverCacheMode,
        FocConfigMode, NodeState, ObjectRegistration, ObjectRegistry, Sequence,
    },
    Error, Result,
};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use std::{
    collections::{BTreeMap, HashMap},
    convert::TryFrom,
    net::SocketAddr,
    sync::Arc,
    thread,
    time::Duration,
};

// Nap table of the routing loop, indexed by attempt, saturating.
const ROUTING_NAP_USECS: [u64; 11] = [
    100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400,
];

fn maybe_take_a_nap(attempt: u32) {
    if attempt > 0 {
        let idx = ((attempt - 1) as usize).min(ROUTING_NAP_USECS.len() - 1);
        thread::sleep(Duration::from_micros(ROUTING_NAP_USECS[idx]));
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RedirectKind {
    Reads,
    Writes,
}

#[derive(Default)]
struct RedirectCounters {
    reads: u64,
    writes: u64,
}

type ObjectOp<'a, T> = &'a mut dyn FnMut(&ClusterNode, &Object) -> Result<T>;

pub struct ObjectRouter {
    config: RwLock<RouterConfig>,
    local: Arc<LocalNode>,
    nodes: RwLock<HashMap<NodeId, Arc<ClusterNode>>>,
    registry: Arc<CachedObjectRegistry>,
    cluster_registry: Arc<dyn ClusterRegistry>,
    publisher: Arc<dyn EventPublisher>,
    redirects: Mutex<HashMap<ObjectId, RedirectCounters>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl ObjectRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        object_registry: Arc<dyn ObjectRegistry>,
        cluster_registry: Arc<dyn ClusterRegistry>,
        engine: Arc<dyn VolumeEngine>,
        files: Arc<dyn ContainerDriver>,
        backend: Arc<dyn volgrid::Backend>,
        publisher: Arc<dyn EventPublisher>,
        foc_config_mode: FocConfigMode,
        foc_mode: FailoverCacheMode,
        manual_foc_config: Option<FailoverCacheConfig>,
    ) -> Result<Arc<ObjectRouter>> {
        if let Some(p) = config.check().first() {
            return Err(Error::InvalidConfiguration(format!(
                "{}: {}",
                p.param, p.reason
            )));
        }

        let node_config = config
            .node_config(&config.id)
            .expect("checked above")
            .clone();

        let registry = Arc::new(CachedObjectRegistry::new(
            object_registry,
            config.registry_cache_capacity,
        ));

        let dtl = DtlTopology {
            node_id: config.id.clone(),
            mode: foc_config_mode,
            foc_mode,
            manual_config: manual_foc_config,
            nodes: config.nodes.clone(),
        };

        let local = LocalNode::new(
            node_config,
            config.local.clone(),
            engine,
            files,
            backend,
            Arc::clone(&registry),
            dtl,
        );

        let router = Arc::new(ObjectRouter {
            nodes: RwLock::new(HashMap::new()),
            local,
            registry,
            cluster_registry,
            publisher,
            redirects: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            config: RwLock::new(config),
        });

        router.rebuild_node_map_();
        Ok(router)
    }

    pub fn node_id(&self) -> NodeId {
        self.local.node_id().clone()
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.config.read().cluster_id.clone()
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn object_registry(&self) -> &Arc<CachedObjectRegistry> {
        &self.registry
    }

    pub fn scrub_counts(&self) -> ScrubCounts {
        self.local.scrub_counts()
    }

    /// Bind the message address and start serving peers.
    pub fn start_message_server(self: &Arc<Self>) -> Result<SocketAddr> {
        let weak = Arc::downgrade(self);
        let handler: Handler = Arc::new(move |frame| {
            let tag = frame.tag;
            match weak.upgrade() {
                Some(router) => router.handle_frame_(frame),
                None => Frame::response(ResponseKind::IoError, tag, Vec::new(), Vec::new()),
            }
        });

        let (addr, min, max) = {
            let config = self.config.read();
            let own = config.node_config(&config.id).expect("validated at build");
            (own.message_addr(), config.min_workers, config.max_workers)
        };

        let pool = WorkerPool::new(
            format!("vrouter-{}", self.node_id()),
            &addr,
            handler,
            min,
            max,
        )?;
        let local_addr = pool.local_addr();

        *self.pool.lock() = Some(pool);
        Ok(local_addr)
    }

    pub fn stop_message_server(&self) {
        *self.pool.lock() = None;
    }

    /// Re-read the cluster topology, rebuilding remote-node channels
    /// and the DTL layout.
    pub fn update_cluster_node_configs(&self, nodes: Vec<ClusterNodeConfig>) -> Result<()> {
        {
            let mut config = self.config.write();
            if !nodes.iter().any(|n| n.node_id == config.id) {
                return Err(Error::InvalidConfiguration(format!(
                    "node {} is not part of the new topology",
                    config.id
                )));
            }
            config.nodes = nodes;
        }

        self.rebuild_node_map_();
        Ok(())
    }

    fn rebuild_node_map_(&self) {
        let config = self.config.read();
        let redirect_timeout = Duration::from_millis(config.redirect_timeout_ms);
        let migrate_timeout = Duration::from_millis(config.migrate_timeout_ms);

        let mut map = HashMap::new();
        for node in &config.nodes {
            let cluster_node = if node.node_id == config.id {
                ClusterNode::Local(Arc::clone(&self.local))
            } else {
                ClusterNode::Remote(RemoteNode::new(
                    node.clone(),
                    redirect_timeout,
                    migrate_timeout,
                ))
            };
            map.insert(node.node_id.clone(), Arc::new(cluster_node));
        }

        self.local.update_dtl_topology(DtlTopology {
            node_id: config.id.clone(),
            mode: self.local_dtl_mode_(),
            foc_mode: self.local_dtl_foc_mode_(),
            manual_config: self.local_dtl_manual_(),
            nodes: config.nodes.clone(),
        });

        *self.nodes.write() = map;
    }

    // The DTL mode/config parts of the topology don't change with the
    // node map; fetch the current values back out of the local node.
    fn local_dtl_mode_(&self) -> FocConfigMode {
        self.local.dtl_topology().mode
    }

    fn local_dtl_foc_mode_(&self) -> FailoverCacheMode {
        self.local.dtl_topology().foc_mode
    }

    fn local_dtl_manual_(&self) -> Option<FailoverCacheConfig> {
        self.local.dtl_topology().manual_config
    }

    /// Re-apply a changed configuration; scalar routing parameters
    /// and the worker pool bounds apply online.
    pub fn update_config(&self, new: &RouterConfig) -> Vec<ConfigProblem> {
        let mut problems = new.check();

        {
            let config = self.config.read();
            if new.nodes != config.nodes {
                problems.push(ConfigProblem::new(
                    "nodes",
                    "topology changes go through update_cluster_node_configs",
                ));
            }
        }

        if !problems.is_empty() {
            return problems;
        }

        {
            let pool = self.pool.lock();
            if let Some(pool) = &*pool {
                if let Err(e) = pool.resize(new.min_workers, new.max_workers) {
                    error!("failed to resize worker pool: {}", e);
                    problems.push(ConfigProblem::new("min_workers", e.to_string()));
                    return problems;
                }
            }
        }

        self.local.update_config(&new.local);

        let mut config = self.config.write();
        let nodes = config.nodes.clone();
        *config = new.clone();
        config.nodes = nodes;

        problems
    }

    // --- routing core --------------------------------------------------

    fn find_node_(&self, node_id: &NodeId) -> Result<Arc<ClusterNode>> {
        self.nodes.read().get(node_id).cloned().ok_or_else(|| {
            error!("cannot find node {} in the local config", node_id);
            Error::InvalidConfiguration(format!("cannot find node {}", node_id))
        })
    }

    fn local_cluster_node_(&self) -> Result<Arc<ClusterNode>> {
        self.find_node_(self.local.node_id())
    }

    /// Route one operation to the object's owner, looping over
    /// registration refetches while the object cannot be found where
    /// the registry said it was.
    fn route_<T>(
        &self,
        id: &ObjectId,
        attempt_theft: bool,
        op: ObjectOp<T>,
    ) -> Result<(T, bool)> {
        let retries = self.config.read().routing_retries;
        let mut reg = self.registry.find_or_fail(id, false)?;

        for attempt in 0..=retries {
            if attempt > 0 {
                reg = self.registry.find_or_fail(id, true)?;
            }

            debug!("{}: purportedly hosted by {}", id, reg.node_id);

            match self.maybe_steal_(&reg, attempt_theft, &mut *op) {
                Err(e) if e.is_ownership_related() => {
                    debug!(
                        "{}: routing attempt {} failed, the object could (temporarily?) not be found: {}",
                        id, attempt, e
                    );
                    if attempt == retries {
                        error!("{}: object location not found, giving up", id);
                        return Err(e);
                    }
                    maybe_take_a_nap(attempt + 1);
                }
                other => return other,
            }
        }

        unreachable!("loop returns on the last attempt");
    }

    /// Invoke `op` on the owner. A remote timeout may lead to theft:
    /// assert the owner offline in the registry, migrate ownership to
    /// ourselves, restart from the backend, run the operation
    /// locally.
    fn maybe_steal_<T>(
        &self,
        reg: &ObjectRegistration,
        attempt_theft: bool,
        op: ObjectOp<T>,
    ) -> Result<(T, bool)> {
        let obj = reg.object();
        let mut retry = 0u32;

        loop {
            let node = self.find_node_(&reg.node_id)?;
            let remote = node.is_remote();

            match op(&node, &obj) {
                Err(Error::RequestTimeout) => {
                    error!("{}: remote node {} timed out", reg.id, reg.node_id);

                    if self.cluster_registry.node_state(&reg.node_id)? == NodeState::Online {
                        self.publisher.publish(Event::RedirectTimeoutWhileOnline {
                            node: reg.node_id.clone(),
                        });
                    }

                    if !attempt_theft {
                        debug!("not even attempting to steal {} from {}", reg.id, reg.node_id);
                        return Err(Error::RequestTimeout);
                    }

                    if self.steal_(reg, true)? {
                        info!("{}: retrying I/O after stealing", reg.id);
                        let local = self.local_cluster_node_()?;
                        return op(&local, &obj).map(|t| (t, false));
                    }

                    retry += 1;
                    if retry > self.config.read().redirect_retries {
                        return Err(Error::RequestTimeout);
                    }
                    debug!(
                        "node {}, object {}: making another attempt",
                        reg.node_id, reg.id
                    );
                }
                other => return other.map(|t| (t, remote)),
            }
        }
    }

    fn steal_(&self, reg: &ObjectRegistration, only_steal_if_offline: bool) -> Result<bool> {
        info!(
            "checking whether we should steal {} from {}, only steal if offline: {}",
            reg.id, reg.node_id, only_steal_if_offline
        );
        debug_assert!(reg.node_id != *self.local.node_id());

        let mut seq = Sequence::new();
        if only_steal_if_offline {
            seq.prepare_node_offline_assertion(&reg.node_id);
        }
        seq.prepare_migrate(&reg.id, &reg.node_id, self.local.node_id());

        match self.registry.run_sequence("steal volume", seq) {
            Ok(()) => {}
            Err(Error::NodeNotOffline(_)) | Err(Error::WrongOwner { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.registry.drop_entry(&reg.id);
        info!("registry updated, we're now owner of {}", reg.id);

        // force the restart: the previous owner's failover cache can
        // be ignored, its data was synced or is lost with the node
        self.backend_restart_(&reg.object(), true, &mut |_| Ok(()))?;

        self.publisher.publish(Event::OwnershipStolen {
            id: reg.id.clone(),
            from: reg.node_id.clone(),
        });

        info!("{}: successfully stolen from {}", reg.id, reg.node_id);
        Ok(true)
    }

    fn backend_restart_(
        &self,
        obj: &Object,
        force: bool,
        prepare: &mut dyn FnMut(&Object) -> Result<()>,
    ) -> Result<()> {
        self.local.backend_restart(obj, force, prepare)?;
        self.redirects.lock().remove(&obj.id);
        Ok(())
    }

    // --- auto migration ------------------------------------------------

    fn data_op_<T>(
        &self,
        id: &ObjectId,
        kind: RedirectKind,
        op: ObjectOp<T>,
    ) -> Result<T> {
        let (result, remote) = self.route_(id, true, op)?;

        if remote && self.migrate_pred_(id, kind)? {
            info!("{}: investigating auto migration", id);

            // don't trust the possibly outdated cached registration
            let reg = self.registry.find_or_fail(id, true)?;
            if reg.node_id == *self.local.node_id() {
                info!("{}: already migrated here while we were trying remote", id);
            } else {
                info!("{}: attempting auto migration from {}", id, reg.node_id);

                match self.migrate_reg_(&reg, true, true) {
                    Ok(()) => info!("{}: auto migration from {} done", id, reg.node_id),
                    Err(Error::RemoteTimeout) => {
                        warn!("{}: remote node reported timeout", id)
                    }
                    Err(e) => {
                        let now = self.registry.find(id, true).ok().flatten();
                        if now.map(|r| r.node_id == *self.local.node_id()).unwrap_or(false) {
                            info!("{}: already migrated here while we were trying to do that ourselves", id);
                        } else {
                            warn!("failed to automigrate {}: {}", id, e);
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    // Count the redirect and decide whether migrating the object here
    // is worth a shot.
    fn migrate_pred_(&self, id: &ObjectId, kind: RedirectKind) -> Result<bool> {
        let reg = self.registry.find_or_fail(id, false)?;
        let is_volume = reg.object_type != ObjectType::File;

        let (threshold, period) = {
            let config = self.config.read();
            let threshold = match (is_volume, kind) {
                (true, RedirectKind::Reads) => config.volume_read_threshold,
                (true, RedirectKind::Writes) => config.volume_write_threshold,
                (false, RedirectKind::Reads) => config.file_read_threshold,
                (false, RedirectKind::Writes) => config.file_write_threshold,
            };
            (threshold, config.check_local_volume_potential_period)
        };

        let counter = {
            let mut redirects = self.redirects.lock();
            let counters = redirects.entry(id.clone()).or_default();
            match kind {
                RedirectKind::Reads => {
                    counters.reads += 1;
                    counters.reads
                }
                RedirectKind::Writes => {
                    counters.writes += 1;
                    counters.writes
                }
            }
        };

        if threshold == 0 || counter < threshold {
            return Ok(false);
        }

        if !is_volume {
            return Ok(true);
        }

        if (counter - threshold) % period != 0 {
            return Ok(false);
        }

        info!("{}: checking volume potential of local node", id);
        match self.local.volume_potential() {
            Ok(potential) => Ok(potential > 0),
            Err(e) => {
                error!(
                    "{}: failed to determine volume potential of local node: {} - rather not migrating here",
                    id, e
                );
                Ok(false)
            }
        }
    }

    fn migrate_reg_(
        &self,
        reg: &ObjectRegistration,
        only_steal_if_offline: bool,
        force: bool,
    ) -> Result<()> {
        let from = &reg.node_id;
        info!(
            "trying to migrate {} from {}, only steal if offline: {}",
            reg.id, from, only_steal_if_offline
        );

        if from == self.local.node_id() {
            return self
                .local
                .backend_restart(&reg.object(), force, &mut |_| Ok(()));
        }

        let node = self.find_node_(from)?;
        let sync_timeout_ms = self.config.read().backend_sync_timeout_ms;
        let target = self.node_id();

        let result = self.backend_restart_(&reg.object(), force, &mut |obj| match &*node {
            ClusterNode::Remote(remote) => remote.transfer(obj, &target, sync_timeout_ms),
            ClusterNode::Local(_) => Err(Error::InvalidOperation(
                "cannot transfer from ourselves".into(),
            )),
        });

        match result {
            Err(Error::RequestTimeout) => {
                error!("{}: remote node {} timed out while migrating", reg.id, from);
                if self.steal_(reg, only_steal_if_offline)? {
                    Ok(())
                } else {
                    Err(Error::RequestTimeout)
                }
            }
            other => other,
        }
    }

    /// Explicit (management-driven) migration of an object to this
    /// node.
    pub fn migrate(&self, id: &ObjectId, force: bool) -> Result<()> {
        info!("migrating {}", id);
        let reg = self.registry.find_or_fail(id, true)?;
        self.migrate_reg_(&reg, false, force)
    }

    // --- data operations -----------------------------------------------

    pub fn write(&self, id: &ObjectId, buf: &[u8], offset: u64) -> Result<usize> {
        debug!("{}: write size {}, off {}", id, buf.len(), offset);

        self.data_op_(id, RedirectKind::Writes, &mut |node, obj| {
            let mut size = buf.len();
            node.write(obj, buf, &mut size, offset)?;
            Ok(size)
        })
    }

    pub fn read(&self, id: &ObjectId, buf: &mut [u8], offset: u64) -> Result<usize> {
        debug!("{}: read size {}, off {}", id, buf.len(), offset);

        let capacity = buf.len();
        self.data_op_(id, RedirectKind::Reads, &mut |node, obj| {
            let mut size = capacity;
            node.read(obj, buf, &mut size, offset)?;
            Ok(size)
        })
    }

    pub fn sync(&self, id: &ObjectId) -> Result<()> {
        self.route_(id, true, &mut |node, obj| node.sync(obj))
            .map(|(r, _)| r)
    }

    pub fn get_size(&self, id: &ObjectId) -> Result<u64> {
        self.route_(id, true, &mut |node, obj| node.get_size(obj))
            .map(|(r, _)| r)
    }

    pub fn resize(&self, id: &ObjectId, new_size: u64) -> Result<()> {
        self.route_(id, true, &mut |node, obj| node.resize(obj, new_size))
            .map(|(r, _)| r)
    }

    /// Unlink routes to the owner (no theft) and treats a missing
    /// registration as idempotent success: the object is gone, which
    /// is what was asked for.
    pub fn unlink(&self, id: &ObjectId) -> Result<()> {
        info!("unlinking {}", id);

        match self
            .route_(id, false, &mut |node, obj| node.unlink(obj))
            .map(|(r, _)| r)
        {
            Err(Error::ObjectNotRegistered(_)) => {
                warn!("{} is not registered (anymore)", id);
                Ok(())
            }
            other => other,
        }
    }

    pub fn ping(&self, node_id: &NodeId) -> Result<()> {
        if node_id == self.local.node_id() {
            warn!("not pinging ourselves");
            return Ok(());
        }

        let node = self.find_node_(node_id)?;
        match &*node {
            ClusterNode::Remote(remote) => {
                let pong = remote.ping(self.local.node_id())?;
                debug!("{}: pong from {}", node_id, pong);
                Ok(())
            }
            ClusterNode::Local(_) => Ok(()),
        }
    }

    // --- lifecycle (always local) --------------------------------------

    pub fn create(&self, obj: &Object) -> Result<()> {
        info!("creating {}", obj);
        self.local.create(obj)
    }

    pub fn create_clone(
        &self,
        clone_id: &ObjectId,
        parent_id: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        info!(
            "cloning volume {} from parent {}, snapshot {:?}",
            clone_id, parent_id, parent_snapshot
        );
        self.local.create_clone(clone_id, parent_id, parent_snapshot)
    }

    pub fn clone_to_existing_volume(
        &self,
        clone_id: &ObjectId,
        parent_id: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        info!(
            "cloning to existing volume {} from parent {}, snapshot {:?}",
            clone_id, parent_id, parent_snapshot
        );
        self.local
            .clone_to_existing_volume(clone_id, parent_id, parent_snapshot)
    }

    pub fn vaai_copy(
        &self,
        src_id: &ObjectId,
        maybe_dst_id: Option<&ObjectId>,
        timeout: Duration,
        flags: CloneFileFlags,
    ) -> Result<()> {
        info!("copying {} to {:?}", src_id, maybe_dst_id);

        let mut create_clone = |snap: &SnapshotName| {
            let dst = maybe_dst_id.ok_or_else(|| {
                Error::InvalidOperation("guarded copy needs a destination id".into())
            })?;
            self.local.create_clone(dst, src_id, Some(snap))
        };

        self.local
            .vaai_copy(src_id, maybe_dst_id, timeout, flags, &mut create_clone)
    }

    pub fn vaai_filecopy(&self, src_id: &ObjectId, dst_id: &ObjectId) -> Result<()> {
        info!("copying file {} to {}", src_id, dst_id);
        self.local.vaai_filecopy(src_id, dst_id)
    }

    pub fn set_volume_as_template(&self, id: &ObjectId) -> Result<()> {
        self.local.set_volume_as_template(id)
    }

    pub fn rollback_volume(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        info!("rolling back {} to snapshot {}", id, snap);
        self.local.rollback_volume(id, snap)
    }

    pub fn create_snapshot(&self, id: &ObjectId) -> Result<SnapshotName> {
        self.local.create_snapshot(id)
    }

    pub fn list_snapshots(&self, id: &ObjectId) -> Result<Vec<SnapshotName>> {
        self.local.list_snapshots(id)
    }

    pub fn delete_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        info!("deleting snapshot {} from {}", snap, id);
        self.local.delete_snapshot(id, snap)
    }

    pub fn get_scrub_work(
        &self,
        id: &ObjectId,
        start_snap: Option<&SnapshotName>,
        end_snap: Option<&SnapshotName>,
    ) -> Result<Vec<String>> {
        self.local.get_scrub_work(id, start_snap, end_snap)
    }

    pub fn apply_scrub_result(&self, id: &ObjectId, result: &str) -> Result<()> {
        self.local.apply_scrub_result(id, result)
    }

    // --- restart / stop ------------------------------------------------

    /// Restart the object here if the registry agrees we own it; if
    /// another node does, drop any local leftovers instead.
    pub fn maybe_restart(&self, id: &ObjectId, force: bool) -> Result<bool> {
        let reg = self.registry.find_or_fail(id, true)?;

        if reg.node_id != *self.local.node_id() {
            info!("not restarting {} here, it's running on {}", id, reg.node_id);
            self.local.remove_local_data(&reg.object())?;
            Ok(false)
        } else {
            self.local.local_restart(&reg, force)?;
            Ok(true)
        }
    }

    pub fn restart(&self, id: &ObjectId, force: bool) -> Result<()> {
        if self.maybe_restart(id, force)? {
            Ok(())
        } else {
            Err(Error::NotRunningHere(id.clone()))
        }
    }

    pub fn stop(&self, id: &ObjectId, delete_local_data: bool) -> Result<()> {
        info!("attempting to stop {}", id);

        let reg = self.registry.find_or_fail(id, true)?;
        if reg.node_id != *self.local.node_id() {
            error!(
                "{} is not running here ({}) but on {}",
                id,
                self.local.node_id(),
                reg.node_id
            );
            return Err(Error::NotRunningHere(id.clone()));
        }

        self.local.stop(&reg.object(), delete_local_data)
    }

    // --- node state ----------------------------------------------------

    pub fn mark_node_offline(&self, node_id: &NodeId) -> Result<()> {
        if node_id == self.local.node_id() {
            error!("cannot set self offline: {}", node_id);
            return Err(Error::CannotSetSelfOffline);
        }
        self.cluster_registry
            .set_node_state(node_id, NodeState::Offline)
    }

    pub fn mark_node_online(&self, node_id: &NodeId) -> Result<()> {
        self.cluster_registry
            .set_node_state(node_id, NodeState::Online)
    }

    pub fn node_status_map(&self) -> BTreeMap<NodeId, NodeState> {
        self.cluster_registry.node_status_map()
    }

    pub fn local_volume_potential(&self) -> Result<u64> {
        self.local.volume_potential()
    }

    // --- failover cache ------------------------------------------------

    pub fn get_foc_config_mode(&self, id: &ObjectId) -> Result<FocConfigMode> {
        self.local.foc_config_mode(id)
    }

    pub fn set_manual_foc_config(
        &self,
        id: &ObjectId,
        config: Option<&FailoverCacheConfig>,
    ) -> Result<()> {
        self.local.set_manual_foc_config(id, config)
    }

    pub fn set_automatic_foc_config(&self, id: &ObjectId) -> Result<()> {
        self.local.set_automatic_foc_config(id)
    }

    // --- message handling ----------------------------------------------

    fn handle_frame_(&self, frame: Frame) -> Frame {
        let tag = frame.tag;

        let kind = match RequestKind::try_from(frame.kind) {
            Ok(kind) => kind,
            Err(k) => {
                error!("got unexpected request type {}", k);
                return Frame::response(ResponseKind::UnknownRequest, tag, Vec::new(), Vec::new());
            }
        };

        match self.dispatch_(kind, &frame) {
            Ok((record, payload)) => Frame::response(ResponseKind::Ok, tag, record, payload),
            Err(e) => {
                let response = match &e {
                    Error::NotRunningHere(_)
                    | Error::ObjectNotRegistered(_)
                    | Error::WrongOwner { .. } => ResponseKind::ObjectNotRunningHere,
                    Error::Protocol(_) => ResponseKind::ProtocolError,
                    Error::SyncTimeout | Error::RequestTimeout | Error::RemoteTimeout => {
                        ResponseKind::Timeout
                    }
                    _ => ResponseKind::IoError,
                };

                info!(
                    "error handling {} request: {} - responding with {}",
                    kind.name(),
                    e,
                    response.name()
                );
                Frame::response(response, tag, Vec::new(), Vec::new())
            }
        }
    }

    fn dispatch_(&self, kind: RequestKind, frame: &Frame) -> Result<(Vec<u8>, Vec<u8>)> {
        match kind {
            RequestKind::Ping => {
                let req: protocol::PingMessage = protocol::parse_record(&frame.record)?;
                debug!("got ping from {}", req.sender_id);

                let pong = protocol::PingMessage {
                    sender_id: self.local.node_id().as_str().into(),
                };
                Ok((protocol::serialize_record(&pong), Vec::new()))
            }
            RequestKind::Read => {
                let req: protocol::ReadRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;

                let mut buf = vec![0u8; req.size as usize];
                let mut size = req.size as usize;
                self.local.read(&obj, &mut buf, &mut size, req.offset)?;
                buf.truncate(size);

                Ok((Vec::new(), buf))
            }
            RequestKind::Write => {
                let req: protocol::WriteRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;

                if frame.payload.len() != req.size as usize {
                    return Err(Error::Protocol(format!(
                        "write payload {} != declared size {}",
                        frame.payload.len(),
                        req.size
                    )));
                }

                let mut size = req.size as usize;
                self.local
                    .write(&obj, &frame.payload, &mut size, req.offset)?;

                let rsp = protocol::WriteResponse { size: size as u64 };
                Ok((protocol::serialize_record(&rsp), Vec::new()))
            }
            RequestKind::Sync => {
                let req: protocol::SyncRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;
                self.local.sync(&obj)?;
                Ok((Vec::new(), Vec::new()))
            }
            RequestKind::GetSize => {
                let req: protocol::GetSizeRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;

                let rsp = protocol::GetSizeResponse {
                    size: self.local.get_size(&obj)?,
                };
                Ok((protocol::serialize_record(&rsp), Vec::new()))
            }
            RequestKind::Resize => {
                let req: protocol::ResizeRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;
                self.local.resize(&obj, req.size)?;
                Ok((Vec::new(), Vec::new()))
            }
            RequestKind::Delete => {
                let req: protocol::DeleteRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;
                self.local.unlink(&obj)?;
                Ok((Vec::new(), Vec::new()))
            }
            RequestKind::Transfer => {
                let req: protocol::TransferRequest = protocol::parse_record(&frame.record)?;
                let obj = object_from_message(&req.object_id, req.object_type)?;
                let target = NodeId::new(req.target_node_id);

                let sync_timeout = if req.sync_timeout_ms > 0 {
                    Some(Duration::from_millis(req.sync_timeout_ms))
                } else {
                    None
                };

                debug!("{}: transferring to {}", obj, target);
                self.local.transfer(&obj, &target, sync_timeout)?;
                Ok((Vec::new(), Vec::new()))
            }
        }
    }
}

fn object_from_message(object_id: &str, object_type: u32) -> Result<Object> {
    let object_type = ObjectType::try_from(object_type)
        .map_err(|t| Error::Protocol(format!("unknown object type {}", t)))?;

    Ok(Object {
        object_type,
        id: ObjectId::new(object_id),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        local::CloneFileFlags,
        registry::TreeConfig,
        testing::{TestCluster, CLUSTER_SIZE},
    };
    use volgrid::{Backend, Namespace};

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn local_write_read_roundtrip_with_unaligned_offset() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let id = ObjectId::new("vol-herzog");
        router.create(&Object::volume(id.clone())).unwrap();

        let len = 2 * CLUSTER_SIZE as usize;
        let data: Vec<u8> = b"Herzog".iter().copied().cycle().take(len).collect();
        let offset = CLUSTER_SIZE - 1;

        assert_eq!(router.write(&id, &data, offset).unwrap(), len);
        router.sync(&id).unwrap();

        let mut buf = vec![0u8; len];
        assert_eq!(router.read(&id, &mut buf, offset).unwrap(), len);
        assert_eq!(buf, data);

        // all of it landed in a single SCO on the backend
        let nspace = Namespace::new(id.as_str()).unwrap();
        assert_eq!(cluster.backend.object_count(&nspace), 1);

        let name = cluster.backend.list(&nspace).unwrap().remove(0);
        let object = cluster.backend.object(&nspace, &name).unwrap();
        assert!(object.windows(6).any(|w| w == b"Herzog"));
    }

    #[test]
    fn unaligned_read_matches_covering_aligned_read() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let id = ObjectId::new("vol-align");
        router.create(&Object::volume(id.clone())).unwrap();

        let data = pattern(3, 4 * CLUSTER_SIZE as usize);
        router.write(&id, &data, 0).unwrap();

        let mut aligned = vec![0u8; 2 * CLUSTER_SIZE as usize];
        router.read(&id, &mut aligned, CLUSTER_SIZE).unwrap();

        let off = CLUSTER_SIZE + 17;
        let mut unaligned = vec![0u8; 1000];
        assert_eq!(router.read(&id, &mut unaligned, off).unwrap(), 1000);

        assert_eq!(unaligned[..], aligned[17..17 + 1000]);
    }

    #[test]
    fn remote_redirection_serves_both_ends() {
        let cluster = TestCluster::start(&["a", "b"]);
        let (a, b) = (cluster.router("a"), cluster.router("b"));

        let id = ObjectId::new("vol-redirect");
        a.create(&Object::volume(id.clone())).unwrap();

        let data = pattern(11, CLUSTER_SIZE as usize);
        assert_eq!(b.write(&id, &data, 0).unwrap(), data.len());

        // the write was executed on the owner
        assert_eq!(
            cluster.registry.find_or_fail(&id).unwrap().node_id,
            a.node_id()
        );

        let mut via_b = vec![0u8; data.len()];
        b.read(&id, &mut via_b, 0).unwrap();

        let mut via_a = vec![0u8; data.len()];
        a.read(&id, &mut via_a, 0).unwrap();

        assert_eq!(via_a, data);
        assert_eq!(via_b, data);
    }

    #[test]
    fn tag_and_size_survive_remote_get_size() {
        let cluster = TestCluster::start(&["a", "b"]);
        let (a, b) = (cluster.router("a"), cluster.router("b"));

        let id = ObjectId::new("vol-size");
        a.create(&Object::volume(id.clone())).unwrap();
        a.write(&id, &pattern(0, 3 * CLUSTER_SIZE as usize), 0)
            .unwrap();

        assert_eq!(b.get_size(&id).unwrap(), 3 * CLUSTER_SIZE);
        b.resize(&id, CLUSTER_SIZE).unwrap();
        assert_eq!(a.get_size(&id).unwrap(), CLUSTER_SIZE);
    }

    #[test]
    fn ping_roundtrip() {
        let cluster = TestCluster::start(&["a", "b"]);

        cluster.router("b").ping(&NodeId::new("a")).unwrap();
        // pinging ourselves is a no-op
        cluster.router("a").ping(&NodeId::new("a")).unwrap();
    }

    #[test]
    fn steal_from_offline_owner() {
        let cluster = TestCluster::start(&["a", "b"]);
        let (a, b) = (cluster.router("a"), cluster.router("b"));

        let id = ObjectId::new("vol-steal");
        a.create(&Object::volume(id.clone())).unwrap();

        let before = pattern(1, CLUSTER_SIZE as usize);
        a.write(&id, &before, 0).unwrap();
        a.sync(&id).unwrap();

        let tag_before = cluster.registry.find_or_fail(&id).unwrap().owner_tag;

        // the owner drops off the network and is declared offline
        a.stop_message_server();
        b.mark_node_offline(&NodeId::new("a")).unwrap();

        let after = pattern(2, CLUSTER_SIZE as usize);
        assert_eq!(b.write(&id, &after, CLUSTER_SIZE).unwrap(), after.len());

        // ownership moved with a bumped tag
        let reg = cluster.registry.find_or_fail(&id).unwrap();
        assert_eq!(reg.node_id, b.node_id());
        assert!(reg.owner_tag > tag_before);

        assert!(cluster.node("b").publisher.contains(&Event::OwnershipStolen {
            id: id.clone(),
            from: NodeId::new("a"),
        }));

        // subsequent reads on B are served locally, including the
        // pre-steal data restored from the backend
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        b.read(&id, &mut buf, 0).unwrap();
        assert_eq!(buf, before);
        b.read(&id, &mut buf, CLUSTER_SIZE).unwrap();
        assert_eq!(buf, after);

        // A comes back, learns the volume is no longer its business,
        // and defers to the registry on its next access
        assert!(!a.maybe_restart(&id, false).unwrap());
        let mut via_a = vec![0u8; CLUSTER_SIZE as usize];
        a.read(&id, &mut via_a, CLUSTER_SIZE).unwrap();
        assert_eq!(via_a, after);
    }

    #[test]
    fn timeout_with_online_owner_is_surfaced() {
        let cluster = TestCluster::start(&["a", "b"]);
        let (a, b) = (cluster.router("a"), cluster.router("b"));

        let id = ObjectId::new("vol-timeout");
        a.create(&Object::volume(id.clone())).unwrap();
        a.sync(&id).unwrap();

        // unreachable but still Online in the registry: no theft
        a.stop_message_server();

        let err = b
            .write(&id, &pattern(0, CLUSTER_SIZE as usize), 0)
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout), "{}", err);

        assert!(cluster
            .node("b")
            .publisher
            .contains(&Event::RedirectTimeoutWhileOnline {
                node: NodeId::new("a")
            }));

        // ownership never moved
        assert_eq!(
            cluster.registry.find_or_fail(&id).unwrap().node_id,
            a.node_id()
        );
    }

    #[test]
    fn write_threshold_triggers_auto_migration() {
        let cluster = TestCluster::start_with(&["a", "b"], |config| {
            config.volume_write_threshold = 2;
        });
        let (a, b) = (cluster.router("a"), cluster.router("b"));

        let id = ObjectId::new("vol-migrate");
        a.create(&Object::volume(id.clone())).unwrap();
        a.sync(&id).unwrap();

        let chunks: Vec<Vec<u8>> = (0..3).map(|i| pattern(i, CLUSTER_SIZE as usize)).collect();

        for (i, chunk) in chunks.iter().enumerate() {
            b.write(&id, chunk, i as u64 * CLUSTER_SIZE).unwrap();
        }

        // the second redirected write crossed the threshold and
        // pulled the volume over
        assert_eq!(
            cluster.registry.find_or_fail(&id).unwrap().node_id,
            b.node_id()
        );

        for (i, chunk) in chunks.iter().enumerate() {
            let mut buf = vec![0u8; chunk.len()];
            b.read(&id, &mut buf, i as u64 * CLUSTER_SIZE).unwrap();
            assert_eq!(&buf, chunk, "cluster {}", i);
        }
    }

    #[test]
    fn unlink_is_idempotent_at_the_router() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let (keep, gone) = (ObjectId::new("vol-keep"), ObjectId::new("vol-gone"));
        router.create(&Object::volume(keep.clone())).unwrap();
        router.create(&Object::volume(gone.clone())).unwrap();
        router
            .write(&keep, &pattern(9, CLUSTER_SIZE as usize), 0)
            .unwrap();

        router.unlink(&gone).unwrap();

        // the local node reports the missing registration, the
        // router swallows it
        assert!(matches!(
            router
                .local_node()
                .unlink(&Object::volume(gone.clone())),
            Err(Error::ObjectNotRegistered(_))
        ));
        router.unlink(&gone).unwrap();

        // the unrelated volume is untouched
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        router.read(&keep, &mut buf, 0).unwrap();
        assert_eq!(buf, pattern(9, CLUSTER_SIZE as usize));
    }

    #[test]
    fn snapshot_deletion_blocked_by_clone() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let (vol, clone) = (ObjectId::new("vol-parent"), ObjectId::new("vol-clone"));
        router.create(&Object::volume(vol.clone())).unwrap();
        router
            .write(&vol, &pattern(4, CLUSTER_SIZE as usize), 0)
            .unwrap();

        let snap = router.create_snapshot(&vol).unwrap();
        router.create_clone(&clone, &vol, Some(&snap)).unwrap();

        // the clone sees the parent's data
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        router.read(&clone, &mut buf, 0).unwrap();
        assert_eq!(buf, pattern(4, CLUSTER_SIZE as usize));

        assert!(matches!(
            router.delete_snapshot(&vol, &snap),
            Err(Error::ObjectStillHasChildren(_))
        ));

        router.unlink(&clone).unwrap();
        router.delete_snapshot(&vol, &snap).unwrap();
        assert!(router.list_snapshots(&vol).unwrap().is_empty());
    }

    #[test]
    fn rollback_honors_descendant_snapshots() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let vol = ObjectId::new("vol-rollback");
        router.create(&Object::volume(vol.clone())).unwrap();

        router
            .write(&vol, &pattern(0, CLUSTER_SIZE as usize), 0)
            .unwrap();
        let s1 = router.create_snapshot(&vol).unwrap();

        router
            .write(&vol, &pattern(1, CLUSTER_SIZE as usize), CLUSTER_SIZE)
            .unwrap();
        let s2 = router.create_snapshot(&vol).unwrap();

        let clone = ObjectId::new("vol-rollback-clone");
        router.create_clone(&clone, &vol, Some(&s2)).unwrap();

        // the clone hangs off s2: rolling back past it is refused
        assert!(matches!(
            router.rollback_volume(&vol, &s1),
            Err(Error::ObjectStillHasChildren(_))
        ));

        // rolling back to s2 itself disturbs nothing
        router.rollback_volume(&vol, &s2).unwrap();
    }

    #[test]
    fn vaai_copy_validates_flag_combinations() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let src = ObjectId::new("vol-vaai-src");
        router.create(&Object::volume(src.clone())).unwrap();
        router
            .write(&src, &pattern(7, CLUSTER_SIZE as usize), 0)
            .unwrap();

        // lazy without guarded is rejected and the helper snapshot
        // cleaned up
        let err = router
            .vaai_copy(
                &src,
                None,
                Duration::from_secs(1),
                CloneFileFlags {
                    lazy: true,
                    guarded: false,
                    skip_zeroes: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{}", err);
        assert!(router.list_snapshots(&src).unwrap().is_empty());
    }

    #[test]
    fn vaai_copy_times_out_when_sync_hangs() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let src = ObjectId::new("vol-vaai-stuck");
        router.create(&Object::volume(src.clone())).unwrap();
        router
            .write(&src, &pattern(7, CLUSTER_SIZE as usize), 0)
            .unwrap();

        cluster.node("a").engine.set_sync_stuck(&src, true);

        let err = router
            .vaai_copy(
                &src,
                Some(&ObjectId::new("vol-vaai-dst")),
                Duration::from_millis(50),
                CloneFileFlags {
                    lazy: true,
                    guarded: true,
                    skip_zeroes: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::SyncTimeout), "{}", err);
        assert!(router.list_snapshots(&src).unwrap().is_empty());
    }

    #[test]
    fn vaai_copy_lazy_guarded_creates_clone() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let (src, dst) = (ObjectId::new("vol-vaai-a"), ObjectId::new("vol-vaai-b"));
        router.create(&Object::volume(src.clone())).unwrap();
        router
            .write(&src, &pattern(5, CLUSTER_SIZE as usize), 0)
            .unwrap();

        router
            .vaai_copy(
                &src,
                Some(&dst),
                Duration::from_secs(1),
                CloneFileFlags {
                    lazy: true,
                    guarded: true,
                    skip_zeroes: false,
                },
            )
            .unwrap();

        let reg = cluster.registry.find_or_fail(&dst).unwrap();
        assert!(matches!(reg.tree, TreeConfig::Clone { .. }));

        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        router.read(&dst, &mut buf, 0).unwrap();
        assert_eq!(buf, pattern(5, CLUSTER_SIZE as usize));
    }

    #[test]
    fn vaai_copy_onto_existing_volume_checks_sizes() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let (src, dst) = (ObjectId::new("vol-sz-src"), ObjectId::new("vol-sz-dst"));
        router.create(&Object::volume(src.clone())).unwrap();
        router.create(&Object::volume(dst.clone())).unwrap();

        router
            .write(&src, &pattern(1, 2 * CLUSTER_SIZE as usize), 0)
            .unwrap();
        router
            .write(&dst, &pattern(2, CLUSTER_SIZE as usize), 0)
            .unwrap();

        let skip_zeroes = CloneFileFlags {
            lazy: false,
            guarded: false,
            skip_zeroes: true,
        };

        let err = router
            .vaai_copy(&src, Some(&dst), Duration::from_secs(1), skip_zeroes)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{}", err);

        // grow the destination to match and retry
        router.resize(&dst, 2 * CLUSTER_SIZE).unwrap();
        router
            .vaai_copy(&src, Some(&dst), Duration::from_secs(1), skip_zeroes)
            .unwrap();

        let reg = cluster.registry.find_or_fail(&dst).unwrap();
        assert!(matches!(reg.tree, TreeConfig::Clone { .. }));

        let mut buf = vec![0u8; 2 * CLUSTER_SIZE as usize];
        router.read(&dst, &mut buf, 0).unwrap();
        assert_eq!(buf, pattern(1, 2 * CLUSTER_SIZE as usize));
    }

    #[test]
    fn templates_reject_further_writes() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let vol = ObjectId::new("vol-template");
        router.create(&Object::volume(vol.clone())).unwrap();
        router
            .write(&vol, &pattern(6, CLUSTER_SIZE as usize), 0)
            .unwrap();

        router.set_volume_as_template(&vol).unwrap();
        assert!(matches!(
            cluster.registry.find_or_fail(&vol).unwrap().tree,
            TreeConfig::Template
        ));

        assert!(router
            .write(&vol, &pattern(1, CLUSTER_SIZE as usize), 0)
            .is_err());

        // clones off the template still work
        let clone = ObjectId::new("vol-from-template");
        router.create_clone(&clone, &vol, None).unwrap();

        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        router.read(&clone, &mut buf, 0).unwrap();
        assert_eq!(buf, pattern(6, CLUSTER_SIZE as usize));
    }

    #[test]
    fn stop_and_restart_from_backend() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let vol = ObjectId::new("vol-restart");
        router.create(&Object::volume(vol.clone())).unwrap();
        let data = pattern(8, 2 * CLUSTER_SIZE as usize);
        router.write(&vol, &data, 0).unwrap();

        router.stop(&vol, true).unwrap();
        assert!(!cluster.node("a").engine.is_running(&vol));

        router.restart(&vol, false).unwrap();

        let mut buf = vec![0u8; data.len()];
        router.read(&vol, &mut buf, 0).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn scrubbing_validates_and_counts() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let vol = ObjectId::new("vol-scrub");
        router.create(&Object::volume(vol.clone())).unwrap();
        router
            .write(&vol, &pattern(0, CLUSTER_SIZE as usize), 0)
            .unwrap();
        let snap = router.create_snapshot(&vol).unwrap();

        let work = router.get_scrub_work(&vol, None, None).unwrap();
        assert_eq!(work, vec![format!("scrub:{}", snap)]);

        router.apply_scrub_result(&vol, &work[0]).unwrap();
        assert_eq!(router.scrub_counts().parent_scrubs_ok, 1);

        assert!(router.apply_scrub_result(&vol, "garbage").is_err());
        assert_eq!(router.scrub_counts().parent_scrubs_nok, 1);

        // volumes with clones hand out no scrub work
        let clone = ObjectId::new("vol-scrub-clone");
        router.create_clone(&clone, &vol, Some(&snap)).unwrap();
        assert!(matches!(
            router.get_scrub_work(&vol, None, None),
            Err(Error::ObjectStillHasChildren(_))
        ));
    }

    #[test]
    fn node_state_management() {
        let cluster = TestCluster::start(&["a", "b"]);
        let a = cluster.router("a");

        assert!(matches!(
            a.mark_node_offline(&NodeId::new("a")),
            Err(Error::CannotSetSelfOffline)
        ));

        a.mark_node_offline(&NodeId::new("b")).unwrap();
        assert_eq!(
            a.node_status_map().get(&NodeId::new("b")),
            Some(&NodeState::Offline)
        );

        a.mark_node_online(&NodeId::new("b")).unwrap();
        assert_eq!(
            a.node_status_map().get(&NodeId::new("b")),
            Some(&NodeState::Online)
        );
    }

    #[test]
    fn automatic_dtl_config_follows_topology() {
        let cluster = TestCluster::start(&["a", "b"]);
        let a = cluster.router("a");

        let vol = ObjectId::new("vol-dtl");
        a.create(&Object::volume(vol.clone())).unwrap();

        assert_eq!(
            a.get_foc_config_mode(&vol).unwrap(),
            FocConfigMode::Automatic
        );

        // the engine got a config pointing at the next node
        let config = cluster
            .node("a")
            .engine
            .failover_cache_config(&vol)
            .unwrap()
            .expect("automatic DTL config should be set");
        assert_eq!(config.mode, FailoverCacheMode::Async);

        // manual overrides stick
        let manual = FailoverCacheConfig {
            host: "10.0.0.1".into(),
            port: 4242,
            mode: FailoverCacheMode::Sync,
        };
        a.set_manual_foc_config(&vol, Some(&manual)).unwrap();
        assert_eq!(a.get_foc_config_mode(&vol).unwrap(), FocConfigMode::Manual);
        assert_eq!(
            cluster
                .node("a")
                .engine
                .failover_cache_config(&vol)
                .unwrap(),
            Some(manual)
        );
    }

    #[test]
    fn config_update_resizes_pool_and_rejects_topology_changes() {
        let cluster = TestCluster::start(&["a", "b"]);
        let a = cluster.router("a");

        let mut new_config = {
            crate::config::RouterConfig {
                id: a.node_id(),
                cluster_id: a.cluster_id(),
                nodes: vec![],
                volume_read_threshold: 0,
                volume_write_threshold: 0,
                file_read_threshold: 0,
                file_write_threshold: 0,
                check_local_volume_potential_period: 1,
                backend_sync_timeout_ms: 2000,
                migrate_timeout_ms: 2000,
                redirect_timeout_ms: 300,
                redirect_retries: 1,
                routing_retries: 2,
                min_workers: 3,
                max_workers: 6,
                registry_cache_capacity: 64,
                local: Default::default(),
            }
        };

        // topology edits are refused through this path
        let problems = a.update_config(&new_config);
        assert!(problems.iter().any(|p| p.param == "nodes" || p.param == "id"));

        // a clean scalar-only update passes
        new_config.nodes = cluster.topology();
        let problems = a.update_config(&new_config);
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn file_objects_route_and_copy() {
        let cluster = TestCluster::start(&["a"]);
        let router = cluster.router("a");

        let (src, dst) = (ObjectId::new("file-src"), ObjectId::new("file-dst"));
        router.create(&Object::file(src.clone())).unwrap();
        router.create(&Object::file(dst.clone())).unwrap();

        let data = pattern(42, 3000);
        assert_eq!(router.write(&src, &data, 0).unwrap(), data.len());
        assert_eq!(router.get_size(&src).unwrap(), data.len() as u64);

        router.vaai_filecopy(&src, &dst).unwrap();

        let mut buf = vec![0u8; data.len()];
        assert_eq!(router.read(&dst, &mut buf, 0).unwrap(), data.len());
        assert_eq!(buf, data);

        router.unlink(&src).unwrap();
        router.unlink(&src).unwrap();
    }
}
