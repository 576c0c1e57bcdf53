//! The node-local side of the router: drives the volume engine and
//! the container driver, guarded by per-object rw-locks.

use crate::{
    config::LocalNodeConfig,
    engine::{ContainerDriver, VolumeEngine},
    object::{ClusterNodeConfig, NodeId, Object, ObjectId, SnapshotName},
    periodic::PeriodicTask,
    registry::{
        CachedObjectRegistry, FailoverCacheConfig, FailoverCacheMode, FocConfigMode,
        ObjectRegistration, TreeConfig,
    },
    Error, Result,
};
use volgrid::Namespace;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Flags of the VAAI-style copy operation. Only two combinations are
/// valid: `lazy && guarded` (clone off the helper snapshot) and
/// `!lazy && !guarded && skip_zeroes` (clone onto an existing
/// destination); everything else is rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloneFileFlags {
    pub lazy: bool,
    pub guarded: bool,
    pub skip_zeroes: bool,
}

/// Scrub bookkeeping observable through the management surface.
#[derive(Default)]
pub struct ScrubCounters {
    parent_scrubs_ok: AtomicU64,
    parent_scrubs_nok: AtomicU64,
    clone_scrubs_ok: AtomicU64,
    clone_scrubs_nok: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrubCounts {
    pub parent_scrubs_ok: u64,
    pub parent_scrubs_nok: u64,
    pub clone_scrubs_ok: u64,
    pub clone_scrubs_nok: u64,
}

impl ScrubCounters {
    fn snapshot(&self) -> ScrubCounts {
        ScrubCounts {
            parent_scrubs_ok: self.parent_scrubs_ok.load(Ordering::Relaxed),
            parent_scrubs_nok: self.parent_scrubs_nok.load(Ordering::Relaxed),
            clone_scrubs_ok: self.clone_scrubs_ok.load(Ordering::Relaxed),
            clone_scrubs_nok: self.clone_scrubs_nok.load(Ordering::Relaxed),
        }
    }
}

/// Failover-cache (DTL) topology view: enough to compute what a
/// volume's DTL config *should* be. Every node computes the same
/// answer because the canonical order is by node id.
#[derive(Clone, Debug)]
pub struct DtlTopology {
    pub node_id: NodeId,
    pub mode: FocConfigMode,
    pub foc_mode: FailoverCacheMode,
    /// Cluster-wide pinned config; only consulted in Manual mode.
    pub manual_config: Option<FailoverCacheConfig>,
    pub nodes: Vec<ClusterNodeConfig>,
}

impl DtlTopology {
    /// Manual mode returns the pinned config; Automatic picks the
    /// next cluster node in canonical order, so every node computes
    /// the same topology. A single-node cluster has no DTL.
    pub fn config_as_it_should_be(&self) -> Option<FailoverCacheConfig> {
        if self.mode == FocConfigMode::Manual {
            return self.manual_config.clone();
        }

        if self.nodes.len() < 2 {
            return None;
        }

        let mut nodes = self.nodes.clone();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let pos = nodes.iter().position(|n| n.node_id == self.node_id)?;
        let next = &nodes[(pos + 1) % nodes.len()];

        Some(FailoverCacheConfig {
            host: next.host.clone(),
            port: next.failovercache_port,
            mode: self.foc_mode,
        })
    }
}

type ObjectLockMap = Arc<scc::HashMap<ObjectId, Arc<RwLock<()>>>>;

pub struct LocalNode {
    node_config: ClusterNodeConfig,
    config: Mutex<LocalNodeConfig>,
    engine: Arc<dyn VolumeEngine>,
    files: Arc<dyn ContainerDriver>,
    backend: Arc<dyn volgrid::Backend>,
    registry: Arc<CachedObjectRegistry>,
    locks: ObjectLockMap,
    scrubs: ScrubCounters,
    dtl: Mutex<DtlTopology>,
    reaper: Mutex<Option<PeriodicTask>>,
}

impl LocalNode {
    pub fn new(
        node_config: ClusterNodeConfig,
        config: LocalNodeConfig,
        engine: Arc<dyn VolumeEngine>,
        files: Arc<dyn ContainerDriver>,
        backend: Arc<dyn volgrid::Backend>,
        registry: Arc<CachedObjectRegistry>,
        dtl: DtlTopology,
    ) -> Arc<LocalNode> {
        let node = Arc::new(LocalNode {
            node_config,
            config: Mutex::new(config),
            engine,
            files,
            backend,
            registry,
            locks: Arc::new(scc::HashMap::new()),
            scrubs: ScrubCounters::default(),
            dtl: Mutex::new(dtl),
            reaper: Mutex::new(None),
        });

        node.reset_lock_reaper_();
        node
    }

    pub fn config(&self) -> &ClusterNodeConfig {
        &self.node_config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_config.node_id
    }

    pub fn scrub_counts(&self) -> ScrubCounts {
        self.scrubs.snapshot()
    }

    pub fn update_config(&self, new: &LocalNodeConfig) {
        let reset = {
            let mut config = self.config.lock();
            let reset = config.lock_reaper_interval_secs != new.lock_reaper_interval_secs;
            *config = new.clone();
            reset
        };

        if reset {
            self.reset_lock_reaper_();
        }
    }

    pub fn update_dtl_topology(&self, dtl: DtlTopology) {
        *self.dtl.lock() = dtl;
    }

    pub fn dtl_topology(&self) -> DtlTopology {
        self.dtl.lock().clone()
    }

    fn reset_lock_reaper_(&self) {
        let interval = Duration::from_secs(self.config.lock().lock_reaper_interval_secs.max(1));
        let locks = Arc::clone(&self.locks);

        *self.reaper.lock() = Some(PeriodicTask::new("object-lock-reaper", interval, move || {
            // keep only locks some operation still holds on to
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }));
    }

    fn get_lock_(&self, id: &ObjectId) -> Arc<RwLock<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .get()
            .clone()
    }

    fn with_retries_<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let (retries, sleep_usecs) = {
            let config = self.config.lock();
            (
                config.local_io_retries,
                config.local_io_sleep_before_retry_usecs,
            )
        };

        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    thread::sleep(Duration::from_micros(sleep_usecs));
                }
                other => return other,
            }
        }
    }

    // --- data path -----------------------------------------------------

    pub fn read(&self, obj: &Object, buf: &mut [u8], size: &mut usize, offset: u64) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.read();

        if obj.is_file() {
            *size = self.files.read(&obj.id, offset, &mut buf[..*size])?;
            return Ok(());
        }

        let volume_size = self.engine.volume_size(&obj.id)?;
        if offset >= volume_size {
            *size = 0;
            return Ok(());
        }

        let lba_size = self.engine.lba_size(&obj.id)?;
        let lba = offset / lba_size;
        let lba_off = offset % lba_size;

        let to_read = (volume_size - offset).min(*size as u64);
        let mut rsize = to_read;
        let mut unaligned = lba_off != 0;

        if unaligned {
            rsize += lba_off;
        }
        if rsize % lba_size != 0 {
            unaligned = true;
            rsize += lba_size - rsize % lba_size;
        }

        if unaligned {
            let mut bounce = vec![0u8; rsize as usize];
            self.with_retries_(|| self.engine.read(&obj.id, lba, &mut bounce))?;
            buf[..to_read as usize]
                .copy_from_slice(&bounce[lba_off as usize..(lba_off + to_read) as usize]);
        } else {
            self.with_retries_(|| self.engine.read(&obj.id, lba, &mut buf[..to_read as usize]))?;
        }

        *size = to_read as usize;
        Ok(())
    }

    pub fn write(&self, obj: &Object, buf: &[u8], size: &mut usize, offset: u64) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.read();

        if obj.is_file() {
            *size = self.files.write(&obj.id, offset, &buf[..*size])?;
            return Ok(());
        }

        let lba_size = self.engine.lba_size(&obj.id)?;
        let lba = offset / lba_size;
        let lba_off = offset % lba_size;

        let len = *size as u64;
        let mut wsize = len;
        let mut unaligned = lba_off != 0;

        if unaligned {
            wsize += lba_off;
        }
        if wsize % lba_size != 0 {
            unaligned = true;
            wsize += lba_size - wsize % lba_size;
        }

        if unaligned {
            // read-modify-write of the covering aligned range
            let mut bounce = vec![0u8; wsize as usize];
            self.with_retries_(|| self.engine.read(&obj.id, lba, &mut bounce))?;
            bounce[lba_off as usize..(lba_off + len) as usize].copy_from_slice(&buf[..*size]);
            self.with_retries_(|| self.engine.write(&obj.id, lba, &bounce))?;
        } else {
            self.with_retries_(|| self.engine.write(&obj.id, lba, &buf[..*size]))?;
        }

        Ok(())
    }

    pub fn sync(&self, obj: &Object) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.read();

        if obj.is_file() {
            self.files.sync(&obj.id)
        } else {
            self.with_retries_(|| self.engine.sync(&obj.id))
        }
    }

    pub fn get_size(&self, obj: &Object) -> Result<u64> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.read();

        if obj.is_file() {
            self.files.size(&obj.id)
        } else {
            self.engine.volume_size(&obj.id)
        }
    }

    pub fn resize(&self, obj: &Object, new_size: u64) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        if obj.is_file() {
            self.files.resize(&obj.id, new_size)
        } else {
            self.engine.resize(&obj.id, new_size)
        }
    }

    // --- lifecycle -----------------------------------------------------

    pub fn create(&self, obj: &Object) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        if obj.is_file() {
            self.registry.register_file(&obj.id, self.node_id())?;

            if let Err(e) = self.files.create(&obj.id) {
                error!("failed to create {}: {}", obj, e);
                let _ = self.registry.unregister(&obj.id, self.node_id());
                return Err(e);
            }
            Ok(())
        } else {
            self.create_volume_(&obj.id)
        }
    }

    fn create_volume_(&self, id: &ObjectId) -> Result<()> {
        let nspace = volume_nspace(id)?;
        let sco_multiplier = self.config.lock().sco_multiplier;

        let reg = self
            .registry
            .register_base_volume(id, &nspace, self.node_id())?;

        if let Err(e) = self
            .engine
            .create_volume(id, &nspace, reg.owner_tag, sco_multiplier)
        {
            error!("failed to create volume {}: {}", id, e);
            let _ = self.registry.unregister(id, self.node_id());
            return Err(e);
        }

        // volume creation succeeded; a failure to configure the
        // failover cache must not undo it
        self.try_adjust_failovercache_config_(id);
        Ok(())
    }

    pub fn create_clone(
        &self,
        clone_id: &ObjectId,
        parent_id: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        let lock = self.get_lock_(clone_id);
        let _guard = lock.write();

        let nspace = volume_nspace(clone_id)?;

        let reg = self.registry.register_clone(
            clone_id,
            &nspace,
            parent_id,
            parent_snapshot,
            self.node_id(),
        )?;

        // fetch the parent's namespace from the backing store, not
        // the cache: we're off the hot path and can afford the truth
        let parent_reg = self.registry.find_or_fail(parent_id, true)?;

        if let Err(e) = self.engine.create_clone(
            clone_id,
            &nspace,
            &parent_reg.nspace,
            parent_snapshot,
            reg.owner_tag,
            true,
        ) {
            error!(
                "failed to create a clone from {}, snapshot {:?}: {}",
                parent_id, parent_snapshot, e
            );
            let _ = self.registry.unregister(clone_id, self.node_id());
            return Err(e);
        }

        self.try_adjust_failovercache_config_(clone_id);
        Ok(())
    }

    /// Clone onto an existing volume: its data is dropped, its
    /// namespace cleared, and its registration converted to a clone
    /// of `parent_id`.
    pub fn clone_to_existing_volume(
        &self,
        clone_id: &ObjectId,
        parent_id: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        let lock = self.get_lock_(clone_id);
        let _guard = lock.write();

        self.destroy_(clone_id, true, false, None)?;

        let parent_reg = self.registry.find_or_fail(parent_id, true)?;
        let clone_reg = self.registry.find_or_fail(clone_id, true)?;

        self.backend.clear_namespace(&clone_reg.nspace)?;

        self.engine.create_clone(
            clone_id,
            &clone_reg.nspace,
            &parent_reg.nspace,
            parent_snapshot,
            clone_reg.owner_tag,
            false,
        )?;

        self.registry
            .convert_base_to_clone(clone_id, &clone_reg.nspace, parent_id, parent_snapshot)
    }

    /// Snapshot the source, wait (bounded) for it to hit the backend,
    /// then clone: either a fresh clone off the snapshot
    /// (lazy+guarded) or onto an existing destination of equal size
    /// (skip-zeroes). `create_clone_fun` performs the actual clone
    /// creation for the lazy+guarded flavor.
    pub fn vaai_copy(
        &self,
        src_id: &ObjectId,
        maybe_dst_id: Option<&ObjectId>,
        timeout: Duration,
        flags: CloneFileFlags,
        create_clone_fun: &mut dyn FnMut(&SnapshotName) -> Result<()>,
    ) -> Result<()> {
        let snap = self.engine.create_snapshot(src_id)?;

        let deadline = Instant::now() + timeout;
        let mut synced = false;

        while Instant::now() < deadline {
            if self.engine.is_synced_up_to(src_id, &snap)? {
                synced = true;
                break;
            }
            thread::sleep(SYNC_POLL_INTERVAL);
        }

        if !synced {
            self.delete_snapshot(src_id, &snap)?;
            return Err(Error::SyncTimeout);
        }

        if flags.lazy && flags.guarded {
            create_clone_fun(&snap)
        } else if !flags.lazy && !flags.guarded && flags.skip_zeroes {
            let dst_id = maybe_dst_id.ok_or_else(|| {
                Error::InvalidOperation("copy onto existing volume needs a destination".into())
            })?;

            let src_size = self.get_size(&Object::volume(src_id.clone()))?;
            let dst_size = self.get_size(&Object::volume(dst_id.clone()))?;
            if src_size != dst_size {
                return Err(Error::InvalidOperation(
                    "source and target volume size mismatch".into(),
                ));
            }

            self.clone_to_existing_volume(dst_id, src_id, Some(&snap))
        } else {
            self.delete_snapshot(src_id, &snap)?;
            Err(Error::InvalidOperation(
                "unknown volume-based VAAI call".into(),
            ))
        }
    }

    /// Copy a file object chunk-wise through the node's own
    /// read/write path. Source and destination must exist.
    pub fn vaai_filecopy(&self, src_id: &ObjectId, dst_id: &ObjectId) -> Result<()> {
        const BUF_SIZE: usize = 1024;

        let src = Object::file(src_id.clone());
        let dst = Object::file(dst_id.clone());

        let mut remaining = self.get_size(&src)?;
        let mut offset = 0u64;

        while remaining > 0 {
            let mut buf = [0u8; BUF_SIZE];
            let mut read_size = BUF_SIZE.min(remaining as usize);

            self.read(&src, &mut buf, &mut read_size, offset)?;

            let mut write_size = read_size;
            self.write(&dst, &buf, &mut write_size, offset)?;

            if write_size != read_size {
                return Err(Error::InvalidOperation(
                    "couldn't write whole buffer".into(),
                ));
            }

            remaining -= write_size as u64;
            offset += write_size as u64;
        }

        Ok(())
    }

    /// Unregister first, destroy after: the reverse order would let a
    /// concurrent clone off a half-deleted template succeed.
    pub fn unlink(&self, obj: &Object) -> Result<()> {
        info!("{}: deleting object", obj.id);

        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        match self.registry.find(&obj.id, true)? {
            Some(_) => {
                self.registry
                    .unregister(&obj.id, self.node_id())
                    .map_err(|e| match e {
                        Error::WrongOwner { id, .. } => Error::NotRunningHere(id),
                        other => other,
                    })?;
            }
            None => return Err(Error::ObjectNotRegistered(obj.id.clone())),
        }

        let result = if obj.is_file() {
            self.files.unlink(&obj.id)
        } else {
            self.destroy_(&obj.id, true, true, None)
        };

        if let Err(e) = &result {
            // past the point of no return: the registration is gone
            error!(
                "{}: unregistered but not destroyed ({}) - data leaked on the backend",
                obj.id, e
            );
        }

        result
    }

    fn destroy_(
        &self,
        id: &ObjectId,
        delete_local_data: bool,
        remove_completely: bool,
        sync_timeout: Option<Duration>,
    ) -> Result<()> {
        if !remove_completely && delete_local_data {
            info!("{}: trying to sync to the backend", id);
            self.engine.schedule_backend_sync(id)?;

            let start = Instant::now();
            loop {
                if self.engine.is_volume_synced(id)? {
                    info!("{}: synced to the backend", id);
                    break;
                }

                if let Some(timeout) = sync_timeout {
                    if start.elapsed() > timeout {
                        error!("{}: timeout syncing to the backend", id);
                        return Err(Error::SyncTimeout);
                    }
                }

                thread::sleep(SYNC_POLL_INTERVAL);
            }
        }

        self.engine
            .destroy_volume(id, delete_local_data, remove_completely)
    }

    pub fn stop(&self, obj: &Object, delete_local_data: bool) -> Result<()> {
        info!("stopping {}", obj);

        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        if obj.is_file() {
            self.files.drop_from_cache(&obj.id)
        } else {
            self.destroy_(&obj.id, delete_local_data, false, None)
        }
    }

    pub fn remove_local_data(&self, obj: &Object) -> Result<()> {
        if obj.is_file() {
            self.files.drop_from_cache(&obj.id)
        } else {
            let lock = self.get_lock_(&obj.id);
            let _guard = lock.write();
            self.engine.remove_local_data(&volume_nspace(&obj.id)?)
        }
    }

    pub fn local_restart(&self, reg: &ObjectRegistration, force: bool) -> Result<()> {
        let lock = self.get_lock_(&reg.id);
        let _guard = lock.write();

        if reg.object().is_file() {
            self.files.restart(&reg.id)
        } else {
            if !self.engine.is_running(&reg.id) {
                self.engine
                    .local_restart(&reg.id, &reg.nspace, reg.owner_tag, force)?;
            } else {
                warn!("{} already running", reg.id);
            }

            self.try_adjust_failovercache_config_(&reg.id);
            Ok(())
        }
    }

    /// Restart from the backend, running `prepare` (e.g. the transfer
    /// request to the previous owner) under the object's exclusive
    /// lock first.
    pub fn backend_restart(
        &self,
        obj: &Object,
        force: bool,
        prepare: &mut dyn FnMut(&Object) -> Result<()>,
    ) -> Result<()> {
        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        prepare(obj)?;

        if obj.is_file() {
            self.files.restart(&obj.id)
        } else {
            // check ownership while holding the lock so a concurrent
            // transfer cannot give the volume away underneath us
            let reg = self.registry.find_or_fail(&obj.id, true)?;
            if reg.node_id != *self.node_id() {
                return Err(Error::WrongOwner {
                    id: obj.id.clone(),
                    owner: reg.node_id.clone(),
                });
            }

            if !self.engine.is_running(&obj.id) {
                self.engine
                    .backend_restart(&obj.id, &reg.nspace, reg.owner_tag, force)?;
            } else {
                warn!("{} already running", obj.id);
            }

            self.try_adjust_failovercache_config_(&obj.id);
            Ok(())
        }
    }

    /// Hand the object over to `target`: drop local state (syncing
    /// volumes to the backend first) and update the registry.
    pub fn transfer(
        &self,
        obj: &Object,
        target: &NodeId,
        sync_timeout: Option<Duration>,
    ) -> Result<()> {
        info!("{}: transferring to {}", obj, target);

        let lock = self.get_lock_(&obj.id);
        let _guard = lock.write();

        if obj.is_file() {
            self.files.drop_from_cache(&obj.id)?;
        } else {
            self.destroy_(&obj.id, true, false, sync_timeout)?;
        }

        self.registry.migrate(&obj.id, self.node_id(), target)
    }

    // --- snapshots -----------------------------------------------------

    pub fn create_snapshot(&self, id: &ObjectId) -> Result<SnapshotName> {
        let lock = self.get_lock_(id);
        let _guard = lock.write();
        self.engine.create_snapshot(id)
    }

    pub fn list_snapshots(&self, id: &ObjectId) -> Result<Vec<SnapshotName>> {
        let lock = self.get_lock_(id);
        let _guard = lock.read();
        self.engine.list_snapshots(id)
    }

    /// Roll the volume back, unless a clone still needs a snapshot
    /// more recent than the rollback target.
    pub fn rollback_volume(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        let lock = self.get_lock_(id);
        let _guard = lock.write();

        let reg = self.registry.find_or_fail(id, true)?;
        let snaps = self.engine.list_snapshots(id)?;

        let mut doomed = BTreeSet::new();
        let mut seen = false;
        for s in snaps {
            if &s == snap {
                seen = true;
                continue;
            }
            if seen {
                doomed.insert(s);
            }
        }

        for (clone, maybe_snap) in &reg.descendants {
            if let Some(s) = maybe_snap {
                if doomed.contains(s) {
                    error!(
                        "{}: cannot roll back to snapshot {}: more recent snapshot {} is still required by {}",
                        id, snap, s, clone
                    );
                    return Err(Error::ObjectStillHasChildren(id.clone()));
                }
            }
        }

        self.engine.restore_snapshot(id, snap)
    }

    pub fn delete_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        info!("{}: deleting snapshot {}", id, snap);

        let lock = self.get_lock_(id);
        let _guard = lock.read();

        let reg = self.registry.find_or_fail(id, true)?;
        if reg.node_id != *self.node_id() {
            return Err(Error::NotRunningHere(id.clone()));
        }

        for (clone, maybe_snap) in &reg.descendants {
            if maybe_snap.as_ref() == Some(snap) {
                error!(
                    "{}: cannot delete snapshot {}: still required by {}",
                    id, snap, clone
                );
                return Err(Error::ObjectStillHasChildren(id.clone()));
            }
        }

        self.engine.delete_snapshot(id, snap)
    }

    pub fn set_volume_as_template(&self, id: &ObjectId) -> Result<()> {
        info!("setting volume {} as template", id);

        let lock = self.get_lock_(id);
        let _guard = lock.write();

        self.registry
            .set_volume_as_template(id, self.node_id())
            .map_err(|e| match e {
                Error::WrongOwner { id, .. } => Error::NotRunningHere(id),
                other => other,
            })?;

        // not rolled back on failure; the registry conversion stands
        // and the engine call can be retried
        self.engine.set_as_template(id)
    }

    // --- scrubbing -----------------------------------------------------

    fn scrub_wrapper_<T>(
        &self,
        desc: &str,
        id: &ObjectId,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<(T, bool)> {
        let lock = self.get_lock_(id);
        let _guard = lock.read();

        let reg = self.registry.find_or_fail(id, true)?;
        if reg.node_id != *self.node_id() {
            return Err(Error::NotRunningHere(id.clone()));
        }

        if !reg.descendants.is_empty() {
            error!("{}: refusing to {} as there are clones", id, desc);
            return Err(Error::ObjectStillHasChildren(id.clone()));
        }

        if reg.object_type != crate::ObjectType::Volume {
            return Err(Error::InvalidOperation(format!(
                "{}: cannot {} - not a volume",
                id, desc
            )));
        }

        let is_clone = matches!(reg.tree, TreeConfig::Clone { .. });
        f().map(|t| (t, is_clone))
    }

    pub fn get_scrub_work(
        &self,
        id: &ObjectId,
        start_snap: Option<&SnapshotName>,
        end_snap: Option<&SnapshotName>,
    ) -> Result<Vec<String>> {
        info!("{}: getting scrub work", id);

        self.scrub_wrapper_("hand out scrub work", id, || {
            self.engine.get_scrub_work(id, start_snap, end_snap)
        })
        .map(|(work, _)| work)
    }

    pub fn apply_scrub_result(&self, id: &ObjectId, result: &str) -> Result<()> {
        info!("{}: applying scrub result", id);

        let applied = self.scrub_wrapper_("apply scrub result", id, || {
            self.engine.apply_scrub_result(id, result)
        });

        match applied {
            Ok(((), is_clone)) => {
                if is_clone {
                    self.scrubs.clone_scrubs_ok.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.scrubs.parent_scrubs_ok.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => {
                // without a registration we cannot attribute the failure
                if let Ok(reg) = self.registry.find_or_fail(id, false) {
                    if matches!(reg.tree, TreeConfig::Clone { .. }) {
                        self.scrubs.clone_scrubs_nok.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.scrubs
                            .parent_scrubs_nok
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e)
            }
        }
    }

    // --- failover cache ------------------------------------------------

    pub fn foc_config_mode(&self, id: &ObjectId) -> Result<FocConfigMode> {
        Ok(self.registry.find_or_fail(id, true)?.foc_mode)
    }

    pub fn set_manual_foc_config(
        &self,
        id: &ObjectId,
        config: Option<&FailoverCacheConfig>,
    ) -> Result<()> {
        self.adjust_failovercache_config_(id, FocConfigMode::Manual, config)
    }

    pub fn set_automatic_foc_config(&self, id: &ObjectId) -> Result<()> {
        let computed = self.dtl.lock().config_as_it_should_be();
        self.adjust_failovercache_config_(id, FocConfigMode::Automatic, computed.as_ref())
    }

    fn adjust_failovercache_config_(
        &self,
        id: &ObjectId,
        mode: FocConfigMode,
        config: Option<&FailoverCacheConfig>,
    ) -> Result<()> {
        self.registry.set_foc_config_mode(id, mode)?;

        let old = self.engine.failover_cache_config(id)?;
        if old.as_ref() != config {
            info!(
                "{}: setting failover cache config {:?} -> {:?}",
                id, old, config
            );
            if let Err(e) = self.engine.set_failover_cache_config(id, config) {
                warn!("{}: error setting failover cache config: {}", id, e);
            }
        }

        Ok(())
    }

    fn try_adjust_failovercache_config_(&self, id: &ObjectId) {
        let result = (|| -> Result<()> {
            if self.foc_config_mode(id)? == FocConfigMode::Automatic {
                let computed = self.dtl.lock().config_as_it_should_be();
                self.adjust_failovercache_config_(
                    id,
                    FocConfigMode::Automatic,
                    computed.as_ref(),
                )?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!("{}: failed to adjust failover cache config: {}", id, e);
        }
    }

    pub fn volume_potential(&self) -> Result<u64> {
        let sco_multiplier = self.config.lock().sco_multiplier;
        self.engine.volume_potential(sco_multiplier)
    }
}

pub(crate) fn volume_nspace(id: &ObjectId) -> Result<Namespace> {
    Namespace::new(id.as_str()).map_err(|e| Error::InvalidOperation(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn node_config(id: &str, failovercache_port: u16) -> ClusterNodeConfig {
        ClusterNodeConfig {
            node_id: NodeId::new(id),
            host: "127.0.0.1".into(),
            message_port: 20000,
            failovercache_port,
        }
    }

    #[test]
    fn dtl_targets_next_node_in_canonical_order() {
        let topology = |own: &str| DtlTopology {
            node_id: NodeId::new(own),
            mode: FocConfigMode::Automatic,
            foc_mode: FailoverCacheMode::Async,
            manual_config: None,
            // deliberately out of order: canonical order is by id
            nodes: vec![
                node_config("c", 3),
                node_config("a", 1),
                node_config("b", 2),
            ],
        };

        let next = |own: &str| {
            topology(own)
                .config_as_it_should_be()
                .map(|c| c.port)
                .unwrap()
        };

        // every node picks its successor, cyclically
        assert_eq!(next("a"), 2);
        assert_eq!(next("b"), 3);
        assert_eq!(next("c"), 1);
    }

    #[test]
    fn single_node_cluster_has_no_dtl() {
        let topology = DtlTopology {
            node_id: NodeId::new("a"),
            mode: FocConfigMode::Automatic,
            foc_mode: FailoverCacheMode::Async,
            manual_config: None,
            nodes: vec![node_config("a", 1)],
        };

        assert_eq!(topology.config_as_it_should_be(), None);
    }
}
