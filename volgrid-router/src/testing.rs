//! In-process collaborators for exercising the router against a real
//! SCO cache: a miniature volume engine that stages cluster writes in
//! SCOs, syncs them to an in-memory blob backend, and restores
//! volumes from it, plus a harness wiring several routers into a
//! cluster over loopback TCP.

use crate::{
    config::{LocalNodeConfig, RouterConfig},
    engine::{ContainerDriver, VolumeEngine},
    events::test::CollectingPublisher,
    object::{ClusterId, ClusterNodeConfig, NodeId, ObjectId, SnapshotName},
    registry::{
        FailoverCacheConfig, FailoverCacheMode, FocConfigMode, MemoryRegistry, OwnerTag,
    },
    router::ObjectRouter,
    Error, Result,
};
use crate::events::{Event, EventPublisher};
use volgrid::{
    backend::test::InMemoryBackend,
    scocache::{BackendFetcher, CacheEventListener, OpenMode, OpenSco, ScoAccessData},
    Backend, ClusterLocation, MountPointConfig, Namespace, Sco, ScoCache, ScoCacheConfig,
};

use parking_lot::Mutex;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Cluster size (and LBA size) of the test engine.
pub const CLUSTER_SIZE: u64 = 4096;

/// Clusters per SCO.
pub const SCO_CLUSTERS: u32 = 8;

#[derive(Clone, Default)]
pub struct VolumeMeta {
    pub size: u64,
    pub clusters: BTreeMap<u64, (Namespace, ClusterLocation)>,
    pub snapshots: Vec<SnapshotMeta>,
}

#[derive(Clone)]
pub struct SnapshotMeta {
    pub name: SnapshotName,
    pub size: u64,
    pub clusters: BTreeMap<u64, (Namespace, ClusterLocation)>,
}

/// The volume metadata "on the backend": what a node needs to restart
/// a volume from scratch. Shared between all engines of a test
/// cluster.
pub type SharedMeta = Arc<Mutex<HashMap<Namespace, VolumeMeta>>>;

struct CurrentSco {
    open: OpenSco,
    next: ClusterLocation,
}

struct VolumeState {
    nspace: Namespace,
    #[allow(dead_code)]
    owner_tag: OwnerTag,
    size: u64,
    clusters: BTreeMap<u64, (Namespace, ClusterLocation)>,
    snapshots: Vec<SnapshotMeta>,
    current: Option<CurrentSco>,
    dirty: bool,
    template: bool,
    foc_config: Option<FailoverCacheConfig>,
}

pub struct TestEngine {
    cache: Arc<ScoCache>,
    backend: Arc<InMemoryBackend>,
    meta: SharedMeta,
    volumes: Mutex<HashMap<ObjectId, VolumeState>>,
    potential: AtomicI64,
    sync_stuck: Mutex<HashSet<ObjectId>>,
    snap_seq: AtomicU64,
}

impl TestEngine {
    pub fn new(cache: Arc<ScoCache>, backend: Arc<InMemoryBackend>, meta: SharedMeta) -> TestEngine {
        TestEngine {
            cache,
            backend,
            meta,
            volumes: Mutex::new(HashMap::new()),
            potential: AtomicI64::new(1024),
            sync_stuck: Mutex::new(HashSet::new()),
            snap_seq: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<ScoCache> {
        &self.cache
    }

    /// Pretend backend syncs of this volume hang; lets tests drive
    /// the sync-timeout paths.
    pub fn set_sync_stuck(&self, id: &ObjectId, stuck: bool) {
        let mut set = self.sync_stuck.lock();
        if stuck {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    pub fn set_volume_potential(&self, potential: i64) {
        self.potential.store(potential, Ordering::Relaxed);
    }

    fn not_running_(id: &ObjectId) -> Error {
        Error::NotRunningHere(id.clone())
    }

    fn with_state_<T>(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut VolumeState) -> Result<T>,
    ) -> Result<T> {
        let mut volumes = self.volumes.lock();
        let state = volumes.get_mut(id).ok_or_else(|| Self::not_running_(id))?;
        f(state)
    }

    fn roll_sco_(&self, state: &mut VolumeState) -> Result<()> {
        let next_number = state
            .current
            .as_ref()
            .map(|c| c.next.sco().number() + 1)
            .or_else(|| {
                state
                    .clusters
                    .values()
                    .filter(|(ns, _)| *ns == state.nspace)
                    .map(|(_, loc)| loc.sco().number() + 1)
                    .max()
            })
            .unwrap_or(1);

        let sco = Sco::new(0, next_number);
        let cached =
            self.cache
                .create_sco(&state.nspace, sco, SCO_CLUSTERS as u64 * CLUSTER_SIZE)?;

        state.current = Some(CurrentSco {
            open: cached.open(OpenMode::Write)?,
            next: ClusterLocation::new(sco, 0),
        });

        Ok(())
    }

    // Append one cluster, returning where it landed.
    fn append_cluster_(&self, state: &mut VolumeState, chunk: &[u8]) -> Result<ClusterLocation> {
        let full = state
            .current
            .as_ref()
            .map(|c| c.next.offset() >= SCO_CLUSTERS)
            .unwrap_or(true);

        if full {
            self.roll_sco_(state)?;
        }

        let current = state.current.as_mut().expect("SCO rolled above");
        let loc = current.next;

        let (_, throttle) = current
            .open
            .pwrite(chunk, loc.offset() as u64 * CLUSTER_SIZE)?;
        if let Some(usecs) = throttle {
            thread::sleep(Duration::from_micros(usecs as u64));
        }

        current.next = loc.advanced();
        Ok(loc)
    }

    fn read_cluster_(&self, nspace: &Namespace, loc: ClusterLocation, buf: &mut [u8]) -> Result<()> {
        let sco_size = SCO_CLUSTERS as u64 * CLUSTER_SIZE;

        let cached = match self.cache.find_sco(nspace, loc.sco())? {
            Some(cached) => cached,
            None => {
                let mut fetch = BackendFetcher::new(&*self.backend, nspace.clone(), loc.sco());
                let (cached, _) = self.cache.get_sco(nspace, loc.sco(), sco_size, &mut fetch)?;
                cached
            }
        };

        let open = cached.open(OpenMode::Read)?;
        open.pread(buf, loc.offset() as u64 * CLUSTER_SIZE)?;
        self.cache.signal_sco_accessed(&cached, 1);

        Ok(())
    }

    // Push every non-disposable SCO of the volume to the backend and
    // publish the volume metadata. The current SCO is closed, the
    // next write starts a fresh one.
    fn sync_to_backend_(&self, id: &ObjectId) -> Result<()> {
        self.with_state_(id, |state| {
            if let Some(current) = state.current.take() {
                current.open.sync()?;
            }

            for sco in self.cache.sco_name_list(&state.nspace, false)? {
                let cached = self
                    .cache
                    .find_sco(&state.nspace, sco)?
                    .ok_or_else(|| Error::Transient("SCO disappeared during sync".into()))?;

                self.backend
                    .write(&state.nspace, &sco.to_string(), cached.path(), true)?;
                self.cache.set_sco_disposable(&cached)?;
            }

            self.meta.lock().insert(
                state.nspace.clone(),
                VolumeMeta {
                    size: state.size,
                    clusters: state.clusters.clone(),
                    snapshots: state.snapshots.clone(),
                },
            );

            state.dirty = false;
            Ok(())
        })
    }

    fn activate_namespace_(&self, nspace: &Namespace) -> Result<()> {
        if self.cache.has_namespace(nspace) {
            Ok(())
        } else if self.cache.has_disabled_namespace(nspace) {
            self.cache
                .enable_namespace(nspace, 0, u64::MAX, &ScoAccessData::new(nspace.clone()))?;
            Ok(())
        } else {
            self.cache.add_namespace(nspace, 0, u64::MAX)?;
            Ok(())
        }
    }

    // A clone's initial view of its parent: live state if the parent
    // runs here, backend metadata otherwise.
    fn parent_view_(
        &self,
        parent_nspace: &Namespace,
        snapshot: Option<&SnapshotName>,
    ) -> Result<(u64, BTreeMap<u64, (Namespace, ClusterLocation)>)> {
        let volumes = self.volumes.lock();

        let view = volumes
            .values()
            .find(|state| &state.nspace == parent_nspace)
            .map(|state| (state.size, state.clusters.clone(), state.snapshots.clone()));

        let (size, clusters, snapshots) = match view {
            Some(v) => v,
            None => {
                let meta = self.meta.lock();
                let m = meta.get(parent_nspace).ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "parent namespace {} not found on the backend",
                        parent_nspace
                    ))
                })?;
                (m.size, m.clusters.clone(), m.snapshots.clone())
            }
        };

        match snapshot {
            None => Ok((size, clusters)),
            Some(snap) => {
                let s = snapshots
                    .iter()
                    .find(|s| &s.name == snap)
                    .ok_or_else(|| {
                        Error::InvalidOperation(format!("unknown parent snapshot {}", snap))
                    })?;
                Ok((s.size, s.clusters.clone()))
            }
        }
    }
}

impl VolumeEngine for TestEngine {
    fn create_volume(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        _sco_multiplier: u32,
    ) -> Result<()> {
        self.backend.create_namespace(nspace)?;
        self.cache.add_namespace(nspace, 0, u64::MAX)?;

        self.volumes.lock().insert(
            id.clone(),
            VolumeState {
                nspace: nspace.clone(),
                owner_tag,
                size: 0,
                clusters: BTreeMap::new(),
                snapshots: Vec::new(),
                current: None,
                dirty: false,
                template: false,
                foc_config: None,
            },
        );

        Ok(())
    }

    fn create_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent_nspace: &Namespace,
        parent_snapshot: Option<&SnapshotName>,
        owner_tag: OwnerTag,
        create_namespace: bool,
    ) -> Result<()> {
        let (size, clusters) = self.parent_view_(parent_nspace, parent_snapshot)?;

        if create_namespace {
            self.backend.create_namespace(nspace)?;
        }
        self.activate_namespace_(nspace)?;

        self.volumes.lock().insert(
            id.clone(),
            VolumeState {
                nspace: nspace.clone(),
                owner_tag,
                size,
                clusters,
                snapshots: Vec::new(),
                current: None,
                dirty: false,
                template: false,
                foc_config: None,
            },
        );

        Ok(())
    }

    fn local_restart(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        force: bool,
    ) -> Result<()> {
        self.backend_restart(id, nspace, owner_tag, force)
    }

    fn backend_restart(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        _force: bool,
    ) -> Result<()> {
        let meta = self
            .meta
            .lock()
            .get(nspace)
            .cloned()
            .ok_or_else(|| Self::not_running_(id))?;

        self.activate_namespace_(nspace)?;

        self.volumes.lock().insert(
            id.clone(),
            VolumeState {
                nspace: nspace.clone(),
                owner_tag,
                size: meta.size,
                clusters: meta.clusters,
                snapshots: meta.snapshots,
                current: None,
                dirty: false,
                template: false,
                foc_config: None,
            },
        );

        Ok(())
    }

    fn is_running(&self, id: &ObjectId) -> bool {
        self.volumes.lock().contains_key(id)
    }

    fn destroy_volume(
        &self,
        id: &ObjectId,
        delete_local_data: bool,
        remove_completely: bool,
    ) -> Result<()> {
        let state = self
            .volumes
            .lock()
            .remove(id)
            .ok_or_else(|| Self::not_running_(id))?;
        let nspace = state.nspace.clone();
        drop(state);

        if delete_local_data {
            match self.cache.remove_namespace(&nspace) {
                Ok(()) | Err(volgrid::CacheError::NamespaceNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        } else if self.cache.has_namespace(&nspace) {
            self.cache.disable_namespace(&nspace)?;
        }

        if remove_completely {
            self.backend.delete_namespace(&nspace)?;
            self.meta.lock().remove(&nspace);
        }

        Ok(())
    }

    fn remove_local_data(&self, nspace: &Namespace) -> Result<()> {
        self.volumes.lock().retain(|_, state| &state.nspace != nspace);

        if self.cache.has_namespace(nspace) {
            self.cache.remove_namespace(nspace)?;
        } else if self.cache.has_disabled_namespace(nspace) {
            self.cache.remove_disabled_namespace(nspace)?;
        }

        Ok(())
    }

    fn read(&self, id: &ObjectId, lba: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64 % CLUSTER_SIZE, 0);

        let locations: Vec<Option<(Namespace, ClusterLocation)>> = self.with_state_(id, |state| {
            Ok((0..buf.len() as u64 / CLUSTER_SIZE)
                .map(|i| state.clusters.get(&(lba + i)).cloned())
                .collect())
        })?;

        for (i, loc) in locations.into_iter().enumerate() {
            let chunk = &mut buf[i * CLUSTER_SIZE as usize..(i + 1) * CLUSTER_SIZE as usize];
            match loc {
                Some((nspace, loc)) => self.read_cluster_(&nspace, loc, chunk)?,
                None => chunk.fill(0),
            }
        }

        Ok(())
    }

    fn write(&self, id: &ObjectId, lba: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64 % CLUSTER_SIZE, 0);

        self.with_state_(id, |state| {
            if state.template {
                return Err(Error::InvalidOperation(format!(
                    "{} is a template, no further writes",
                    id
                )));
            }

            for (i, chunk) in buf.chunks(CLUSTER_SIZE as usize).enumerate() {
                let loc = self.append_cluster_(state, chunk)?;
                state.clusters.insert(lba + i as u64, (state.nspace.clone(), loc));
            }

            state.size = state.size.max((lba + buf.len() as u64 / CLUSTER_SIZE) * CLUSTER_SIZE);
            state.dirty = true;
            Ok(())
        })
    }

    fn sync(&self, id: &ObjectId) -> Result<()> {
        self.sync_to_backend_(id)
    }

    fn volume_size(&self, id: &ObjectId) -> Result<u64> {
        self.with_state_(id, |state| Ok(state.size))
    }

    fn resize(&self, id: &ObjectId, new_size: u64) -> Result<()> {
        self.with_state_(id, |state| {
            state.size = new_size;
            state
                .clusters
                .retain(|lba, _| lba * CLUSTER_SIZE < new_size);
            state.dirty = true;
            Ok(())
        })
    }

    fn lba_size(&self, id: &ObjectId) -> Result<u64> {
        self.with_state_(id, |_| Ok(CLUSTER_SIZE))
    }

    fn create_snapshot(&self, id: &ObjectId) -> Result<SnapshotName> {
        let name = SnapshotName::new(format!(
            "snap-{}",
            self.snap_seq.fetch_add(1, Ordering::Relaxed)
        ));

        self.with_state_(id, |state| {
            state.snapshots.push(SnapshotMeta {
                name: name.clone(),
                size: state.size,
                clusters: state.clusters.clone(),
            });
            state.dirty = true;
            Ok(name.clone())
        })
    }

    fn list_snapshots(&self, id: &ObjectId) -> Result<Vec<SnapshotName>> {
        self.with_state_(id, |state| {
            Ok(state.snapshots.iter().map(|s| s.name.clone()).collect())
        })
    }

    fn delete_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        self.with_state_(id, |state| {
            let before = state.snapshots.len();
            state.snapshots.retain(|s| &s.name != snap);

            if state.snapshots.len() == before {
                return Err(Error::InvalidOperation(format!(
                    "unknown snapshot {}",
                    snap
                )));
            }

            state.dirty = true;
            Ok(())
        })
    }

    fn restore_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()> {
        self.with_state_(id, |state| {
            let s = state
                .snapshots
                .iter()
                .find(|s| &s.name == snap)
                .ok_or_else(|| Error::InvalidOperation(format!("unknown snapshot {}", snap)))?
                .clone();

            state.size = s.size;
            state.clusters = s.clusters;
            state.current = None;
            state.dirty = true;
            Ok(())
        })
    }

    fn is_synced_up_to(&self, id: &ObjectId, snap: &SnapshotName) -> Result<bool> {
        if self.sync_stuck.lock().contains(id) {
            return Ok(false);
        }

        self.with_state_(id, |state| {
            if !state.snapshots.iter().any(|s| &s.name == snap) {
                return Err(Error::InvalidOperation(format!(
                    "unknown snapshot {}",
                    snap
                )));
            }
            Ok(())
        })?;

        self.sync_to_backend_(id)?;
        Ok(true)
    }

    fn schedule_backend_sync(&self, id: &ObjectId) -> Result<()> {
        self.with_state_(id, |_| Ok(()))
    }

    fn is_volume_synced(&self, id: &ObjectId) -> Result<bool> {
        if self.sync_stuck.lock().contains(id) {
            return Ok(false);
        }

        self.sync_to_backend_(id)?;
        Ok(true)
    }

    fn set_as_template(&self, id: &ObjectId) -> Result<()> {
        self.with_state_(id, |state| {
            state.template = true;
            Ok(())
        })
    }

    fn volume_potential(&self, _sco_multiplier: u32) -> Result<u64> {
        let potential = self.potential.load(Ordering::Relaxed);
        let running = self.volumes.lock().len() as i64;
        Ok((potential - running).max(0) as u64)
    }

    fn get_scrub_work(
        &self,
        id: &ObjectId,
        start_snap: Option<&SnapshotName>,
        end_snap: Option<&SnapshotName>,
    ) -> Result<Vec<String>> {
        self.with_state_(id, |state| {
            let names: Vec<_> = state.snapshots.iter().map(|s| s.name.clone()).collect();

            let start = start_snap
                .and_then(|s| names.iter().position(|n| n == s))
                .unwrap_or(0);
            let end = end_snap
                .and_then(|s| names.iter().position(|n| n == s))
                .map(|i| i + 1)
                .unwrap_or(names.len());

            Ok(names[start..end]
                .iter()
                .map(|n| format!("scrub:{}", n))
                .collect())
        })
    }

    fn apply_scrub_result(&self, id: &ObjectId, result: &str) -> Result<()> {
        self.with_state_(id, |_| {
            if result.starts_with("scrub:") {
                Ok(())
            } else {
                Err(Error::InvalidOperation(format!(
                    "malformed scrub result {:?}",
                    result
                )))
            }
        })
    }

    fn failover_cache_config(&self, id: &ObjectId) -> Result<Option<FailoverCacheConfig>> {
        self.with_state_(id, |state| Ok(state.foc_config.clone()))
    }

    fn set_failover_cache_config(
        &self,
        id: &ObjectId,
        config: Option<&FailoverCacheConfig>,
    ) -> Result<()> {
        self.with_state_(id, |state| {
            state.foc_config = config.cloned();
            Ok(())
        })
    }
}

/// File objects as a plain in-memory byte store.
#[derive(Default)]
pub struct TestFiles {
    files: Mutex<HashMap<ObjectId, Vec<u8>>>,
}

impl TestFiles {
    pub fn new() -> TestFiles {
        TestFiles::default()
    }
}

impl ContainerDriver for TestFiles {
    fn create(&self, id: &ObjectId) -> Result<()> {
        let mut files = self.files.lock();
        if files.contains_key(id) {
            return Err(Error::InvalidOperation(format!(
                "file {} already exists",
                id
            )));
        }
        files.insert(id.clone(), Vec::new());
        Ok(())
    }

    fn read(&self, id: &ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let files = self.files.lock();
        let data = files
            .get(id)
            .ok_or_else(|| Error::NotRunningHere(id.clone()))?;

        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }

        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, id: &ObjectId, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut files = self.files.lock();
        let data = files
            .get_mut(id)
            .ok_or_else(|| Error::NotRunningHere(id.clone()))?;

        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn sync(&self, _id: &ObjectId) -> Result<()> {
        Ok(())
    }

    fn size(&self, id: &ObjectId) -> Result<u64> {
        let files = self.files.lock();
        files
            .get(id)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::NotRunningHere(id.clone()))
    }

    fn resize(&self, id: &ObjectId, new_size: u64) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .get_mut(id)
            .ok_or_else(|| Error::NotRunningHere(id.clone()))?;
        data.resize(new_size as usize, 0);
        Ok(())
    }

    fn unlink(&self, id: &ObjectId) -> Result<()> {
        self.files
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotRunningHere(id.clone()))
    }

    fn restart(&self, _id: &ObjectId) -> Result<()> {
        Ok(())
    }

    fn drop_from_cache(&self, _id: &ObjectId) -> Result<()> {
        Ok(())
    }
}

/// Forwards cache telemetry into the node's event publisher.
struct CacheEvents(Arc<CollectingPublisher>);

impl CacheEventListener for CacheEvents {
    fn mount_point_offlined(&self, path: &std::path::Path) {
        self.0.publish(Event::ScoCacheMountPointOfflined {
            path: path.to_path_buf(),
        });
    }
}

pub struct TestNode {
    pub router: Arc<ObjectRouter>,
    pub engine: Arc<TestEngine>,
    pub publisher: Arc<CollectingPublisher>,
    _mount_dirs: Vec<tempfile::TempDir>,
}

/// A loopback cluster: one registry, one blob backend, one shared
/// metadata store, N routers with their own caches and engines.
pub struct TestCluster {
    pub registry: Arc<MemoryRegistry>,
    pub backend: Arc<InMemoryBackend>,
    pub meta: SharedMeta,
    nodes: BTreeMap<NodeId, TestNode>,
    topology: Vec<ClusterNodeConfig>,
}

impl TestCluster {
    pub fn start(node_ids: &[&str]) -> TestCluster {
        Self::start_with(node_ids, |_| {})
    }

    pub fn start_with(node_ids: &[&str], tweak: impl Fn(&mut RouterConfig)) -> TestCluster {
        let registry = MemoryRegistry::shared();
        let backend = InMemoryBackend::shared();
        let meta: SharedMeta = Arc::default();

        let mut nodes = BTreeMap::new();
        let mut configs = Vec::new();

        for id in node_ids {
            configs.push(ClusterNodeConfig {
                node_id: NodeId::new(*id),
                host: "127.0.0.1".into(),
                message_port: 0,
                failovercache_port: 0,
            });
        }

        for id in node_ids {
            let mount_dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
            let publisher = Arc::new(CollectingPublisher::default());

            let cache = Arc::new(
                ScoCache::with_listener(
                    ScoCacheConfig {
                        trigger_gap: 1 << 20,
                        backoff_gap: 2 << 20,
                        discount_factor: 1.0e-3,
                        datastore_throttle_usecs: 100,
                        scocache_mount_points: mount_dirs
                            .iter()
                            .map(|d| MountPointConfig {
                                path: d.path().into(),
                                size: 64 << 20,
                            })
                            .collect(),
                    },
                    Arc::new(CacheEvents(Arc::clone(&publisher))),
                )
                .unwrap(),
            );

            let engine = Arc::new(TestEngine::new(
                cache,
                Arc::clone(&backend),
                Arc::clone(&meta),
            ));

            let mut config = RouterConfig {
                id: NodeId::new(*id),
                cluster_id: ClusterId::new("test-cluster"),
                nodes: configs.clone(),
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
                min_workers: 2,
                max_workers: 4,
                registry_cache_capacity: 64,
                local: LocalNodeConfig {
                    local_io_sleep_before_retry_usecs: 1000,
                    local_io_retries: 2,
                    sco_multiplier: SCO_CLUSTERS,
                    lock_reaper_interval_secs: 3600,
                },
            };
            tweak(&mut config);

            let router = ObjectRouter::new(
                config,
                registry.clone(),
                registry.clone(),
                Arc::clone(&engine) as Arc<dyn VolumeEngine>,
                Arc::new(TestFiles::new()),
                Arc::clone(&backend) as Arc<dyn Backend>,
                Arc::clone(&publisher) as Arc<dyn EventPublisher>,
                FocConfigMode::Automatic,
                FailoverCacheMode::Async,
                None,
            )
            .unwrap();

            nodes.insert(
                NodeId::new(*id),
                TestNode {
                    router,
                    engine,
                    publisher,
                    _mount_dirs: mount_dirs,
                },
            );
        }

        // bind everyone, then distribute the actual addresses
        let mut final_configs = Vec::new();
        for (node_id, node) in &nodes {
            let addr = node.router.start_message_server().unwrap();
            final_configs.push(ClusterNodeConfig {
                node_id: node_id.clone(),
                host: "127.0.0.1".into(),
                message_port: addr.port(),
                failovercache_port: addr.port(),
            });
        }

        for node in nodes.values() {
            node.router
                .update_cluster_node_configs(final_configs.clone())
                .unwrap();
        }

        TestCluster {
            registry,
            backend,
            meta,
            nodes,
            topology: final_configs,
        }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        &self.nodes[&NodeId::new(id)]
    }

    pub fn router(&self, id: &str) -> &Arc<ObjectRouter> {
        &self.node(id).router
    }

    pub fn topology(&self) -> Vec<ClusterNodeConfig> {
        self.topology.clone()
    }
}
