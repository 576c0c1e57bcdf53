//! Bounded, multi-mountpoint disk cache of SCOs.
//!
//! The cache stages SCOs produced by the volume engine before they
//! are flushed to the blob backend, and holds fetched copies for
//! reads. Every namespace gets a minimum reservation and a ceiling on
//! non-disposable (not yet backend-synced) data; eviction is weighted
//! by access probability and runs per mountpoint towards a free-space
//! target.

mod access;
mod cached;
mod garbage;
mod mountpoint;
mod namespace;
mod open;

pub use access::ScoAccessData;
pub use cached::CachedSco;
pub use mountpoint::{MountPointId, ScoCacheMountPoint};
pub use open::{OpenMode, OpenSco};

use namespace::CacheNamespace;

use crate::{
    config::{ConfigProblem, MountPointConfig, ScoCacheConfig},
    sco::{Namespace, Sco},
};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("transient: {0}")]
    Transient(&'static str),
    #[error("no mountpoints available")]
    NoMountPoints,
    #[error("mountpoint I/O error: {source}")]
    MountpointIo { source: io::Error },
    #[error("invalid mountpoint {path}: {reason}")]
    InvalidMountPoint { path: PathBuf, reason: String },
    #[error("SCO {nspace}/{sco} not found")]
    ScoNotFound { nspace: Namespace, sco: Sco },
    #[error("SCO {nspace}/{sco} already exists")]
    ScoExists { nspace: Namespace, sco: Sco },
    #[error("attempt to create SCO {path} with size 0")]
    EmptySco { path: PathBuf },
    #[error("attempt to remove non-disposable SCO {nspace}/{sco}")]
    NotDisposable { nspace: Namespace, sco: Sco },
    #[error("namespace {0} does not exist")]
    NamespaceNotFound(Namespace),
    #[error("namespace {0} already exists")]
    NamespaceExists(Namespace),
    #[error("namespace {0} still holds referenced SCOs")]
    NamespaceBusy(Namespace),
    #[error("fetching SCO failed: {source}")]
    Fetch { source: anyhow::Error },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Retryable by the caller, per the error taxonomy: blocked SCOs,
    /// cache-full conditions and offlined mountpoints all clear up on
    /// their own (or after a cleanup pass).
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors a [`ScoFetcher`] can report. Filesystem trouble while
/// filling the cache file is mountpoint trouble and offlines the
/// mountpoint; everything else is the backend's problem and removes
/// the reservation.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("mountpoint I/O error: {source}")]
    MountpointIo {
        #[from]
        source: io::Error,
    },
    #[error("backend error: {source}")]
    Backend { source: anyhow::Error },
}

/// Pulls a SCO's contents from elsewhere (typically the blob backend)
/// into a cache file.
pub trait ScoFetcher {
    fn fetch(&mut self, path: &Path) -> std::result::Result<(), FetchError>;

    /// Whether the fetched data is known to be persisted on the
    /// backend, making the cached copy immediately evictable.
    fn disposable(&self) -> bool {
        true
    }
}

/// Fetcher backed by the blob backend; the common case for reads of
/// evicted SCOs.
pub struct BackendFetcher<'a> {
    backend: &'a dyn crate::Backend,
    nspace: Namespace,
    sco: Sco,
}

impl<'a> BackendFetcher<'a> {
    pub fn new(backend: &'a dyn crate::Backend, nspace: Namespace, sco: Sco) -> Self {
        BackendFetcher {
            backend,
            nspace,
            sco,
        }
    }
}

impl ScoFetcher for BackendFetcher<'_> {
    fn fetch(&mut self, path: &Path) -> std::result::Result<(), FetchError> {
        self.backend
            .read(&self.nspace, &self.sco.to_string(), path)
            .map_err(|e| match e {
                crate::backend::BackendError::Io { source } => FetchError::MountpointIo { source },
                other => FetchError::Backend {
                    source: other.into(),
                },
            })
    }
}

/// Observer for cache-level telemetry.
pub trait CacheEventListener: Send + Sync {
    fn mount_point_offlined(&self, path: &Path) {
        let _ = path;
    }
}

#[derive(Clone, Debug)]
pub struct NamespaceInfo {
    pub name: Namespace,
    pub min_size: u64,
    pub max_non_disposable: u64,
    pub disposable: u64,
    pub non_disposable: u64,
    pub choking: bool,
}

#[derive(Clone, Debug)]
pub struct MountPointInfo {
    pub path: PathBuf,
    pub capacity: u64,
    pub free: u64,
    pub used: u64,
    pub throttle_usecs: Option<u32>,
    pub offline: bool,
}

#[derive(Default)]
struct Inner {
    mount_points: Vec<Arc<ScoCacheMountPoint>>,
    current: usize,
    namespaces: HashMap<Namespace, CacheNamespace>,
    error_epoch: u64,
}

struct XVals {
    cached_min: f32,
    initial: f32,
}

// LOCKING:
// (1) nspace_mgmt  - serializes management of inactive namespaces
// (2) cleanup_lock - excludes cleanup from namespace removal
// (3) inner        - namespace map, mountpoint list, write cursor
// (4) xvals        - weight rescaling state
// Always acquired in this order, never outward.
pub struct ScoCache {
    nspace_mgmt: Mutex<()>,
    cleanup_lock: Mutex<()>,
    inner: RwLock<Inner>,
    xvals: Mutex<XVals>,

    trigger_gap: AtomicU64,
    backoff_gap: AtomicU64,
    discount_factor: AtomicU32,
    throttle_usecs: AtomicU32,

    config: Mutex<ScoCacheConfig>,
    listener: Option<Arc<dyn CacheEventListener>>,
}

const MAX_THROTTLE_USECS: u32 = 1_000_000;

impl ScoCache {
    pub fn new(config: ScoCacheConfig) -> Result<ScoCache> {
        Self::with_listener_(config, None)
    }

    pub fn with_listener(
        config: ScoCacheConfig,
        listener: Arc<dyn CacheEventListener>,
    ) -> Result<ScoCache> {
        Self::with_listener_(config, Some(listener))
    }

    fn with_listener_(
        config: ScoCacheConfig,
        listener: Option<Arc<dyn CacheEventListener>>,
    ) -> Result<ScoCache> {
        let problems = config.check();
        if let Some(p) = problems.first() {
            return Err(CacheError::Config(format!("{}: {}", p.param, p.reason)));
        }

        let cache = ScoCache {
            nspace_mgmt: Mutex::new(()),
            cleanup_lock: Mutex::new(()),
            inner: RwLock::new(Inner::default()),
            xvals: Mutex::new(XVals {
                cached_min: 0.0,
                initial: 1.0,
            }),
            trigger_gap: AtomicU64::new(config.trigger_gap),
            backoff_gap: AtomicU64::new(config.backoff_gap),
            discount_factor: AtomicU32::new(config.discount_factor.to_bits()),
            throttle_usecs: AtomicU32::new(config.datastore_throttle_usecs),
            config: Mutex::new(config),
            listener,
        };

        {
            let mut inner = cache.inner.write();
            cache.init_mount_points_(&mut inner)?;
        }

        Ok(cache)
    }

    // Mountpoint restart protocol: surviving directories keep their
    // persisted identity, fresh ones get the lockfile only once the
    // global epoch is known, stale ones (epoch mismatch, i.e.
    // offlined in a previous life) are dropped, and the epoch is
    // bumped once more so this generation is distinguishable from the
    // next.
    fn init_mount_points_(&self, inner: &mut Inner) -> Result<()> {
        let configs = self.config.lock().scocache_mount_points.clone();

        let mut survivors = Vec::new();
        let mut fresh = Vec::new();
        let mut epoch = 0u64;

        for cfg in &configs {
            let restart = ScoCacheMountPoint::exists(cfg);
            match ScoCacheMountPoint::new(cfg, restart) {
                Ok(mp) => {
                    if restart {
                        epoch = epoch.max(mp.error_epoch());
                        survivors.push(mp);
                    } else {
                        fresh.push(mp);
                    }
                }
                Err(e) => {
                    error!(
                        "failed to initialize mountpoint {}: {} - proceeding without it",
                        cfg.path.display(),
                        e
                    );
                }
            }
        }

        for mp in fresh {
            match mp.stage2(epoch) {
                Ok(()) => survivors.push(mp),
                Err(e) => error!(
                    "failed to initialize new mountpoint {}: {} - dropping it",
                    mp.path().display(),
                    e
                ),
            }
        }

        let mut seen = HashSet::new();
        survivors.retain(|mp| {
            if seen.insert(mp.uuid()) {
                true
            } else {
                error!(
                    "duplicate mountpoint {} - dropping it",
                    mp.path().display()
                );
                false
            }
        });

        survivors.retain(|mp| {
            if mp.error_epoch() == epoch {
                true
            } else {
                error!(
                    "{} was previously offlined, dropping it",
                    mp.path().display()
                );
                false
            }
        });

        inner.mount_points = survivors;
        inner.current = 0;
        inner.error_epoch = epoch;

        self.bump_error_epoch_(inner);

        if inner.mount_points.is_empty() {
            error!("no usable mountpoints available, giving up");
            return Err(CacheError::NoMountPoints);
        }

        Ok(())
    }

    /// Late addition of a mountpoint; primarily here for tests and
    /// management tooling, config-driven setups go through restart.
    pub fn add_mount_point(&self, cfg: &MountPointConfig) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.mount_points.iter().any(|mp| mp.path() == cfg.path) {
            return Err(CacheError::InvalidMountPoint {
                path: cfg.path.clone(),
                reason: "already part of the cache".into(),
            });
        }

        let restart = ScoCacheMountPoint::exists(cfg);
        let mp = ScoCacheMountPoint::new(cfg, restart)?;
        if !restart {
            mp.stage2(inner.error_epoch)?;
        } else if mp.error_epoch() != inner.error_epoch {
            mp.set_error_epoch(inner.error_epoch)?;
        }

        let namespaces: Vec<Namespace> = inner.namespaces.keys().cloned().collect();
        for nspace in namespaces {
            if !mp.has_namespace(&nspace) {
                mp.add_namespace(&nspace)?;
            }
        }

        inner.mount_points.push(mp);
        Ok(())
    }

    /// Remove an idle mountpoint, leaving its directory as pristine
    /// as creation found it. Refused while SCOs live on it.
    pub fn remove_mount_point(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.write();

        let idx = inner
            .mount_points
            .iter()
            .position(|mp| mp.path() == path)
            .ok_or_else(|| CacheError::InvalidMountPoint {
                path: path.into(),
                reason: "not part of the cache".into(),
            })?;

        let mp = Arc::clone(&inner.mount_points[idx]);

        let referenced = inner.namespaces.values().any(|ns| {
            ns.iter()
                .any(|(_, e)| Arc::ptr_eq(e.sco.mount_point(), &mp))
        });
        if referenced {
            return Err(CacheError::InvalidMountPoint {
                path: path.into(),
                reason: "still holds cached SCOs".into(),
            });
        }

        let namespaces: Vec<Namespace> = inner.namespaces.keys().cloned().collect();
        for nspace in namespaces {
            if mp.has_namespace(&nspace) {
                mp.remove_namespace(&nspace)?;
            }
        }

        inner.mount_points.remove(idx);
        inner.current = 0;
        mp.retire()
    }

    pub fn has_mount_point(&self, path: &Path) -> bool {
        self.inner
            .read()
            .mount_points
            .iter()
            .any(|mp| mp.path() == path)
    }

    pub fn create_sco(&self, nspace: &Namespace, sco: Sco, sco_size: u64) -> Result<Arc<CachedSco>> {
        let mut inner = self.inner.write();
        let xval = self.initial_xval_();
        self.create_sco_(&mut inner, nspace, sco, sco_size, xval, false)
    }

    /// Look the SCO up, fetching it through `fetch` on a miss. The
    /// returned flag tells whether it was already cached.
    pub fn get_sco(
        &self,
        nspace: &Namespace,
        sco: Sco,
        sco_size: u64,
        fetch: &mut dyn ScoFetcher,
    ) -> Result<(Arc<CachedSco>, bool)> {
        let xval = self.initial_xval_();
        self.get_sco_(nspace, sco, sco_size, fetch, xval)
    }

    /// Advisory fetch-ahead. Declined (returning `false`) when the
    /// cache is soft-full and the caller's access probability is
    /// below the least valuable resident SCO; any failure during the
    /// actual fetch is logged and swallowed.
    pub fn prefetch_sco(
        &self,
        nspace: &Namespace,
        sco: Sco,
        sco_size: u64,
        sap: f32,
        fetch: &mut dyn ScoFetcher,
    ) -> bool {
        let min = self.xvals.lock().cached_min;
        if self.soft_cache_full_() && sap < min {
            debug!(
                "{}/{}: not prefetching, sap {} < {}",
                nspace, sco, sap, min
            );
            return false;
        }

        match self.get_sco_(nspace, sco, sco_size, fetch, sap) {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                // concurrent fetch of the same SCO, or the cache
                // filled up in the meantime
                debug!("transient error prefetching {}/{}: {}", nspace, sco, e);
            }
            Err(e) => {
                warn!("error prefetching {}/{}: {}", nspace, sco, e);
            }
        }

        true
    }

    pub fn find_sco(&self, nspace: &Namespace, sco: Sco) -> Result<Option<Arc<CachedSco>>> {
        let inner = self.inner.read();
        self.find_sco_(&inner, nspace, sco)
    }

    pub fn find_sco_or_fail(&self, nspace: &Namespace, sco: Sco) -> Result<Arc<CachedSco>> {
        self.find_sco(nspace, sco)?
            .ok_or_else(|| CacheError::ScoNotFound {
                nspace: nspace.clone(),
                sco,
            })
    }

    pub fn set_sco_disposable(&self, sco: &Arc<CachedSco>) -> Result<()> {
        let result = {
            let _inner = self.inner.read();
            sco.set_disposable()
        };

        match result {
            Err(CacheError::MountpointIo { .. }) => {
                self.report_io_error(sco);
                Err(CacheError::Transient("retryable I/O error"))
            }
            other => other,
        }
    }

    pub fn is_sco_disposable(&self, sco: &Arc<CachedSco>) -> bool {
        let _inner = self.inner.read();
        sco.is_disposable()
    }

    pub fn remove_sco(
        &self,
        nspace: &Namespace,
        sco: Sco,
        remove_non_disposable: bool,
        unlink: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        self.find_and_remove_sco_(&mut inner, nspace, sco, remove_non_disposable, false, unlink)
    }

    pub fn sco_name_list(&self, nspace: &Namespace, disposable: bool) -> Result<Vec<Sco>> {
        let inner = self.inner.read();
        let ns = Self::find_ns_or_fail_(&inner, nspace)?;

        Ok(ns
            .iter()
            .filter(|(_, e)| e.sco.is_disposable() == disposable)
            .map(|(sco, _)| *sco)
            .collect())
    }

    pub fn sco_name_list_all(&self, nspace: &Namespace) -> Result<Vec<Sco>> {
        let inner = self.inner.read();
        let ns = Self::find_ns_or_fail_(&inner, nspace)?;

        Ok(ns.iter().map(|(sco, _)| *sco).collect())
    }

    /// Report an I/O error observed on a SCO; offlines its
    /// mountpoint.
    pub fn report_io_error(&self, sco: &Arc<CachedSco>) {
        let mut inner = self.inner.write();
        self.report_io_error_(&mut inner, sco);
    }

    /// Record `count` accesses to a SCO, bumping its eviction weight.
    pub fn signal_sco_accessed(&self, sco: &Arc<CachedSco>, count: u32) {
        let _xvals = self.xvals.lock();
        sco.add_xval(count as f32 * self.discount_factor_());
    }

    /// Whether the namespace exceeded its non-disposable budget at
    /// the last cleanup; frontends consult this to throttle the
    /// volume.
    pub fn namespace_choking(&self, nspace: &Namespace) -> Result<bool> {
        let inner = self.inner.read();
        Ok(Self::find_ns_or_fail_(&inner, nspace)?.is_choking())
    }

    pub fn add_namespace(
        &self,
        nspace: &Namespace,
        min: u64,
        max_non_disposable: u64,
    ) -> Result<()> {
        let _mgmt = self.nspace_mgmt.lock();
        let mut inner = self.inner.write();

        if inner.namespaces.contains_key(nspace) {
            return Err(CacheError::NamespaceExists(nspace.clone()));
        }

        if Self::has_disabled_namespace_(&inner, nspace) {
            error!("namespace {} already exists but is inactive", nspace);
            return Err(CacheError::NamespaceExists(nspace.clone()));
        }

        if let Err(e) = Self::add_namespace_to_mount_points_(&inner.mount_points, nspace) {
            if let Err(e2) = Self::remove_namespace_from_mount_points_(&inner.mount_points, nspace)
            {
                error!(
                    "failed to recover from failed namespace creation {} - intervention required: {}",
                    nspace, e2
                );
            }
            return Err(e);
        }

        inner.namespaces.insert(
            nspace.clone(),
            CacheNamespace::new(nspace.clone(), min, max_non_disposable),
        );

        Ok(())
    }

    /// Drop a namespace and every SCO it holds, on disk included.
    pub fn remove_namespace(&self, nspace: &Namespace) -> Result<()> {
        let _mgmt = self.nspace_mgmt.lock();
        let _cleanup = self.cleanup_lock.lock();

        let to_delete = {
            let mut inner = self.inner.write();
            let ns = Self::find_ns_mut_or_fail_(&mut inner, nspace)?;

            let mut doomed = Vec::new();
            for (_, entry) in ns.iter_mut() {
                entry.blocked = true;
                doomed.push(Arc::clone(&entry.sco));
            }
            doomed
        };

        self.do_cleanup_(to_delete, true);

        let mut inner = self.inner.write();

        if !Self::find_ns_or_fail_(&inner, nspace)?.is_empty() {
            return Err(CacheError::NamespaceBusy(nspace.clone()));
        }

        inner.namespaces.remove(nspace);

        Self::remove_namespace_from_mount_points_(&inner.mount_points, nspace).map_err(|e| {
            error!(
                "failed to remove namespace {} from mountpoint(s) - intervention required: {}",
                nspace, e
            );
            e
        })
    }

    /// Re-activate a namespace whose directories survived a disable
    /// or restart, seeding access weights from `access_data`.
    pub fn enable_namespace(
        &self,
        nspace: &Namespace,
        min: u64,
        max_non_disposable: u64,
        access_data: &ScoAccessData,
    ) -> Result<()> {
        let _mgmt = self.nspace_mgmt.lock();
        let mut inner = self.inner.write();

        debug!("{}: enabling", nspace);

        if inner.namespaces.contains_key(nspace) {
            error!("{}: already active", nspace);
            return Err(CacheError::NamespaceExists(nspace.clone()));
        }

        inner.namespaces.insert(
            nspace.clone(),
            CacheNamespace::new(nspace.clone(), min, max_non_disposable),
        );

        let mount_points = inner.mount_points.clone();
        let mut scanned = Vec::new();
        let mut failure = None;

        for mp in &mount_points {
            let result = if mp.has_namespace(nspace) {
                mp.scan_namespace(nspace).map(|scos| scanned.extend(scos))
            } else {
                mp.add_namespace(nspace)
            };

            if let Err(e) = result {
                error!("{}: failed to activate namespace: {}", nspace, e);
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            inner.namespaces.remove(nspace);
            return Err(e);
        }

        {
            let ns = inner
                .namespaces
                .get_mut(nspace)
                .expect("namespace inserted above");
            for sco in scanned {
                let name = sco.sco();
                if !ns.insert(sco, true) {
                    warn!("{}: duplicate SCO {} while scanning", nspace, name);
                }
            }
        }

        self.init_xvals_(&mut inner, nspace, access_data);

        debug!("{}: enabled", nspace);
        Ok(())
    }

    /// Deactivate a namespace: entries disappear, the on-disk
    /// directories (and the used-bytes they account for) persist.
    pub fn disable_namespace(&self, nspace: &Namespace) -> Result<()> {
        let _mgmt = self.nspace_mgmt.lock();
        let mut inner = self.inner.write();

        inner
            .namespaces
            .remove(nspace)
            .map(|_| ())
            .ok_or_else(|| CacheError::NamespaceNotFound(nspace.clone()))
    }

    /// Remove the on-disk remains of a disabled namespace.
    pub fn remove_disabled_namespace(&self, nspace: &Namespace) -> Result<()> {
        let _mgmt = self.nspace_mgmt.lock();

        let mount_points = {
            let inner = self.inner.read();
            if inner.namespaces.contains_key(nspace) {
                error!("namespace {} is active, not removing it", nspace);
                return Err(CacheError::NamespaceExists(nspace.clone()));
            }
            inner.mount_points.clone()
        };

        for mp in &mount_points {
            if mp.has_namespace(nspace) {
                let bytes = mp.remove_namespace(nspace)?;
                mp.update_used(-(bytes as i64));
            }
        }

        Ok(())
    }

    pub fn has_namespace(&self, nspace: &Namespace) -> bool {
        self.inner.read().namespaces.contains_key(nspace)
    }

    pub fn has_disabled_namespace(&self, nspace: &Namespace) -> bool {
        let _mgmt = self.nspace_mgmt.lock();
        let inner = self.inner.read();
        Self::has_disabled_namespace_(&inner, nspace)
    }

    pub fn set_namespace_limits(
        &self,
        nspace: &Namespace,
        min: u64,
        max_non_disposable: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        Self::find_ns_mut_or_fail_(&mut inner, nspace)?.set_limits(min, max_non_disposable);
        Ok(())
    }

    pub fn set_namespace_limit_max(&self, nspace: &Namespace, max_non_disposable: u64) -> Result<()> {
        let mut inner = self.inner.write();
        Self::find_ns_mut_or_fail_(&mut inner, nspace)?.set_limit_max(max_non_disposable);
        Ok(())
    }

    /// Export the namespace's access weights for persistence.
    pub fn fill_access_data(&self, nspace: &Namespace) -> Result<ScoAccessData> {
        let inner = self.inner.read();
        let _xvals = self.xvals.lock();

        let ns = Self::find_ns_or_fail_(&inner, nspace)?;
        let mut sad = ScoAccessData::new(nspace.clone());

        for (sco, entry) in ns.iter() {
            sad.add(*sco, entry.sco.xval());
        }

        Ok(sad)
    }

    pub fn namespace_info(&self, nspace: &Namespace) -> Result<NamespaceInfo> {
        let inner = self.inner.read();
        let ns = Self::find_ns_or_fail_(&inner, nspace)?;

        let mut info = NamespaceInfo {
            name: nspace.clone(),
            min_size: ns.min_size(),
            max_non_disposable: ns.max_non_disposable(),
            disposable: 0,
            non_disposable: 0,
            choking: ns.is_choking(),
        };

        for (_, entry) in ns.iter() {
            if entry.sco.is_disposable() {
                info.disposable += entry.sco.real_size();
            } else {
                info.non_disposable += entry.sco.real_size();
            }
        }

        Ok(info)
    }

    pub fn mount_points_info(&self) -> Vec<MountPointInfo> {
        let inner = self.inner.read();

        inner
            .mount_points
            .iter()
            .map(|mp| MountPointInfo {
                path: mp.path().into(),
                capacity: mp.capacity(),
                free: mp.free_disk_space().unwrap_or(0),
                used: mp.used(),
                throttle_usecs: mp.throttle_usecs(),
                offline: mp.is_offline(),
            })
            .collect()
    }

    /// Base per-write throttle delay from the configuration.
    pub fn throttle_usecs(&self) -> u32 {
        self.throttle_usecs.load(Ordering::Relaxed)
    }

    /// Re-apply a changed configuration. Scalar parameters take
    /// effect immediately; mountpoint changes are refused and
    /// reported.
    pub fn update_config(&self, new: &ScoCacheConfig) -> Vec<ConfigProblem> {
        let mut config = self.config.lock();
        let problems = config.check_update(new);

        self.trigger_gap.store(new.trigger_gap, Ordering::Relaxed);
        self.backoff_gap.store(new.backoff_gap, Ordering::Relaxed);
        self.discount_factor
            .store(new.discount_factor.to_bits(), Ordering::Relaxed);
        self.throttle_usecs
            .store(new.datastore_throttle_usecs, Ordering::Relaxed);

        config.trigger_gap = new.trigger_gap;
        config.backoff_gap = new.backoff_gap;
        config.discount_factor = new.discount_factor;
        config.datastore_throttle_usecs = new.datastore_throttle_usecs;

        problems
    }

    /// Periodic maintenance: re-evaluate namespace admission, evict
    /// towards the backoff gap where the trigger gap is breached,
    /// adjust mountpoint choking, rescale access weights.
    pub fn cleanup(&self) {
        let _cleanup = self.cleanup_lock.lock();

        let to_delete = {
            let mut inner = self.inner.write();

            self.maybe_choke_namespaces_(&mut inner);

            let doomed = if self.check_for_work_(&mut inner) {
                self.prepare_cleanup_(&mut inner)
            } else {
                debug!("no cleanup required");
                Vec::new()
            };

            self.rescale_xvals_(&mut inner);
            doomed
        };

        self.do_cleanup_(to_delete, false);
    }

    // --- internals -----------------------------------------------------

    fn trigger_gap_(&self) -> u64 {
        self.trigger_gap.load(Ordering::Relaxed)
    }

    fn backoff_gap_(&self) -> u64 {
        self.backoff_gap.load(Ordering::Relaxed)
    }

    fn discount_factor_(&self) -> f32 {
        f32::from_bits(self.discount_factor.load(Ordering::Relaxed))
    }

    fn initial_xval_(&self) -> f32 {
        self.xvals.lock().initial
    }

    fn find_ns_or_fail_<'a>(inner: &'a Inner, nspace: &Namespace) -> Result<&'a CacheNamespace> {
        inner
            .namespaces
            .get(nspace)
            .ok_or_else(|| CacheError::NamespaceNotFound(nspace.clone()))
    }

    fn find_ns_mut_or_fail_<'a>(
        inner: &'a mut Inner,
        nspace: &Namespace,
    ) -> Result<&'a mut CacheNamespace> {
        inner
            .namespaces
            .get_mut(nspace)
            .ok_or_else(|| CacheError::NamespaceNotFound(nspace.clone()))
    }

    fn has_disabled_namespace_(inner: &Inner, nspace: &Namespace) -> bool {
        !inner.namespaces.contains_key(nspace)
            && inner.mount_points.iter().any(|mp| mp.has_namespace(nspace))
    }

    fn add_namespace_to_mount_points_(
        mount_points: &[Arc<ScoCacheMountPoint>],
        nspace: &Namespace,
    ) -> Result<()> {
        for mp in mount_points {
            if !mp.has_namespace(nspace) {
                mp.add_namespace(nspace)?;
            }
        }
        Ok(())
    }

    fn remove_namespace_from_mount_points_(
        mount_points: &[Arc<ScoCacheMountPoint>],
        nspace: &Namespace,
    ) -> Result<()> {
        for mp in mount_points {
            if mp.has_namespace(nspace) {
                mp.remove_namespace(nspace)?;
            }
        }
        Ok(())
    }

    fn find_sco_(
        &self,
        inner: &Inner,
        nspace: &Namespace,
        sco: Sco,
    ) -> Result<Option<Arc<CachedSco>>> {
        let ns = Self::find_ns_or_fail_(inner, nspace)?;

        match ns.find_entry(sco) {
            Some(entry) if entry.blocked => {
                debug!("sco {}/{} is currently being fetched", nspace, sco);
                Err(CacheError::Transient("sco is currently being fetched"))
            }
            Some(entry) => Ok(Some(Arc::clone(&entry.sco))),
            None => Ok(None),
        }
    }

    // currentMountPoint semantics: advance the cursor round-robin,
    // first skipping choking mountpoints, then (if all choke) falling
    // back to anything with room.
    fn get_write_mount_point_(
        &self,
        inner: &mut Inner,
        sco_size: u64,
    ) -> Result<Arc<ScoCacheMountPoint>> {
        let n = inner.mount_points.len();
        if n == 0 {
            return Err(CacheError::NoMountPoints);
        }

        let start = inner.current.min(n - 1);
        let mut chosen = None;

        for step in 1..=n {
            let idx = (start + step) % n;
            if !inner.mount_points[idx].is_choking() {
                chosen = Some(idx);
                break;
            }
        }

        let idx = chosen.unwrap_or_else(|| {
            for step in 1..=n {
                let idx = (start + step) % n;
                let mp = &inner.mount_points[idx];
                if mp.used() + sco_size <= mp.capacity() {
                    return idx;
                }
            }
            start
        });

        let mp = Arc::clone(&inner.mount_points[idx]);
        if mp.used() + sco_size > mp.capacity() {
            return Err(CacheError::Transient("cache full"));
        }

        inner.current = idx;
        Ok(mp)
    }

    fn create_sco_(
        &self,
        inner: &mut Inner,
        nspace: &Namespace,
        sco: Sco,
        sco_size: u64,
        xval: f32,
        blocked: bool,
    ) -> Result<Arc<CachedSco>> {
        {
            let ns = Self::find_ns_or_fail_(inner, nspace)?;
            if ns.find_entry(sco).is_some() {
                error!("attempt to create existing SCO {}/{}", nspace, sco);
                return Err(CacheError::ScoExists {
                    nspace: nspace.clone(),
                    sco,
                });
            }
        }

        let mp = self.get_write_mount_point_(inner, sco_size)?;
        let cached = CachedSco::create(nspace.clone(), sco, mp, sco_size, xval)?;

        let ns = Self::find_ns_mut_or_fail_(inner, nspace)?;
        if !ns.insert(Arc::clone(&cached), blocked) {
            cached.release_reservation();
            return Err(CacheError::ScoExists {
                nspace: nspace.clone(),
                sco,
            });
        }

        Ok(cached)
    }

    fn get_sco_(
        &self,
        nspace: &Namespace,
        sco: Sco,
        sco_size: u64,
        fetch: &mut dyn ScoFetcher,
        xval: f32,
    ) -> Result<(Arc<CachedSco>, bool)> {
        let cached = {
            let mut inner = self.inner.write();

            if let Some(found) = self.find_sco_(&inner, nspace, sco)? {
                return Ok((found, true));
            }

            debug!("{}/{} not cached, fetching it", nspace, sco);
            self.create_sco_(&mut inner, nspace, sco, sco_size, xval, true)?
        };

        match fetch.fetch(cached.path()) {
            Ok(()) => {}
            Err(FetchError::MountpointIo { source }) => {
                error!(
                    "I/O error fetching {}/{}: {}",
                    nspace, sco, source
                );
                self.report_io_error(&cached);
                return Err(CacheError::Transient("retryable I/O error"));
            }
            Err(FetchError::Backend { source }) => {
                error!("fetching {}/{} failed: {}", nspace, sco, source);
                let mut inner = self.inner.write();
                if let Ok(ns) = Self::find_ns_mut_or_fail_(&mut inner, nspace) {
                    ns.erase(sco);
                }
                cached.release_reservation();
                return Err(CacheError::Fetch { source });
            }
        }

        let mut inner = self.inner.write();

        if fetch.disposable() {
            if let Err(e) = cached.set_disposable() {
                if let CacheError::MountpointIo { .. } = e {
                    self.report_io_error_(&mut inner, &cached);
                    return Err(CacheError::Transient("retryable I/O error"));
                }
                return Err(e);
            }
        }

        // the mountpoint may have gone bad while the lock was
        // released around the fetch
        match Self::find_ns_mut_or_fail_(&mut inner, nspace)
            .ok()
            .and_then(|ns| ns.find_entry_mut(sco))
        {
            Some(entry) => entry.blocked = false,
            None => {
                return Err(CacheError::Transient(
                    "mountpoint went offline while fetching",
                ))
            }
        }

        Ok((cached, false))
    }

    fn find_and_remove_sco_(
        &self,
        inner: &mut Inner,
        nspace: &Namespace,
        sco: Sco,
        remove_non_disposable: bool,
        must_be_blocked: bool,
        unlink: bool,
    ) -> Result<()> {
        let ns = Self::find_ns_mut_or_fail_(inner, nspace)?;
        let entry = ns.find_entry(sco).ok_or_else(|| CacheError::ScoNotFound {
            nspace: nspace.clone(),
            sco,
        })?;

        if !must_be_blocked && entry.blocked {
            info!(
                "not removing SCO {}/{}: currently being retrieved from the backend, \
                 the cleaner will reap it later",
                nspace, sco
            );
            return Err(CacheError::Transient(
                "not removing a SCO that's concurrently being retrieved",
            ));
        }

        if !entry.sco.is_disposable() && !remove_non_disposable {
            error!("attempt to remove non-disposable SCO {}/{}", nspace, sco);
            return Err(CacheError::NotDisposable {
                nspace: nspace.clone(),
                sco,
            });
        }

        if unlink {
            entry.sco.mark_unlink_on_drop();
        }

        ns.erase(sco);
        Ok(())
    }

    fn report_io_error_(&self, inner: &mut Inner, sco: &Arc<CachedSco>) {
        error!("I/O error in SCO {}", sco.path().display());
        let mp = Arc::clone(sco.mount_point());
        self.offline_mount_point_(inner, &mp);
    }

    // Offlining removes the mountpoint from the rotation, drops every
    // cache entry that referenced it (without touching the files: the
    // filesystem is likely remounted read-only) and bumps the error
    // epoch so the directory cannot silently rejoin later.
    fn offline_mount_point_(&self, inner: &mut Inner, mp: &Arc<ScoCacheMountPoint>) {
        info!("offlining mountpoint {}", mp.path().display());

        mp.set_offline();

        let before = inner.mount_points.len();
        inner.mount_points.retain(|m| !Arc::ptr_eq(m, mp));

        if inner.mount_points.len() == before {
            debug!(
                "{}: mountpoint already removed, nothing left to do",
                mp.path().display()
            );
            return;
        }

        if let Some(listener) = &self.listener {
            listener.mount_point_offlined(mp.path());
        }

        for ns in inner.namespaces.values_mut() {
            ns.retain(|entry| !Arc::ptr_eq(entry.sco.mount_point(), mp));
        }

        inner.current = 0;
        self.bump_error_epoch_(inner);
    }

    // Failure to persist the new epoch offlines the mountpoint in
    // turn, which recurses here. That cascade is intended: a
    // mountpoint that cannot record the epoch cannot be trusted to
    // stay out after the next restart.
    fn bump_error_epoch_(&self, inner: &mut Inner) {
        inner.error_epoch += 1;
        let epoch = inner.error_epoch;

        let mut failed = None;
        for mp in &inner.mount_points {
            if let Err(e) = mp.set_error_epoch(epoch) {
                error!(
                    "failed to set error epoch of mountpoint {} to {}: {}",
                    mp.path().display(),
                    epoch,
                    e
                );
                failed = Some(Arc::clone(mp));
                break;
            }
        }

        if let Some(mp) = failed {
            self.offline_mount_point_(inner, &mp);
        }
    }

    fn maybe_choke_namespaces_(&self, inner: &mut Inner) {
        for ns in inner.namespaces.values_mut() {
            let mut non_disposable = 0u64;
            for (_, entry) in ns.iter() {
                if !entry.sco.is_disposable() {
                    non_disposable += entry.sco.size();
                }
            }

            let choke = non_disposable > ns.max_non_disposable();
            if choke != ns.is_choking() {
                info!(
                    "namespace {} non-disposable: {} MiB, max: {} MiB - {}choking it",
                    ns.name(),
                    non_disposable >> 20,
                    ns.max_non_disposable() >> 20,
                    if choke { "" } else { "un" }
                );
            }
            ns.set_choking(choke);
        }
    }

    // Side effect: un-chokes mountpoints whose gap recovered.
    fn check_for_work_(&self, inner: &mut Inner) -> bool {
        let mut work = false;
        let mount_points = inner.mount_points.clone();

        for mp in mount_points {
            if mp.is_offline() {
                continue;
            }

            let free = match mp.free_disk_space() {
                Ok(free) => free,
                Err(e) => {
                    error!(
                        "{}: failed to determine free space: {}",
                        mp.path().display(),
                        e
                    );
                    self.offline_mount_point_(inner, &mp);
                    continue;
                }
            };

            let gap = free.min(mp.capacity().saturating_sub(mp.used()));

            if gap < self.trigger_gap_() {
                debug!("{}: cleanup required", mp.path().display());
                work = true;
            } else {
                mp.clear_choking();
            }
        }

        work
    }

    fn prepare_cleanup_(&self, inner: &mut Inner) -> Vec<Arc<CachedSco>> {
        // Per namespace: collect the evictable SCOs (disposable,
        // unblocked, referenced by nothing but the cache), then keep
        // the highest-weight ones back until the namespace minimum is
        // covered.
        let mut candidates: Vec<Arc<CachedSco>> = Vec::new();

        for ns in inner.namespaces.values() {
            let mut evictable = Vec::new();
            let mut total = 0u64;
            let mut disposable = 0u64;

            for (_, entry) in ns.iter() {
                total += entry.sco.size();

                if entry.sco.is_disposable()
                    && !entry.blocked
                    && Arc::strong_count(&entry.sco) == 1
                {
                    disposable += entry.sco.size();
                    evictable.push(Arc::clone(&entry.sco));
                }
            }

            sort_by_xval(&mut evictable);

            let non_disposable = total - disposable;
            let mut preserve = ns.min_size().saturating_sub(non_disposable) as i64;

            while preserve > 0 {
                match evictable.pop() {
                    Some(sco) => preserve -= sco.size() as i64,
                    None => break,
                }
            }

            candidates.extend(evictable);
        }

        // Regroup the remaining candidates per mountpoint and trim
        // each towards the backoff gap.
        let mut per_mp: HashMap<MountPointId, Vec<Arc<CachedSco>>> = HashMap::new();
        for sco in candidates {
            per_mp
                .entry(sco.mount_point().uuid())
                .or_default()
                .push(sco);
        }

        let mut to_delete = Vec::new();
        let mount_points = inner.mount_points.clone();

        for mp in mount_points {
            let mut scos = per_mp.remove(&mp.uuid()).unwrap_or_default();
            sort_by_xval(&mut scos);
            self.trim_mount_point_(inner, &mp, scos, &mut to_delete);
        }

        to_delete
    }

    fn trim_mount_point_(
        &self,
        inner: &mut Inner,
        mp: &Arc<ScoCacheMountPoint>,
        scos: Vec<Arc<CachedSco>>,
        to_delete: &mut Vec<Arc<CachedSco>>,
    ) {
        debug!("trimming {}", mp.path().display());

        let mut free = match mp.free_disk_space() {
            Ok(free) => free.min(mp.capacity().saturating_sub(mp.used())),
            Err(e) => {
                error!(
                    "{}: failed to determine free space: {}",
                    mp.path().display(),
                    e
                );
                self.offline_mount_point_(inner, mp);
                return;
            }
        };

        if free >= self.trigger_gap_() {
            return;
        }

        let mut scos = scos.into_iter();
        while free < self.backoff_gap_() {
            let sco = match scos.next() {
                Some(sco) => sco,
                None => break,
            };

            if let Some(entry) = inner
                .namespaces
                .get_mut(sco.nspace())
                .and_then(|ns| ns.find_entry_mut(sco.sco()))
            {
                entry.blocked = true;
                free += sco.size();
                to_delete.push(sco);
            }
        }

        if free < self.trigger_gap_() {
            // throttle ingest proportionally to how far below the
            // trigger gap the mountpoint ended up
            let base = self.throttle_usecs() as f64;
            let delay = if free == 0 {
                MAX_THROTTLE_USECS
            } else {
                let factor = self.trigger_gap_() as f64 / free as f64;
                (base * factor).min(MAX_THROTTLE_USECS as f64) as u32
            };

            mp.set_choking(delay);
            info!(
                "{} is choking: free {} MiB < trigger {} MiB, throttling ingest with {} usec per cluster write",
                mp.path().display(),
                free >> 20,
                self.trigger_gap_() >> 20,
                delay
            );
        }
    }

    fn do_cleanup_(&self, to_delete: Vec<Arc<CachedSco>>, remove_non_disposable: bool) {
        for sco in to_delete {
            let mut inner = self.inner.write();

            let nspace = sco.nspace().clone();
            let name = sco.sco();

            if let Err(e) = self.find_and_remove_sco_(
                &mut inner,
                &nspace,
                name,
                remove_non_disposable,
                true,
                true,
            ) {
                // the entry can legitimately be gone if its
                // mountpoint was offlined since the candidate list
                // was built
                debug!("{}/{}: not removed: {}", nspace, name, e);
                continue;
            }

            let path = sco.path().to_path_buf();
            let mp = Arc::clone(sco.mount_point());

            // if something else still holds the SCO, the unlink
            // happens when that reference goes; only when ours is the
            // last one must the file be gone right here
            let last_ref = Arc::strong_count(&sco) == 1;
            drop(sco);

            if last_ref && path.exists() {
                error!("failed to remove SCO {}", path.display());
                self.offline_mount_point_(&mut inner, &mp);
            }
        }
    }

    fn init_xvals_(&self, inner: &mut Inner, nspace: &Namespace, access_data: &ScoAccessData) {
        let initial = self.initial_xval_();

        if let Some(ns) = inner.namespaces.get_mut(nspace) {
            for (sco, xval) in access_data.iter() {
                if let Some(entry) = ns.find_entry_mut(*sco) {
                    entry.sco.set_xval(*xval);
                    entry.blocked = false;
                }
            }

            for (_, entry) in ns.iter_mut() {
                if entry.blocked {
                    entry.sco.set_xval(initial);
                    entry.blocked = false;
                }
            }
        }

        self.rescale_xvals_(inner);
    }

    // Normalize weights so they sum to 1; the resulting 1/count
    // becomes the weight of freshly fetched SCOs and the minimum
    // feeds the prefetch admission check.
    fn rescale_xvals_(&self, inner: &mut Inner) {
        let mut xvals = self.xvals.lock();

        let mut sum = 0.0f32;
        let mut count = 0usize;

        for ns in inner.namespaces.values() {
            for (_, entry) in ns.iter() {
                sum += entry.sco.xval();
                count += 1;
            }
        }

        let mut min = f32::MAX;
        for ns in inner.namespaces.values() {
            for (_, entry) in ns.iter() {
                let new = if sum > 0.0 {
                    entry.sco.xval() / sum
                } else {
                    1.0 / count as f32
                };
                min = min.min(new);
                entry.sco.set_xval(new);
            }
        }

        xvals.cached_min = if count > 0 { min } else { 0.0 };
        xvals.initial = if count > 0 { 1.0 / count as f32 } else { 1.0 };
    }

    fn soft_cache_full_(&self) -> bool {
        // full means every mountpoint is below the backoff gap
        let inner = self.inner.read();
        for mp in &inner.mount_points {
            if mp.free_disk_space().unwrap_or(0) > self.backoff_gap_() {
                return false;
            }
        }
        true
    }
}

fn sort_by_xval(scos: &mut [Arc<CachedSco>]) {
    scos.sort_by(|a, b| {
        a.xval()
            .partial_cmp(&b.xval())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::test::InMemoryBackend;
    use crate::Backend;

    use std::fs;

    const SCO_SIZE: u64 = 4096;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        cache: ScoCache,
        nspace: Namespace,
    }

    fn fixture(mount_points: usize, capacity: u64, trigger: u64, backoff: u64) -> Fixture {
        let dirs: Vec<_> = (0..mount_points)
            .map(|_| tempfile::tempdir().unwrap())
            .collect();

        let cache = ScoCache::new(ScoCacheConfig {
            trigger_gap: trigger,
            backoff_gap: backoff,
            discount_factor: 1.0,
            datastore_throttle_usecs: 4000,
            scocache_mount_points: dirs
                .iter()
                .map(|d| MountPointConfig {
                    path: d.path().into(),
                    size: capacity,
                })
                .collect(),
        })
        .unwrap();

        let nspace = Namespace::new("vol").unwrap();
        cache.add_namespace(&nspace, 0, u64::MAX).unwrap();

        Fixture {
            _dirs: dirs,
            cache,
            nspace,
        }
    }

    fn fill_sco(fx: &Fixture, number: u32, disposable: bool, accesses: u32) {
        let sco = Sco::new(0, number);
        let cached = fx.cache.create_sco(&fx.nspace, sco, SCO_SIZE).unwrap();

        let open = cached.open(OpenMode::Write).unwrap();
        open.pwrite(&vec![number as u8; SCO_SIZE as usize], 0).unwrap();
        drop(open);

        if disposable {
            fx.cache.set_sco_disposable(&cached).unwrap();
        }

        fx.cache.signal_sco_accessed(&cached, accesses);
    }

    fn total_used(fx: &Fixture) -> u64 {
        fx.cache.mount_points_info().iter().map(|i| i.used).sum()
    }

    #[test]
    fn create_and_find() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        let sco = Sco::new(0, 1);

        let created = fx.cache.create_sco(&fx.nspace, sco, SCO_SIZE).unwrap();
        let found = fx.cache.find_sco(&fx.nspace, sco).unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &found));

        assert!(matches!(
            fx.cache.create_sco(&fx.nspace, sco, SCO_SIZE),
            Err(CacheError::ScoExists { .. })
        ));

        assert!(matches!(
            fx.cache.find_sco_or_fail(&fx.nspace, Sco::new(0, 2)),
            Err(CacheError::ScoNotFound { .. })
        ));
    }

    #[test]
    fn used_bytes_track_live_scos() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        for i in 1..=4 {
            fill_sco(&fx, i, i % 2 == 0, 1);
        }
        assert_eq!(total_used(&fx), 4 * SCO_SIZE);

        fx.cache
            .remove_sco(&fx.nspace, Sco::new(0, 2), false, true)
            .unwrap();
        assert_eq!(total_used(&fx), 3 * SCO_SIZE);

        // non-disposable SCOs refuse plain removal
        assert!(matches!(
            fx.cache.remove_sco(&fx.nspace, Sco::new(0, 1), false, true),
            Err(CacheError::NotDisposable { .. })
        ));
        fx.cache
            .remove_sco(&fx.nspace, Sco::new(0, 1), true, true)
            .unwrap();
        assert_eq!(total_used(&fx), 2 * SCO_SIZE);
    }

    #[test]
    fn sticky_bit_mirrors_disposable() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        fill_sco(&fx, 1, false, 1);

        let cached = fx.cache.find_sco(&fx.nspace, Sco::new(0, 1)).unwrap().unwrap();
        let mode = || {
            fs::metadata(cached.path())
                .unwrap()
                .permissions()
                .mode()
        };

        assert_eq!(mode() & 0o1000, 0);

        fx.cache.set_sco_disposable(&cached).unwrap();
        assert_ne!(mode() & 0o1000, 0);
        assert!(fx.cache.is_sco_disposable(&cached));

        // idempotent
        fx.cache.set_sco_disposable(&cached).unwrap();
        assert!(fx.cache.is_sco_disposable(&cached));
    }

    #[test]
    fn disposability_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScoCacheConfig {
            trigger_gap: SCO_SIZE,
            backoff_gap: 2 * SCO_SIZE,
            discount_factor: 1.0,
            datastore_throttle_usecs: 4000,
            scocache_mount_points: vec![MountPointConfig {
                path: dir.path().into(),
                size: 100 * SCO_SIZE,
            }],
        };
        let nspace = Namespace::new("vol").unwrap();

        {
            let cache = ScoCache::new(config.clone()).unwrap();
            cache.add_namespace(&nspace, 0, u64::MAX).unwrap();

            for i in 1..=2 {
                let cached = cache
                    .create_sco(&nspace, Sco::new(0, i), SCO_SIZE)
                    .unwrap();
                let open = cached.open(OpenMode::Write).unwrap();
                open.pwrite(&[7u8; SCO_SIZE as usize], 0).unwrap();
                drop(open);
                if i == 1 {
                    cache.set_sco_disposable(&cached).unwrap();
                }
            }
        }

        let cache = ScoCache::new(config).unwrap();
        cache
            .enable_namespace(&nspace, 0, u64::MAX, &ScoAccessData::new(nspace.clone()))
            .unwrap();

        assert_eq!(cache.sco_name_list(&nspace, true).unwrap(), vec![Sco::new(0, 1)]);
        assert_eq!(cache.sco_name_list(&nspace, false).unwrap(), vec![Sco::new(0, 2)]);

        // the restart scan accounted for both files
        let used: u64 = cache.mount_points_info().iter().map(|i| i.used).sum();
        assert_eq!(used, 2 * SCO_SIZE);
    }

    #[test]
    fn get_sco_fetches_on_miss() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        let backend = InMemoryBackend::new();
        backend.create_namespace(&fx.nspace).unwrap();

        let sco = Sco::new(0, 9);
        let payload = vec![0xabu8; SCO_SIZE as usize];
        {
            let staging = tempfile::NamedTempFile::new().unwrap();
            fs::write(staging.path(), &payload).unwrap();
            backend
                .write(&fx.nspace, &sco.to_string(), staging.path(), false)
                .unwrap();
        }

        let mut fetch = BackendFetcher::new(&backend, fx.nspace.clone(), sco);
        let (cached, was_cached) = fx
            .cache
            .get_sco(&fx.nspace, sco, SCO_SIZE, &mut fetch)
            .unwrap();

        assert!(!was_cached);
        assert!(cached.is_disposable());
        assert_eq!(fs::read(cached.path()).unwrap(), payload);

        // second time around it's a hit
        let (_, was_cached) = fx
            .cache
            .get_sco(&fx.nspace, sco, SCO_SIZE, &mut fetch)
            .unwrap();
        assert!(was_cached);
    }

    #[test]
    fn failed_fetch_releases_reservation() {
        struct FailingFetcher;

        impl ScoFetcher for FailingFetcher {
            fn fetch(&mut self, _path: &std::path::Path) -> std::result::Result<(), FetchError> {
                Err(FetchError::Backend {
                    source: anyhow::anyhow!("object missing"),
                })
            }
        }

        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        let sco = Sco::new(0, 4);

        assert!(matches!(
            fx.cache
                .get_sco(&fx.nspace, sco, SCO_SIZE, &mut FailingFetcher),
            Err(CacheError::Fetch { .. })
        ));

        assert_eq!(total_used(&fx), 0);
        assert!(fx.cache.find_sco(&fx.nspace, sco).unwrap().is_none());
    }

    #[test]
    fn eviction_prefers_low_weights() {
        // capacity of ten SCOs, all filled: cleanup frees towards the
        // backoff gap from the bottom of the weight order
        let fx = fixture(1, 10 * SCO_SIZE, 2 * SCO_SIZE, 6 * SCO_SIZE);

        for i in 1..=10 {
            fill_sco(&fx, i, true, i);
        }
        assert_eq!(total_used(&fx), 10 * SCO_SIZE);

        fx.cache.cleanup();

        let left = fx.cache.sco_name_list_all(&fx.nspace).unwrap();
        assert_eq!(
            left,
            (7..=10).map(|i| Sco::new(0, i)).collect::<Vec<_>>()
        );
        assert_eq!(total_used(&fx), 4 * SCO_SIZE);

        let info = &fx.cache.mount_points_info()[0];
        assert!(info.throttle_usecs.is_none());
        assert!(!info.offline);
    }

    #[test]
    fn cleanup_honors_namespace_min() {
        let fx = fixture(1, 10 * SCO_SIZE, 2 * SCO_SIZE, 6 * SCO_SIZE);
        fx.cache
            .set_namespace_limits(&fx.nspace, 8 * SCO_SIZE, u64::MAX)
            .unwrap();

        for i in 1..=10 {
            fill_sco(&fx, i, true, i);
        }

        fx.cache.cleanup();

        // the namespace minimum keeps the top eight; only the two
        // lowest weights were up for grabs
        let left = fx.cache.sco_name_list_all(&fx.nspace).unwrap();
        assert_eq!(left.len(), 8);
        assert!(!left.contains(&Sco::new(0, 1)));
        assert!(!left.contains(&Sco::new(0, 2)));
    }

    #[test]
    fn cleanup_never_evicts_non_disposable() {
        let fx = fixture(1, 10 * SCO_SIZE, 2 * SCO_SIZE, 6 * SCO_SIZE);

        for i in 1..=10 {
            fill_sco(&fx, i, false, i);
        }

        fx.cache.cleanup();

        assert_eq!(fx.cache.sco_name_list_all(&fx.nspace).unwrap().len(), 10);

        // the mountpoint chokes instead, and writers observe the
        // delay
        let info = &fx.cache.mount_points_info()[0];
        let delay = info.throttle_usecs.expect("mountpoint should be choking");
        assert!(delay > 0);

        let cached = fx
            .cache
            .find_sco(&fx.nspace, Sco::new(0, 1)).unwrap().unwrap();
        let open = cached.open(OpenMode::ReadWrite).unwrap();
        let (_, throttle) = open.pwrite(b"x", 0).unwrap();
        assert_eq!(throttle, Some(delay));
    }

    #[test]
    fn choking_starts_below_trigger_gap() {
        let capacity = 16 * SCO_SIZE;
        let trigger = 4 * SCO_SIZE;
        let fx = fixture(1, capacity, trigger, 6 * SCO_SIZE);

        // fill to exactly capacity - trigger_gap: still healthy
        for i in 1..=12 {
            fill_sco(&fx, i, false, 1);
        }
        fx.cache.cleanup();
        assert!(fx.cache.mount_points_info()[0].throttle_usecs.is_none());

        // one more cluster pushes the gap below the trigger
        fill_sco(&fx, 13, false, 1);
        fx.cache.cleanup();
        assert!(fx.cache.mount_points_info()[0].throttle_usecs.is_some());
    }

    #[test]
    fn namespace_chokes_past_non_disposable_budget() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        fx.cache
            .set_namespace_limits(&fx.nspace, 0, 2 * SCO_SIZE)
            .unwrap();

        for i in 1..=3 {
            fill_sco(&fx, i, false, 1);
        }

        fx.cache.cleanup();
        assert!(fx.cache.namespace_choking(&fx.nspace).unwrap());

        for i in 1..=2 {
            let cached = fx
                .cache
                .find_sco(&fx.nspace, Sco::new(0, i)).unwrap().unwrap();
            fx.cache.set_sco_disposable(&cached).unwrap();
        }

        fx.cache.cleanup();
        assert!(!fx.cache.namespace_choking(&fx.nspace).unwrap());
    }

    #[test]
    fn write_mount_point_rotates() {
        let fx = fixture(3, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        for i in 1..=6 {
            fill_sco(&fx, i, false, 1);
        }

        for info in fx.cache.mount_points_info() {
            assert_eq!(info.used, 2 * SCO_SIZE, "{}", info.path.display());
        }
    }

    #[test]
    fn full_cache_reports_transient() {
        let fx = fixture(1, 2 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        fill_sco(&fx, 1, false, 1);
        fill_sco(&fx, 2, false, 1);

        let err = fx
            .cache
            .create_sco(&fx.nspace, Sco::new(0, 3), SCO_SIZE)
            .unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }

    #[test]
    fn unreadable_mount_points_cascade_offline() {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();

        let cache = ScoCache::new(ScoCacheConfig {
            trigger_gap: SCO_SIZE,
            backoff_gap: 2 * SCO_SIZE,
            discount_factor: 1.0,
            datastore_throttle_usecs: 4000,
            scocache_mount_points: dirs
                .iter()
                .map(|d| MountPointConfig {
                    path: d.path().into(),
                    size: 100 * SCO_SIZE,
                })
                .collect(),
        })
        .unwrap();

        let nspace = Namespace::new("vol").unwrap();
        cache.add_namespace(&nspace, 0, u64::MAX).unwrap();

        // yank both directories out from under the cache
        for dir in &dirs {
            fs::remove_dir_all(dir.path()).unwrap();
        }

        cache.cleanup();

        assert!(cache.mount_points_info().is_empty());
        assert!(matches!(
            cache.create_sco(&nspace, Sco::new(0, 1), SCO_SIZE),
            Err(CacheError::NoMountPoints)
        ));
    }

    #[test]
    fn mount_point_add_remove_roundtrip() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        let extra = tempfile::tempdir().unwrap();
        let cfg = MountPointConfig {
            path: extra.path().into(),
            size: 100 * SCO_SIZE,
        };

        fx.cache.add_mount_point(&cfg).unwrap();
        assert!(fx.cache.has_mount_point(extra.path()));
        assert_eq!(fx.cache.mount_points_info().len(), 2);

        fx.cache.remove_mount_point(extra.path()).unwrap();
        assert!(!fx.cache.has_mount_point(extra.path()));
        assert_eq!(fx.cache.mount_points_info().len(), 1);
        assert_eq!(fs::read_dir(extra.path()).unwrap().count(), 0);
    }

    #[test]
    fn disabled_namespace_keeps_files() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);
        fill_sco(&fx, 1, true, 1);

        let path = fx
            .cache
            .find_sco(&fx.nspace, Sco::new(0, 1)).unwrap().unwrap()
            .path()
            .to_path_buf();

        fx.cache.disable_namespace(&fx.nspace).unwrap();
        assert!(!fx.cache.has_namespace(&fx.nspace));
        assert!(fx.cache.has_disabled_namespace(&fx.nspace));
        assert!(path.exists());

        fx.cache
            .enable_namespace(&fx.nspace, 0, u64::MAX, &ScoAccessData::new(fx.nspace.clone()))
            .unwrap();
        assert_eq!(fx.cache.sco_name_list_all(&fx.nspace).unwrap().len(), 1);

        fx.cache.disable_namespace(&fx.nspace).unwrap();
        fx.cache.remove_disabled_namespace(&fx.nspace).unwrap();
        assert!(!path.exists());
        assert!(!fx.cache.has_disabled_namespace(&fx.nspace));
        assert_eq!(total_used(&fx), 0);
    }

    #[test]
    fn access_data_seeds_enable() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        fill_sco(&fx, 1, true, 1);
        fill_sco(&fx, 2, true, 1);

        let mut sad = ScoAccessData::new(fx.nspace.clone());
        sad.add(Sco::new(0, 1), 5.0);

        fx.cache.disable_namespace(&fx.nspace).unwrap();
        fx.cache
            .enable_namespace(&fx.nspace, 0, u64::MAX, &sad)
            .unwrap();

        let seeded = fx
            .cache
            .find_sco(&fx.nspace, Sco::new(0, 1)).unwrap().unwrap();
        let fallback = fx
            .cache
            .find_sco(&fx.nspace, Sco::new(0, 2)).unwrap().unwrap();

        // weights are rescaled to sum to 1, the seeded one dominates
        assert!(seeded.xval() > fallback.xval());
    }

    #[test]
    fn remove_namespace_drops_everything() {
        let fx = fixture(1, 100 * SCO_SIZE, SCO_SIZE, 2 * SCO_SIZE);

        fill_sco(&fx, 1, true, 1);
        fill_sco(&fx, 2, false, 1);

        fx.cache.remove_namespace(&fx.nspace).unwrap();

        assert!(!fx.cache.has_namespace(&fx.nspace));
        assert!(!fx.cache.has_disabled_namespace(&fx.nspace));
        assert_eq!(total_used(&fx), 0);
    }
}
