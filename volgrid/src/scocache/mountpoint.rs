//! One backing directory of the SCO cache.

use super::{cached::CachedSco, garbage::FileRemover, CacheError, Result};
use crate::{
    config::MountPointConfig,
    sco::{Namespace, Sco},
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

const LOCKFILE: &str = ".scocache";
const GARBAGE_DIR: &str = ".garbage";

/// Identity of a mountpoint, persisted in its lockfile so restarts
/// can tell the same directory apart from a lookalike.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountPointId([u8; 16]);

impl MountPointId {
    fn generate() -> MountPointId {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("random source unavailable");
        MountPointId(bytes)
    }
}

impl fmt::Display for MountPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MountPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Serialize, Deserialize)]
struct MetaData {
    uuid: MountPointId,
    error_epoch: u64,
}

/// A mountpoint backs a slice of the cache with one directory and a
/// capacity budget. Namespaces are subdirectories; the lockfile holds
/// `{uuid, error epoch}` so a previously offlined directory cannot
/// silently rejoin after a restart.
#[derive(Debug)]
pub struct ScoCacheMountPoint {
    path: PathBuf,
    capacity: u64,
    used: Mutex<u64>,
    choking: Mutex<Option<u32>>,
    offline: AtomicBool,
    uuid: MountPointId,
    error_epoch: AtomicU64,
    initialised: AtomicBool,
    remover: FileRemover,
}

impl ScoCacheMountPoint {
    /// Whether the directory was used as a mountpoint before: decides
    /// between restart and fresh creation.
    pub fn exists(cfg: &MountPointConfig) -> bool {
        cfg.path.join(LOCKFILE).exists()
    }

    pub(crate) fn new(cfg: &MountPointConfig, restart: bool) -> Result<Arc<ScoCacheMountPoint>> {
        let path = cfg.path.clone();

        if !path.is_dir() {
            return Err(CacheError::InvalidMountPoint {
                path,
                reason: "directory does not exist".into(),
            });
        }

        if path.file_name().map(|n| n == "lost+found").unwrap_or(false) {
            return Err(CacheError::InvalidMountPoint {
                path,
                reason: "invalid path".into(),
            });
        }

        if cfg.size == 0 {
            return Err(CacheError::InvalidMountPoint {
                path,
                reason: "capacity must be > 0".into(),
            });
        }

        let fs_size = filesystem_size(&path)?;
        let capacity = if cfg.size == u64::MAX {
            fs_size
        } else if cfg.size > fs_size {
            return Err(CacheError::InvalidMountPoint {
                path,
                reason: format!(
                    "filesystem cannot hold specified capacity: {} < {}",
                    fs_size, cfg.size
                ),
            });
        } else {
            cfg.size
        };

        // stale garbage staging from an earlier failed creation is
        // not a reason to reject the directory; the remover reaps it
        if !restart && !dir_is_empty(&path, &[GARBAGE_DIR])? {
            return Err(CacheError::InvalidMountPoint {
                path,
                reason: "directory is not empty".into(),
            });
        }

        let remover = FileRemover::new(path.join(GARBAGE_DIR))
            .map_err(|source| CacheError::MountpointIo { source })?;

        let mp = if restart {
            let meta = read_metadata(&path)?;

            let mp = ScoCacheMountPoint {
                path,
                capacity,
                used: Mutex::new(0),
                choking: Mutex::new(None),
                offline: AtomicBool::new(false),
                uuid: meta.uuid,
                error_epoch: AtomicU64::new(meta.error_epoch),
                initialised: AtomicBool::new(true),
                remover,
            };

            mp.scan_()?;
            debug!("{}: restarted", mp.path.display());
            mp
        } else {
            ScoCacheMountPoint {
                path,
                capacity,
                used: Mutex::new(0),
                choking: Mutex::new(None),
                offline: AtomicBool::new(false),
                uuid: MountPointId::generate(),
                error_epoch: AtomicU64::new(0),
                initialised: AtomicBool::new(false),
                remover,
            }
        };

        Ok(Arc::new(mp))
    }

    /// Second creation stage for fresh mountpoints: once the global
    /// error epoch is known, persist the lockfile.
    pub(crate) fn stage2(&self, error_epoch: u64) -> Result<()> {
        debug_assert!(!self.initialised.load(Ordering::Acquire));

        self.error_epoch.store(error_epoch, Ordering::Release);
        self.write_metadata_()?;
        self.initialised.store(true, Ordering::Release);

        debug!("{}: created", self.path.display());
        Ok(())
    }

    #[inline(always)]
    pub fn uuid(&self) -> MountPointId {
        self.uuid
    }

    pub fn error_epoch(&self) -> u64 {
        self.error_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn set_error_epoch(&self, error_epoch: u64) -> Result<()> {
        self.error_epoch.store(error_epoch, Ordering::Release);
        self.write_metadata_()
    }

    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline(always)]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    pub(crate) fn update_used(&self, diff: i64) {
        let mut used = self.used.lock();
        *used = used.saturating_add_signed(diff);
    }

    pub fn free_disk_space(&self) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.path).map_err(|errno| {
            CacheError::MountpointIo {
                source: io::Error::from(errno),
            }
        })?;

        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub(crate) fn set_choking(&self, throttle_usecs: u32) {
        *self.choking.lock() = Some(throttle_usecs);
    }

    pub(crate) fn clear_choking(&self) {
        *self.choking.lock() = None;
    }

    pub fn is_choking(&self) -> bool {
        self.choking.lock().is_some()
    }

    /// Delay imposed on every successful write while the mountpoint
    /// is choking.
    pub fn throttle_usecs(&self) -> Option<u32> {
        *self.choking.lock()
    }

    pub(crate) fn sco_path(&self, nspace: &Namespace, sco: Sco) -> PathBuf {
        self.path.join(nspace.as_str()).join(sco.to_string())
    }

    pub(crate) fn add_namespace(&self, nspace: &Namespace) -> Result<()> {
        debug_assert!(self.initialised.load(Ordering::Acquire));
        info!("{}: adding namespace {}", self.path.display(), nspace);

        let dir = self.path.join(nspace.as_str());
        if dir.exists() {
            return Err(CacheError::NamespaceExists(nspace.clone()));
        }

        fs::create_dir_all(&dir).map_err(|source| {
            error!(
                "{}: failed to add namespace {}: {}",
                self.path.display(),
                nspace,
                source
            );
            CacheError::MountpointIo { source }
        })
    }

    /// Drop the namespace directory, returning the bytes it held so
    /// the caller can settle the accounting.
    pub(crate) fn remove_namespace(&self, nspace: &Namespace) -> Result<u64> {
        debug_assert!(self.initialised.load(Ordering::Acquire));
        info!("{}: removing namespace {}", self.path.display(), nspace);

        let dir = self.path.join(nspace.as_str());
        if !dir.exists() {
            return Err(CacheError::NamespaceNotFound(nspace.clone()));
        }

        let bytes = tree_size(&dir).map_err(|source| CacheError::MountpointIo { source })?;
        fs::remove_dir_all(&dir).map_err(|source| CacheError::MountpointIo { source })?;

        Ok(bytes)
    }

    pub(crate) fn has_namespace(&self, nspace: &Namespace) -> bool {
        self.path.join(nspace.as_str()).exists()
    }

    /// Walk one namespace directory and adopt every regular file
    /// whose name parses as a SCO.
    pub(crate) fn scan_namespace(
        self: &Arc<Self>,
        nspace: &Namespace,
    ) -> Result<Vec<Arc<CachedSco>>> {
        debug_assert!(self.initialised.load(Ordering::Acquire));

        let dir = self.path.join(nspace.as_str());
        debug!("{}: scanning namespace {}", self.path.display(), nspace);

        let mut scos = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|source| CacheError::MountpointIo { source })?;

        for entry in entries {
            let entry = entry.map_err(|source| CacheError::MountpointIo { source })?;
            let path = entry.path();

            if !path.is_file() {
                warn!("ignoring non-file entry {}", path.display());
                continue;
            }

            let name = entry.file_name();
            let sco = match name.to_str().and_then(|n| n.parse::<Sco>().ok()) {
                Some(sco) => sco,
                None => {
                    warn!("ignoring non-SCO entry {}", path.display());
                    continue;
                }
            };

            scos.push(CachedSco::open_scanned(
                nspace.clone(),
                sco,
                Arc::clone(self),
                path,
            )?);
        }

        Ok(scos)
    }

    /// Stage `path` for asynchronous removal; falls back to a direct
    /// unlink if the rename fails. Failures are logged, the caller
    /// decides whether the mountpoint is still healthy.
    pub(crate) fn remove_file(&self, path: &Path) {
        if let Err(e) = self.remover.schedule(path) {
            warn!(
                "{}: failed to stage {} for removal: {} - unlinking directly",
                self.path.display(),
                path.display(),
                e
            );
            if let Err(e) = fs::remove_file(path) {
                error!("failed to unlink {}: {}", path.display(), e);
            }
        }
    }

    /// Undo creation: drop the lockfile and the (empty) garbage
    /// staging directory. Only valid for mountpoints without SCOs.
    pub(crate) fn retire(&self) -> Result<()> {
        fs::remove_file(self.lockfile_path_())
            .map_err(|source| CacheError::MountpointIo { source })?;
        let _ = fs::remove_dir(self.remover.path());
        Ok(())
    }

    fn lockfile_path_(&self) -> PathBuf {
        self.path.join(LOCKFILE)
    }

    fn write_metadata_(&self) -> Result<()> {
        let meta = MetaData {
            uuid: self.uuid,
            error_epoch: self.error_epoch.load(Ordering::Acquire),
        };

        let bytes = rmp_serde::to_vec(&meta).map_err(|e| CacheError::MountpointIo {
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let tmp = self.path.join(".scocache.tmp");
        write_and_sync(&tmp, &bytes).map_err(|source| CacheError::MountpointIo { source })?;
        fs::rename(&tmp, self.lockfile_path_())
            .map_err(|source| CacheError::MountpointIo { source })
    }

    /// Restart-time walk: account for every SCO file already present,
    /// warn about anything else.
    fn scan_(&self) -> Result<()> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.path).map_err(|source| CacheError::MountpointIo { source })?
        {
            let entry = entry.map_err(|source| CacheError::MountpointIo { source })?;
            let name = entry.file_name();

            // lockfile and garbage staging live at the top level
            if name.to_string_lossy().starts_with('.') {
                continue;
            }

            let path = entry.path();
            if path.is_dir() {
                total += scan_tree(&path)?;
            } else {
                warn!("{}: found non-SCO entry {}", self.path.display(), path.display());
            }
        }

        self.update_used(total as i64);
        Ok(())
    }
}

fn scan_tree(dir: &Path) -> Result<u64> {
    let mut total = 0u64;

    for entry in fs::read_dir(dir).map_err(|source| CacheError::MountpointIo { source })? {
        let entry = entry.map_err(|source| CacheError::MountpointIo { source })?;
        let path = entry.path();

        if path.is_dir() {
            total += scan_tree(&path)?;
        } else if !Sco::is_sco_string(&entry.file_name().to_string_lossy()) {
            warn!("ignoring non-SCO entry {}", path.display());
        } else {
            let meta = entry
                .metadata()
                .map_err(|source| CacheError::MountpointIo { source })?;
            debug!("adding {}, size {}", path.display(), meta.len());
            total += meta.len();
        }
    }

    Ok(total)
}

fn tree_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0u64;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            total += tree_size(&path)?;
        } else {
            total += entry.metadata()?.len();
        }
    }

    Ok(total)
}

fn dir_is_empty(path: &Path, ignore: &[&str]) -> Result<bool> {
    let entries = fs::read_dir(path).map_err(|source| CacheError::MountpointIo { source })?;

    for entry in entries {
        let entry = entry.map_err(|source| CacheError::MountpointIo { source })?;
        let name = entry.file_name();
        if !ignore.iter().any(|i| name.to_string_lossy() == *i) {
            return Ok(false);
        }
    }

    Ok(true)
}

fn filesystem_size(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|errno| CacheError::MountpointIo {
        source: io::Error::from(errno),
    })?;

    Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
}

fn read_metadata(path: &Path) -> Result<MetaData> {
    let bytes =
        fs::read(path.join(LOCKFILE)).map_err(|source| CacheError::MountpointIo { source })?;

    rmp_serde::from_slice(&bytes).map_err(|e| CacheError::MountpointIo {
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(path: &Path) -> MountPointConfig {
        MountPointConfig {
            path: path.into(),
            size: 1 << 20,
        }
    }

    #[test]
    fn fresh_mountpoint_needs_stage2() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        assert!(!ScoCacheMountPoint::exists(&cfg));

        let mp = ScoCacheMountPoint::new(&cfg, false).unwrap();
        mp.stage2(3).unwrap();

        assert!(ScoCacheMountPoint::exists(&cfg));
        assert_eq!(mp.error_epoch(), 3);
    }

    #[test]
    fn restart_restores_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let (uuid, epoch) = {
            let mp = ScoCacheMountPoint::new(&cfg, false).unwrap();
            mp.stage2(7).unwrap();
            (mp.uuid(), mp.error_epoch())
        };

        let mp = ScoCacheMountPoint::new(&cfg, true).unwrap();
        assert_eq!(mp.uuid(), uuid);
        assert_eq!(mp.error_epoch(), epoch);
    }

    #[test]
    fn creation_refuses_nonempty_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("leftover"), b"junk").unwrap();

        assert!(matches!(
            ScoCacheMountPoint::new(&config(dir.path()), false),
            Err(CacheError::InvalidMountPoint { .. })
        ));
    }

    #[test]
    fn creation_refuses_lost_and_found() {
        let dir = tempfile::tempdir().unwrap();
        let lf = dir.path().join("lost+found");
        fs::create_dir(&lf).unwrap();

        assert!(matches!(
            ScoCacheMountPoint::new(&config(&lf), false),
            Err(CacheError::InvalidMountPoint { .. })
        ));
    }

    #[test]
    fn restart_scan_accounts_for_sco_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        {
            let mp = ScoCacheMountPoint::new(&cfg, false).unwrap();
            mp.stage2(0).unwrap();
        }

        let nspace = dir.path().join("vol");
        fs::create_dir(&nspace).unwrap();
        fs::write(nspace.join("00_00000001_00"), vec![0u8; 4096]).unwrap();
        fs::write(nspace.join("00_00000002_00"), vec![0u8; 8192]).unwrap();
        fs::write(nspace.join("not-a-sco"), vec![0u8; 512]).unwrap();

        let mp = ScoCacheMountPoint::new(&cfg, true).unwrap();
        assert_eq!(mp.used(), 4096 + 8192);
    }

    #[test]
    fn namespace_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mp = ScoCacheMountPoint::new(&config(dir.path()), false).unwrap();
        mp.stage2(0).unwrap();

        let ns = Namespace::new("vol").unwrap();
        assert!(!mp.has_namespace(&ns));

        mp.add_namespace(&ns).unwrap();
        assert!(mp.has_namespace(&ns));
        assert!(matches!(
            mp.add_namespace(&ns),
            Err(CacheError::NamespaceExists(_))
        ));

        fs::write(mp.sco_path(&ns, Sco::new(0, 1)), vec![1u8; 1024]).unwrap();
        assert_eq!(mp.remove_namespace(&ns).unwrap(), 1024);
        assert!(!mp.has_namespace(&ns));
    }
}
