//! A SCO living on a cache mountpoint.

use super::{mountpoint::ScoCacheMountPoint, CacheError, OpenMode, OpenSco, Result};
use crate::sco::{Namespace, Sco};

use log::error;
use parking_lot::Mutex;

use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

const STICKY_BIT: u32 = 0o1000;

/// Cached object owned by a mountpoint. Its reference count doubles
/// as the liveness signal of the eviction logic: an entry whose only
/// reference is the namespace map is fair game for the cleaner.
///
/// The sticky bit on the backing file mirrors the disposable flag, so
/// a rescan after a restart recovers it. Becoming disposable is
/// one-way until removal.
#[derive(Debug)]
pub struct CachedSco {
    path: PathBuf,
    nspace: Namespace,
    sco: Sco,
    mount: Arc<ScoCacheMountPoint>,
    size: AtomicU64,
    xval: Mutex<f32>,
    disposable: AtomicBool,
    unlink_on_drop: AtomicBool,
}

impl CachedSco {
    /// Reserve space for a new SCO. The file itself appears when the
    /// writer opens it.
    pub(crate) fn create(
        nspace: Namespace,
        sco: Sco,
        mount: Arc<ScoCacheMountPoint>,
        size: u64,
        xval: f32,
    ) -> Result<Arc<CachedSco>> {
        let path = mount.sco_path(&nspace, sco);

        if size == 0 {
            error!("attempt to create SCO {} with size 0", path.display());
            return Err(CacheError::EmptySco { path });
        }

        mount.update_used(size as i64);

        Ok(Arc::new(CachedSco {
            path,
            nspace,
            sco,
            mount,
            size: AtomicU64::new(size),
            xval: Mutex::new(xval),
            disposable: AtomicBool::new(false),
            unlink_on_drop: AtomicBool::new(false),
        }))
    }

    /// Adopt an existing file found while scanning a mountpoint. Size
    /// and disposability come from the filesystem; the scan already
    /// accounted for the bytes.
    pub(crate) fn open_scanned(
        nspace: Namespace,
        sco: Sco,
        mount: Arc<ScoCacheMountPoint>,
        path: PathBuf,
    ) -> Result<Arc<CachedSco>> {
        if mount.is_offline() {
            return Err(CacheError::Transient("mountpoint is offline"));
        }

        let meta = fs::metadata(&path).map_err(|source| {
            error!("failed to stat {}: {}", path.display(), source);
            CacheError::MountpointIo { source }
        })?;

        Ok(Arc::new(CachedSco {
            path,
            nspace,
            sco,
            mount,
            size: AtomicU64::new(meta.len()),
            xval: Mutex::new(0.0),
            disposable: AtomicBool::new(meta.permissions().mode() & STICKY_BIT != 0),
            unlink_on_drop: AtomicBool::new(false),
        }))
    }

    #[inline(always)]
    pub fn nspace(&self) -> &Namespace {
        &self.nspace
    }

    #[inline(always)]
    pub fn sco(&self) -> Sco {
        self.sco
    }

    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline(always)]
    pub fn mount_point(&self) -> &Arc<ScoCacheMountPoint> {
        &self.mount
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Bytes actually occupied on disk. For SCOs still being written
    /// the reservation can exceed the file size; monitoring wants the
    /// latter. Filesystem errors fall back to the reservation.
    pub fn real_size(&self) -> u64 {
        if self.is_disposable() {
            return self.size();
        }

        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => self.size(),
        }
    }

    pub fn xval(&self) -> f32 {
        *self.xval.lock()
    }

    pub(crate) fn set_xval(&self, xval: f32) {
        *self.xval.lock() = xval;
    }

    pub(crate) fn add_xval(&self, delta: f32) {
        *self.xval.lock() += delta;
    }

    pub fn is_disposable(&self) -> bool {
        self.disposable.load(Ordering::Acquire)
    }

    /// Mark the SCO as persisted on the backend: set the sticky bit
    /// and settle the reservation to the real file size. Idempotent.
    pub(crate) fn set_disposable(&self) -> Result<()> {
        if self.is_disposable() {
            return Ok(());
        }

        if self.mount.is_offline() {
            return Err(CacheError::Transient("mountpoint is offline"));
        }

        let meta = fs::metadata(&self.path).map_err(|source| {
            error!("failed to stat {}: {}", self.path.display(), source);
            CacheError::MountpointIo { source }
        })?;

        if meta.len() == 0 {
            error!(
                "attempt to set empty SCO disposable: {}",
                self.path.display()
            );
            return Err(CacheError::MountpointIo {
                source: io::Error::new(io::ErrorKind::InvalidData, "empty SCO"),
            });
        }

        let mut perm = meta.permissions();
        perm.set_mode(perm.mode() | STICKY_BIT);
        fs::set_permissions(&self.path, perm).map_err(|source| {
            error!("failed to chmod {}: {}", self.path.display(), source);
            CacheError::MountpointIo { source }
        })?;

        let diff = meta.len() as i64 - self.size() as i64;
        self.size.store(meta.len(), Ordering::Relaxed);
        self.disposable.store(true, Ordering::Release);
        self.mount.update_used(diff);

        Ok(())
    }

    pub(crate) fn mark_unlink_on_drop(&self) {
        self.unlink_on_drop.store(true, Ordering::Release);
    }

    /// Release the space reservation without touching the file. Used
    /// when a fetch fails before anything was written.
    pub(crate) fn release_reservation(&self) {
        self.mount.update_used(-(self.size() as i64));
    }

    pub fn open(self: &Arc<Self>, mode: OpenMode) -> Result<OpenSco> {
        OpenSco::new(Arc::clone(self), mode)
    }
}

impl Drop for CachedSco {
    fn drop(&mut self) {
        if self.unlink_on_drop.load(Ordering::Acquire) {
            self.mount.remove_file(&self.path);
            self.mount.update_used(-(self.size() as i64));
        }
    }
}
