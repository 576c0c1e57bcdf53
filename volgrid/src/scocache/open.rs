//! Scoped read/write descriptor over a cached SCO.

use super::{cached::CachedSco, CacheError, Result};
use crate::sco::Sco;

use log::error;

use std::{fs, os::unix::fs::FileExt, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Open file handle on a cached SCO. Construction opens, destruction
/// closes; the handle keeps the SCO alive (and thus off the cleaner's
/// menu) for its whole lifetime.
pub struct OpenSco {
    sco: Arc<CachedSco>,
    file: fs::File,
}

impl OpenSco {
    pub(crate) fn new(sco: Arc<CachedSco>, mode: OpenMode) -> Result<OpenSco> {
        if sco.mount_point().is_offline() {
            return Err(CacheError::Transient("mountpoint is offline"));
        }

        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
        };

        let file = options.open(sco.path()).map_err(|source| {
            error!("failed to open {}: {}", sco.path().display(), source);
            CacheError::MountpointIo { source }
        })?;

        Ok(OpenSco { sco, file })
    }

    pub fn sco_name(&self) -> Sco {
        self.sco.sco()
    }

    pub fn cached(&self) -> &Arc<CachedSco> {
        &self.sco
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_online_()?;

        self.file.read_at(buf, offset).map_err(|source| {
            error!("read error on {}: {}", self.sco.path().display(), source);
            CacheError::MountpointIo { source }
        })
    }

    /// Write at `offset`, reporting the throttle delay the mountpoint
    /// currently imposes. The caller is expected to apply the delay
    /// before issuing its next write.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<(usize, Option<u32>)> {
        self.check_online_()?;

        let written = self.file.write_at(buf, offset).map_err(|source| {
            error!("write error on {}: {}", self.sco.path().display(), source);
            CacheError::MountpointIo { source }
        })?;

        Ok((written, self.sco.mount_point().throttle_usecs()))
    }

    pub fn sync(&self) -> Result<()> {
        self.check_online_()?;

        self.file.sync_data().map_err(|source| {
            error!("sync error on {}: {}", self.sco.path().display(), source);
            CacheError::MountpointIo { source }
        })
    }

    fn check_online_(&self) -> Result<()> {
        if self.sco.mount_point().is_offline() {
            Err(CacheError::Transient("mountpoint is offline"))
        } else {
            Ok(())
        }
    }
}
