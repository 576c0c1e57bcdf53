//! Deferred removal of large object files.
//!
//! Unlinking a multi-megabyte SCO can stall the I/O path on some
//! filesystems, so doomed files are renamed into a hidden staging
//! directory (a cheap metadata operation) and unlinked from a
//! dedicated thread.

use log::{debug, warn};

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

#[derive(Debug)]
pub(crate) struct FileRemover {
    dir: PathBuf,
    tx: Option<flume::Sender<PathBuf>>,
    worker: Option<thread::JoinHandle<()>>,
    seq: AtomicU64,
}

impl FileRemover {
    pub(crate) fn new(dir: PathBuf) -> io::Result<FileRemover> {
        fs::create_dir_all(&dir)?;

        let (tx, rx) = flume::unbounded::<PathBuf>();

        // reap leftovers from a previous run
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let _ = tx.send(entry.path());
        }

        let worker = thread::Builder::new()
            .name("file-remover".into())
            .spawn(move || {
                for path in rx.iter() {
                    match fs::remove_file(&path) {
                        Ok(()) => debug!("removed {}", path.display()),
                        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
                    }
                }
            })?;

        Ok(FileRemover {
            dir,
            tx: Some(tx),
            worker: Some(worker),
            seq: AtomicU64::new(0),
        })
    }

    /// Move `path` into the staging directory and queue its removal.
    /// The file is gone from its original location once this returns.
    pub(crate) fn schedule(&self, path: &Path) -> io::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "anonymous".into());
        let target = self.dir.join(format!("{}.{}", name, seq));

        fs::rename(path, &target)?;

        if let Some(tx) = &self.tx {
            let _ = tx.send(target);
        }

        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for FileRemover {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheduled_files_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join(".garbage");
        let remover = FileRemover::new(garbage.clone()).unwrap();

        let victim = dir.path().join("00_00000001_00");
        fs::write(&victim, b"doomed").unwrap();

        remover.schedule(&victim).unwrap();
        assert!(!victim.exists());

        // joining the worker drains the queue
        drop(remover);
        assert_eq!(fs::read_dir(&garbage).unwrap().count(), 0);
    }

    #[test]
    fn leftovers_are_reaped_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join(".garbage");
        fs::create_dir_all(&garbage).unwrap();
        fs::write(garbage.join("00_00000001_00.0"), b"stale").unwrap();

        drop(FileRemover::new(garbage.clone()).unwrap());
        assert_eq!(fs::read_dir(&garbage).unwrap().count(), 0);
    }
}
