//! Collaborator traits around the local node.
//!
//! The volume engine (TLog replay, metadata, snapshot tree) and the
//! container manager for file-typed objects are external to the
//! router core; these traits are the exact surface the local node
//! drives. Volume data operations work in whole LBAs; the local node
//! does the bounce buffering for unaligned callers.

use crate::{
    object::{ObjectId, SnapshotName},
    registry::{FailoverCacheConfig, OwnerTag},
    Result,
};
use volgrid::Namespace;

/// The local volume manager. Transient faults are reported as
/// [`crate::Error::Transient`] and retried by the local node; a
/// volume unknown to the engine is
/// [`crate::Error::NotRunningHere`].
pub trait VolumeEngine: Send + Sync {
    fn create_volume(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        sco_multiplier: u32,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn create_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent_nspace: &Namespace,
        parent_snapshot: Option<&SnapshotName>,
        owner_tag: OwnerTag,
        create_namespace: bool,
    ) -> Result<()>;

    /// Restart from local state, falling back to the backend.
    fn local_restart(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        force: bool,
    ) -> Result<()>;

    /// Restart purely from the backend; used after migration/steal.
    fn backend_restart(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        owner_tag: OwnerTag,
        force: bool,
    ) -> Result<()>;

    fn is_running(&self, id: &ObjectId) -> bool;

    fn destroy_volume(&self, id: &ObjectId, delete_local_data: bool, remove_completely: bool)
        -> Result<()>;

    /// Drop local caches/data of a volume that runs elsewhere.
    fn remove_local_data(&self, nspace: &Namespace) -> Result<()>;

    /// Read whole LBAs starting at `lba`; `buf` is a multiple of the
    /// LBA size. Short volumes read as zeroes.
    fn read(&self, id: &ObjectId, lba: u64, buf: &mut [u8]) -> Result<()>;

    /// Write whole LBAs starting at `lba`.
    fn write(&self, id: &ObjectId, lba: u64, buf: &[u8]) -> Result<()>;

    fn sync(&self, id: &ObjectId) -> Result<()>;

    fn volume_size(&self, id: &ObjectId) -> Result<u64>;

    fn resize(&self, id: &ObjectId, new_size: u64) -> Result<()>;

    fn lba_size(&self, id: &ObjectId) -> Result<u64>;

    fn create_snapshot(&self, id: &ObjectId) -> Result<SnapshotName>;

    /// Snapshots in creation order, oldest first.
    fn list_snapshots(&self, id: &ObjectId) -> Result<Vec<SnapshotName>>;

    fn delete_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()>;

    fn restore_snapshot(&self, id: &ObjectId, snap: &SnapshotName) -> Result<()>;

    fn is_synced_up_to(&self, id: &ObjectId, snap: &SnapshotName) -> Result<bool>;

    fn schedule_backend_sync(&self, id: &ObjectId) -> Result<()>;

    fn is_volume_synced(&self, id: &ObjectId) -> Result<bool>;

    fn set_as_template(&self, id: &ObjectId) -> Result<()>;

    /// How many more volumes this node could host with the given SCO
    /// multiplier.
    fn volume_potential(&self, sco_multiplier: u32) -> Result<u64>;

    fn get_scrub_work(
        &self,
        id: &ObjectId,
        start_snap: Option<&SnapshotName>,
        end_snap: Option<&SnapshotName>,
    ) -> Result<Vec<String>>;

    fn apply_scrub_result(&self, id: &ObjectId, result: &str) -> Result<()>;

    fn failover_cache_config(&self, id: &ObjectId) -> Result<Option<FailoverCacheConfig>>;

    fn set_failover_cache_config(
        &self,
        id: &ObjectId,
        config: Option<&FailoverCacheConfig>,
    ) -> Result<()>;
}

/// Manager for file-typed objects.
pub trait ContainerDriver: Send + Sync {
    fn create(&self, id: &ObjectId) -> Result<()>;
    fn read(&self, id: &ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, id: &ObjectId, offset: u64, buf: &[u8]) -> Result<usize>;
    fn sync(&self, id: &ObjectId) -> Result<()>;
    fn size(&self, id: &ObjectId) -> Result<u64>;
    fn resize(&self, id: &ObjectId, new_size: u64) -> Result<()>;
    fn unlink(&self, id: &ObjectId) -> Result<()>;
    fn restart(&self, id: &ObjectId) -> Result<()>;
    fn drop_from_cache(&self, id: &ObjectId) -> Result<()>;
}
