//! LRU cache in front of the object registry.
//!
//! Lookups on the hot path tolerate a slightly stale registration
//! (the routing loop recovers from misdirected requests anyway);
//! anything ownership-critical reads through with `ignore_cache`.

use super::{
    FocConfigMode, ObjectRegistration, ObjectRegistry, Sequence,
};
use crate::{
    object::{NodeId, ObjectId, SnapshotName},
    Error, Result,
};
use volgrid::Namespace;

use lru::LruCache;
use parking_lot::Mutex;

use std::{num::NonZeroUsize, sync::Arc};

pub struct CachedObjectRegistry {
    inner: Arc<dyn ObjectRegistry>,
    cache: Mutex<LruCache<ObjectId, Arc<ObjectRegistration>>>,
}

impl CachedObjectRegistry {
    pub fn new(inner: Arc<dyn ObjectRegistry>, capacity: usize) -> CachedObjectRegistry {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        CachedObjectRegistry {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn find(
        &self,
        id: &ObjectId,
        ignore_cache: bool,
    ) -> Result<Option<Arc<ObjectRegistration>>> {
        if !ignore_cache {
            if let Some(reg) = self.cache.lock().get(id) {
                return Ok(Some(Arc::clone(reg)));
            }
        }

        let found = self.inner.find(id)?;
        let mut cache = self.cache.lock();
        match &found {
            Some(reg) => {
                cache.put(id.clone(), Arc::clone(reg));
            }
            None => {
                cache.pop(id);
            }
        }

        Ok(found)
    }

    pub fn find_or_fail(
        &self,
        id: &ObjectId,
        ignore_cache: bool,
    ) -> Result<Arc<ObjectRegistration>> {
        self.find(id, ignore_cache)?
            .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))
    }

    pub fn drop_entry(&self, id: &ObjectId) {
        self.cache.lock().pop(id);
    }

    pub fn register_base_volume(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>> {
        let reg = self.inner.register_base_volume(id, nspace, node)?;
        self.cache.lock().put(id.clone(), Arc::clone(&reg));
        Ok(reg)
    }

    pub fn register_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>> {
        let reg = self
            .inner
            .register_clone(id, nspace, parent, parent_snapshot, node)?;
        self.cache.lock().put(id.clone(), Arc::clone(&reg));
        self.drop_entry(parent);
        Ok(reg)
    }

    pub fn register_file(&self, id: &ObjectId, node: &NodeId) -> Result<Arc<ObjectRegistration>> {
        let reg = self.inner.register_file(id, node)?;
        self.cache.lock().put(id.clone(), Arc::clone(&reg));
        Ok(reg)
    }

    pub fn unregister(&self, id: &ObjectId, node: &NodeId) -> Result<()> {
        let result = self.inner.unregister(id, node);
        self.drop_entry(id);
        result
    }

    pub fn migrate(&self, id: &ObjectId, from: &NodeId, to: &NodeId) -> Result<()> {
        let result = self.inner.migrate(id, from, to);
        self.drop_entry(id);
        result
    }

    pub fn run_sequence(&self, desc: &str, seq: Sequence) -> Result<()> {
        self.inner.run_sequence(desc, seq)
    }

    pub fn set_volume_as_template(&self, id: &ObjectId, node: &NodeId) -> Result<()> {
        let result = self.inner.set_volume_as_template(id, node);
        self.drop_entry(id);
        result
    }

    pub fn convert_base_to_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        let result = self
            .inner
            .convert_base_to_clone(id, nspace, parent, parent_snapshot);
        self.drop_entry(id);
        self.drop_entry(parent);
        result
    }

    pub fn set_foc_config_mode(&self, id: &ObjectId, mode: FocConfigMode) -> Result<()> {
        let result = self.inner.set_foc_config_mode(id, mode);
        self.drop_entry(id);
        result
    }

    pub fn list(&self) -> Vec<ObjectId> {
        self.inner.list()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::MemoryRegistry;

    #[test]
    fn cached_reads_can_go_stale_until_dropped() {
        let backing = MemoryRegistry::shared();
        let cached = CachedObjectRegistry::new(backing.clone(), 4);

        let (a, b) = (NodeId::new("a"), NodeId::new("b"));
        let id = ObjectId::new("vol");
        let nspace = Namespace::new("vol").unwrap();

        cached.register_base_volume(&id, &nspace, &a).unwrap();
        assert_eq!(cached.find_or_fail(&id, false).unwrap().node_id, a);

        // mutate behind the cache's back
        ObjectRegistry::migrate(&*backing, &id, &a, &b).unwrap();

        assert_eq!(cached.find_or_fail(&id, false).unwrap().node_id, a);
        assert_eq!(cached.find_or_fail(&id, true).unwrap().node_id, b);

        // the read-through refreshed the entry
        assert_eq!(cached.find_or_fail(&id, false).unwrap().node_id, b);
    }

    #[test]
    fn drop_entry_forces_reread() {
        let backing = MemoryRegistry::shared();
        let cached = CachedObjectRegistry::new(backing.clone(), 4);

        let (a, b) = (NodeId::new("a"), NodeId::new("b"));
        let id = ObjectId::new("vol");
        let nspace = Namespace::new("vol").unwrap();

        cached.register_base_volume(&id, &nspace, &a).unwrap();
        ObjectRegistry::migrate(&*backing, &id, &a, &b).unwrap();

        cached.drop_entry(&id);
        assert_eq!(cached.find_or_fail(&id, false).unwrap().node_id, b);
    }
}
