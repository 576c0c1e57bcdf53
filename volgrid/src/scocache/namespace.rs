//! Per-volume view inside the cache.

use super::cached::CachedSco;
use crate::sco::{Namespace, Sco};

use std::{collections::BTreeMap, sync::Arc};

/// One cached SCO as seen from its namespace. A blocked entry is
/// reserved while its SCO is being fetched from the backend or is
/// queued for deletion; it must not be handed out for reads.
pub(crate) struct NamespaceEntry {
    pub(crate) sco: Arc<CachedSco>,
    pub(crate) blocked: bool,
}

pub(crate) struct CacheNamespace {
    name: Namespace,
    min_size: u64,
    max_non_disposable: u64,
    choking: bool,
    entries: BTreeMap<Sco, NamespaceEntry>,
}

impl CacheNamespace {
    pub(crate) fn new(name: Namespace, min_size: u64, max_non_disposable: u64) -> CacheNamespace {
        CacheNamespace {
            name,
            min_size,
            max_non_disposable,
            choking: false,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &Namespace {
        &self.name
    }

    pub(crate) fn min_size(&self) -> u64 {
        self.min_size
    }

    pub(crate) fn max_non_disposable(&self) -> u64 {
        self.max_non_disposable
    }

    pub(crate) fn set_limits(&mut self, min: u64, max_non_disposable: u64) {
        self.min_size = min;
        self.max_non_disposable = max_non_disposable;
    }

    pub(crate) fn set_limit_max(&mut self, max_non_disposable: u64) {
        self.max_non_disposable = max_non_disposable;
    }

    pub(crate) fn is_choking(&self) -> bool {
        self.choking
    }

    pub(crate) fn set_choking(&mut self, choking: bool) {
        self.choking = choking;
    }

    pub(crate) fn find_entry(&self, sco: Sco) -> Option<&NamespaceEntry> {
        self.entries.get(&sco)
    }

    pub(crate) fn find_entry_mut(&mut self, sco: Sco) -> Option<&mut NamespaceEntry> {
        self.entries.get_mut(&sco)
    }

    /// Fails on duplicates: SCO names are unique within a namespace.
    pub(crate) fn insert(&mut self, sco: Arc<CachedSco>, blocked: bool) -> bool {
        let name = sco.sco();
        if self.entries.contains_key(&name) {
            return false;
        }

        self.entries.insert(name, NamespaceEntry { sco, blocked });
        true
    }

    pub(crate) fn erase(&mut self, sco: Sco) -> Option<NamespaceEntry> {
        self.entries.remove(&sco)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Sco, &NamespaceEntry)> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&Sco, &mut NamespaceEntry)> {
        self.entries.iter_mut()
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&NamespaceEntry) -> bool) {
        self.entries.retain(|_, e| keep(e));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
