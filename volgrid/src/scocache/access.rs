//! Access-frequency snapshots exchanged with the volume engine.

use crate::sco::{Namespace, Sco};

/// Per-namespace snapshot of `(SCO, access weight)` pairs. The volume
/// engine persists these across restarts; enabling a namespace seeds
/// the scanned SCOs' weights from the snapshot so the eviction order
/// survives a process restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoAccessData {
    nspace: Namespace,
    weights: Vec<(Sco, f32)>,
}

impl ScoAccessData {
    pub fn new(nspace: Namespace) -> ScoAccessData {
        ScoAccessData {
            nspace,
            weights: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn namespace(&self) -> &Namespace {
        &self.nspace
    }

    pub fn add(&mut self, sco: Sco, weight: f32) {
        self.weights.push((sco, weight));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Sco, f32)> {
        self.weights.iter()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
