//! Consumer interface to the consensus registry holding the
//! volume-to-owner mapping, plus an in-process implementation used by
//! tests and single-node deployments.

mod cache;
pub use cache::CachedObjectRegistry;

use crate::{
    object::{NodeId, Object, ObjectId, ObjectType, SnapshotName},
    Error, Result,
};
use volgrid::Namespace;

use parking_lot::Mutex;

use std::{collections::BTreeMap, sync::Arc};

/// Monotone fencing token; bumped on every successful ownership
/// change of a volume.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct OwnerTag(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FailoverCacheMode {
    Sync,
    Async,
}

/// Where a volume's failover cache (DTL) lives.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FailoverCacheConfig {
    pub host: String,
    pub port: u16,
    pub mode: FailoverCacheMode,
}

/// Manual pins the DTL config; Automatic follows the cluster
/// topology.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FocConfigMode {
    Automatic,
    Manual,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Offline,
}

/// Position of an object in the clone tree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TreeConfig {
    Base,
    Clone {
        parent: ObjectId,
        parent_snapshot: Option<SnapshotName>,
    },
    Template,
}

#[derive(Clone, Debug)]
pub struct ObjectRegistration {
    pub id: ObjectId,
    pub nspace: Namespace,
    pub node_id: NodeId,
    pub object_type: ObjectType,
    pub tree: TreeConfig,
    /// Clones hanging off this object, with the snapshot each one was
    /// taken from.
    pub descendants: BTreeMap<ObjectId, Option<SnapshotName>>,
    pub owner_tag: OwnerTag,
    pub foc_mode: FocConfigMode,
}

impl ObjectRegistration {
    pub fn object(&self) -> Object {
        Object {
            object_type: self.object_type,
            id: self.id.clone(),
        }
    }
}

/// One step of a sequenced registry update. The whole sequence is
/// applied atomically; a failing assertion aborts it without side
/// effects.
#[derive(Clone, Debug)]
pub enum SequenceStep {
    AssertOwner { id: ObjectId, node: NodeId },
    AssertNodeState { node: NodeId, state: NodeState },
    SetOwner { id: ObjectId, to: NodeId },
}

#[derive(Clone, Debug, Default)]
pub struct Sequence {
    steps: Vec<SequenceStep>,
}

impl Sequence {
    pub fn new() -> Sequence {
        Sequence::default()
    }

    /// Migrate `id` from `from` to `to`, asserting `from` still owns
    /// it.
    pub fn prepare_migrate(&mut self, id: &ObjectId, from: &NodeId, to: &NodeId) {
        self.steps.push(SequenceStep::AssertOwner {
            id: id.clone(),
            node: from.clone(),
        });
        self.steps.push(SequenceStep::SetOwner {
            id: id.clone(),
            to: to.clone(),
        });
    }

    /// Assert that `node` is marked offline.
    pub fn prepare_node_offline_assertion(&mut self, node: &NodeId) {
        self.steps.push(SequenceStep::AssertNodeState {
            node: node.clone(),
            state: NodeState::Offline,
        });
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }
}

/// Volume-to-owner registry. All mutations go through the sequenced
/// API of the underlying store; ownership changes bump the owner tag.
pub trait ObjectRegistry: Send + Sync {
    fn find(&self, id: &ObjectId) -> Result<Option<Arc<ObjectRegistration>>>;

    fn find_or_fail(&self, id: &ObjectId) -> Result<Arc<ObjectRegistration>> {
        self.find(id)?
            .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))
    }

    fn register_base_volume(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>>;

    fn register_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>>;

    fn register_file(&self, id: &ObjectId, node: &NodeId) -> Result<Arc<ObjectRegistration>>;

    /// Fails with `WrongOwner` when `node` does not own the object.
    fn unregister(&self, id: &ObjectId, node: &NodeId) -> Result<()>;

    fn migrate(&self, id: &ObjectId, from: &NodeId, to: &NodeId) -> Result<()>;

    /// Execute a sequence of assertions and updates atomically.
    fn run_sequence(&self, desc: &str, seq: Sequence) -> Result<()>;

    fn set_volume_as_template(&self, id: &ObjectId, node: &NodeId) -> Result<()>;

    fn convert_base_to_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()>;

    fn set_foc_config_mode(&self, id: &ObjectId, mode: FocConfigMode) -> Result<()>;

    fn list(&self) -> Vec<ObjectId>;
}

/// Node liveness registry.
pub trait ClusterRegistry: Send + Sync {
    fn set_node_state(&self, node: &NodeId, state: NodeState) -> Result<()>;
    fn node_state(&self, node: &NodeId) -> Result<NodeState>;
    fn node_status_map(&self) -> BTreeMap<NodeId, NodeState>;
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectId, Arc<ObjectRegistration>>,
    nodes: BTreeMap<NodeId, NodeState>,
    next_tag: u64,
}

/// Registry keeping everything under one mutex, which trivially gives
/// the sequenced-assertion semantics of the real consensus store.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

impl MemoryRegistry {
    pub fn new() -> MemoryRegistry {
        MemoryRegistry::default()
    }

    pub fn shared() -> Arc<MemoryRegistry> {
        Arc::new(MemoryRegistry::new())
    }

    fn register_(
        &self,
        state: &mut MemoryState,
        id: &ObjectId,
        nspace: Namespace,
        node: &NodeId,
        object_type: ObjectType,
        tree: TreeConfig,
    ) -> Result<Arc<ObjectRegistration>> {
        if state.objects.contains_key(id) {
            return Err(Error::InvalidOperation(format!(
                "object {} is already registered",
                id
            )));
        }

        state.next_tag += 1;
        let reg = Arc::new(ObjectRegistration {
            id: id.clone(),
            nspace,
            node_id: node.clone(),
            object_type,
            tree,
            descendants: BTreeMap::new(),
            owner_tag: OwnerTag(state.next_tag),
            foc_mode: FocConfigMode::Automatic,
        });

        state.objects.insert(id.clone(), Arc::clone(&reg));
        Ok(reg)
    }

    fn update_(
        state: &mut MemoryState,
        id: &ObjectId,
        f: impl FnOnce(&mut ObjectRegistration),
    ) -> Result<()> {
        let reg = state
            .objects
            .get(id)
            .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))?;

        let mut updated = (**reg).clone();
        f(&mut updated);
        state.objects.insert(id.clone(), Arc::new(updated));
        Ok(())
    }

    fn set_owner_(state: &mut MemoryState, id: &ObjectId, to: &NodeId) -> Result<()> {
        state.next_tag += 1;
        let tag = OwnerTag(state.next_tag);
        Self::update_(state, id, |reg| {
            reg.node_id = to.clone();
            reg.owner_tag = tag;
        })
    }

    fn check_step_(state: &MemoryState, step: &SequenceStep) -> Result<()> {
        match step {
            SequenceStep::AssertOwner { id, node } => {
                let reg = state
                    .objects
                    .get(id)
                    .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))?;
                if &reg.node_id != node {
                    return Err(Error::WrongOwner {
                        id: id.clone(),
                        owner: reg.node_id.clone(),
                    });
                }
            }
            SequenceStep::AssertNodeState { node, state: want } => {
                let got = state.nodes.get(node).copied().unwrap_or(NodeState::Online);
                if got != *want {
                    return Err(match want {
                        NodeState::Offline => Error::NodeNotOffline(node.clone()),
                        NodeState::Online => Error::NodeNotOnline(node.clone()),
                    });
                }
            }
            SequenceStep::SetOwner { .. } => {}
        }
        Ok(())
    }
}

impl ObjectRegistry for MemoryRegistry {
    fn find(&self, id: &ObjectId) -> Result<Option<Arc<ObjectRegistration>>> {
        Ok(self.state.lock().objects.get(id).cloned())
    }

    fn register_base_volume(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>> {
        let mut state = self.state.lock();
        self.register_(
            &mut state,
            id,
            nspace.clone(),
            node,
            ObjectType::Volume,
            TreeConfig::Base,
        )
    }

    fn register_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
        node: &NodeId,
    ) -> Result<Arc<ObjectRegistration>> {
        let mut state = self.state.lock();

        if !state.objects.contains_key(parent) {
            return Err(Error::ObjectNotRegistered(parent.clone()));
        }

        let reg = self.register_(
            &mut state,
            id,
            nspace.clone(),
            node,
            ObjectType::Volume,
            TreeConfig::Clone {
                parent: parent.clone(),
                parent_snapshot: parent_snapshot.cloned(),
            },
        )?;

        let snap = parent_snapshot.cloned();
        let clone_id = id.clone();
        Self::update_(&mut state, parent, |p| {
            p.descendants.insert(clone_id, snap);
        })?;

        Ok(reg)
    }

    fn register_file(&self, id: &ObjectId, node: &NodeId) -> Result<Arc<ObjectRegistration>> {
        let mut state = self.state.lock();
        let nspace = Namespace::new(id.as_str())
            .map_err(|e| Error::InvalidOperation(e.to_string()))?;
        self.register_(&mut state, id, nspace, node, ObjectType::File, TreeConfig::Base)
    }

    fn unregister(&self, id: &ObjectId, node: &NodeId) -> Result<()> {
        let mut state = self.state.lock();

        let reg = state
            .objects
            .get(id)
            .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))?;

        if &reg.node_id != node {
            return Err(Error::WrongOwner {
                id: id.clone(),
                owner: reg.node_id.clone(),
            });
        }

        if !reg.descendants.is_empty() {
            return Err(Error::ObjectStillHasChildren(id.clone()));
        }

        let parent = match &reg.tree {
            TreeConfig::Clone { parent, .. } => Some(parent.clone()),
            _ => None,
        };

        state.objects.remove(id);

        if let Some(parent) = parent {
            let clone_id = id.clone();
            let _ = Self::update_(&mut state, &parent, |p| {
                p.descendants.remove(&clone_id);
            });
        }

        Ok(())
    }

    fn migrate(&self, id: &ObjectId, from: &NodeId, to: &NodeId) -> Result<()> {
        let mut seq = Sequence::new();
        seq.prepare_migrate(id, from, to);
        self.run_sequence("migrate", seq)
    }

    fn run_sequence(&self, _desc: &str, seq: Sequence) -> Result<()> {
        let mut state = self.state.lock();

        for step in seq.steps() {
            Self::check_step_(&state, step)?;
        }

        for step in seq.steps() {
            if let SequenceStep::SetOwner { id, to } = step {
                Self::set_owner_(&mut state, id, to)?;
            }
        }

        Ok(())
    }

    fn set_volume_as_template(&self, id: &ObjectId, node: &NodeId) -> Result<()> {
        let mut state = self.state.lock();

        let reg = state
            .objects
            .get(id)
            .ok_or_else(|| Error::ObjectNotRegistered(id.clone()))?;

        if &reg.node_id != node {
            return Err(Error::WrongOwner {
                id: id.clone(),
                owner: reg.node_id.clone(),
            });
        }

        Self::update_(&mut state, id, |reg| {
            reg.tree = TreeConfig::Template;
        })
    }

    fn convert_base_to_clone(
        &self,
        id: &ObjectId,
        nspace: &Namespace,
        parent: &ObjectId,
        parent_snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if !state.objects.contains_key(parent) {
            return Err(Error::ObjectNotRegistered(parent.clone()));
        }

        let tree = TreeConfig::Clone {
            parent: parent.clone(),
            parent_snapshot: parent_snapshot.cloned(),
        };
        let nspace = nspace.clone();
        Self::update_(&mut state, id, move |reg| {
            reg.tree = tree;
            reg.nspace = nspace;
        })?;

        let snap = parent_snapshot.cloned();
        let clone_id = id.clone();
        Self::update_(&mut state, parent, |p| {
            p.descendants.insert(clone_id, snap);
        })
    }

    fn set_foc_config_mode(&self, id: &ObjectId, mode: FocConfigMode) -> Result<()> {
        let mut state = self.state.lock();
        Self::update_(&mut state, id, |reg| {
            reg.foc_mode = mode;
        })
    }

    fn list(&self) -> Vec<ObjectId> {
        self.state.lock().objects.keys().cloned().collect()
    }
}

impl ClusterRegistry for MemoryRegistry {
    fn set_node_state(&self, node: &NodeId, state: NodeState) -> Result<()> {
        self.state.lock().nodes.insert(node.clone(), state);
        Ok(())
    }

    fn node_state(&self, node: &NodeId) -> Result<NodeState> {
        Ok(self
            .state
            .lock()
            .nodes
            .get(node)
            .copied()
            .unwrap_or(NodeState::Online))
    }

    fn node_status_map(&self) -> BTreeMap<NodeId, NodeState> {
        self.state.lock().nodes.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn nspace(name: &str) -> Namespace {
        Namespace::new(name).unwrap()
    }

    #[test]
    fn owner_tag_is_monotone() {
        let reg = MemoryRegistry::new();
        let (a, b) = (NodeId::new("a"), NodeId::new("b"));
        let id = ObjectId::new("vol");

        let tag0 = reg
            .register_base_volume(&id, &nspace("vol"), &a)
            .unwrap()
            .owner_tag;

        reg.migrate(&id, &a, &b).unwrap();
        let tag1 = reg.find_or_fail(&id).unwrap().owner_tag;
        assert!(tag1 > tag0);

        reg.migrate(&id, &b, &a).unwrap();
        assert!(reg.find_or_fail(&id).unwrap().owner_tag > tag1);
    }

    #[test]
    fn migrate_asserts_current_owner() {
        let reg = MemoryRegistry::new();
        let (a, b, c) = (NodeId::new("a"), NodeId::new("b"), NodeId::new("c"));
        let id = ObjectId::new("vol");

        reg.register_base_volume(&id, &nspace("vol"), &a).unwrap();

        assert!(matches!(
            reg.migrate(&id, &b, &c),
            Err(Error::WrongOwner { .. })
        ));
        assert_eq!(reg.find_or_fail(&id).unwrap().node_id, a);
    }

    #[test]
    fn steal_sequence_requires_offline_owner() {
        let reg = MemoryRegistry::new();
        let (a, b) = (NodeId::new("a"), NodeId::new("b"));
        let id = ObjectId::new("vol");

        reg.register_base_volume(&id, &nspace("vol"), &a).unwrap();

        let steal = |reg: &MemoryRegistry| {
            let mut seq = Sequence::new();
            seq.prepare_node_offline_assertion(&a);
            seq.prepare_migrate(&id, &a, &b);
            reg.run_sequence("steal volume", seq)
        };

        // owner still online: the assertion aborts the sequence
        // without touching ownership
        assert!(matches!(steal(&reg), Err(Error::NodeNotOffline(_))));
        assert_eq!(reg.find_or_fail(&id).unwrap().node_id, a);

        reg.set_node_state(&a, NodeState::Offline).unwrap();
        steal(&reg).unwrap();
        assert_eq!(reg.find_or_fail(&id).unwrap().node_id, b);

        // a second steal with the same stale owner loses the race
        assert!(matches!(steal(&reg), Err(Error::WrongOwner { .. })));
    }

    #[test]
    fn clones_track_descendants() {
        let reg = MemoryRegistry::new();
        let a = NodeId::new("a");
        let (parent, clone) = (ObjectId::new("parent"), ObjectId::new("clone"));
        let snap = SnapshotName::new("snap-1");

        reg.register_base_volume(&parent, &nspace("parent"), &a)
            .unwrap();
        reg.register_clone(&clone, &nspace("clone"), &parent, Some(&snap), &a)
            .unwrap();

        let p = reg.find_or_fail(&parent).unwrap();
        assert_eq!(p.descendants.get(&clone), Some(&Some(snap)));

        // the parent cannot go while the clone lives
        assert!(matches!(
            reg.unregister(&parent, &a),
            Err(Error::ObjectStillHasChildren(_))
        ));

        reg.unregister(&clone, &a).unwrap();
        assert!(reg.find_or_fail(&parent).unwrap().descendants.is_empty());
        reg.unregister(&parent, &a).unwrap();
    }

    #[test]
    fn unregister_twice_reports_not_registered() {
        let reg = MemoryRegistry::new();
        let a = NodeId::new("a");
        let id = ObjectId::new("vol");

        reg.register_base_volume(&id, &nspace("vol"), &a).unwrap();
        reg.unregister(&id, &a).unwrap();

        assert!(matches!(
            reg.unregister(&id, &a),
            Err(Error::ObjectNotRegistered(_))
        ));
    }
}
