//! Uniform per-object operation surface over cluster nodes.
//!
//! A `ClusterNode` is either the local node, which executes
//! operations against the engine, or a remote one, which forwards
//! them over the message channel. The router keeps one per configured
//! cluster member and dispatches without caring which is which.

mod remote;
pub use remote::RemoteNode;

use crate::{local::LocalNode, object::ClusterNodeConfig, Object, Result};

use std::sync::Arc;

pub enum ClusterNode {
    Local(Arc<LocalNode>),
    Remote(RemoteNode),
}

impl ClusterNode {
    pub fn config(&self) -> &ClusterNodeConfig {
        match self {
            ClusterNode::Local(node) => node.config(),
            ClusterNode::Remote(node) => node.config(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ClusterNode::Remote(_))
    }

    /// Read into `buf`; `size` is in-out so partial completion at the
    /// end of an object is reported.
    pub fn read(&self, obj: &Object, buf: &mut [u8], size: &mut usize, offset: u64) -> Result<()> {
        match self {
            ClusterNode::Local(node) => node.read(obj, buf, size, offset),
            ClusterNode::Remote(node) => node.read(obj, buf, size, offset),
        }
    }

    pub fn write(&self, obj: &Object, buf: &[u8], size: &mut usize, offset: u64) -> Result<()> {
        match self {
            ClusterNode::Local(node) => node.write(obj, buf, size, offset),
            ClusterNode::Remote(node) => node.write(obj, buf, size, offset),
        }
    }

    pub fn sync(&self, obj: &Object) -> Result<()> {
        match self {
            ClusterNode::Local(node) => node.sync(obj),
            ClusterNode::Remote(node) => node.sync(obj),
        }
    }

    pub fn get_size(&self, obj: &Object) -> Result<u64> {
        match self {
            ClusterNode::Local(node) => node.get_size(obj),
            ClusterNode::Remote(node) => node.get_size(obj),
        }
    }

    pub fn resize(&self, obj: &Object, new_size: u64) -> Result<()> {
        match self {
            ClusterNode::Local(node) => node.resize(obj, new_size),
            ClusterNode::Remote(node) => node.resize(obj, new_size),
        }
    }

    pub fn unlink(&self, obj: &Object) -> Result<()> {
        match self {
            ClusterNode::Local(node) => node.unlink(obj),
            ClusterNode::Remote(node) => node.unlink(obj),
        }
    }
}
