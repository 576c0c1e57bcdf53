#![deny(clippy::all)]

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod local;
pub mod node;
mod periodic;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;

#[cfg(any(test, feature = "test"))]
pub mod testing;

mod object;

pub use config::RouterConfig;
pub use error::{Error, Result};
pub use local::LocalNode;
pub use object::{ClusterId, ClusterNodeConfig, NodeId, Object, ObjectId, ObjectType, SnapshotName};
pub use router::ObjectRouter;
