#![deny(clippy::all)]

#[macro_use]
extern crate serde_derive;

pub mod backend;
pub mod config;
mod sco;
pub mod scocache;

pub use backend::Backend;
pub use config::{MountPointConfig, ScoCacheConfig};
pub use sco::{ClusterLocation, Namespace, Sco};
pub use scocache::{CacheError, ScoCache, ScoFetcher};

pub use anyhow;
