//! Consumer interface to the blob backend holding SCOs per namespace.

use crate::sco::Namespace;

use std::{io, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("{name} not found in namespace {nspace}")]
    NotFound { nspace: Namespace, name: String },
    #[error("{name} already exists in namespace {nspace}")]
    ObjectExists { nspace: Namespace, name: String },
    #[error("namespace {0} does not exist")]
    NoSuchNamespace(Namespace),
    #[error("namespace {0} already exists")]
    NamespaceExists(Namespace),
    #[error("backend error: {source}")]
    Generic {
        #[from]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// The object store the volume engine syncs SCOs to and the cache
/// fetches them back from. Implementations are expected to be cheap
/// to share across threads.
pub trait Backend: Send + Sync {
    fn create_namespace(&self, nspace: &Namespace) -> Result<()>;
    fn delete_namespace(&self, nspace: &Namespace) -> Result<()>;
    fn has_namespace(&self, nspace: &Namespace) -> Result<bool>;

    /// Drop every object in the namespace, keeping the namespace.
    fn clear_namespace(&self, nspace: &Namespace) -> Result<()> {
        self.delete_namespace(nspace)?;
        self.create_namespace(nspace)
    }

    /// Download `name` into the local file at `dst`.
    fn read(&self, nspace: &Namespace, name: &str, dst: &Path) -> Result<()>;

    /// Upload the local file at `src` as `name`.
    fn write(&self, nspace: &Namespace, name: &str, src: &Path, overwrite: bool) -> Result<()>;

    fn list(&self, nspace: &Namespace) -> Result<Vec<String>>;

    fn delete(&self, nspace: &Namespace, name: &str) -> Result<()>;
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    use super::*;
    use std::{
        collections::{BTreeMap, HashMap},
        fs,
        sync::{Arc, Mutex},
    };

    /// Backend keeping namespaces in process memory. Objects are real
    /// byte blobs, so fetches through it produce genuine SCO files.
    #[derive(Clone, Default)]
    pub struct InMemoryBackend(Arc<Mutex<HashMap<Namespace, BTreeMap<String, Vec<u8>>>>>);

    impl InMemoryBackend {
        pub fn new() -> Self {
            InMemoryBackend::default()
        }

        pub fn shared() -> Arc<Self> {
            Arc::new(InMemoryBackend::default())
        }

        pub fn object(&self, nspace: &Namespace, name: &str) -> Option<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .get(nspace)
                .and_then(|ns| ns.get(name).cloned())
        }

        pub fn object_count(&self, nspace: &Namespace) -> usize {
            self.0
                .lock()
                .unwrap()
                .get(nspace)
                .map(|ns| ns.len())
                .unwrap_or(0)
        }
    }

    impl Backend for InMemoryBackend {
        fn create_namespace(&self, nspace: &Namespace) -> Result<()> {
            let mut map = self.0.lock().unwrap();
            if map.contains_key(nspace) {
                return Err(BackendError::NamespaceExists(nspace.clone()));
            }
            map.insert(nspace.clone(), BTreeMap::new());
            Ok(())
        }

        fn delete_namespace(&self, nspace: &Namespace) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .remove(nspace)
                .map(|_| ())
                .ok_or_else(|| BackendError::NoSuchNamespace(nspace.clone()))
        }

        fn has_namespace(&self, nspace: &Namespace) -> Result<bool> {
            Ok(self.0.lock().unwrap().contains_key(nspace))
        }

        fn read(&self, nspace: &Namespace, name: &str, dst: &Path) -> Result<()> {
            let data = {
                let map = self.0.lock().unwrap();
                let ns = map
                    .get(nspace)
                    .ok_or_else(|| BackendError::NoSuchNamespace(nspace.clone()))?;
                ns.get(name)
                    .cloned()
                    .ok_or_else(|| BackendError::NotFound {
                        nspace: nspace.clone(),
                        name: name.into(),
                    })?
            };

            fs::write(dst, data)?;
            Ok(())
        }

        fn write(
            &self,
            nspace: &Namespace,
            name: &str,
            src: &Path,
            overwrite: bool,
        ) -> Result<()> {
            let data = fs::read(src)?;

            let mut map = self.0.lock().unwrap();
            let ns = map
                .get_mut(nspace)
                .ok_or_else(|| BackendError::NoSuchNamespace(nspace.clone()))?;

            if !overwrite && ns.contains_key(name) {
                return Err(BackendError::ObjectExists {
                    nspace: nspace.clone(),
                    name: name.into(),
                });
            }

            ns.insert(name.into(), data);
            Ok(())
        }

        fn list(&self, nspace: &Namespace) -> Result<Vec<String>> {
            let map = self.0.lock().unwrap();
            map.get(nspace)
                .map(|ns| ns.keys().cloned().collect())
                .ok_or_else(|| BackendError::NoSuchNamespace(nspace.clone()))
        }

        fn delete(&self, nspace: &Namespace, name: &str) -> Result<()> {
            let mut map = self.0.lock().unwrap();
            let ns = map
                .get_mut(nspace)
                .ok_or_else(|| BackendError::NoSuchNamespace(nspace.clone()))?;
            ns.remove(name).map(|_| ()).ok_or(BackendError::NotFound {
                nspace: nspace.clone(),
                name: name.into(),
            })
        }
    }
}
