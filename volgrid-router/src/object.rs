//! Identities of cluster nodes and the objects they host.

use std::{convert::TryFrom, fmt};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> $name {
                $name(id.into())
            }

            #[inline(always)]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> $name {
                $name(s.into())
            }
        }
    };
}

id_type! {
    /// Opaque short string naming a volume or file object, unique
    /// cluster-wide.
    ObjectId
}

id_type! {
    /// Name of one cluster node.
    NodeId
}

id_type! {
    /// Name of the cluster itself.
    ClusterId
}

id_type! {
    /// Name of a volume snapshot.
    SnapshotName
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObjectType {
    File,
    Volume,
}

impl From<ObjectType> for u32 {
    fn from(t: ObjectType) -> u32 {
        match t {
            ObjectType::File => 0,
            ObjectType::Volume => 1,
        }
    }
}

impl TryFrom<u32> for ObjectType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectType::File),
            1 => Ok(ObjectType::Volume),
            other => Err(other),
        }
    }
}

/// Value type every cluster-node operation takes: what kind of object
/// and which one.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Object {
    pub object_type: ObjectType,
    pub id: ObjectId,
}

impl Object {
    pub fn volume(id: ObjectId) -> Object {
        Object {
            object_type: ObjectType::Volume,
            id,
        }
    }

    pub fn file(id: ObjectId) -> Object {
        Object {
            object_type: ObjectType::File,
            id,
        }
    }

    pub fn is_file(&self) -> bool {
        self.object_type == ObjectType::File
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_type {
            ObjectType::File => write!(f, "file {}", self.id),
            ObjectType::Volume => write!(f, "volume {}", self.id),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Per-node addressing info distributed with the cluster config.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    pub node_id: NodeId,
    pub host: String,
    pub message_port: u16,
    pub failovercache_port: u16,
}

impl ClusterNodeConfig {
    pub fn message_addr(&self) -> String {
        format!("{}:{}", self.host, self.message_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_type_wire_values() {
        assert_eq!(u32::from(ObjectType::File), 0);
        assert_eq!(u32::from(ObjectType::Volume), 1);
        assert_eq!(ObjectType::try_from(1).unwrap(), ObjectType::Volume);
        assert!(ObjectType::try_from(2).is_err());
    }
}
