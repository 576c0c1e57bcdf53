//! Telemetry events the router and its collaborators emit.

use crate::object::{NodeId, ObjectId};

use std::path::PathBuf;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Event {
    /// A redirected request timed out although the registry still
    /// lists the owner as online.
    RedirectTimeoutWhileOnline { node: NodeId },
    /// Ownership of an object was taken over from an offline node.
    OwnershipStolen { id: ObjectId, from: NodeId },
    /// A cache mountpoint was taken out of rotation after an I/O
    /// error.
    ScoCacheMountPointOfflined { path: PathBuf },
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Publisher for deployments without an event sink.
#[derive(Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: Event) {}
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct CollectingPublisher(Mutex<Vec<Event>>);

    impl CollectingPublisher {
        pub fn take(&self) -> Vec<Event> {
            std::mem::take(&mut self.0.lock().unwrap())
        }

        pub fn contains(&self, event: &Event) -> bool {
            self.0.lock().unwrap().contains(event)
        }
    }

    impl EventPublisher for CollectingPublisher {
        fn publish(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }
}
