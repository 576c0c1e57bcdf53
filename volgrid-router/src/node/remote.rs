//! Request channel to one remote cluster node.

use crate::{
    object::{ClusterNodeConfig, NodeId, Object, ObjectId},
    protocol::{self, Frame, RequestKind, ResponseKind, Tag},
    Error, Result,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use std::{
    convert::TryFrom,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

/// Cluster node living elsewhere. One socket, guarded by a mutex:
/// requests to a peer are strictly serialized and in-order, the peer
/// pipelines internally through its worker pool. A reply timeout
/// tears the socket down; the next request reconnects.
pub struct RemoteNode {
    config: ClusterNodeConfig,
    redirect_timeout: Duration,
    migrate_timeout: Duration,
    sock: Mutex<Option<TcpStream>>,
}

impl RemoteNode {
    pub fn new(
        config: ClusterNodeConfig,
        redirect_timeout: Duration,
        migrate_timeout: Duration,
    ) -> RemoteNode {
        RemoteNode {
            config,
            redirect_timeout,
            migrate_timeout,
            sock: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClusterNodeConfig {
        &self.config
    }

    fn connect_(&self) -> Result<TcpStream> {
        let addr = self
            .config
            .message_addr()
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "cannot resolve {}",
                    self.config.message_addr()
                ))
            })?;

        info!("connecting to {}", addr);

        // an unreachable peer looks the same as a silent one: the
        // steal/retry machinery upstairs handles both
        let sock = TcpStream::connect_timeout(&addr, self.redirect_timeout).map_err(|e| {
            warn!("failed to connect to {}: {}", self.config.node_id, e);
            Error::RequestTimeout
        })?;
        sock.set_nodelay(true).ok();

        Ok(sock)
    }

    fn exchange_(
        &self,
        obj_id: Option<&ObjectId>,
        kind: RequestKind,
        tag: Tag,
        record: Vec<u8>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame> {
        let mut guard = self.sock.lock();

        if guard.is_none() {
            *guard = Some(self.connect_()?);
        }
        let sock = guard.as_mut().expect("socket populated above");

        debug!(
            "{}: sending {}, tag {:?}, timeout {:?}",
            self.config.node_id,
            kind.name(),
            tag,
            timeout
        );

        let request = Frame::request(kind, tag, record, payload);
        if let Err(e) = protocol::write_frame(sock, &request) {
            warn!("{}: send failed: {}", self.config.node_id, e);
            *guard = None;
            return Err(Error::RequestTimeout);
        }

        sock.set_read_timeout(Some(timeout)).ok();

        let response = match protocol::read_frame(sock) {
            Ok(frame) => frame,
            Err(e) => {
                info!(
                    "{}: no response within {:?} ({}) - giving up on this socket",
                    self.config.node_id, timeout, e
                );
                *guard = None;
                return Err(Error::RequestTimeout);
            }
        };

        if response.tag != tag {
            error!(
                "{}: expected tag {:?}, got {:?}",
                self.config.node_id, tag, response.tag
            );
            *guard = None;
            return Err(Error::Protocol("wrong tag in response".into()));
        }

        let kind = ResponseKind::try_from(response.kind).map_err(|k| {
            *guard = None;
            Error::Protocol(format!("unknown response kind {}", k))
        })?;

        debug!("{}: received {}, tag {:?}", self.config.node_id, kind.name(), tag);

        match kind {
            ResponseKind::Ok => Ok(response),
            ResponseKind::ObjectNotRunningHere => {
                info!("object not present on node {}", self.config.node_id);
                let id = obj_id.cloned().unwrap_or_else(|| ObjectId::new("<unknown>"));
                Err(Error::NotRunningHere(id))
            }
            ResponseKind::UnknownRequest => Err(Error::Protocol(
                "remote sent UnknownRequest response status".into(),
            )),
            ResponseKind::ProtocolError => {
                Err(Error::Protocol("remote sent ProtocolError response".into()))
            }
            ResponseKind::Timeout => Err(Error::RemoteTimeout),
            ResponseKind::IoError => {
                Err(Error::Other { source: anyhow::anyhow!("remote operation failed") })
            }
        }
    }

    fn exchange_for_object_(
        &self,
        obj: &Object,
        kind: RequestKind,
        tag: Tag,
        record: Vec<u8>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame> {
        self.exchange_(Some(&obj.id), kind, tag, record, payload, timeout)
    }

    pub fn read(&self, obj: &Object, buf: &mut [u8], size: &mut usize, offset: u64) -> Result<()> {
        let req = protocol::ReadRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
            size: *size as u64,
            offset,
        };
        let tag = Tag::for_request(&req);

        let rsp = self.exchange_for_object_(
            obj,
            RequestKind::Read,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )?;

        if rsp.payload.len() > *size {
            error!(
                "read {} > expected {} from {}",
                rsp.payload.len(),
                size,
                obj.id
            );
            return Err(Error::Protocol("read size mismatch".into()));
        }

        buf[..rsp.payload.len()].copy_from_slice(&rsp.payload);
        *size = rsp.payload.len();
        Ok(())
    }

    pub fn write(&self, obj: &Object, buf: &[u8], size: &mut usize, offset: u64) -> Result<()> {
        let req = protocol::WriteRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
            size: *size as u64,
            offset,
        };
        let tag = Tag::for_request(&req);

        let rsp = self.exchange_for_object_(
            obj,
            RequestKind::Write,
            tag,
            protocol::serialize_record(&req),
            buf[..*size].to_vec(),
            self.redirect_timeout,
        )?;

        let written: protocol::WriteResponse = protocol::parse_record(&rsp.record)?;
        *size = written.size as usize;
        Ok(())
    }

    pub fn sync(&self, obj: &Object) -> Result<()> {
        let req = protocol::SyncRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
        };
        let tag = Tag::for_request(&req);

        self.exchange_for_object_(
            obj,
            RequestKind::Sync,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )
        .map(|_| ())
    }

    pub fn get_size(&self, obj: &Object) -> Result<u64> {
        let req = protocol::GetSizeRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
        };
        let tag = Tag::for_request(&req);

        let rsp = self.exchange_for_object_(
            obj,
            RequestKind::GetSize,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )?;

        let size: protocol::GetSizeResponse = protocol::parse_record(&rsp.record)?;
        Ok(size.size)
    }

    pub fn resize(&self, obj: &Object, new_size: u64) -> Result<()> {
        let req = protocol::ResizeRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
            size: new_size,
        };
        let tag = Tag::for_request(&req);

        self.exchange_for_object_(
            obj,
            RequestKind::Resize,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )
        .map(|_| ())
    }

    pub fn unlink(&self, obj: &Object) -> Result<()> {
        let req = protocol::DeleteRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
        };
        let tag = Tag::for_request(&req);

        self.exchange_for_object_(
            obj,
            RequestKind::Delete,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )
        .map(|_| ())
    }

    /// Ask the remote to hand the object over to `target`, syncing
    /// its data to the backend first.
    pub fn transfer(&self, obj: &Object, target: &NodeId, sync_timeout_ms: u64) -> Result<()> {
        let req = protocol::TransferRequest {
            object_id: obj.id.as_str().into(),
            object_type: obj.object_type.into(),
            target_node_id: target.as_str().into(),
            sync_timeout_ms,
        };
        let tag = Tag::for_request(&req);

        self.exchange_for_object_(
            obj,
            RequestKind::Transfer,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.migrate_timeout,
        )
        .map(|_| ())
    }

    /// Round-trip a single message to verify liveness; returns the
    /// peer's node id.
    pub fn ping(&self, sender: &NodeId) -> Result<NodeId> {
        let req = protocol::PingMessage {
            sender_id: sender.as_str().into(),
        };
        let tag = Tag::for_request(&req);

        let rsp = self.exchange_(
            None,
            RequestKind::Ping,
            tag,
            protocol::serialize_record(&req),
            Vec::new(),
            self.redirect_timeout,
        )?;

        let pong: protocol::PingMessage = protocol::parse_record(&rsp.record)?;
        Ok(NodeId::new(pong.sender_id))
    }
}
