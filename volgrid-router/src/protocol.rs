//! Wire protocol between object routers.
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! [u32 frame length][u32 kind][u64 tag][u32 record length][record][payload...]
//! ```
//!
//! Requests carry a typed record (and, for writes, a raw data
//! payload); responses echo the request's tag and carry an optional
//! record and/or payload. The tag is opaque to the receiving side; a
//! response with the wrong tag is a protocol error on the client.

use crate::{Error, Result};

use std::{
    convert::TryFrom,
    io::{Read, Write},
};

/// Hard cap on a frame; anything bigger is a protocol error, not an
/// allocation.
pub const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum RequestKind {
    Read = 1,
    Write = 2,
    Sync = 3,
    GetSize = 4,
    Resize = 5,
    Delete = 6,
    Transfer = 7,
    Ping = 8,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Read => "Read",
            RequestKind::Write => "Write",
            RequestKind::Sync => "Sync",
            RequestKind::GetSize => "GetSize",
            RequestKind::Resize => "Resize",
            RequestKind::Delete => "Delete",
            RequestKind::Transfer => "Transfer",
            RequestKind::Ping => "Ping",
        }
    }
}

impl TryFrom<u32> for RequestKind {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            1 => Ok(RequestKind::Read),
            2 => Ok(RequestKind::Write),
            3 => Ok(RequestKind::Sync),
            4 => Ok(RequestKind::GetSize),
            5 => Ok(RequestKind::Resize),
            6 => Ok(RequestKind::Delete),
            7 => Ok(RequestKind::Transfer),
            8 => Ok(RequestKind::Ping),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ResponseKind {
    Ok = 1001,
    UnknownRequest = 1002,
    ProtocolError = 1003,
    ObjectNotRunningHere = 1004,
    IoError = 1005,
    Timeout = 1006,
}

impl ResponseKind {
    pub fn name(self) -> &'static str {
        match self {
            ResponseKind::Ok => "Ok",
            ResponseKind::UnknownRequest => "UnknownRequest",
            ResponseKind::ProtocolError => "ProtocolError",
            ResponseKind::ObjectNotRunningHere => "ObjectNotRunningHere",
            ResponseKind::IoError => "IOError",
            ResponseKind::Timeout => "Timeout",
        }
    }
}

impl TryFrom<u32> for ResponseKind {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            1001 => Ok(ResponseKind::Ok),
            1002 => Ok(ResponseKind::UnknownRequest),
            1003 => Ok(ResponseKind::ProtocolError),
            1004 => Ok(ResponseKind::ObjectNotRunningHere),
            1005 => Ok(ResponseKind::IoError),
            1006 => Ok(ResponseKind::Timeout),
            other => Err(other),
        }
    }
}

/// Request correlator, chosen by the sender and echoed verbatim by
/// every response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Tag(pub u64);

impl Tag {
    /// The conventional choice: the request record's address, unique
    /// among requests in flight on one socket.
    pub fn for_request<T>(request: &T) -> Tag {
        Tag(request as *const T as u64)
    }
}

// Typed records. Missing required fields fail deserialization at the
// server and must produce a ProtocolError response.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingMessage {
    pub sender_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub object_id: String,
    pub object_type: u32,
    pub size: u64,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub object_id: String,
    pub object_type: u32,
    pub size: u64,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub object_id: String,
    pub object_type: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSizeRequest {
    pub object_id: String,
    pub object_type: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSizeResponse {
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub object_id: String,
    pub object_type: u32,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub object_id: String,
    pub object_type: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRequest {
    pub object_id: String,
    pub object_type: u32,
    pub target_node_id: String,
    /// 0 means no bound on the backend sync.
    pub sync_timeout_ms: u64,
}

/// One message on the wire, request or response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: u32,
    pub tag: Tag,
    pub record: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(kind: RequestKind, tag: Tag, record: Vec<u8>, payload: Vec<u8>) -> Frame {
        Frame {
            kind: kind as u32,
            tag,
            record,
            payload,
        }
    }

    pub fn response(kind: ResponseKind, tag: Tag, record: Vec<u8>, payload: Vec<u8>) -> Frame {
        Frame {
            kind: kind as u32,
            tag,
            record,
            payload,
        }
    }
}

pub fn serialize_record<T: serde::Serialize>(record: &T) -> Vec<u8> {
    rmp_serde::to_vec(record).expect("record serialization cannot fail")
}

pub fn parse_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Protocol(format!("malformed record: {}", e)))
}

pub fn write_frame(w: &mut impl Write, frame: &Frame) -> std::io::Result<()> {
    let len = 4 + 8 + 4 + frame.record.len() + frame.payload.len();

    w.write_all(&(len as u32).to_le_bytes())?;
    w.write_all(&frame.kind.to_le_bytes())?;
    w.write_all(&frame.tag.0.to_le_bytes())?;
    w.write_all(&(frame.record.len() as u32).to_le_bytes())?;
    w.write_all(&frame.record)?;
    w.write_all(&frame.payload)?;
    w.flush()
}

pub fn read_frame(r: &mut impl Read) -> std::io::Result<Frame> {
    use std::io::{Error as IoError, ErrorKind};

    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;

    if !(16..=MAX_FRAME_LEN).contains(&len) {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame length {} out of bounds", len),
        ));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;

    let kind = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let tag = Tag(u64::from_le_bytes(buf[4..12].try_into().unwrap()));
    let record_len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;

    if 16 + record_len > len {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            "record length exceeds frame",
        ));
    }

    let record = buf[16..16 + record_len].to_vec();
    let payload = buf[16 + record_len..].to_vec();

    Ok(Frame {
        kind,
        tag,
        record,
        payload,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let record = serialize_record(&ReadRequest {
            object_id: "vol".into(),
            object_type: 1,
            size: 4096,
            offset: 8192,
        });

        let frame = Frame::request(RequestKind::Read, Tag(42), record, vec![1, 2, 3]);

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).unwrap();

        let parsed = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(parsed, frame);

        let req: ReadRequest = parse_record(&parsed.record).unwrap();
        assert_eq!(req.object_id, "vol");
        assert_eq!(req.offset, 8192);
    }

    #[test]
    fn records_with_missing_fields_are_rejected() {
        // a sync record lacks the size/offset fields a read requires
        let record = serialize_record(&SyncRequest {
            object_id: "vol".into(),
            object_type: 1,
        });

        assert!(matches!(
            parse_record::<ReadRequest>(&record),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_le_bytes());
        wire.extend_from_slice(&[0u8; 64]);

        assert!(read_frame(&mut wire.as_slice()).is_err());
    }

    #[test]
    fn kind_values_are_stable() {
        assert_eq!(RequestKind::Read as u32, 1);
        assert_eq!(RequestKind::Ping as u32, 8);
        assert_eq!(ResponseKind::Ok as u32, 1001);
        assert_eq!(ResponseKind::Timeout as u32, 1006);
        assert_eq!(RequestKind::try_from(7).unwrap(), RequestKind::Transfer);
        assert!(ResponseKind::try_from(1007).is_err());
    }
}
