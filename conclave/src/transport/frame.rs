//! The wire frame and its codec.
//!
//! Every message on the wire is a self-describing record `{sender,
//! correlation_id, body}` carried as a length-prefixed (u32 big-endian)
//! bincode blob. Frames which fail to decode are skipped by the reader: the
//! length prefix makes resynchronisation trivial, so an unknown or corrupt
//! frame is logged and dropped without poisoning the connection.

use anyhow::bail;
use anyhow::Result;
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;

use crate::network::CacheProbeRequest;
use crate::network::CacheProbeResponse;
use crate::network::ProposeRequest;
use crate::network::ProposeResponse;
use crate::network::QueueForwardRequest;
use crate::network::QueueForwardResponse;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// The hard cap on a single frame's encoded size.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// A single message on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// The id of the sending node.
    pub sender: NodeId,
    /// Correlates a reply with its request. 0 for one-way frames.
    pub correlation_id: u64,
    pub body: FrameBody,
}

/// The closed set of frame types.
///
/// Reply variants carry `Err(reason)` when the remote handler failed, so
/// transport-level and handler-level failures stay distinguishable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FrameBody {
    RequestVote(VoteRequest),
    RequestVoteReply(Result<VoteResponse, String>),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesReply(Result<AppendEntriesResponse, String>),
    ClientPropose(ProposeRequest),
    ClientProposeReply(Result<ProposeResponse, String>),
    QueueForward(QueueForwardRequest),
    QueueForwardReply(Result<QueueForwardResponse, String>),
    CacheProbe(CacheProbeRequest),
    CacheProbeReply(Result<CacheProbeResponse, String>),
    Heartbeat,
}

impl FrameBody {
    /// The frame type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::RequestVote(_) => "request-vote",
            FrameBody::RequestVoteReply(_) => "request-vote-reply",
            FrameBody::AppendEntries(_) => "append-entries",
            FrameBody::AppendEntriesReply(_) => "append-entries-reply",
            FrameBody::ClientPropose(_) => "client-propose",
            FrameBody::ClientProposeReply(_) => "client-propose-reply",
            FrameBody::QueueForward(_) => "queue-forward",
            FrameBody::QueueForwardReply(_) => "queue-forward-reply",
            FrameBody::CacheProbe(_) => "cache-probe",
            FrameBody::CacheProbeReply(_) => "cache-probe-reply",
            FrameBody::Heartbeat => "heartbeat",
        }
    }

    /// True for reply frame types.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            FrameBody::RequestVoteReply(_)
                | FrameBody::AppendEntriesReply(_)
                | FrameBody::ClientProposeReply(_)
                | FrameBody::QueueForwardReply(_)
                | FrameBody::CacheProbeReply(_)
        )
    }
}

/// Encode a frame with its length prefix.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds the {} byte cap", body.len(), MAX_FRAME_BYTES);
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// The outcome of a decode attempt against the read buffer.
pub enum Decoded {
    /// The buffer does not yet hold a complete frame.
    NeedMore,
    /// A complete frame was present but failed to decode; it has been
    /// consumed, logged and dropped.
    Skipped,
    /// A complete, valid frame.
    Frame(Frame),
}

/// Try to decode one frame from the front of `buf`.
pub fn decode(buf: &mut BytesMut) -> Result<Decoded> {
    if buf.len() < 4 {
        return Ok(Decoded::NeedMore);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        bail!("peer announced a frame of {} bytes, exceeding the {} byte cap", len, MAX_FRAME_BYTES);
    }
    if buf.len() < 4 + len {
        return Ok(Decoded::NeedMore);
    }
    buf.advance(4);
    let payload = buf.split_to(len);
    match bincode::deserialize::<Frame>(&payload) {
        Ok(frame) => Ok(Decoded::Frame(frame)),
        Err(err) => {
            tracing::warn!(error=%err, len, "dropping undecodable frame");
            Ok(Decoded::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            sender: "n1".into(),
            correlation_id: 42,
            body: FrameBody::RequestVote(VoteRequest::new(3, "n1".into(), 7, 2)),
        };
        let encoded = encode(&frame).expect("encodes");
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = match decode(&mut buf).expect("no codec error") {
            Decoded::Frame(frame) => frame,
            _ => panic!("expected a complete frame"),
        };
        assert_eq!(decoded.sender, "n1");
        assert_eq!(decoded.correlation_id, 42);
        assert!(matches!(decoded.body, FrameBody::RequestVote(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let frame = Frame {
            sender: "n1".into(),
            correlation_id: 1,
            body: FrameBody::Heartbeat,
        };
        let encoded = encode(&frame).expect("encodes");
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(matches!(decode(&mut buf).expect("no codec error"), Decoded::NeedMore));
    }

    #[test]
    fn test_undecodable_frame_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(decode(&mut buf).expect("no codec error"), Decoded::Skipped));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_BYTES + 1) as u32);
        assert!(decode(&mut buf).is_err());
    }
}
