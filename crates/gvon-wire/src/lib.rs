//! Wire format of the socket transport and the signaling service.
//!
//! Every message on the wire is one length-prefixed frame: a big-endian
//! `u32` payload length, a fixed binary header (message type, source and
//! destination address, context, tag), and the payload bytes. Control-plane
//! payloads are JSON; data-plane payloads are the sender's serialized user
//! bytes.

use gvon_types::{ContextId, Tag, VAddr};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default cap on a frame payload, matching the transport's default
/// `max_buffer_size` configuration.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 100_000_000;

/// Length prefix plus header.
pub const HEADER_BYTES: usize = 4 + 1 + 4 + 4 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    PayloadTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTooLarge { len: usize, max: usize },
    FrameTruncated { expected: usize, actual: usize },
    UnknownMsgType { value: u8 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            Self::FrameTooShort { len } => write!(f, "frame too short: {len}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Self::FrameTruncated { expected, actual } => {
                write!(
                    f,
                    "truncated frame payload: expected {expected}, got {actual}"
                )
            }
            Self::UnknownMsgType { value } => write!(f, "unknown message type: {value}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Debug, Clone)]
pub enum WireError {
    Frame(FrameError),
    Json(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameError> for WireError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

/// 8-bit frame type. Data-plane traffic is [`MsgType::Peer`]; everything
/// else is control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    VaddrRequest = 0,
    VaddrLookup = 1,
    Destruct = 2,
    Retry = 3,
    Ack = 4,
    ContextInit = 5,
    ContextRequest = 6,
    Peer = 7,
    Confirm = 8,
    Split = 9,
}

impl TryFrom<u8> for MsgType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0 => Self::VaddrRequest,
            1 => Self::VaddrLookup,
            2 => Self::Destruct,
            3 => Self::Retry,
            4 => Self::Ack,
            5 => Self::ContextInit,
            6 => Self::ContextRequest,
            7 => Self::Peer,
            8 => Self::Confirm,
            9 => Self::Split,
            value => return Err(FrameError::UnknownMsgType { value }),
        })
    }
}

/// Fixed per-frame routing header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub src: VAddr,
    pub dst: VAddr,
    pub context: ContextId,
    pub tag: Tag,
}

impl Header {
    /// Control-plane header with zeroed routing fields.
    pub fn control(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            src: VAddr(0),
            dst: VAddr(0),
            context: ContextId(0),
            tag: Tag(0),
        }
    }
}

pub fn encode_frame(
    header: &Header,
    payload: &[u8],
    max_payload_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_payload_bytes {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload_bytes,
        });
    }
    let payload_len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut out = Vec::with_capacity(HEADER_BYTES + payload.len());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.push(header.msg_type as u8);
    out.extend_from_slice(&header.src.0.to_be_bytes());
    out.extend_from_slice(&header.dst.0.to_be_bytes());
    out.extend_from_slice(&header.context.0.to_be_bytes());
    out.extend_from_slice(&header.tag.0.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame_default(header: &Header, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_frame(header, payload, DEFAULT_MAX_PAYLOAD_BYTES)
}

pub fn decode_frame(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<(Header, &[u8]), FrameError> {
    if frame.len() < HEADER_BYTES {
        return Err(FrameError::FrameTooShort { len: frame.len() });
    }

    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&frame[..4]);
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }

    let actual_payload_len = frame.len() - HEADER_BYTES;
    if actual_payload_len != payload_len {
        return Err(FrameError::FrameTruncated {
            expected: payload_len,
            actual: actual_payload_len,
        });
    }

    let msg_type = MsgType::try_from(frame[4])?;
    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];

    u32_buf.copy_from_slice(&frame[5..9]);
    let src = VAddr(u32::from_be_bytes(u32_buf));
    u32_buf.copy_from_slice(&frame[9..13]);
    let dst = VAddr(u32::from_be_bytes(u32_buf));
    u64_buf.copy_from_slice(&frame[13..21]);
    let context = ContextId(u64::from_be_bytes(u64_buf));
    u32_buf.copy_from_slice(&frame[21..25]);
    let tag = Tag(u32::from_be_bytes(u32_buf));

    Ok((
        Header {
            msg_type,
            src,
            dst,
            context,
            tag,
        },
        &frame[HEADER_BYTES..],
    ))
}

pub fn decode_frame_default(frame: &[u8]) -> Result<(Header, &[u8]), FrameError> {
    decode_frame(frame, DEFAULT_MAX_PAYLOAD_BYTES)
}

/// Requests understood by the signaling service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalRequest {
    /// Register under a named context; the reply is deferred until
    /// `expected_size` peers have requested the same name.
    ContextRequest {
        context_name: String,
        expected_size: u32,
    },
    /// Claim the next dense address within the context, publishing the
    /// peer's listening URI.
    VaddrRequest { context_id: ContextId, peer_uri: String },
    /// Resolve a peer address to its URI.
    VaddrLookup { context_id: ContextId, vaddr: VAddr },
    /// Deregister from the context.
    LeaveContext { context_id: ContextId, vaddr: VAddr },
}

impl SignalRequest {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::ContextRequest { .. } => MsgType::ContextRequest,
            Self::VaddrRequest { .. } => MsgType::VaddrRequest,
            Self::VaddrLookup { .. } => MsgType::VaddrLookup,
            Self::LeaveContext { .. } => MsgType::Destruct,
        }
    }
}

/// Replies of the signaling service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalReply {
    /// The named context is complete.
    ContextInit { context_id: ContextId, size: u32 },
    VaddrAssigned { vaddr: VAddr },
    VaddrUri { uri: String },
    /// The queried state is not available yet; ask again.
    Retry,
    Left,
    Error { reason: String },
}

impl SignalReply {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::ContextInit { .. } => MsgType::ContextInit,
            Self::Retry => MsgType::Retry,
            Self::VaddrAssigned { .. } | Self::VaddrUri { .. } | Self::Left => MsgType::Ack,
            Self::Error { .. } => MsgType::Destruct,
        }
    }
}

pub fn encode_signal_request(request: &SignalRequest) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(request).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame_default(
        &Header::control(request.msg_type()),
        &payload,
    )?)
}

pub fn decode_signal_request(frame: &[u8]) -> Result<SignalRequest, WireError> {
    let (_, payload) = decode_frame_default(frame)?;
    serde_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn encode_signal_reply(reply: &SignalReply) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(reply).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame_default(
        &Header::control(reply.msg_type()),
        &payload,
    )?)
}

pub fn decode_signal_reply(frame: &[u8]) -> Result<SignalReply, WireError> {
    let (_, payload) = decode_frame_default(frame)?;
    serde_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_payload_json(request: &SignalRequest) -> String {
        let frame = encode_signal_request(request).expect("request should encode");
        let (header, payload) = decode_frame_default(&frame).expect("frame should decode");
        assert_eq!(header.msg_type, request.msg_type());
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    fn reply_payload_json(reply: &SignalReply) -> String {
        let frame = encode_signal_reply(reply).expect("reply should encode");
        let (header, payload) = decode_frame_default(&frame).expect("frame should decode");
        assert_eq!(header.msg_type, reply.msg_type());
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    #[test]
    fn data_frame_roundtrip() {
        let header = Header {
            msg_type: MsgType::Peer,
            src: VAddr(3),
            dst: VAddr(1),
            context: ContextId(7),
            tag: Tag(42),
        };
        let frame = encode_frame_default(&header, b"payload").expect("frame should encode");
        let (decoded, payload) = decode_frame_default(&frame).expect("frame should decode");
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let header = Header::control(MsgType::Confirm);
        let frame = encode_frame_default(&header, b"").expect("frame should encode");
        let (decoded, payload) = decode_frame_default(&frame).expect("frame should decode");
        assert_eq!(decoded.msg_type, MsgType::Confirm);
        assert!(payload.is_empty());
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let header = Header::control(MsgType::Peer);
        let err = encode_frame(&header, &[0u8; 64], 32).expect_err("payload should be rejected");
        assert!(matches!(err, FrameError::PayloadTooLarge { len: 64, max: 32 }));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let header = Header::control(MsgType::Peer);
        let mut frame = encode_frame_default(&header, b"0123456789").expect("should encode");
        frame.truncate(frame.len() - 3);
        let err = decode_frame_default(&frame).expect_err("truncated frame should be rejected");
        assert!(matches!(
            err,
            FrameError::FrameTruncated {
                expected: 10,
                actual: 7
            }
        ));
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let header = Header::control(MsgType::Peer);
        let mut frame = encode_frame_default(&header, b"x").expect("should encode");
        frame[4] = 200;
        let err = decode_frame_default(&frame).expect_err("unknown type should be rejected");
        assert!(matches!(err, FrameError::UnknownMsgType { value: 200 }));
    }

    #[test]
    fn context_request_wire_shape() {
        let json = request_payload_json(&SignalRequest::ContextRequest {
            context_name: "context".into(),
            expected_size: 4,
        });
        assert_eq!(
            json,
            r#"{"context_request":{"context_name":"context","expected_size":4}}"#
        );
    }

    #[test]
    fn vaddr_request_wire_shape() {
        let json = request_payload_json(&SignalRequest::VaddrRequest {
            context_id: ContextId(1),
            peer_uri: "127.0.0.1:6001".into(),
        });
        assert_eq!(
            json,
            r#"{"vaddr_request":{"context_id":1,"peer_uri":"127.0.0.1:6001"}}"#
        );
    }

    #[test]
    fn vaddr_lookup_wire_shape() {
        let json = request_payload_json(&SignalRequest::VaddrLookup {
            context_id: ContextId(1),
            vaddr: VAddr(2),
        });
        assert_eq!(json, r#"{"vaddr_lookup":{"context_id":1,"vaddr":2}}"#);
    }

    #[test]
    fn leave_context_wire_shape() {
        let json = request_payload_json(&SignalRequest::LeaveContext {
            context_id: ContextId(1),
            vaddr: VAddr(2),
        });
        assert_eq!(json, r#"{"leave_context":{"context_id":1,"vaddr":2}}"#);
    }

    #[test]
    fn reply_wire_shapes() {
        assert_eq!(
            reply_payload_json(&SignalReply::ContextInit {
                context_id: ContextId(1),
                size: 4
            }),
            r#"{"context_init":{"context_id":1,"size":4}}"#
        );
        assert_eq!(
            reply_payload_json(&SignalReply::VaddrAssigned { vaddr: VAddr(0) }),
            r#"{"vaddr_assigned":{"vaddr":0}}"#
        );
        assert_eq!(
            reply_payload_json(&SignalReply::VaddrUri {
                uri: "127.0.0.1:6001".into()
            }),
            r#"{"vaddr_uri":{"uri":"127.0.0.1:6001"}}"#
        );
        assert_eq!(reply_payload_json(&SignalReply::Retry), r#""retry""#);
        assert_eq!(reply_payload_json(&SignalReply::Left), r#""left""#);
    }
}
