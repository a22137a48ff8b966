//! IDEX inter-driver frame format.
//!
//! An IDEX frame travels as the payload of an IHC packet on a HIF channel:
//!
//! ```text
//! frame header     dst_phy_if:u8 type:u8                       (2 bytes)
//! request record   seq:u32 type:u8 dst_phy_if:u8 state:u8 pad  (37 bytes)
//!   or
//! response record  seq:u32 type:u8 plen:u16                    (7 bytes)
//! message          request/response specific
//! ```
//!
//! Messages are either an [`RpcEnvelope`] or a [`MasterDiscovery`] record.
//!
//! All integers are big-endian. The firmware pads short IHC packets, so bytes after a request
//! message, or beyond a response's declared payload length, are ignored rather than rejected.

#![forbid(unsafe_code)]

use pfe_ct::PhyIfId;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 2;
pub const REQUEST_RECORD_LEN: usize = 37;
pub const RESPONSE_RECORD_LEN: usize = 7;
pub const RPC_ENVELOPE_HEADER_LEN: usize = 10;
pub const MASTER_DISCOVERY_LEN: usize = 1;

/// Smallest IHC packet the firmware emits; shorter frames arrive zero-padded to this size.
pub const MIN_IHC_FRAME_LEN: usize = 68;

/// Largest RPC payload an envelope can describe.
pub const MAX_RPC_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    UnexpectedEof,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown request type {0}")]
    UnknownRequestType(u8),
    #[error("declared payload of {declared} bytes but only {available} present")]
    LengthMismatch { declared: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("message of {0} bytes does not fit a 16-bit length field")]
    TooLarge(usize),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(DecodeError::UnknownFrameType(other)),
        }
    }
}

/// What a request asks for. Responses carry the type of the request they answer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    MasterDiscovery = 0,
    Rpc = 1,
}

impl TryFrom<u8> for RequestType {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(Self::MasterDiscovery),
            1 => Ok(Self::Rpc),
            other => Err(DecodeError::UnknownRequestType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub dst_phy_if: PhyIfId,
    pub frame_type: FrameType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub seq: u32,
    pub request_type: RequestType,
    pub dst_phy_if: PhyIfId,
    /// Sender-side lifecycle state at the time of sending; informational only.
    pub state: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRecord {
    pub seq: u32,
    pub response_type: RequestType,
    pub payload_len: u16,
}

/// A decoded frame borrowing its message bytes from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Request {
        header: FrameHeader,
        record: RequestRecord,
        message: &'a [u8],
    },
    Response {
        header: FrameHeader,
        record: ResponseRecord,
        message: &'a [u8],
    },
}

impl Frame<'_> {
    pub fn header(&self) -> FrameHeader {
        match self {
            Frame::Request { header, .. } | Frame::Response { header, .. } => *header,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Frame::Request { record, .. } => record.seq,
            Frame::Response { record, .. } => record.seq,
        }
    }
}

/// Appends a REQUEST frame to `out`.
pub fn encode_request_into(
    dst_phy_if: PhyIfId,
    seq: u32,
    request_type: RequestType,
    message: &[u8],
    out: &mut Vec<u8>,
) {
    out.reserve(FRAME_HEADER_LEN + REQUEST_RECORD_LEN + message.len());
    out.push(dst_phy_if.raw());
    out.push(FrameType::Request as u8);
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(request_type as u8);
    out.push(dst_phy_if.raw());
    out.push(0);
    out.resize(out.len() + REQUEST_RECORD_LEN - 7, 0);
    out.extend_from_slice(message);
}

/// Appends a RESPONSE frame to `out`.
pub fn encode_response_into(
    dst_phy_if: PhyIfId,
    seq: u32,
    response_type: RequestType,
    message: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let plen = u16::try_from(message.len()).map_err(|_| EncodeError::TooLarge(message.len()))?;
    out.reserve(FRAME_HEADER_LEN + RESPONSE_RECORD_LEN + message.len());
    out.push(dst_phy_if.raw());
    out.push(FrameType::Response as u8);
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(response_type as u8);
    out.extend_from_slice(&plen.to_be_bytes());
    out.extend_from_slice(message);
    Ok(())
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, DecodeError> {
    let mut r = Reader::new(bytes);
    let dst_phy_if = PhyIfId::from_raw(r.read_u8()?);
    let frame_type = FrameType::try_from(r.read_u8()?)?;
    let header = FrameHeader {
        dst_phy_if,
        frame_type,
    };

    match frame_type {
        FrameType::Request => {
            let record = r.read_bytes(REQUEST_RECORD_LEN)?;
            let mut rec = Reader::new(record);
            let seq = rec.read_u32()?;
            let request_type = RequestType::try_from(rec.read_u8()?)?;
            let dst_phy_if = PhyIfId::from_raw(rec.read_u8()?);
            let state = rec.read_u8()?;
            Ok(Frame::Request {
                header,
                record: RequestRecord {
                    seq,
                    request_type,
                    dst_phy_if,
                    state,
                },
                message: r.rest(),
            })
        }
        FrameType::Response => {
            let seq = r.read_u32()?;
            let response_type = RequestType::try_from(r.read_u8()?)?;
            let payload_len = r.read_u16()?;
            let available = r.remaining();
            let message = r.read_bytes(usize::from(payload_len)).map_err(|_| {
                DecodeError::LengthMismatch {
                    declared: usize::from(payload_len),
                    available,
                }
            })?;
            Ok(Frame::Response {
                header,
                record: ResponseRecord {
                    seq,
                    response_type,
                    payload_len,
                },
                message,
            })
        }
    }
}

/// RPC call or result: `rpc_id:u32 return_code:i32 plen:u16 payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcEnvelope<'a> {
    pub rpc_id: u32,
    /// Zero in requests; the handler's result in responses.
    pub return_code: i32,
    pub payload: &'a [u8],
}

impl<'a> RpcEnvelope<'a> {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let plen = u16::try_from(self.payload.len())
            .map_err(|_| EncodeError::TooLarge(self.payload.len()))?;
        out.reserve(RPC_ENVELOPE_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.rpc_id.to_be_bytes());
        out.extend_from_slice(&self.return_code.to_be_bytes());
        out.extend_from_slice(&plen.to_be_bytes());
        out.extend_from_slice(self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let rpc_id = r.read_u32()?;
        let return_code = r.read_u32()? as i32;
        let plen = usize::from(r.read_u16()?);
        let available = r.remaining();
        let payload = r.read_bytes(plen).map_err(|_| DecodeError::LengthMismatch {
            declared: plen,
            available,
        })?;
        Ok(Self {
            rpc_id,
            return_code,
            payload,
        })
    }
}

/// Answer to a master-discovery request: the interface the master is reachable on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterDiscovery {
    pub phy_if: PhyIfId,
}

impl MasterDiscovery {
    pub fn encode(&self) -> [u8; MASTER_DISCOVERY_LEN] {
        [self.phy_if.raw()]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            phy_if: PhyIfId::from_raw(r.read_u8()?),
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.bytes.len());
        self.pos = self.bytes.len();
        &self.bytes[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let mut out = Vec::new();
        encode_request_into(PhyIfId::HIF1, 0x0102_0304, RequestType::Rpc, &[0xEE], &mut out);
        assert_eq!(out.len(), FRAME_HEADER_LEN + REQUEST_RECORD_LEN + 1);
        assert_eq!(&out[..8], &[7, 0, 0x01, 0x02, 0x03, 0x04, 1, 7]);
        assert_eq!(out[8], 0);
        assert!(out[9..FRAME_HEADER_LEN + REQUEST_RECORD_LEN].iter().all(|&b| b == 0));
        assert_eq!(out.last(), Some(&0xEE));
    }

    #[test]
    fn response_frame_layout() {
        let mut out = Vec::new();
        encode_response_into(PhyIfId::HIF0, 9, RequestType::MasterDiscovery, &[6], &mut out)
            .unwrap();
        assert_eq!(out, vec![6, 1, 0, 0, 0, 9, 0, 0, 1, 6]);
    }

    #[test]
    fn rpc_envelope_layout() {
        let env = RpcEnvelope {
            rpc_id: 0xBE,
            return_code: -22,
            payload: &[1, 2],
        };
        let bytes = env.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 0xBE, 0xFF, 0xFF, 0xFF, 0xEA, 0, 2, 1, 2]
        );
        assert_eq!(RpcEnvelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn padded_response_keeps_declared_payload() {
        let mut out = Vec::new();
        encode_response_into(PhyIfId::HIF1, 1, RequestType::Rpc, &[1, 2, 3], &mut out).unwrap();
        out.resize(MIN_IHC_FRAME_LEN, 0);
        let Frame::Response { message, record, .. } = decode_frame(&out).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(message, &[1, 2, 3]);
        assert_eq!(record.payload_len, 3);
    }

    #[test]
    fn request_message_includes_padding() {
        let mut out = Vec::new();
        encode_request_into(PhyIfId::HIF0, 5, RequestType::MasterDiscovery, &[], &mut out);
        out.resize(MIN_IHC_FRAME_LEN, 0);
        let frame = decode_frame(&out).unwrap();
        assert_eq!(frame.seq(), 5);
        let Frame::Request { message, record, .. } = frame else {
            panic!("expected a request");
        };
        assert_eq!(record.request_type, RequestType::MasterDiscovery);
        assert_eq!(message.len(), MIN_IHC_FRAME_LEN - FRAME_HEADER_LEN - REQUEST_RECORD_LEN);
    }

    #[test]
    fn rejects_unknown_types_and_short_input() {
        assert_eq!(decode_frame(&[]), Err(DecodeError::UnexpectedEof));
        assert_eq!(decode_frame(&[6]), Err(DecodeError::UnexpectedEof));
        assert_eq!(decode_frame(&[6, 2]), Err(DecodeError::UnknownFrameType(2)));
        assert_eq!(decode_frame(&[6, 0, 0, 0]), Err(DecodeError::UnexpectedEof));

        let mut bad = Vec::new();
        encode_request_into(PhyIfId::HIF0, 1, RequestType::Rpc, &[], &mut bad);
        bad[6] = 9;
        assert_eq!(decode_frame(&bad), Err(DecodeError::UnknownRequestType(9)));
    }

    #[test]
    fn truncated_response_payload_is_a_length_mismatch() {
        let frame = [6, 1, 0, 0, 0, 1, 1, 0, 10, 0xAA];
        assert_eq!(
            decode_frame(&frame),
            Err(DecodeError::LengthMismatch {
                declared: 10,
                available: 1
            })
        );
    }

    #[test]
    fn oversized_messages_are_refused() {
        let big = vec![0u8; MAX_RPC_PAYLOAD + 1];
        let env = RpcEnvelope {
            rpc_id: 1,
            return_code: 0,
            payload: &big,
        };
        assert_eq!(env.encode(), Err(EncodeError::TooLarge(MAX_RPC_PAYLOAD + 1)));
    }
}
