//! The ordering header attached to every protocol frame
//!
//! Wire layout of a frame:
//!
//! ```text
//! +--------+------+---------------+----------+------------+---------+
//! | marker | kind | correlationId | orderId  | viewEpoch  | payload |
//! | 1 byte | 1 B  | i64 LE        | i64 LE   | i32 LE     | rest    |
//! +--------+------+---------------+----------+------------+---------+
//! ```
//!
//! `marker` is 1 when no header is present (the payload follows directly)
//! and 0 when the 21-byte header body follows.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TotalError};
use crate::view::ViewEpoch;

/// Sentinel for unassigned correlation and order ids
pub const NONE_ID: i64 = -1;

const HEADER_ABSENT: u8 = 1;
const HEADER_PRESENT: u8 = 0;

/// Header type tag
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// Null tag; never acted upon
    None = 0,
    /// Broadcast sequencing request
    Req = 1,
    /// Reply to a broadcast request
    Rep = 2,
    /// Unicast, bypasses ordering
    Ucast = 3,
    /// Globally ordered broadcast
    Bcast = 4,
    /// Subgroup-ordered multicast
    Mcast = 5,
    /// Multicast sequencing request
    ReqMcast = 6,
    /// Reply to a multicast request
    RepMcast = 7,
}

impl TryFrom<u8> for HeaderKind {
    type Error = TotalError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Req,
            2 => Self::Rep,
            3 => Self::Ucast,
            4 => Self::Bcast,
            5 => Self::Mcast,
            6 => Self::ReqMcast,
            7 => Self::RepMcast,
            other => return Err(TotalError::UnknownHeaderKind(other)),
        })
    }
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Ucast => "UCAST",
            Self::Bcast => "BCAST",
            Self::Mcast => "MCAST",
            Self::ReqMcast => "REQMCAST",
            Self::RepMcast => "REPMCAST",
        };
        f.write_str(name)
    }
}

/// Total-order tag carried by a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderingHeader {
    /// What the frame is
    pub kind: HeaderKind,
    /// Sender-assigned id matching a reply to its request
    pub correlation_id: i64,
    /// Sequencer-assigned position in the scope's order
    pub order_id: i64,
    /// Epoch the order id was minted in
    pub view_epoch: ViewEpoch,
}

impl OrderingHeader {
    /// Size of the encoded header body, excluding the marker byte
    pub const ENCODED_LEN: usize = 1 + 8 + 8 + 4;

    /// Create a header
    pub fn new(kind: HeaderKind, correlation_id: i64, order_id: i64, view_epoch: ViewEpoch) -> Self {
        Self {
            kind,
            correlation_id,
            order_id,
            view_epoch,
        }
    }

    /// A sequencing request; the order id is not known yet
    pub fn request(kind: HeaderKind, correlation_id: i64, view_epoch: ViewEpoch) -> Self {
        Self::new(kind, correlation_id, NONE_ID, view_epoch)
    }

    /// A unicast tag
    pub fn unicast() -> Self {
        Self::new(HeaderKind::Ucast, NONE_ID, NONE_ID, ViewEpoch::UNSET)
    }

    fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_i64_le(self.correlation_id);
        buf.put_i64_le(self.order_id);
        buf.put_i32_le(self.view_epoch.get());
    }

    fn decode_body(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(TotalError::Decode(format!(
                "header needs {} bytes, {} remaining",
                Self::ENCODED_LEN,
                buf.remaining()
            )));
        }

        let kind = HeaderKind::try_from(buf.get_u8())?;
        let correlation_id = buf.get_i64_le();
        let order_id = buf.get_i64_le();
        let view_epoch = ViewEpoch::new(buf.get_i32_le());

        Ok(Self::new(kind, correlation_id, order_id, view_epoch))
    }

    /// Write an optional header preceded by its null marker
    pub fn write_optional(header: Option<&Self>, buf: &mut impl BufMut) {
        match header {
            None => buf.put_u8(HEADER_ABSENT),
            Some(header) => {
                buf.put_u8(HEADER_PRESENT);
                header.encode_body(buf);
            }
        }
    }

    /// Read an optional header preceded by its null marker
    pub fn read_optional(buf: &mut impl Buf) -> Result<Option<Self>> {
        if !buf.has_remaining() {
            return Err(TotalError::Decode("empty frame".to_string()));
        }

        match buf.get_u8() {
            HEADER_ABSENT => Ok(None),
            HEADER_PRESENT => Self::decode_body(buf).map(Some),
            marker => Err(TotalError::Decode(format!("invalid header marker {marker}"))),
        }
    }
}

impl fmt::Display for OrderingHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[TOTAL {} correlation={} order={} epoch={}]",
            self.kind, self.correlation_id, self.order_id, self.view_epoch
        )
    }
}

/// A header plus the opaque payload it tags
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Ordering header, absent for unsequenced traffic
    pub header: Option<OrderingHeader>,
    /// Application payload
    pub payload: Bytes,
}

impl Frame {
    /// A frame with a header
    pub fn new(header: OrderingHeader, payload: Bytes) -> Self {
        Self {
            header: Some(header),
            payload,
        }
    }

    /// A frame with only the header and an empty payload
    pub fn control(header: OrderingHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let header_len = if self.header.is_some() {
            OrderingHeader::ENCODED_LEN
        } else {
            0
        };
        let mut buf = BytesMut::with_capacity(1 + header_len + self.payload.len());
        OrderingHeader::write_optional(self.header.as_ref(), &mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire bytes
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let header = OrderingHeader::read_optional(&mut bytes)?;
        Ok(Self {
            header,
            payload: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let header = OrderingHeader::new(HeaderKind::Rep, 5, 9, ViewEpoch::new(2));
        let bytes = Frame::control(header).encode();

        assert_eq!(bytes.len(), 1 + OrderingHeader::ENCODED_LEN);
        assert_eq!(bytes[0], HEADER_PRESENT);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[2..10], &5i64.to_le_bytes());
        assert_eq!(&bytes[10..18], &9i64.to_le_bytes());
        assert_eq!(&bytes[18..22], &2i32.to_le_bytes());
    }

    #[test]
    fn test_frame_with_payload() {
        let header = OrderingHeader::new(HeaderKind::Bcast, 1, 1, ViewEpoch::new(0));
        let frame = Frame::new(header, Bytes::from_static(b"put k v"));

        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_absent_header_marker() {
        let frame = Frame {
            header: None,
            payload: Bytes::from_static(b"raw"),
        };
        let bytes = frame.encode();

        assert_eq!(bytes[0], HEADER_ABSENT);
        assert_eq!(&bytes[1..], b"raw");
        assert_eq!(Frame::decode(bytes).unwrap().header, None);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut raw = Frame::control(OrderingHeader::unicast()).encode().to_vec();
        raw[1] = 42;

        let result = Frame::decode(Bytes::from(raw));
        assert!(matches!(result, Err(TotalError::UnknownHeaderKind(42))));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let raw = Frame::control(OrderingHeader::unicast()).encode();
        let result = Frame::decode(raw.slice(0..10));
        assert!(matches!(result, Err(TotalError::Decode(_))));

        assert!(matches!(
            Frame::decode(Bytes::new()),
            Err(TotalError::Decode(_))
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[7])),
            Err(TotalError::Decode(_))
        ));
    }

    #[test]
    fn test_display() {
        let header = OrderingHeader::request(HeaderKind::ReqMcast, 4, ViewEpoch::new(7));
        assert_eq!(
            header.to_string(),
            "[TOTAL REQMCAST correlation=4 order=-1 epoch=7]"
        );
    }
}
