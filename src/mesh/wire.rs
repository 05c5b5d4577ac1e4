use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use super::Rank;
use crate::error::{Error, Result};

/// Value carried by the two signal messages. Only their presence matters.
pub const SENTINEL: i32 = 1;

/// Discriminates a message's logical sub-channel and payload shape. The
/// discriminants are the on-wire tag byte and must not change.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Coordinator -> one worker: a point to evaluate
    PointToEvaluate = 0,
    /// Worker -> coordinator: an evaluated point
    EvaluatedPoint = 1,
    /// Coordinator -> every worker: no more work will come
    EvaluationDone = 2,
    /// Worker -> coordinator: acknowledgement of `EvaluationDone`
    WorkerDone = 3,
}

impl Tag {
    pub const ALL: [Tag; 4] = [
        Tag::PointToEvaluate,
        Tag::EvaluatedPoint,
        Tag::EvaluationDone,
        Tag::WorkerDone,
    ];

    /// Size of the payload following the tag byte.
    pub fn payload_len(self) -> usize {
        match self {
            Tag::PointToEvaluate => 8,
            Tag::EvaluatedPoint => 3 * 8,
            Tag::EvaluationDone | Tag::WorkerDone => 4,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Tag::ALL
            .into_iter()
            .find(|tag| tag.byte() == value)
            .ok_or(Error::UnknownTag(value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationRequest {
    pub x: f64,
}

/// What a worker sends back. The coordinator attaches the source rank on
/// receipt, so the worker id never travels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluatedPoint {
    pub x: f64,
    pub f: f64,
    pub ok: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Message {
    PointToEvaluate(EvaluationRequest),
    EvaluatedPoint(EvaluatedPoint),
    EvaluationDone(i32),
    WorkerDone(i32),
}

impl Message {
    pub fn point(x: f64) -> Self {
        Self::PointToEvaluate(EvaluationRequest { x })
    }

    pub fn evaluated(x: f64, f: f64, ok: bool) -> Self {
        Self::EvaluatedPoint(EvaluatedPoint { x, f, ok })
    }

    pub fn tag(&self) -> Tag {
        match self {
            Message::PointToEvaluate(_) => Tag::PointToEvaluate,
            Message::EvaluatedPoint(_) => Tag::EvaluatedPoint,
            Message::EvaluationDone(_) => Tag::EvaluationDone,
            Message::WorkerDone(_) => Tag::WorkerDone,
        }
    }

    /// Encodes as `tag | payload`, little-endian throughout.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.tag();
        let mut buf = vec![0u8; 1 + tag.payload_len()];
        buf[0] = tag.byte();
        let payload = &mut buf[1..];
        match self {
            Message::PointToEvaluate(req) => {
                LittleEndian::write_f64(payload, req.x);
            }
            Message::EvaluatedPoint(point) => {
                LittleEndian::write_f64(&mut payload[0..8], point.x);
                LittleEndian::write_f64(&mut payload[8..16], point.f);
                // booleans travel as 1.0 / 0.0
                let ok = if point.ok { 1.0 } else { 0.0 };
                LittleEndian::write_f64(&mut payload[16..24], ok);
            }
            Message::EvaluationDone(sentinel) | Message::WorkerDone(sentinel) => {
                LittleEndian::write_i32(payload, *sentinel);
            }
        }
        buf
    }

    /// Decodes a payload whose tag byte has already been read.
    pub fn decode(tag: Tag, payload: &[u8]) -> Result<Self> {
        if payload.len() != tag.payload_len() {
            return Err(Error::PayloadLength {
                tag,
                expected: tag.payload_len(),
                actual: payload.len(),
            });
        }
        let msg = match tag {
            Tag::PointToEvaluate => Message::point(LittleEndian::read_f64(
                array_ref![payload, 0, 8],
            )),
            Tag::EvaluatedPoint => Message::evaluated(
                LittleEndian::read_f64(array_ref![payload, 0, 8]),
                LittleEndian::read_f64(array_ref![payload, 8, 8]),
                LittleEndian::read_f64(array_ref![payload, 16, 8]) != 0.0,
            ),
            Tag::EvaluationDone => {
                Message::EvaluationDone(LittleEndian::read_i32(payload))
            }
            Tag::WorkerDone => {
                Message::WorkerDone(LittleEndian::read_i32(payload))
            }
        };
        Ok(msg)
    }
}

/// First frame on every link, sent by both ends:
/// `magic | rank: u32 | world_size: u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub rank: Rank,
    pub world_size: usize,
}

impl Hello {
    pub const MAGIC: [u8; 4] = *b"EVM1";
    pub const LEN: usize = 12;

    /// Fails when either field does not fit the 32-bit wire fields.
    pub fn new(rank: Rank, world_size: usize) -> Result<Self> {
        let hello = Self { rank, world_size };
        hello.fields()?;
        Ok(hello)
    }

    fn fields(&self) -> Result<(u32, u32)> {
        let narrow = |value: usize, what: &str| {
            u32::try_from(value).map_err(|_| {
                Error::Config(format!(
                    "{} {} does not fit in 32 bits",
                    what, value
                ))
            })
        };
        let rank = narrow(self.rank, "rank")?;
        let world_size = narrow(self.world_size, "world size")?;
        Ok((rank, world_size))
    }

    pub fn encode(&self) -> Result<[u8; Self::LEN]> {
        let (rank, world_size) = self.fields()?;
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&Self::MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], rank);
        LittleEndian::write_u32(&mut buf[8..12], world_size);
        Ok(buf)
    }

    /// Returns `None` when the magic does not match.
    pub fn decode(buf: &[u8; Self::LEN]) -> Option<Self> {
        if array_ref![buf, 0, 4] != &Self::MAGIC {
            return None;
        }
        Some(Self {
            rank: LittleEndian::read_u32(&buf[4..8]) as Rank,
            world_size: LittleEndian::read_u32(&buf[8..12]) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bytes_are_fixed() {
        assert_eq!(Tag::PointToEvaluate.byte(), 0);
        assert_eq!(Tag::EvaluatedPoint.byte(), 1);
        assert_eq!(Tag::EvaluationDone.byte(), 2);
        assert_eq!(Tag::WorkerDone.byte(), 3);
        for tag in Tag::ALL {
            assert_eq!(Tag::try_from(tag.byte()).unwrap(), tag);
        }
        assert!(matches!(Tag::try_from(4), Err(Error::UnknownTag(4))));
    }

    #[test]
    fn evaluated_point_layout() {
        let buf = Message::evaluated(42.37, 42.0, true).encode();
        assert_eq!(buf.len(), 25);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..9], &42.37f64.to_le_bytes());
        assert_eq!(&buf[9..17], &42.0f64.to_le_bytes());
        assert_eq!(&buf[17..25], &1.0f64.to_le_bytes());

        let failed = Message::evaluated(1.5, f64::NAN, false).encode();
        assert_eq!(&failed[17..25], &0.0f64.to_le_bytes());
    }

    #[test]
    fn signal_layout() {
        let buf = Message::EvaluationDone(SENTINEL).encode();
        assert_eq!(buf, vec![2, 1, 0, 0, 0]);
        let buf = Message::WorkerDone(SENTINEL).encode();
        assert_eq!(buf, vec![3, 1, 0, 0, 0]);
    }

    #[test]
    fn decode_reads_what_encode_wrote() {
        let msg = Message::evaluated(-3.25, -3.0, true);
        let buf = msg.encode();
        let tag = Tag::try_from(buf[0]).unwrap();
        assert_eq!(Message::decode(tag, &buf[1..]).unwrap(), msg);
    }

    #[test]
    fn any_nonzero_ok_is_true() {
        let mut payload = [0u8; 24];
        LittleEndian::write_f64(&mut payload[16..24], 0.5);
        match Message::decode(Tag::EvaluatedPoint, &payload).unwrap() {
            Message::EvaluatedPoint(point) => assert!(point.ok),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = Message::decode(Tag::PointToEvaluate, &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadLength {
                tag: Tag::PointToEvaluate,
                expected: 8,
                actual: 4
            }
        ));
    }

    #[test]
    fn hello_checks_magic() {
        let hello = Hello {
            rank: 3,
            world_size: 5,
        };
        let mut buf = hello.encode().unwrap();
        assert_eq!(Hello::decode(&buf), Some(hello));
        buf[0] = b'X';
        assert_eq!(Hello::decode(&buf), None);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn hello_rejects_values_wider_than_the_wire() {
        let huge = u32::MAX as usize + 1;
        assert!(matches!(Hello::new(0, huge), Err(Error::Config(_))));
        assert!(matches!(Hello::new(huge, huge + 1), Err(Error::Config(_))));
        let hello = Hello {
            rank: 0,
            world_size: huge,
        };
        assert!(matches!(hello.encode(), Err(Error::Config(_))));
        assert_eq!(Hello::new(2, 3).unwrap().encode().unwrap().len(), 12);
    }
}
