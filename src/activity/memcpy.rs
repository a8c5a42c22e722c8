//! Support for memcpy activity records, obtained by enabling [`crate::activity::Kind::Memcpy`]
//! or, for peer-to-peer copies, [`crate::activity::Kind::Memcpy2`].
//!
//! Layout after the header:
//!
//! | offset | field            | type |
//! |--------|------------------|------|
//! | 8      | copy kind        | u8   |
//! | 9      | source kind      | u8   |
//! | 10     | destination kind | u8   |
//! | 11     | flags            | u8   |
//! | 16     | bytes            | u64  |
//! | 24     | start            | u64  |
//! | 32     | end              | u64  |
//! | 40     | device id        | u32  |
//! | 44     | context id       | u32  |
//! | 48     | stream id        | u32  |
//! | 52     | correlation id   | u32  |
//! | 56     | source device    | u32 (peer copies only) |
//! | 60     | destination device | u32 (peer copies only) |

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use super::{Kind as ActivityKind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 56;
pub const PEER_LEN: usize = 64;

const FLAG_ASYNC: u8 = 0x01;

/// Direction of a copy.
#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum Kind {
    #[default]
    Unknown = 0,
    HtoD = 1,
    DtoH = 2,
    HtoA = 3,
    AtoH = 4,
    AtoA = 5,
    AtoD = 6,
    DtoA = 7,
    DtoD = 8,
    HtoH = 9,
    PtoP = 10,
}

/// Kind of memory at either end of a copy.
#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum MemoryKind {
    #[default]
    Unknown = 0,
    Pageable = 1,
    Pinned = 2,
    Device = 3,
    Array = 4,
    Managed = 5,
    DeviceStatic = 6,
    ManagedStatic = 7,
}

/// Devices involved in a peer-to-peer copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct PeerDevices {
    pub source: super::DeviceId,
    pub destination: super::DeviceId,
}

/// Memcpy activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub copy_kind: Kind,
    pub src_kind: MemoryKind,
    pub dst_kind: MemoryKind,
    pub is_async: bool,
    pub bytes: u64,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub device_id: super::DeviceId,
    pub context_id: super::ContextId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::DeviceCorrelationId,
    pub peer: Option<PeerDevices>,
}

impl Record {
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, len) = match self.peer {
            Some(_) => (ActivityKind::Memcpy2, PEER_LEN),
            None => (ActivityKind::Memcpy, LEN),
        };
        let writer = RecordWriter::new(kind as u32, len)
            .u8(8, self.copy_kind as u8)
            .u8(9, self.src_kind as u8)
            .u8(10, self.dst_kind as u8)
            .u8(11, if self.is_async { FLAG_ASYNC } else { 0 })
            .u64(16, self.bytes)
            .u64(24, self.start)
            .u64(32, self.end)
            .u32(40, self.device_id)
            .u32(44, self.context_id)
            .u32(48, self.stream_id)
            .u32(52, self.correlation_id);
        match self.peer {
            Some(peer) => writer.u32(56, peer.source).u32(60, peer.destination),
            None => writer,
        }
        .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        let peer = value.kind() == Some(ActivityKind::Memcpy2);
        value.require(if peer { PEER_LEN } else { LEN })?;
        Ok(Self {
            copy_kind: Kind::from_repr(value.u8_at(8)).unwrap_or_default(),
            src_kind: MemoryKind::from_repr(value.u8_at(9)).unwrap_or_default(),
            dst_kind: MemoryKind::from_repr(value.u8_at(10)).unwrap_or_default(),
            is_async: value.u8_at(11) & FLAG_ASYNC != 0,
            bytes: value.u64_at(16),
            start: value.u64_at(24),
            end: value.u64_at(32),
            device_id: value.u32_at(40),
            context_id: value.u32_at(44),
            stream_id: value.u32_at(48),
            correlation_id: value.u32_at(52),
            peer: peer.then(|| PeerDevices {
                source: value.u32_at(56),
                destination: value.u32_at(60),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fields() -> Result<(), TraceError> {
        let record = Record {
            copy_kind: Kind::HtoD,
            src_kind: MemoryKind::Pinned,
            dst_kind: MemoryKind::Device,
            is_async: true,
            bytes: 4096,
            start: 100,
            end: 250,
            device_id: 1,
            context_id: 2,
            stream_id: 3,
            correlation_id: 42,
            peer: None,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), LEN);
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(Record::try_from(&view)?, record);
        Ok(())
    }

    #[test]
    fn peer_copy_uses_memcpy2() {
        let record = Record {
            copy_kind: Kind::PtoP,
            peer: Some(PeerDevices {
                source: 0,
                destination: 1,
            }),
            ..Default::default()
        };
        let bytes = record.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(view.kind(), Some(ActivityKind::Memcpy2));
        assert_eq!(Record::try_from(&view).unwrap().peer, record.peer);
    }

    #[test]
    fn short_record_is_truncated() {
        let bytes = RecordWriter::new(ActivityKind::Memcpy as u32, 32).finish();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert!(matches!(
            Record::try_from(&view),
            Err(TraceError::Truncated { required: LEN, .. })
        ));
    }

    #[test]
    fn unknown_enum_values_decode_as_unknown() {
        let bytes = RecordWriter::new(ActivityKind::Memcpy as u32, LEN)
            .u8(8, 200)
            .u8(9, 200)
            .finish();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        let record = Record::try_from(&view).unwrap();
        assert_eq!(record.copy_kind, Kind::Unknown);
        assert_eq!(record.src_kind, MemoryKind::Unknown);
    }
}
