//! Overhead records, obtained by enabling [`crate::activity::Kind::Overhead`].
//!
//! Layout after the header: overhead kind at 8 and object kind at 12 (`u32`), three
//! object id words at 16, 20 and 24 (`u32`), start and end at 32 and 40 (`u64`).
//! Which id word names the object depends on the object kind: process and device use
//! the first, thread and context the second, stream the third.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

use super::{Kind as ActivityKind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 48;

/// What the overhead was spent on.
#[derive(Clone, Copy, Debug, Default, FromRepr, IntoStaticStr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum Kind {
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown = 0,
    #[strum(serialize = "COMPILER")]
    DriverCompiler = 1,
    #[strum(serialize = "BUFFER_FLUSH")]
    BufferFlush = 1 << 16,
    #[strum(serialize = "INSTRUMENTATION")]
    Instrumentation = 2 << 16,
    #[strum(serialize = "RESOURCE")]
    Resource = 3 << 16,
}

/// Kind of object the overhead is attributed to.
#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum ObjectKind {
    #[default]
    Unknown = 0,
    Process = 1,
    Thread = 2,
    Device = 3,
    Context = 4,
    Stream = 5,
}

/// Overhead activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub overhead_kind: Kind,
    pub object_kind: ObjectKind,
    pub object_ids: [u32; 3],
    pub start: super::Timestamp,
    pub end: super::Timestamp,
}

impl Record {
    /// The id of the object this overhead is attributed to.
    pub fn object_id(&self) -> Option<u32> {
        match self.object_kind {
            ObjectKind::Process | ObjectKind::Device => Some(self.object_ids[0]),
            ObjectKind::Thread | ObjectKind::Context => Some(self.object_ids[1]),
            ObjectKind::Stream => Some(self.object_ids[2]),
            ObjectKind::Unknown => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(ActivityKind::Overhead as u32, LEN)
            .u32(8, self.overhead_kind as u32)
            .u32(12, self.object_kind as u32)
            .u32(16, self.object_ids[0])
            .u32(20, self.object_ids[1])
            .u32(24, self.object_ids[2])
            .u64(32, self.start)
            .u64(40, self.end)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        Ok(Record {
            overhead_kind: Kind::from_repr(value.u32_at(8)).unwrap_or_default(),
            object_kind: ObjectKind::from_repr(value.u32_at(12)).unwrap_or_default(),
            object_ids: [value.u32_at(16), value.u32_at(20), value.u32_at(24)],
            start: value.u64_at(32),
            end: value.u64_at(40),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_follows_object_kind() {
        let mut record = Record {
            overhead_kind: Kind::BufferFlush,
            object_kind: ObjectKind::Thread,
            object_ids: [100, 200, 300],
            start: 1,
            end: 3,
        };
        assert_eq!(record.object_id(), Some(200));
        record.object_kind = ObjectKind::Stream;
        assert_eq!(record.object_id(), Some(300));
        record.object_kind = ObjectKind::Unknown;
        assert_eq!(record.object_id(), None);
    }

    #[test]
    fn decodes_overhead() {
        let record = Record {
            overhead_kind: Kind::Instrumentation,
            object_kind: ObjectKind::Device,
            object_ids: [1, 0, 0],
            start: 10,
            end: 20,
        };
        let bytes = record.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        let decoded = Record::try_from(&view).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(<&str>::from(decoded.overhead_kind), "INSTRUMENTATION");
    }
}
