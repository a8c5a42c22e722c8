//! Driver and runtime API activity records, obtained by enabling
//! [`crate::activity::Kind::Driver`] or [`crate::activity::Kind::Runtime`].
//!
//! Both kinds share one layout: callback id at 8 and return value at 12 (`u32`),
//! start and end at 16 and 24 (`u64`), then process, thread and correlation ids at 32,
//! 36 and 40 (`u32`).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Kind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 48;

/// API activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    /// Id of the API function, as numbered by its callback domain.
    pub callback_id: u32,
    pub return_value: u32,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub process_id: super::ProcessId,
    pub thread_id: super::ThreadId,
    pub correlation_id: super::DeviceCorrelationId,
}

impl Record {
    /// Encode as a record of `kind`, either [`Kind::Driver`] or [`Kind::Runtime`].
    pub fn to_bytes(&self, kind: Kind) -> Vec<u8> {
        RecordWriter::new(kind as u32, LEN)
            .u32(8, self.callback_id)
            .u32(12, self.return_value)
            .u64(16, self.start)
            .u64(24, self.end)
            .u32(32, self.process_id)
            .u32(36, self.thread_id)
            .u32(40, self.correlation_id)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        Ok(Record {
            callback_id: value.u32_at(8),
            return_value: value.u32_at(12),
            start: value.u64_at(16),
            end: value.u64_at(24),
            process_id: value.u32_at(32),
            thread_id: value.u32_at(36),
            correlation_id: value.u32_at(40),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity;

    #[test]
    fn driver_and_runtime_share_layout() -> Result<(), TraceError> {
        let record = Record {
            callback_id: 307,
            start: 1,
            end: 2,
            process_id: 10,
            thread_id: 11,
            correlation_id: 12,
            ..Default::default()
        };
        for kind in [Kind::Driver, Kind::Runtime] {
            let bytes = record.to_bytes(kind);
            let view = RecordRef::parse(&bytes, 0).unwrap();
            let decoded = activity::Record::decode(&view)?;
            match (kind, decoded) {
                (Kind::Driver, activity::Record::DriverApi(r))
                | (Kind::Runtime, activity::Record::RuntimeApi(r)) => assert_eq!(r, record),
                (_, other) => panic!("unexpected record {other:?}"),
            }
        }
        Ok(())
    }
}
