//! Types related Unified Virtual Memory (UVM) a.k.a. Unified Memory
//!
//! Counter records are obtained by enabling [`crate::activity::Kind::UnifiedMemoryCounter`].
//! Layout after the header: counter kind at 8 and flags at 12 (`u32`), value, start,
//! end and address at 16, 24, 32 and 40 (`u64`), then source id, destination id,
//! stream id and process id at 48, 52, 56 and 60 (`u32`).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use super::{Kind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 64;

#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum CounterKind {
    #[default]
    Unknown = 0,
    BytesTransferHtoD = 1,
    BytesTransferDtoH = 2,
    CpuPageFaultCount = 3,
    GpuPageFault = 4,
    Thrashing = 5,
    Throttling = 6,
    RemoteMap = 7,
    BytesTransferDtoD = 8,
}

/// Why a transfer was performed, carried in the flags word of transfer counters.
#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum MigrationCause {
    #[default]
    Unknown = 0,
    User = 1,
    Coherence = 2,
    Prefetch = 3,
    Eviction = 4,
    AccessCounters = 5,
}

/// Data of UVM counter records representing transfers
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct BytesTransfer {
    pub memory_region_bytes: u64,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub virtual_base_address: u64,
    pub source_device_id: super::DeviceId,
    pub destination_device_id: super::DeviceId,
    pub stream_id: super::StreamId,
    pub process_id: super::ProcessId,
    pub migration_cause: MigrationCause,
}

impl BytesTransfer {
    fn from_record(rec: &RecordRef<'_>) -> Self {
        Self {
            memory_region_bytes: rec.u64_at(16),
            start: rec.u64_at(24),
            end: rec.u64_at(32),
            virtual_base_address: rec.u64_at(40),
            source_device_id: rec.u32_at(48),
            destination_device_id: rec.u32_at(52),
            stream_id: rec.u32_at(56),
            process_id: rec.u32_at(60),
            migration_cause: MigrationCause::from_repr(rec.u32_at(12)).unwrap_or_default(),
        }
    }

    fn write(&self, kind: CounterKind) -> Vec<u8> {
        RecordWriter::new(Kind::UnifiedMemoryCounter as u32, LEN)
            .u32(8, kind as u32)
            .u32(12, self.migration_cause as u32)
            .u64(16, self.memory_region_bytes)
            .u64(24, self.start)
            .u64(32, self.end)
            .u64(40, self.virtual_base_address)
            .u32(48, self.source_device_id)
            .u32(52, self.destination_device_id)
            .u32(56, self.stream_id)
            .u32(60, self.process_id)
            .finish()
    }
}

/// A UVM counter activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CounterRecord {
    BytesTransferHtoD(BytesTransfer),
    BytesTransferDtoH(BytesTransfer),
    BytesTransferDtoD(BytesTransfer),
    /// A counter without transfer data; only the value is kept.
    Count { kind: CounterKind, value: u64 },
}

impl CounterRecord {
    pub fn transfer(&self) -> Option<&BytesTransfer> {
        match self {
            CounterRecord::BytesTransferHtoD(t)
            | CounterRecord::BytesTransferDtoH(t)
            | CounterRecord::BytesTransferDtoD(t) => Some(t),
            CounterRecord::Count { .. } => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CounterRecord::BytesTransferHtoD(t) => t.write(CounterKind::BytesTransferHtoD),
            CounterRecord::BytesTransferDtoH(t) => t.write(CounterKind::BytesTransferDtoH),
            CounterRecord::BytesTransferDtoD(t) => t.write(CounterKind::BytesTransferDtoD),
            CounterRecord::Count { kind, value } => {
                RecordWriter::new(Kind::UnifiedMemoryCounter as u32, LEN)
                    .u32(8, *kind as u32)
                    .u64(16, *value)
                    .finish()
            }
        }
    }
}

impl TryFrom<&RecordRef<'_>> for CounterRecord {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        let kind = CounterKind::from_repr(value.u32_at(8)).unwrap_or_default();
        Ok(match kind {
            CounterKind::BytesTransferHtoD => {
                Self::BytesTransferHtoD(BytesTransfer::from_record(value))
            }
            CounterKind::BytesTransferDtoH => {
                Self::BytesTransferDtoH(BytesTransfer::from_record(value))
            }
            CounterKind::BytesTransferDtoD => {
                Self::BytesTransferDtoD(BytesTransfer::from_record(value))
            }
            kind => Self::Count {
                kind,
                value: value.u64_at(16),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_counters_keep_transfer_data() {
        let transfer = BytesTransfer {
            memory_region_bytes: 1 << 20,
            start: 3,
            end: 8,
            virtual_base_address: 0x7f00_0000,
            source_device_id: 0,
            destination_device_id: 1,
            migration_cause: MigrationCause::Prefetch,
            ..Default::default()
        };
        let record = CounterRecord::BytesTransferHtoD(transfer.clone());
        let bytes = record.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        let decoded = CounterRecord::try_from(&view).unwrap();
        assert_eq!(decoded.transfer(), Some(&transfer));
    }

    #[test]
    fn other_counters_keep_value() {
        let record = CounterRecord::Count {
            kind: CounterKind::GpuPageFault,
            value: 12,
        };
        let bytes = record.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(CounterRecord::try_from(&view), Ok(record));
    }
}
