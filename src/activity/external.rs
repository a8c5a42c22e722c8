//! External correlation records, obtained by enabling
//! [`crate::activity::Kind::ExternalCorrelation`].
//!
//! The producer emits one of these ahead of each device record created while a host
//! correlation id was pushed. It links the producer's own correlation id to the
//! pushed id. Layout after the header: external kind at 8 and device correlation id
//! at 12 (`u32`), external id at 16 (`u64`).

use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use super::{Kind as ActivityKind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 24;

/// Who pushed the external id.
#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum Kind {
    #[default]
    Invalid = 0,
    Unknown = 1,
    Openacc = 2,
    Custom0 = 3,
    Custom1 = 4,
    Custom2 = 5,
}

/// External correlation activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub external_kind: Kind,
    pub correlation_id: super::DeviceCorrelationId,
    pub external_id: u64,
}

impl Record {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(ActivityKind::ExternalCorrelation as u32, LEN)
            .u32(8, self.external_kind as u32)
            .u32(12, self.correlation_id)
            .u64(16, self.external_id)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        Ok(Record {
            external_kind: Kind::from_repr(value.u32_at(8)).unwrap_or_default(),
            correlation_id: value.u32_at(12),
            external_id: value.u64_at(16),
        })
    }
}

/// Attributes device records to host operations through external correlation records.
#[derive(Clone, Debug, Default)]
pub struct Attribution {
    host_ops: HashMap<super::DeviceCorrelationId, u64>,
}

impl Attribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the link carried by an external correlation record.
    pub fn observe(&mut self, record: &Record) {
        self.host_ops.insert(record.correlation_id, record.external_id);
    }

    /// The host operation a device correlation id belongs to.
    pub fn host_operation(&self, correlation_id: super::DeviceCorrelationId) -> Option<u64> {
        self.host_ops.get(&correlation_id).copied()
    }

    /// The host operation of a decoded record, for kinds that carry a correlation id.
    pub fn host_operation_of(&self, record: &super::Record) -> Option<u64> {
        let correlation_id = match record {
            super::Record::Memcpy(r) => r.correlation_id,
            super::Record::Kernel(r) => r.correlation_id,
            super::Record::DriverApi(r) | super::Record::RuntimeApi(r) => r.correlation_id,
            super::Record::PcSampling(r) => r.correlation_id,
            super::Record::PcSamplingRecordInfo(r) => r.correlation_id,
            _ => return None,
        };
        self.host_operation(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.host_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host_ops.is_empty()
    }
}
