//! Context records, obtained by enabling [`crate::activity::Kind::Context`].
//!
//! A context record marks a boundary in the stream: the records after it, up to the
//! next context record, were produced on the device it names.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Kind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 24;

pub(crate) const CONTEXT_ID: usize = 8;
pub(crate) const DEVICE_ID: usize = 12;

/// Context activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub context_id: super::ContextId,
    pub device_id: super::DeviceId,
    pub compute_api_kind: u16,
    pub null_stream_id: u16,
}

impl Record {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(Kind::Context as u32, LEN)
            .u32(CONTEXT_ID, self.context_id)
            .u32(DEVICE_ID, self.device_id)
            .u16(16, self.compute_api_kind)
            .u16(18, self.null_stream_id)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        Ok(Record {
            context_id: value.u32_at(CONTEXT_ID),
            device_id: value.u32_at(DEVICE_ID),
            compute_api_kind: value.u16_at(16),
            null_stream_id: value.u16_at(18),
        })
    }
}
