//! Support for kernel activity records, obtained by enabling [`crate::activity::Kind::Kernel`] or
//! [`crate::activity::Kind::ConcurrentKernel`].
//!
//! Layout after the header: start, end and completed time stamps at 8, 16 and 24
//! (`u64`), then device, context, stream and correlation ids at 32, 36, 40 and 44
//! (`u32`), then grid and block dimensions as six `i32` from 48 to 72.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Kind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const LEN: usize = 72;

/// Kernel activity record
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    /// Whether the producer marked this kernel as concurrent.
    pub concurrent: bool,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub completed: super::Timestamp,
    pub device_id: super::DeviceId,
    pub context_id: super::ContextId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::DeviceCorrelationId,
    pub grid_x: i32,
    pub grid_y: i32,
    pub grid_z: i32,
    pub block_x: i32,
    pub block_y: i32,
    pub block_z: i32,
}

impl Record {
    pub fn to_bytes(&self) -> Vec<u8> {
        let kind = if self.concurrent {
            Kind::ConcurrentKernel
        } else {
            Kind::Kernel
        };
        RecordWriter::new(kind as u32, LEN)
            .u64(8, self.start)
            .u64(16, self.end)
            .u64(24, self.completed)
            .u32(32, self.device_id)
            .u32(36, self.context_id)
            .u32(40, self.stream_id)
            .u32(44, self.correlation_id)
            .i32(48, self.grid_x)
            .i32(52, self.grid_y)
            .i32(56, self.grid_z)
            .i32(60, self.block_x)
            .i32(64, self.block_y)
            .i32(68, self.block_z)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Record {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(LEN)?;
        Ok(Record {
            concurrent: value.kind() == Some(Kind::ConcurrentKernel),
            start: value.u64_at(8),
            end: value.u64_at(16),
            completed: value.u64_at(24),
            device_id: value.u32_at(32),
            context_id: value.u32_at(36),
            stream_id: value.u32_at(40),
            correlation_id: value.u32_at(44),
            grid_x: value.i32_at(48),
            grid_y: value.i32_at(52),
            grid_z: value.i32_at(56),
            block_x: value.i32_at(60),
            block_y: value.i32_at(64),
            block_z: value.i32_at(68),
        })
    }
}
