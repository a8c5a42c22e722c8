//! Kernel execution detail: program counter samples and the source locator and
//! function records they refer to.
//!
//! | kind                         | layout after the header |
//! |------------------------------|-------------------------|
//! | `SourceLocator`              | id 8, line 12 |
//! | `Function`                   | id 8, context 12, module 16, function index 20 |
//! | `PcSampling`                 | flags 8, source locator 12, correlation 16, function 20, pc offset 24, samples 28, stall reason 32 |
//! | `PcSamplingRecordInfo`       | correlation 8 (`u32`), total samples 16 and dropped samples 24 (`u64`) |
//!
//! All fields are `u32` unless noted.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use super::{Kind, RecordRef, writer::RecordWriter};
use crate::error::TraceError;

pub const SOURCE_LOCATOR_LEN: usize = 16;
pub const FUNCTION_LEN: usize = 24;
pub const PC_SAMPLE_LEN: usize = 40;
pub const RECORD_INFO_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Default, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum StallReason {
    #[default]
    Invalid = 0,
    None = 1,
    InstructionFetch = 2,
    ExecutionDependency = 3,
    MemoryDependency = 4,
    Texture = 5,
    Sync = 6,
    ConstantMemoryDependency = 7,
    PipeBusy = 8,
    MemoryThrottle = 9,
    NotSelected = 10,
    Other = 11,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SourceLocator {
    pub id: u32,
    pub line_number: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Function {
    pub id: u32,
    pub context_id: super::ContextId,
    pub module_id: u32,
    pub function_index: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct PcSample {
    pub flags: u32,
    pub source_locator_id: u32,
    pub correlation_id: super::DeviceCorrelationId,
    pub function_id: u32,
    pub pc_offset: u32,
    pub samples: u32,
    pub stall_reason: StallReason,
}

/// Sampling totals for one kernel launch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct PcSamplingInfo {
    pub correlation_id: super::DeviceCorrelationId,
    pub total_samples: u64,
    pub dropped_samples: u64,
}

impl SourceLocator {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(Kind::SourceLocator as u32, SOURCE_LOCATOR_LEN)
            .u32(8, self.id)
            .u32(12, self.line_number)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for SourceLocator {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(SOURCE_LOCATOR_LEN)?;
        Ok(Self {
            id: value.u32_at(8),
            line_number: value.u32_at(12),
        })
    }
}

impl Function {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(Kind::Function as u32, FUNCTION_LEN)
            .u32(8, self.id)
            .u32(12, self.context_id)
            .u32(16, self.module_id)
            .u32(20, self.function_index)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for Function {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(FUNCTION_LEN)?;
        Ok(Self {
            id: value.u32_at(8),
            context_id: value.u32_at(12),
            module_id: value.u32_at(16),
            function_index: value.u32_at(20),
        })
    }
}

impl PcSample {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(Kind::PcSampling as u32, PC_SAMPLE_LEN)
            .u32(8, self.flags)
            .u32(12, self.source_locator_id)
            .u32(16, self.correlation_id)
            .u32(20, self.function_id)
            .u32(24, self.pc_offset)
            .u32(28, self.samples)
            .u32(32, self.stall_reason as u32)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for PcSample {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(PC_SAMPLE_LEN)?;
        Ok(Self {
            flags: value.u32_at(8),
            source_locator_id: value.u32_at(12),
            correlation_id: value.u32_at(16),
            function_id: value.u32_at(20),
            pc_offset: value.u32_at(24),
            samples: value.u32_at(28),
            stall_reason: StallReason::from_repr(value.u32_at(32)).unwrap_or_default(),
        })
    }
}

impl PcSamplingInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        RecordWriter::new(Kind::PcSamplingRecordInfo as u32, RECORD_INFO_LEN)
            .u32(8, self.correlation_id)
            .u64(16, self.total_samples)
            .u64(24, self.dropped_samples)
            .finish()
    }
}

impl TryFrom<&RecordRef<'_>> for PcSamplingInfo {
    type Error = TraceError;

    fn try_from(value: &RecordRef<'_>) -> Result<Self, Self::Error> {
        value.require(RECORD_INFO_LEN)?;
        Ok(Self {
            correlation_id: value.u32_at(8),
            total_samples: value.u64_at(16),
            dropped_samples: value.u64_at(24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{AbstractRecord, AbstractType, Record};

    #[test]
    fn pc_sample_decodes_and_maps() -> Result<(), TraceError> {
        let sample = PcSample {
            source_locator_id: 4,
            correlation_id: 9,
            pc_offset: 0x40,
            samples: 3,
            stall_reason: StallReason::MemoryThrottle,
            ..Default::default()
        };
        let bytes = sample.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        let record = Record::decode(&view)?;
        assert_eq!(record, Record::PcSampling(sample));
        assert_eq!(
            AbstractRecord::from(&record).record_type,
            Some(AbstractType::KernelPcSample)
        );
        Ok(())
    }

    #[test]
    fn record_info_and_function() -> Result<(), TraceError> {
        let info = PcSamplingInfo {
            correlation_id: 1,
            total_samples: 100,
            dropped_samples: 2,
        };
        let bytes = info.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(PcSamplingInfo::try_from(&view)?, info);

        let function = Function {
            id: 5,
            context_id: 1,
            module_id: 2,
            function_index: 3,
        };
        let bytes = function.to_bytes();
        let view = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(Function::try_from(&view)?, function);
        Ok(())
    }
}
