//! Activity records: kinds, buffers, the record cursor and per-kind decoding.
//!
//! The device subsystem fills [`RecordBuffer`]s with a self-framed stream of binary
//! activity records. Every record starts with an 8-byte header, a little-endian `u32`
//! kind tag followed by the `u32` length of the whole record, and is padded to a
//! multiple of 8 bytes. The payload layout of each kind is documented in its module.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumIter, FromRepr, IntoStaticStr};

use crate::error::TraceError;

pub mod api;
pub mod buffer;
pub mod context;
pub mod cursor;
pub mod dispatch;
pub mod external;
pub mod kernel;
pub mod memcpy;
pub mod overhead;
pub mod partition;
pub mod sampling;
pub mod uvm;
pub mod writer;

pub use buffer::{BufferPool, RecordBuffer};
pub use cursor::{Cursor, RecordRef, RecordType, Records, advance_cursor, is_valid, record_kind};
pub use dispatch::{DispatchTable, DrainSummary};
pub use partition::{ContextSpan, DeviceRecords, context_spans};

/// A time stamp in nanoseconds on the device clock.
pub type Timestamp = u64;

pub type ProcessId = u32;
pub type ThreadId = u32;
/// Correlation id assigned by the device subsystem, distinct from host correlation ids.
pub type DeviceCorrelationId = u32;
pub type StreamId = u32;
pub type DeviceId = u32;
pub type ContextId = u32;

/// Activity record kinds, numbered as the device profiling client numbers them.
///
/// [`Kind::Invalid`] doubles as the terminating sentinel of kind lists.
#[derive(
    Clone, Copy, Debug, EnumIter, FromRepr, IntoStaticStr, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum Kind {
    Invalid = 0,
    Memcpy = 1,
    Memset = 2,
    Kernel = 3,
    Driver = 4,
    Runtime = 5,
    Event = 6,
    Metric = 7,
    Device = 8,
    Context = 9,
    ConcurrentKernel = 10,
    Name = 11,
    Marker = 12,
    MarkerData = 13,
    SourceLocator = 14,
    GlobalAccess = 15,
    Branch = 16,
    Overhead = 17,
    CdpKernel = 18,
    Preemption = 19,
    Environment = 20,
    EventInstance = 21,
    Memcpy2 = 22,
    MetricInstance = 23,
    InstructionExecution = 24,
    UnifiedMemoryCounter = 25,
    Function = 26,
    Module = 27,
    DeviceAttribute = 28,
    SharedAccess = 29,
    PcSampling = 30,
    PcSamplingRecordInfo = 31,
    InstructionCorrelation = 32,
    OpenaccData = 33,
    OpenaccLaunch = 34,
    OpenaccOther = 35,
    CudaEvent = 36,
    Stream = 37,
    Synchronization = 38,
    ExternalCorrelation = 39,
    Nvlink = 40,
    InstantaneousEvent = 41,
    InstantaneousEventInstance = 42,
    InstantaneousMetric = 43,
    InstantaneousMetricInstance = 44,
}

impl Kind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl From<Kind> for u32 {
    fn from(value: Kind) -> Self {
        value as u32
    }
}

/// A decoded activity record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum Record {
    /// A memory copy, from [`Kind::Memcpy`] or a peer-to-peer copy from [`Kind::Memcpy2`].
    Memcpy(memcpy::Record),
    /// A kernel execution, from [`Kind::Kernel`] or [`Kind::ConcurrentKernel`].
    Kernel(kernel::Record),
    /// A driver API call span.
    DriverApi(api::Record),
    /// A runtime API call span.
    RuntimeApi(api::Record),
    /// A context boundary, marking which device the following records belong to.
    Context(context::Record),
    /// Time spent in the driver or the profiling client itself.
    Overhead(overhead::Record),
    /// Links the next device record to a host-side operation.
    ExternalCorrelation(external::Record),
    UnifiedMemoryCounter(uvm::CounterRecord),
    SourceLocator(sampling::SourceLocator),
    Function(sampling::Function),
    PcSampling(sampling::PcSample),
    PcSamplingRecordInfo(sampling::PcSamplingInfo),
    /// A known kind this crate does not decode.
    Other(Kind),
    /// A kind tag this crate does not know.
    Unknown(u32),
}

impl Record {
    /// Decode a record view into its kind-specific shape.
    pub fn decode(record: &RecordRef<'_>) -> Result<Self, TraceError> {
        let Some(kind) = record.kind() else {
            return Ok(Record::Unknown(record.kind_tag()));
        };
        Ok(match kind {
            Kind::Memcpy | Kind::Memcpy2 => Record::Memcpy(record.try_into()?),
            Kind::Kernel | Kind::ConcurrentKernel => Record::Kernel(record.try_into()?),
            Kind::Driver => Record::DriverApi(record.try_into()?),
            Kind::Runtime => Record::RuntimeApi(record.try_into()?),
            Kind::Context => Record::Context(record.try_into()?),
            Kind::Overhead => Record::Overhead(record.try_into()?),
            Kind::ExternalCorrelation => Record::ExternalCorrelation(record.try_into()?),
            Kind::UnifiedMemoryCounter => Record::UnifiedMemoryCounter(record.try_into()?),
            Kind::SourceLocator => Record::SourceLocator(record.try_into()?),
            Kind::Function => Record::Function(record.try_into()?),
            Kind::PcSampling => Record::PcSampling(record.try_into()?),
            Kind::PcSamplingRecordInfo => Record::PcSamplingRecordInfo(record.try_into()?),
            other => Record::Other(other),
        })
    }

    /// Encode this record in the binary stream format. [`Record::Other`] and
    /// [`Record::Unknown`] carry no payload and encode as a bare header.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Record::Memcpy(r) => r.to_bytes(),
            Record::Kernel(r) => r.to_bytes(),
            Record::DriverApi(r) => r.to_bytes(Kind::Driver),
            Record::RuntimeApi(r) => r.to_bytes(Kind::Runtime),
            Record::Context(r) => r.to_bytes(),
            Record::Overhead(r) => r.to_bytes(),
            Record::ExternalCorrelation(r) => r.to_bytes(),
            Record::UnifiedMemoryCounter(r) => r.to_bytes(),
            Record::SourceLocator(r) => r.to_bytes(),
            Record::Function(r) => r.to_bytes(),
            Record::PcSampling(r) => r.to_bytes(),
            Record::PcSamplingRecordInfo(r) => r.to_bytes(),
            Record::Other(kind) => writer::RecordWriter::new(*kind as u32, 0).finish(),
            Record::Unknown(tag) => writer::RecordWriter::new(*tag, 0).finish(),
        }
    }
}

/// Category label of an [`AbstractRecord`].
#[derive(Clone, Copy, Debug, IntoStaticStr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum AbstractType {
    #[strum(serialize = "MEMCPY EXPLICIT")]
    MemcpyExplicit,
    #[strum(serialize = "MEMCPY IMPLICIT")]
    MemcpyImplicit,
    #[strum(serialize = "KERNEL INVOCATION")]
    KernelInvocation,
    #[strum(serialize = "KERNEL SOURCE LOCATOR")]
    KernelSourceLocator,
    #[strum(serialize = "KERNEL PC SAMPLE")]
    KernelPcSample,
    #[strum(serialize = "KERNEL PC SAMPLING INFO")]
    KernelPcSamplingInfo,
    #[strum(serialize = "FUNCTION")]
    Function,
    #[strum(serialize = "DRIVER")]
    Driver,
    #[strum(serialize = "RUNTIME")]
    Runtime,
    #[strum(serialize = "OVERHEAD")]
    Overhead,
}

impl AbstractType {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Vendor-independent summary of a record.
///
/// `None` fields correspond to the "none" values of the tool interface: no type, no
/// device time, no hardware id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct AbstractRecord {
    pub record_type: Option<AbstractType>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub hardware_id: Option<u64>,
}

impl AbstractRecord {
    fn spanning(record_type: AbstractType, start: Timestamp, end: Timestamp) -> Self {
        Self {
            record_type: Some(record_type),
            start_time: Some(start),
            end_time: Some(end),
            hardware_id: None,
        }
    }

    fn untimed(record_type: AbstractType) -> Self {
        Self {
            record_type: Some(record_type),
            ..Default::default()
        }
    }
}

impl From<&Record> for AbstractRecord {
    fn from(value: &Record) -> Self {
        match value {
            // Peer-to-peer copies have no abstract category.
            Record::Memcpy(r) if r.peer.is_some() => AbstractRecord::default(),
            Record::Memcpy(r) => AbstractRecord::spanning(AbstractType::MemcpyExplicit, r.start, r.end),
            Record::UnifiedMemoryCounter(r) => match r.transfer() {
                Some(t) => AbstractRecord::spanning(AbstractType::MemcpyImplicit, t.start, t.end),
                None => AbstractRecord::untimed(AbstractType::MemcpyImplicit),
            },
            Record::Kernel(r) => {
                AbstractRecord::spanning(AbstractType::KernelInvocation, r.start, r.end)
            }
            Record::SourceLocator(_) => AbstractRecord::untimed(AbstractType::KernelSourceLocator),
            Record::PcSampling(_) => AbstractRecord::untimed(AbstractType::KernelPcSample),
            Record::PcSamplingRecordInfo(_) => {
                AbstractRecord::untimed(AbstractType::KernelPcSamplingInfo)
            }
            Record::Function(_) => AbstractRecord::untimed(AbstractType::Function),
            Record::DriverApi(r) => AbstractRecord {
                hardware_id: Some(r.thread_id.into()),
                ..AbstractRecord::spanning(AbstractType::Driver, r.start, r.end)
            },
            Record::RuntimeApi(r) => AbstractRecord {
                hardware_id: Some(r.thread_id.into()),
                ..AbstractRecord::spanning(AbstractType::Runtime, r.start, r.end)
            },
            Record::Overhead(r) => {
                AbstractRecord::spanning(AbstractType::Overhead, r.start, r.end)
            }
            Record::Context(_)
            | Record::ExternalCorrelation(_)
            | Record::Other(_)
            | Record::Unknown(_) => AbstractRecord::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn kind_tags_roundtrip() {
        for kind in Kind::iter() {
            assert_eq!(Kind::from_repr(kind as u32), Some(kind));
        }
        assert_eq!(Kind::from_repr(45), None);
        assert_eq!(Kind::ExternalCorrelation as u32, 39);
        assert_eq!(Kind::Memcpy.name(), "Memcpy");
    }

    #[test]
    fn abstract_mapping() {
        let memcpy = Record::Memcpy(memcpy::Record {
            start: 10,
            end: 20,
            ..Default::default()
        });
        let abs = AbstractRecord::from(&memcpy);
        assert_eq!(abs.record_type.map(AbstractType::as_str), Some("MEMCPY EXPLICIT"));
        assert_eq!((abs.start_time, abs.end_time), (Some(10), Some(20)));
        assert_eq!(abs.hardware_id, None);

        let driver = Record::DriverApi(api::Record {
            start: 1,
            end: 2,
            thread_id: 77,
            ..Default::default()
        });
        let abs = AbstractRecord::from(&driver);
        assert_eq!(abs.record_type, Some(AbstractType::Driver));
        assert_eq!(abs.hardware_id, Some(77));

        let locator = Record::SourceLocator(sampling::SourceLocator::default());
        let abs = AbstractRecord::from(&locator);
        assert_eq!(abs.record_type, Some(AbstractType::KernelSourceLocator));
        assert_eq!(abs.start_time, None);

        assert_eq!(AbstractRecord::from(&Record::Unknown(999)), AbstractRecord::default());
        assert_eq!(
            AbstractRecord::from(&Record::Other(Kind::Nvlink)),
            AbstractRecord::default()
        );
    }

    #[test]
    fn decode_unknown_and_other() -> Result<(), TraceError> {
        let bytes = writer::RecordWriter::new(1234, 8).finish();
        let record = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(Record::decode(&record)?, Record::Unknown(1234));

        let bytes = Record::Other(Kind::Nvlink).to_bytes();
        let record = RecordRef::parse(&bytes, 0).unwrap();
        assert_eq!(Record::decode(&record)?, Record::Other(Kind::Nvlink));
        Ok(())
    }
}
