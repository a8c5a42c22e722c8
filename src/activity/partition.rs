//! Splitting a completed buffer at context boundaries so each device sees only its own
//! records.
use std::ops::Range;

use super::{Kind, Records, context};
use crate::error::TraceError;

/// A run of records produced on one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSpan {
    /// Relative device id taken from the context record that opened the span, or 0 for
    /// records before the first context record.
    pub device_id: super::DeviceId,
    pub context_id: super::ContextId,
    /// Byte range of the span within the buffer.
    pub range: Range<usize>,
}

/// Split `bytes` into non-empty spans, each starting at a context record (except
/// possibly the first) and ending before the next one.
///
/// The second value is the terminal error of the stream, if it ended on a corrupt
/// record. Spans cover the records before the corruption.
pub fn context_spans(bytes: &[u8]) -> (Vec<ContextSpan>, Option<TraceError>) {
    let mut spans = Vec::new();
    let mut current = ContextSpan {
        device_id: 0,
        context_id: 0,
        range: 0..0,
    };
    let mut records = Records::new(bytes);
    for record in records.by_ref() {
        if record.kind() == Some(Kind::Context) {
            current.range.end = record.offset();
            let next = ContextSpan {
                device_id: record.u32_at(context::DEVICE_ID),
                context_id: record.u32_at(context::CONTEXT_ID),
                range: record.offset()..record.offset(),
            };
            let done = std::mem::replace(&mut current, next);
            if !done.range.is_empty() {
                spans.push(done);
            }
        }
    }
    current.range.end = records.position();
    if !current.range.is_empty() {
        spans.push(current);
    }
    (spans, records.into_error())
}

/// The records of one device, borrowed from a buffer the caller keeps owning.
#[derive(Clone, Copy, Debug)]
pub struct DeviceRecords<'a> {
    /// Global id of the device.
    pub device_id: i32,
    pub context_id: super::ContextId,
    bytes: &'a [u8],
}

impl<'a> DeviceRecords<'a> {
    pub fn new(device_id: i32, context_id: super::ContextId, bytes: &'a [u8]) -> Self {
        Self {
            device_id,
            context_id,
            bytes,
        }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn valid_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn records(&self) -> Records<'a> {
        Records::new(self.bytes)
    }
}
