//! Walking the record stream inside a buffer.
//!
//! A position in a buffer is a [`Cursor`]. The first record sits at offset 0 and each
//! following one at the previous offset plus the previous record's length. The stream
//! ends cleanly when the next offset lands exactly on the valid size or leaves a tail
//! too short to hold a header. A header that claims a bad length, or a record that
//! would run past the valid size, ends the stream with [`TraceError::CorruptRecord`].
use crate::error::TraceError;

use super::Kind;

/// Size of the record header: kind tag and total length.
pub const HEADER_SIZE: usize = 8;
/// Records are padded so every header starts at a multiple of this.
pub const RECORD_ALIGN: usize = 8;

/// Byte offset of a record within a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(usize);

impl Cursor {
    pub fn offset(self) -> usize {
        self.0
    }
}

/// Classification of the record under a cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// A record of a kind this crate knows.
    Native(Kind),
    /// A well-formed record with a kind tag this crate does not know.
    Unknown(u32),
    /// The cursor does not address a valid record.
    Invalid,
}

/// Borrowed view of one record, header included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordRef<'a> {
    offset: usize,
    bytes: &'a [u8],
}

pub(crate) enum Step<'a> {
    Record(RecordRef<'a>),
    End,
    Corrupt(usize),
}

pub(crate) fn step(data: &[u8], offset: usize) -> Step<'_> {
    let Some(header) = offset
        .checked_add(HEADER_SIZE)
        .and_then(|end| data.get(offset..end))
    else {
        return Step::End;
    };
    let len = le_u32(&header[4..8]) as usize;
    if len < HEADER_SIZE || len % RECORD_ALIGN != 0 {
        return Step::Corrupt(offset);
    }
    match data.get(offset..offset + len) {
        Some(bytes) => Step::Record(RecordRef { offset, bytes }),
        None => Step::Corrupt(offset),
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn valid_region(buffer: &[u8], valid_size: usize) -> &[u8] {
    &buffer[..valid_size.min(buffer.len())]
}

impl<'a> RecordRef<'a> {
    /// Parse the record at `offset` of `data`, if one is there.
    pub fn parse(data: &'a [u8], offset: usize) -> Option<Self> {
        match step(data, offset) {
            Step::Record(record) => Some(record),
            Step::End | Step::Corrupt(_) => None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn cursor(&self) -> Cursor {
        Cursor(self.offset)
    }

    pub fn kind_tag(&self) -> u32 {
        le_u32(&self.bytes[0..4])
    }

    /// The kind of this record, or `None` for unknown kind tags.
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_repr(self.kind_tag())
    }

    pub fn record_type(&self) -> RecordType {
        match self.kind() {
            Some(kind) => RecordType::Native(kind),
            None => RecordType::Unknown(self.kind_tag()),
        }
    }

    /// Total length in bytes, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the record carries anything past its header.
    pub fn has_payload(&self) -> bool {
        self.bytes.len() > HEADER_SIZE
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Offset just past the end of this record.
    pub fn end(&self) -> usize {
        self.offset + self.bytes.len()
    }

    /// Fail unless this record has room for a `required` byte layout.
    pub(crate) fn require(&self, required: usize) -> Result<(), TraceError> {
        if self.bytes.len() < required {
            Err(TraceError::Truncated {
                kind: self.kind().map_or("unknown", Kind::name),
                len: self.bytes.len(),
                required,
            })
        } else {
            Ok(())
        }
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut raw = [0u8; N];
        if let Some(src) = self.bytes.get(offset..offset + N) {
            raw.copy_from_slice(src);
        }
        raw
    }

    // Field readers assume `require` was checked; out of range fields read as zero.
    pub(crate) fn u8_at(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or_default()
    }

    pub(crate) fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.array(offset))
    }

    pub(crate) fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    pub(crate) fn i32_at(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.array(offset))
    }

    pub(crate) fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }
}

/// Return the cursor of the record after `current`, or of the first record when
/// `current` is `None`.
///
/// Returns `None` at the end of the stream, when `current` does not address a valid
/// record, or when the next header is malformed. This function never panics and never
/// reads outside `buffer[..valid_size]`.
pub fn advance_cursor(buffer: &[u8], valid_size: usize, current: Option<Cursor>) -> Option<Cursor> {
    let data = valid_region(buffer, valid_size);
    let next = match current {
        None => 0,
        Some(Cursor(offset)) => RecordRef::parse(data, offset)?.end(),
    };
    RecordRef::parse(data, next).map(|r| r.cursor())
}

/// Whether advancing from `current` would yield another record.
pub fn is_valid(buffer: &[u8], valid_size: usize, current: Option<Cursor>) -> bool {
    advance_cursor(buffer, valid_size, current).is_some()
}

/// Classify the record under `cursor`.
pub fn record_kind(buffer: &[u8], valid_size: usize, cursor: Cursor) -> RecordType {
    RecordRef::parse(valid_region(buffer, valid_size), cursor.0)
        .map_or(RecordType::Invalid, |r| r.record_type())
}

/// The record under `cursor`, if it addresses a valid one.
pub fn record_at(buffer: &[u8], valid_size: usize, cursor: Cursor) -> Option<RecordRef<'_>> {
    RecordRef::parse(valid_region(buffer, valid_size), cursor.0)
}

/// Iterator over the records in a byte region.
///
/// After the iterator is exhausted, [`Records::error`] tells whether the stream ended
/// cleanly or on a malformed header.
#[derive(Clone, Debug)]
pub struct Records<'a> {
    data: &'a [u8],
    next: usize,
    done: bool,
    error: Option<TraceError>,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: 0,
            done: false,
            error: None,
        }
    }

    /// The terminal error of the stream, if it ended on a corrupt record.
    pub fn error(&self) -> Option<&TraceError> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<TraceError> {
        self.error
    }

    /// Offset just past the last record yielded so far.
    pub fn position(&self) -> usize {
        self.next
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = RecordRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match step(self.data, self.next) {
            Step::Record(record) => {
                self.next = record.end();
                Some(record)
            }
            Step::End => {
                self.done = true;
                None
            }
            Step::Corrupt(offset) => {
                self.done = true;
                self.error = Some(TraceError::CorruptRecord { offset });
                None
            }
        }
    }
}

/// Reads records the way the native record accessor does: the host operation id of a
/// record is the id of the most recent context boundary seen before it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeReader {
    host_op_id: u64,
}

impl NativeReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The record under `cursor` together with its host operation id.
    pub fn read<'a>(
        &mut self,
        buffer: &'a [u8],
        valid_size: usize,
        cursor: Cursor,
    ) -> Option<(RecordRef<'a>, u64)> {
        let record = record_at(buffer, valid_size, cursor)?;
        if record.kind() == Some(Kind::Context) {
            self.host_op_id = record.u32_at(super::context::CONTEXT_ID).into();
        }
        Some((record, self.host_op_id))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::activity::writer::RecordWriter;

    fn stream(records: &[Vec<u8>]) -> Vec<u8> {
        records.concat()
    }

    #[test]
    fn walks_every_record() {
        let buf = stream(&[
            RecordWriter::new(Kind::Kernel as u32, 64).finish(),
            RecordWriter::new(Kind::Memcpy as u32, 56).finish(),
            RecordWriter::new(Kind::Context as u32, 24).finish(),
        ]);

        let first = advance_cursor(&buf, buf.len(), None).unwrap();
        assert_eq!(first.offset(), 0);
        assert_eq!(record_kind(&buf, buf.len(), first), RecordType::Native(Kind::Kernel));

        let second = advance_cursor(&buf, buf.len(), Some(first)).unwrap();
        assert_eq!(second.offset(), 64);
        let third = advance_cursor(&buf, buf.len(), Some(second)).unwrap();
        assert_eq!(record_kind(&buf, buf.len(), third), RecordType::Native(Kind::Context));

        assert!(!is_valid(&buf, buf.len(), Some(third)));
        assert_eq!(advance_cursor(&buf, buf.len(), Some(third)), None);
        assert_eq!(Records::new(&buf).count(), 3);
    }

    #[test]
    fn empty_buffer_has_no_records() {
        assert_eq!(advance_cursor(&[], 0, None), None);
        let buf = [0u8; 64];
        assert_eq!(advance_cursor(&buf, 0, None), None);
    }

    #[test]
    fn short_tail_ends_cleanly() {
        let mut buf = RecordWriter::new(Kind::Context as u32, 24).finish();
        buf.extend_from_slice(&[0xff; 4]);

        let mut records = Records::new(&buf);
        assert_eq!(records.by_ref().count(), 1);
        assert_eq!(records.error(), None);
    }

    #[test]
    fn record_past_valid_size_is_corrupt() {
        let buf = stream(&[
            RecordWriter::new(Kind::Context as u32, 24).finish(),
            RecordWriter::new(Kind::Kernel as u32, 64).finish(),
        ]);
        let valid = 24 + 40;

        let first = advance_cursor(&buf, valid, None).unwrap();
        assert_eq!(advance_cursor(&buf, valid, Some(first)), None);

        let mut records = Records::new(&buf[..valid]);
        assert_eq!(records.by_ref().count(), 1);
        assert_eq!(records.into_error(), Some(TraceError::CorruptRecord { offset: 24 }));
    }

    #[test]
    fn bad_lengths_are_corrupt() {
        let mut zero_len = vec![0u8; 16];
        zero_len[0..4].copy_from_slice(&(Kind::Kernel as u32).to_le_bytes());
        let mut records = Records::new(&zero_len);
        assert_eq!(records.next(), None);
        assert!(records.error().is_some());

        let mut unaligned = vec![0u8; 16];
        unaligned[4..8].copy_from_slice(&12u32.to_le_bytes());
        assert_eq!(advance_cursor(&unaligned, 16, None), None);
        assert_eq!(record_kind(&unaligned, 16, Cursor(0)), RecordType::Invalid);
    }

    #[test]
    fn unknown_kinds_are_walkable() {
        let buf = RecordWriter::new(4242, 16).finish();
        let cursor = advance_cursor(&buf, buf.len(), None).unwrap();
        assert_eq!(record_kind(&buf, buf.len(), cursor), RecordType::Unknown(4242));
    }

    #[test]
    fn cursor_not_on_a_record() {
        let buf = RecordWriter::new(Kind::Context as u32, 24).finish();
        assert_eq!(advance_cursor(&buf, buf.len(), Some(Cursor(3))), None);
        assert_eq!(record_kind(&buf, buf.len(), Cursor(1000)), RecordType::Invalid);
    }

    #[test]
    fn native_reader_tracks_context_boundaries() {
        let buf = stream(&[
            RecordWriter::new(Kind::Kernel as u32, 64).finish(),
            crate::activity::context::Record {
                context_id: 7,
                device_id: 1,
                ..Default::default()
            }
            .to_bytes(),
            RecordWriter::new(Kind::Kernel as u32, 64).finish(),
        ]);
        let mut reader = NativeReader::new();
        let ids: Vec<u64> = Records::new(&buf)
            .map(|r| reader.read(&buf, buf.len(), r.cursor()).unwrap().1)
            .collect();
        assert_eq!(ids, vec![0, 7, 7]);
    }

    #[test]
    fn header_only_record_has_no_payload() {
        let buf = stream(&[
            RecordWriter::new(4242, 8).finish(),
            RecordWriter::new(Kind::Context as u32, 24).finish(),
        ]);
        let records: Vec<_> = Records::new(&buf).collect();
        assert_eq!(records[0].len(), HEADER_SIZE);
        assert!(!records[0].has_payload());
        assert!(records[1].has_payload());
    }

    proptest! {
        #[test]
        fn well_formed_stream_yields_each_record_once(
            records in proptest::collection::vec((any::<u32>(), 0usize..128), 0..32)
        ) {
            let buf = stream(
                &records
                    .iter()
                    .map(|(tag, len)| RecordWriter::new(*tag, *len).finish())
                    .collect::<Vec<_>>(),
            );
            let mut cursor = None;
            let mut tags = Vec::new();
            while let Some(next) = advance_cursor(&buf, buf.len(), cursor) {
                tags.push(record_at(&buf, buf.len(), next).map(|r| r.kind_tag()));
                cursor = Some(next);
            }
            let expected: Vec<_> = records.iter().map(|(tag, _)| Some(*tag)).collect();
            prop_assert_eq!(tags, expected);
            prop_assert_eq!(advance_cursor(&buf, buf.len(), cursor), None);
            prop_assert_eq!(advance_cursor(&buf, buf.len(), cursor), None);
            prop_assert!(!is_valid(&buf, buf.len(), cursor));
        }

        #[test]
        fn cursor_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..256), valid in 0usize..300) {
            let mut cursor = None;
            let mut steps = 0;
            while let Some(next) = advance_cursor(&bytes, valid, cursor) {
                prop_assert!(next.offset() + HEADER_SIZE <= valid.min(bytes.len()));
                let _ = record_kind(&bytes, valid, next);
                prop_assert!(cursor.is_none_or(|c: Cursor| next.offset() > c.offset()));
                cursor = Some(next);
                steps += 1;
            }
            prop_assert!(steps <= bytes.len() / HEADER_SIZE);
        }
    }
}
