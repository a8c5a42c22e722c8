//! Encoding records into the binary stream format, for producers and simulators.
use super::cursor::{HEADER_SIZE, RECORD_ALIGN};

/// Builds one record: a header followed by a zeroed payload that is filled field by
/// field. The length is rounded up to the record alignment.
#[derive(Clone, Debug)]
pub struct RecordWriter {
    bytes: Vec<u8>,
}

impl RecordWriter {
    /// A record with kind tag `kind` and a total length of at least `len` bytes.
    pub fn new(kind: u32, len: usize) -> Self {
        let len = len.max(HEADER_SIZE).next_multiple_of(RECORD_ALIGN);
        let mut bytes = vec![0u8; len];
        bytes[0..4].copy_from_slice(&kind.to_le_bytes());
        bytes[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        Self { bytes }
    }

    fn put(mut self, offset: usize, raw: &[u8]) -> Self {
        if let Some(dst) = self.bytes.get_mut(offset..offset + raw.len()) {
            dst.copy_from_slice(raw);
        }
        self
    }

    pub fn u8(self, offset: usize, value: u8) -> Self {
        self.put(offset, &[value])
    }

    pub fn u16(self, offset: usize, value: u16) -> Self {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn u32(self, offset: usize, value: u32) -> Self {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn i32(self, offset: usize, value: i32) -> Self {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn u64(self, offset: usize, value: u64) -> Self {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_alignment() {
        let bytes = RecordWriter::new(3, 13).u8(8, 0xaa).finish();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &16u32.to_le_bytes());
        assert_eq!(bytes[8], 0xaa);
    }

    #[test]
    fn out_of_range_fields_are_ignored() {
        let bytes = RecordWriter::new(1, 8).u64(8, 1).finish();
        assert_eq!(bytes.len(), 8);
    }
}
