//! Bounds-checked little-endian access to marker bytes.

/// Read-only cursor over a byte slice.
///
/// Every accessor returns `None` instead of panicking when the requested
/// range does not fit, so callers can turn short reads into corruption
/// errors.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    /// Wraps a byte slice.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of bytes under the cursor.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if there are no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns `len` bytes starting at `offset`.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        self.bytes.get(offset..end)
    }

    /// Reads a byte.
    #[must_use]
    pub fn u8_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(offset).copied()
    }

    /// Reads a little-endian `u32`.
    #[must_use]
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let raw = self.slice(offset, 4)?;
        Some(u32::from_le_bytes(raw.try_into().ok()?))
    }

    /// Reads a little-endian `u64`.
    #[must_use]
    pub fn u64_at(&self, offset: usize) -> Option<u64> {
        let raw = self.slice(offset, 8)?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }

    /// Returns true if every byte from `offset` to the end is zero.
    #[must_use]
    pub fn is_zero_from(&self, offset: usize) -> bool {
        self.bytes
            .get(offset..)
            .map_or(true, |rest| rest.iter().all(|b| *b == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        bytes[8..16].copy_from_slice(&42u64.to_le_bytes());

        let cursor = ByteCursor::new(&bytes);
        assert_eq!(cursor.u32_at(0), Some(0xDEAD_BEEF));
        assert_eq!(cursor.u64_at(8), Some(42));
        assert_eq!(cursor.u8_at(4), Some(0));
    }

    #[test]
    fn out_of_range_reads_return_none() {
        let bytes = [1u8; 6];
        let cursor = ByteCursor::new(&bytes);
        assert_eq!(cursor.u32_at(4), None);
        assert_eq!(cursor.u64_at(0), None);
        assert_eq!(cursor.slice(usize::MAX, 2), None);
        assert_eq!(cursor.u8_at(6), None);
    }

    #[test]
    fn zero_tail_detection() {
        let bytes = [7u8, 0, 0, 0];
        let cursor = ByteCursor::new(&bytes);
        assert!(!cursor.is_zero_from(0));
        assert!(cursor.is_zero_from(1));
        assert!(cursor.is_zero_from(10));
    }
}
