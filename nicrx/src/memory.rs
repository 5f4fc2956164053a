//! Host memory the receive side writes into or reads from.

/// A host buffer registered for RDMA access under a region number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Opaque host handle returned in completions
    pub cookie: u64,
    bytes: Vec<u8>,
}

impl MemoryRegion {
    /// Register `len` zeroed bytes.
    pub fn zeroed(cookie: u64, len: usize) -> Self {
        Self {
            cookie,
            bytes: vec![0; len],
        }
    }

    /// Register an existing buffer.
    pub fn from_bytes(cookie: u64, bytes: Vec<u8>) -> Self {
        Self { cookie, bytes }
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the region holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Region contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy `data` to `offset`. Returns `false` when it does not fit.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        write_at(&mut self.bytes, offset, data)
    }

    /// Borrow `len` bytes at `offset`.
    pub(crate) fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        read_at(&self.bytes, offset, len)
    }
}

/// A host buffer waiting for the response of a get it issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaOrigin {
    /// Opaque host handle returned in the completion
    pub cookie: u64,
    /// Bytes the host is ready to accept
    pub capacity: usize,
}

impl RdmaOrigin {
    /// Create an origin entry.
    pub fn new(cookie: u64, capacity: usize) -> Self {
        Self { cookie, capacity }
    }
}

/// Per-process heap targeted by shared-memory operations.
///
/// Atomics operate on 64-bit little-endian words.
#[derive(Debug, Clone)]
pub struct SharedHeap {
    bytes: Vec<u8>,
}

impl SharedHeap {
    /// Allocate a zeroed heap of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    /// Heap size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the heap has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow `len` bytes at `addr`.
    pub fn read(&self, addr: usize, len: usize) -> Option<&[u8]> {
        read_at(&self.bytes, addr, len)
    }

    /// Copy `data` to `addr`. Returns `false` when it does not fit.
    pub fn write(&mut self, addr: usize, data: &[u8]) -> bool {
        write_at(&mut self.bytes, addr, data)
    }

    /// Read the word at `addr`.
    pub fn load_u64(&self, addr: usize) -> Option<u64> {
        let bytes = self.read(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }

    /// Overwrite the word at `addr`.
    pub fn store_u64(&mut self, addr: usize, value: u64) -> bool {
        self.write(addr, &value.to_le_bytes())
    }
}

fn read_at(bytes: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    bytes.get(offset..end)
}

fn write_at(bytes: &mut [u8], offset: usize, data: &[u8]) -> bool {
    let Some(end) = offset.checked_add(data.len()) else {
        return false;
    };
    match bytes.get_mut(offset..end) {
        Some(target) => {
            target.copy_from_slice(data);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_words_are_little_endian() {
        let mut heap = SharedHeap::new(16);
        assert!(heap.store_u64(8, 0x0102_0304_0506_0708));

        assert_eq!(heap.load_u64(8), Some(0x0102_0304_0506_0708));
        assert_eq!(heap.read(8, 1), Some(&[0x08][..]));
    }

    #[test]
    fn out_of_range_access_is_refused() {
        let mut heap = SharedHeap::new(16);

        assert!(!heap.store_u64(12, 1));
        assert_eq!(heap.load_u64(9), None);
        assert!(!heap.write(usize::MAX, &[1]));
        assert_eq!(heap.read(usize::MAX, 2), None);
    }

    #[test]
    fn region_writes_stay_inside_bounds() {
        let mut region = MemoryRegion::zeroed(7, 4);

        assert!(region.write(1, &[9, 9]));
        assert!(!region.write(3, &[1, 1]));
        assert_eq!(region.bytes(), &[0, 9, 9, 0]);
        assert_eq!(region.read(1, 3), Some(&[9, 9, 0][..]));
    }
}
