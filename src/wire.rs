//! Fixed, little-endian wire records for collective headers.
//!
//! Element payloads travel as plain [`bytemuck::Pod`] casts; the records
//! here carry the defensive metadata (extent ranges, element counts) the
//! assembly paths verify against the declared decomposition.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// All multi-byte integers in these structs are **little-endian** on the
/// wire: stored pre-LE with `.to_le()` and decoded with `.from_le()`.

/// One half-open axis range `[start, stop)` of a contributed extent.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRange {
    pub start_le: u64,
    pub stop_le: u64,
}

impl WireRange {
    pub fn new(start: usize, stop: usize) -> Self {
        Self {
            start_le: (start as u64).to_le(),
            stop_le: (stop as u64).to_le(),
        }
    }
    pub fn start(&self) -> usize {
        u64::from_le(self.start_le) as usize
    }
    pub fn stop(&self) -> usize {
        u64::from_le(self.stop_le) as usize
    }
}

/// Count of following elements.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

// Compile-time layout checks; Pod/Zeroable ensure no uninit padding when
// cast to bytes.
const _: () = {
    assert!(size_of::<WireRange>() == 16);
    assert!(size_of::<WireCount>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(WireCount, u64);

    #[test]
    fn roundtrip_range() {
        let v = vec![WireRange::new(3, 9), WireRange::new(0, 7)];
        let bytes: Vec<u8> = cast_slice(&v).to_vec();
        let mut out = vec![WireRange::zeroed(); v.len()];
        cast_slice_mut(&mut out).copy_from_slice(&bytes);
        assert_eq!(out[0].start(), 3);
        assert_eq!(out[0].stop(), 9);
        assert_eq!(out[1].stop(), 7);
    }

    #[test]
    fn roundtrip_count() {
        let c = WireCount::new(4096);
        let bytes: Vec<u8> = cast_slice(std::slice::from_ref(&c)).to_vec();
        let mut out = WireCount::zeroed();
        cast_slice_mut(std::slice::from_mut(&mut out)).copy_from_slice(&bytes);
        assert_eq!(out.get(), 4096);
    }
}
