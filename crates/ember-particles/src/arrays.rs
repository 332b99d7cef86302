//! Columnar attribute storage backing one block
//!
//! Every attribute of a block lives in its own contiguous, 16-byte
//! aligned buffer of `capacity` elements. Typed access goes through
//! bytemuck casts; float3 buffers can additionally be flattened to
//! `[f32]` for the vectorized add path.

use bytemuck::{Pod, Zeroable};
use ember_core::Vec3;
use ember_schema::AttributesInfo;
use std::sync::Arc;

/// 16-byte building unit of attribute buffers.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Chunk([u8; 16]);

// Safety: Chunk is a plain array of bytes with no padding (size 16,
// align 16), so every bit pattern is valid.
unsafe impl Zeroable for Chunk {}
unsafe impl Pod for Chunk {}

/// A heap buffer whose start is guaranteed to be 16-byte aligned.
///
/// `len` is in bytes and need not be a multiple of 16; the backing
/// allocation is rounded up.
pub struct AlignedBuffer {
    chunks: Vec<Chunk>,
    len: usize,
}

impl AlignedBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            chunks: vec![Chunk([0; 16]); len.div_ceil(16)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.chunks)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.chunks)[..self.len]
    }

    /// View the buffer as a slice of `T`. The byte length must be an
    /// exact multiple of `size_of::<T>()`.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    pub fn as_slice_mut<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }
}

/// The attribute store of one block: one aligned buffer per attribute,
/// each holding `capacity` elements.
pub struct AttributeArraysCore {
    info: Arc<AttributesInfo>,
    capacity: usize,
    byte_buffers: Vec<AlignedBuffer>,
    float_buffers: Vec<AlignedBuffer>,
    float3_buffers: Vec<AlignedBuffer>,
}

impl AttributeArraysCore {
    pub fn zeroed(info: Arc<AttributesInfo>, capacity: usize) -> Self {
        let byte_buffers = info
            .byte_names()
            .iter()
            .map(|_| AlignedBuffer::zeroed(capacity))
            .collect();
        let float_buffers = info
            .float_names()
            .iter()
            .map(|_| AlignedBuffer::zeroed(capacity * 4))
            .collect();
        let float3_buffers = info
            .float3_names()
            .iter()
            .map(|_| AlignedBuffer::zeroed(capacity * 12))
            .collect();
        Self {
            info,
            capacity,
            byte_buffers,
            float_buffers,
            float3_buffers,
        }
    }

    /// Assemble a core from pre-allocated buffers (one per attribute, in
    /// info order). Used by the scratch allocator to build temporary
    /// offset stores from pooled memory.
    pub fn from_buffers(
        info: Arc<AttributesInfo>,
        capacity: usize,
        byte_buffers: Vec<AlignedBuffer>,
        float_buffers: Vec<AlignedBuffer>,
        float3_buffers: Vec<AlignedBuffer>,
    ) -> Self {
        assert_eq!(byte_buffers.len(), info.byte_names().len());
        assert_eq!(float_buffers.len(), info.float_names().len());
        assert_eq!(float3_buffers.len(), info.float3_names().len());
        for buffer in &byte_buffers {
            assert!(buffer.len() >= capacity);
        }
        for buffer in &float_buffers {
            assert!(buffer.len() >= capacity * 4);
        }
        for buffer in &float3_buffers {
            assert!(buffer.len() >= capacity * 12);
        }
        Self {
            info,
            capacity,
            byte_buffers,
            float_buffers,
            float3_buffers,
        }
    }

    /// Take the buffers back out, e.g. to return them to a scratch pool.
    pub fn into_buffers(self) -> (Vec<AlignedBuffer>, Vec<AlignedBuffer>, Vec<AlignedBuffer>) {
        (self.byte_buffers, self.float_buffers, self.float3_buffers)
    }

    pub fn info(&self) -> &Arc<AttributesInfo> {
        &self.info
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte(&self, index: usize) -> &[u8] {
        &self.byte_buffers[index].as_bytes()[..self.capacity]
    }

    pub fn byte_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.byte_buffers[index].as_bytes_mut()[..self.capacity]
    }

    pub fn float(&self, index: usize) -> &[f32] {
        &self.float_buffers[index].as_slice()[..self.capacity]
    }

    pub fn float_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.float_buffers[index].as_slice_mut()[..self.capacity]
    }

    pub fn float3(&self, index: usize) -> &[Vec3] {
        &self.float3_buffers[index].as_slice()[..self.capacity]
    }

    pub fn float3_mut(&mut self, index: usize) -> &mut [Vec3] {
        &mut self.float3_buffers[index].as_slice_mut()[..self.capacity]
    }

    /// Zero the rows `[start, start + amount)` of every attribute.
    pub fn zero_rows(&mut self, start: usize, amount: usize) {
        assert!(start + amount <= self.capacity);
        for buffer in &mut self.byte_buffers {
            buffer.as_bytes_mut()[start..start + amount].fill(0);
        }
        for buffer in &mut self.float_buffers {
            buffer.as_bytes_mut()[start * 4..(start + amount) * 4].fill(0);
        }
        for buffer in &mut self.float3_buffers {
            buffer.as_bytes_mut()[start * 12..(start + amount) * 12].fill(0);
        }
    }

    /// Copy `amount` rows of every attribute from `src` starting at
    /// `src_start` into this core starting at `dst_start`. Both cores
    /// must have the same descriptor set.
    pub fn copy_rows_from(
        &mut self,
        src: &AttributeArraysCore,
        src_start: usize,
        dst_start: usize,
        amount: usize,
    ) {
        assert_eq!(*self.info, *src.info);
        assert!(src_start + amount <= src.capacity);
        assert!(dst_start + amount <= self.capacity);

        for (dst, src) in self.byte_buffers.iter_mut().zip(&src.byte_buffers) {
            dst.as_bytes_mut()[dst_start..dst_start + amount]
                .copy_from_slice(&src.as_bytes()[src_start..src_start + amount]);
        }
        for (dst, src) in self.float_buffers.iter_mut().zip(&src.float_buffers) {
            dst.as_bytes_mut()[dst_start * 4..(dst_start + amount) * 4]
                .copy_from_slice(&src.as_bytes()[src_start * 4..(src_start + amount) * 4]);
        }
        for (dst, src) in self.float3_buffers.iter_mut().zip(&src.float3_buffers) {
            dst.as_bytes_mut()[dst_start * 12..(dst_start + amount) * 12]
                .copy_from_slice(&src.as_bytes()[src_start * 12..(src_start + amount) * 12]);
        }
    }

    /// Copy `amount` rows starting at `src_start` over the rows starting
    /// at `dst_start`, within the same core. Ranges may overlap.
    pub(crate) fn copy_rows_within(&mut self, src_start: usize, dst_start: usize, amount: usize) {
        for index in 0..self.info.byte_names().len() {
            self.byte_mut(index)
                .copy_within(src_start..src_start + amount, dst_start);
        }
        for index in 0..self.info.float_names().len() {
            self.float_mut(index)
                .copy_within(src_start..src_start + amount, dst_start);
        }
        for index in 0..self.info.float3_names().len() {
            self.float3_mut(index)
                .copy_within(src_start..src_start + amount, dst_start);
        }
    }

    pub fn slice_all(&mut self) -> AttributeArrays<'_> {
        let capacity = self.capacity;
        self.slice(0, capacity)
    }

    pub fn slice(&mut self, start: usize, len: usize) -> AttributeArrays<'_> {
        assert!(start + len <= self.capacity);
        AttributeArrays {
            core: self,
            start,
            len,
        }
    }
}

/// A view over rows `[start, start + len)` of every attribute in a core.
///
/// Accessors by name panic on unknown names: attribute sets are resolved
/// before simulation starts, so a miss on the hot path is a programmer
/// error.
pub struct AttributeArrays<'a> {
    core: &'a mut AttributeArraysCore,
    start: usize,
    len: usize,
}

impl<'a> AttributeArrays<'a> {
    pub fn info(&self) -> &AttributesInfo {
        self.core.info()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow the view to `[start, start + len)` relative to this view.
    pub fn slice(self, start: usize, len: usize) -> AttributeArrays<'a> {
        assert!(start + len <= self.len);
        AttributeArrays {
            start: self.start + start,
            len,
            core: self.core,
        }
    }

    pub fn byte(&self, index: usize) -> &[u8] {
        &self.core.byte(index)[self.start..self.start + self.len]
    }

    pub fn byte_mut(&mut self, index: usize) -> &mut [u8] {
        let (start, len) = (self.start, self.len);
        &mut self.core.byte_mut(index)[start..start + len]
    }

    pub fn float(&self, index: usize) -> &[f32] {
        &self.core.float(index)[self.start..self.start + self.len]
    }

    pub fn float_mut(&mut self, index: usize) -> &mut [f32] {
        let (start, len) = (self.start, self.len);
        &mut self.core.float_mut(index)[start..start + len]
    }

    pub fn float3(&self, index: usize) -> &[Vec3] {
        &self.core.float3(index)[self.start..self.start + self.len]
    }

    pub fn float3_mut(&mut self, index: usize) -> &mut [Vec3] {
        let (start, len) = (self.start, self.len);
        &mut self.core.float3_mut(index)[start..start + len]
    }

    pub fn byte_by_name(&self, name: &str) -> &[u8] {
        self.byte(self.byte_index(name))
    }

    pub fn byte_by_name_mut(&mut self, name: &str) -> &mut [u8] {
        let index = self.byte_index(name);
        self.byte_mut(index)
    }

    pub fn float_by_name(&self, name: &str) -> &[f32] {
        self.float(self.float_index(name))
    }

    pub fn float_by_name_mut(&mut self, name: &str) -> &mut [f32] {
        let index = self.float_index(name);
        self.float_mut(index)
    }

    pub fn float3_by_name(&self, name: &str) -> &[Vec3] {
        self.float3(self.float3_index(name))
    }

    pub fn float3_by_name_mut(&mut self, name: &str) -> &mut [Vec3] {
        let index = self.float3_index(name);
        self.float3_mut(index)
    }

    fn byte_index(&self, name: &str) -> usize {
        self.info()
            .byte_index(name)
            .unwrap_or_else(|| panic!("unknown byte attribute '{name}'"))
    }

    fn float_index(&self, name: &str) -> usize {
        self.info()
            .float_index(name)
            .unwrap_or_else(|| panic!("unknown float attribute '{name}'"))
    }

    fn float3_index(&self, name: &str) -> usize {
        self.info()
            .float3_index(name)
            .unwrap_or_else(|| panic!("unknown float3 attribute '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> Arc<AttributesInfo> {
        Arc::new(
            AttributesInfo::new(
                vec!["Kill State".into()],
                vec!["Birth Time".into()],
                vec!["Position".into()],
            )
            .unwrap(),
        )
    }

    #[test]
    fn buffers_are_16_byte_aligned() {
        let buffer = AlignedBuffer::zeroed(100 * 12);
        assert_eq!(buffer.as_bytes().as_ptr() as usize % 16, 0);
        assert_eq!(buffer.as_slice::<Vec3>().len(), 100);
    }

    #[test]
    fn typed_access_and_slicing() {
        let mut core = AttributeArraysCore::zeroed(test_info(), 10);
        core.float3_mut(0)[3] = Vec3::new(1.0, 2.0, 3.0);

        let mut view = core.slice(2, 4);
        assert_eq!(view.len(), 4);
        assert_eq!(view.float3_by_name("Position")[1], Vec3::new(1.0, 2.0, 3.0));
        view.float_by_name_mut("Birth Time")[0] = 7.0;

        assert_eq!(core.float(0)[2], 7.0);
    }

    #[test]
    fn copy_and_zero_rows() {
        let info = test_info();
        let mut a = AttributeArraysCore::zeroed(info.clone(), 8);
        let mut b = AttributeArraysCore::zeroed(info, 8);
        for i in 0..8 {
            a.float_mut(0)[i] = i as f32;
            a.byte_mut(0)[i] = i as u8;
        }

        b.copy_rows_from(&a, 4, 0, 4);
        assert_eq!(b.float(0)[..4], [4.0, 5.0, 6.0, 7.0]);
        assert_eq!(b.byte(0)[..4], [4, 5, 6, 7]);

        b.zero_rows(0, 2);
        assert_eq!(b.float(0)[..4], [0.0, 0.0, 6.0, 7.0]);
    }

    #[test]
    #[should_panic(expected = "unknown float3 attribute")]
    fn unknown_attribute_name_panics() {
        let mut core = AttributeArraysCore::zeroed(test_info(), 4);
        let view = core.slice_all();
        let _ = view.float3_by_name("Velocity");
    }
}
