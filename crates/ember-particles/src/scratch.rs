//! Per-worker scratch memory
//!
//! The event loop does no per-particle heap allocation: all of its
//! bookkeeping (index lists, time factors, event storage, the temporary
//! offsets store) draws block-sized buffers from a per-worker pool and
//! returns them on scope exit. Buffers are pooled by element size;
//! reacquired buffers have unspecified contents.

use crate::arrays::{AlignedBuffer, AttributeArraysCore};
use bytemuck::Pod;
use ember_schema::AttributesInfo;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A pool of `array_length`-element buffers for one worker.
///
/// Not `Sync`: every worker owns its own allocator.
pub struct ArrayAllocator {
    array_length: usize,
    pools: RefCell<HashMap<usize, Vec<AlignedBuffer>>>,
}

impl ArrayAllocator {
    pub fn new(array_length: usize) -> Self {
        assert!(array_length > 0);
        Self {
            array_length,
            pools: RefCell::new(HashMap::new()),
        }
    }

    /// Number of elements every allocated array holds.
    pub fn array_length(&self) -> usize {
        self.array_length
    }

    fn take(&self, element_size: usize) -> AlignedBuffer {
        let mut pools = self.pools.borrow_mut();
        match pools.get_mut(&element_size).and_then(Vec::pop) {
            Some(buffer) => buffer,
            None => AlignedBuffer::zeroed(self.array_length * element_size),
        }
    }

    fn give_back(&self, element_size: usize, buffer: AlignedBuffer) {
        self.pools
            .borrow_mut()
            .entry(element_size)
            .or_default()
            .push(buffer);
    }

    /// A raw buffer of `array_length * element_size` bytes.
    pub fn allocate_bytes(&self, element_size: usize) -> ScratchBuffer<'_> {
        ScratchBuffer {
            allocator: self,
            element_size,
            buffer: Some(self.take(element_size)),
        }
    }

    /// A typed scratch array of `array_length` elements.
    pub fn allocate_slice<T: Pod>(&self) -> ScratchSlice<'_, T> {
        ScratchSlice {
            inner: self.allocate_bytes(std::mem::size_of::<T>()),
            _marker: PhantomData,
        }
    }

    /// A fixed-capacity vector backed by a scratch array.
    pub fn allocate_vec<T: Pod>(&self) -> ScratchVec<'_, T> {
        ScratchVec {
            inner: self.allocate_slice(),
            len: 0,
        }
    }

    /// A temporary attribute store (used for per-step offsets) whose
    /// buffers come from this pool and go back on drop.
    pub fn allocate_attribute_arrays(&self, info: Arc<AttributesInfo>) -> ScratchAttributeArrays<'_> {
        let byte_buffers = (0..info.byte_names().len()).map(|_| self.take(1)).collect();
        let float_buffers = (0..info.float_names().len()).map(|_| self.take(4)).collect();
        let float3_buffers = (0..info.float3_names().len()).map(|_| self.take(12)).collect();
        ScratchAttributeArrays {
            allocator: self,
            core: Some(AttributeArraysCore::from_buffers(
                info,
                self.array_length,
                byte_buffers,
                float_buffers,
                float3_buffers,
            )),
        }
    }
}

/// Scoped handle on a raw pooled buffer.
pub struct ScratchBuffer<'a> {
    allocator: &'a ArrayAllocator,
    element_size: usize,
    buffer: Option<AlignedBuffer>,
}

impl ScratchBuffer<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_ref().unwrap().as_bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut().unwrap().as_bytes_mut()
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.give_back(self.element_size, buffer);
        }
    }
}

/// Scoped typed scratch array. Contents are unspecified on acquisition.
pub struct ScratchSlice<'a, T: Pod> {
    inner: ScratchBuffer<'a>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Deref for ScratchSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        bytemuck::cast_slice(self.inner.bytes())
    }
}

impl<T: Pod> DerefMut for ScratchSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.inner.bytes_mut())
    }
}

/// Fixed-capacity vector over a scratch array. Pushing past the array
/// length is a programmer error.
pub struct ScratchVec<'a, T: Pod> {
    inner: ScratchSlice<'a, T>,
    len: usize,
}

impl<T: Pod> ScratchVec<'_, T> {
    pub fn push(&mut self, value: T) {
        assert!(self.len < self.inner.inner.allocator.array_length);
        self.inner[self.len] = value;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<T: Pod> Deref for ScratchVec<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.inner[..self.len]
    }
}

/// Scoped attribute store backed by pooled buffers.
pub struct ScratchAttributeArrays<'a> {
    allocator: &'a ArrayAllocator,
    core: Option<AttributeArraysCore>,
}

impl ScratchAttributeArrays<'_> {
    pub fn core(&self) -> &AttributeArraysCore {
        self.core.as_ref().unwrap()
    }

    pub fn core_mut(&mut self) -> &mut AttributeArraysCore {
        self.core.as_mut().unwrap()
    }
}

impl Drop for ScratchAttributeArrays<'_> {
    fn drop(&mut self) {
        let (byte_buffers, float_buffers, float3_buffers) =
            self.core.take().unwrap().into_buffers();
        for buffer in byte_buffers {
            self.allocator.give_back(1, buffer);
        }
        for buffer in float_buffers {
            self.allocator.give_back(4, buffer);
        }
        for buffer in float3_buffers {
            self.allocator.give_back(12, buffer);
        }
    }
}
