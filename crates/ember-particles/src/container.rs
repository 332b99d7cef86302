//! Per-type block containers

use crate::arrays::AttributeArraysCore;
use crate::block::Block;
use ember_schema::AttributesInfo;
use std::sync::{Arc, Mutex};

/// Shared handle to a block. The mutex serializes block acquisition and
/// lets the step driver hand each block to exactly one worker; on the
/// per-particle path a block is locked once and worked to completion.
pub type BlockRef = Arc<Mutex<Block>>;

/// All blocks of one particle type, plus the type's descriptor set.
///
/// The block list is behind a mutex so particle allocators can acquire
/// fresh blocks while a parallel region runs. Descriptor updates and
/// compaction happen in the serial phases of the step driver.
pub struct Container {
    attributes: Arc<AttributesInfo>,
    block_capacity: usize,
    blocks: Mutex<Vec<BlockRef>>,
}

impl Container {
    pub fn new(attributes: AttributesInfo, block_capacity: usize) -> Self {
        assert!(block_capacity > 0);
        Self {
            attributes: Arc::new(attributes),
            block_capacity,
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn attributes_info(&self) -> Arc<AttributesInfo> {
        self.attributes.clone()
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    /// Allocate a new empty block with the container's descriptor set.
    pub fn new_block(&self) -> BlockRef {
        let block = Arc::new(Mutex::new(Block::new(
            self.attributes.clone(),
            self.block_capacity,
        )));
        self.blocks.lock().unwrap().push(block.clone());
        block
    }

    /// Remove an empty block from the container.
    ///
    /// Panics if the block is not empty or not owned by this container;
    /// both are programmer errors.
    pub fn release_block(&self, block: &BlockRef) {
        assert!(
            block.lock().unwrap().is_empty(),
            "released block still has active particles"
        );
        let mut blocks = self.blocks.lock().unwrap();
        let index = blocks
            .iter()
            .position(|b| Arc::ptr_eq(b, block))
            .expect("released block does not belong to this container");
        blocks.swap_remove(index);
    }

    /// Snapshot of the current block set.
    pub fn active_blocks(&self) -> Vec<BlockRef> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// Total live particles across all blocks.
    pub fn active_particles(&self) -> usize {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.lock().unwrap().active_amount())
            .sum()
    }

    /// Replace the descriptor set, re-laying every block's storage.
    ///
    /// Data for attributes present in both sets (matched by name and
    /// kind) is preserved; removed attributes are dropped and added ones
    /// zero-filled. A no-op when the set is unchanged.
    pub fn update_attributes(&mut self, new_info: AttributesInfo) {
        if *self.attributes == new_info {
            return;
        }
        let new_info = Arc::new(new_info);
        let blocks = self.blocks.lock().unwrap();
        for block_ref in blocks.iter() {
            let mut block = block_ref.lock().unwrap();
            let mut arrays = AttributeArraysCore::zeroed(new_info.clone(), self.block_capacity);
            copy_shared_attributes(block.arrays_core(), &mut arrays);
            block.replace_arrays(arrays);
        }
        drop(blocks);
        self.attributes = new_info;
    }
}

fn copy_shared_attributes(old: &AttributeArraysCore, new: &mut AttributeArraysCore) {
    let old_info = old.info().clone();
    let new_info = new.info().clone();

    for (new_index, name) in new_info.byte_names().iter().enumerate() {
        if let Some(old_index) = old_info.byte_index(name) {
            new.byte_mut(new_index).copy_from_slice(old.byte(old_index));
        }
    }
    for (new_index, name) in new_info.float_names().iter().enumerate() {
        if let Some(old_index) = old_info.float_index(name) {
            new.float_mut(new_index)
                .copy_from_slice(old.float(old_index));
        }
    }
    for (new_index, name) in new_info.float3_names().iter().enumerate() {
        if let Some(old_index) = old_info.float3_index(name) {
            new.float3_mut(new_index)
                .copy_from_slice(old.float3(old_index));
        }
    }
}
