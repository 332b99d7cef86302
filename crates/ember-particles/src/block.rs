//! Fixed-capacity particle blocks

use crate::arrays::{AttributeArrays, AttributeArraysCore};
use ember_schema::AttributesInfo;
use std::sync::Arc;

/// A fixed-capacity slab of particles for one type.
///
/// Rows `[0, active_amount)` are live particles; rows beyond hold
/// unspecified data and must not be read. A block's identity is its
/// allocation; containers hand out `BlockRef`s (`Arc<Mutex<Block>>`)
/// so allocators can acquire blocks while a parallel region is running.
pub struct Block {
    arrays: AttributeArraysCore,
    active: usize,
}

impl Block {
    pub(crate) fn new(info: Arc<AttributesInfo>, capacity: usize) -> Self {
        Self {
            arrays: AttributeArraysCore::zeroed(info, capacity),
            active: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.arrays.capacity()
    }

    pub fn active_amount(&self) -> usize {
        self.active
    }

    pub(crate) fn set_active_amount(&mut self, amount: usize) {
        assert!(amount <= self.capacity());
        self.active = amount;
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.active
    }

    pub fn is_full(&self) -> bool {
        self.active == self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn clear(&mut self) {
        self.active = 0;
    }

    pub fn info(&self) -> &Arc<AttributesInfo> {
        self.arrays.info()
    }

    pub fn arrays_core(&self) -> &AttributeArraysCore {
        &self.arrays
    }

    pub fn arrays_core_mut(&mut self) -> &mut AttributeArraysCore {
        &mut self.arrays
    }

    pub(crate) fn replace_arrays(&mut self, arrays: AttributeArraysCore) {
        assert_eq!(arrays.capacity(), self.capacity());
        self.arrays = arrays;
    }

    /// View of every row, including the undefined tail.
    pub fn attributes_all(&mut self) -> AttributeArrays<'_> {
        self.arrays.slice_all()
    }

    /// View of the active rows.
    pub fn attributes(&mut self) -> AttributeArrays<'_> {
        let active = self.active;
        self.arrays.slice(0, active)
    }

    pub fn slice(&mut self, start: usize, len: usize) -> AttributeArrays<'_> {
        self.arrays.slice(start, len)
    }

    /// Copy row `old` over row `new` across every attribute. Does not
    /// change the active amount.
    pub fn move_row(&mut self, old: usize, new: usize) {
        assert!(old < self.active && new < self.active);
        self.arrays.copy_rows_within(old, new, 1);
    }

    /// Transfer active rows from the tail of `from` into the inactive
    /// tail of `to` until `to` is full or `from` is empty. Both blocks
    /// must share the same descriptor set.
    pub fn move_until_full(from: &mut Block, to: &mut Block) {
        let amount = from.active.min(to.remaining_capacity());
        if amount == 0 {
            return;
        }
        let src_start = from.active - amount;
        let dst_start = to.active;
        to.arrays
            .copy_rows_from(&from.arrays, src_start, dst_start, amount);
        from.active -= amount;
        to.active += amount;
    }

    /// Compact a set of blocks so that at most one remains partially
    /// full. Sorts by active amount descending, then repeatedly pours
    /// the least-full block into the most-full one that still has room.
    pub fn compress(blocks: &mut [&mut Block]) {
        blocks.sort_by(|a, b| b.active_amount().cmp(&a.active_amount()));

        if blocks.is_empty() {
            return;
        }
        let mut fill = 0;
        let mut drain = blocks.len() - 1;
        while fill < drain {
            let (head, tail) = blocks.split_at_mut(drain);
            Block::move_until_full(&mut *tail[0], &mut *head[fill]);
            if tail[0].is_empty() {
                drain -= 1;
            }
            if fill < drain && head[fill].is_full() {
                fill += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Vec3;
    use ember_schema::AttributesInfo;

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

    fn block_with_rows(values: &[f32]) -> Block {
        let mut block = Block::new(test_info(), 4);
        block.set_active_amount(values.len());
        for (i, &v) in values.iter().enumerate() {
            block.attributes().float3_by_name_mut("Position")[i] = Vec3::new(v, 0.0, 0.0);
            block.attributes().float_by_name_mut("Birth Time")[i] = v;
        }
        block
    }

    fn positions(block: &mut Block) -> Vec<f32> {
        block
            .attributes()
            .float3_by_name("Position")
            .iter()
            .map(|p| p.x)
            .collect()
    }

    #[test]
    fn move_row_copies_every_attribute() {
        let mut block = block_with_rows(&[1.0, 2.0, 3.0]);
        block.move_row(2, 0);
        assert_eq!(positions(&mut block), [3.0, 2.0, 3.0]);
        assert_eq!(block.attributes().float_by_name("Birth Time")[0], 3.0);
        assert_eq!(block.active_amount(), 3);
    }

    #[test]
    #[should_panic]
    fn move_row_out_of_range_panics() {
        let mut block = block_with_rows(&[1.0]);
        block.move_row(1, 0);
    }

    #[test]
    fn move_until_full_respects_capacity() {
        let mut from = block_with_rows(&[1.0, 2.0, 3.0]);
        let mut to = block_with_rows(&[9.0, 8.0]);

        Block::move_until_full(&mut from, &mut to);
        assert_eq!(from.active_amount(), 1);
        assert_eq!(to.active_amount(), 4);
        assert_eq!(positions(&mut from), [1.0]);

        // Tail rows 2.0 and 3.0 moved over; multiset is preserved.
        let mut moved = positions(&mut to);
        moved.sort_by(f32::total_cmp);
        assert_eq!(moved, [2.0, 3.0, 8.0, 9.0]);
    }

    #[test]
    fn compress_leaves_at_most_one_partial_block() {
        let info = test_info();
        let mut blocks: Vec<Block> = [1, 1, 1, 1]
            .iter()
            .map(|&n| {
                let mut b = Block::new(info.clone(), 4);
                b.set_active_amount(n);
                b
            })
            .collect();

        let mut refs: Vec<&mut Block> = blocks.iter_mut().collect();
        Block::compress(&mut refs);

        let mut amounts: Vec<usize> = blocks.iter().map(|b| b.active_amount()).collect();
        amounts.sort_unstable();
        assert_eq!(amounts, [0, 0, 0, 4]);
    }

    #[test]
    fn compress_preserves_row_multiset() {
        let mut blocks = vec![
            block_with_rows(&[1.0, 2.0]),
            block_with_rows(&[3.0]),
            block_with_rows(&[4.0, 5.0, 6.0]),
        ];

        let mut refs: Vec<&mut Block> = blocks.iter_mut().collect();
        Block::compress(&mut refs);

        let partial = blocks
            .iter()
            .filter(|b| !b.is_empty() && !b.is_full())
            .count();
        assert!(partial <= 1);

        let mut all: Vec<f32> = blocks.iter_mut().flat_map(|b| positions(b)).collect();
        all.sort_by(f32::total_cmp);
        assert_eq!(all, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
