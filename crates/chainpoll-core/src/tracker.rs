//! Head window: a sliding, parent-linked window of the most recent heads.

use std::collections::VecDeque;

use crate::types::Block;

/// The last N accepted heads, oldest first.
///
/// Every block in the window extends its predecessor, so the window always
/// describes one contiguous branch.
#[derive(Debug, Clone)]
pub struct HeadWindow {
    window: VecDeque<Block>,
    capacity: usize,
}

impl HeadWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild a window from persisted heads, keeping the longest linked
    /// suffix ending at the highest block.
    pub fn from_blocks(capacity: usize, mut blocks: Vec<Block>) -> Self {
        blocks.sort_by_key(|b| b.number);
        let mut linked: Vec<Block> = Vec::new();
        for block in blocks.into_iter().rev() {
            match linked.last() {
                Some(child) if !child.extends(&block) => break,
                _ => linked.push(block),
            }
        }
        let mut window = Self::new(capacity);
        for block in linked.into_iter().rev() {
            window.append(block);
        }
        window
    }

    /// Most recently accepted head.
    pub fn head(&self) -> Option<&Block> {
        self.window.back()
    }

    pub fn oldest(&self) -> Option<&Block> {
        self.window.front()
    }

    pub fn get(&self, number: i64) -> Option<&Block> {
        let oldest = self.oldest()?.number;
        let idx = usize::try_from(number - oldest).ok()?;
        self.window.get(idx)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.window.iter()
    }

    /// Returns `true` if `block` is the direct child of the current head.
    pub fn extends_head(&self, block: &Block) -> bool {
        self.head().map_or(true, |head| block.extends(head))
    }

    /// Append a block that extends the head, evicting the oldest entry when
    /// full. A block that does not extend the head resets the window.
    pub fn append(&mut self, block: Block) {
        if !self.extends_head(&block) {
            self.window.clear();
        }
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    /// Discard every block above `number`; returns them newest first.
    pub fn rewind_to(&mut self, number: i64) -> Vec<Block> {
        let mut dropped = Vec::new();
        while let Some(back) = self.window.back() {
            if back.number > number {
                if let Some(b) = self.window.pop_back() {
                    dropped.push(b);
                }
            } else {
                break;
            }
        }
        dropped
    }

    /// Replace the whole window with a single block.
    pub fn reset(&mut self, block: Block) {
        self.window.clear();
        self.window.push_back(block);
    }
}
