/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module provides memory allocation for task stacks and
 * control blocks. The allocator is chosen by the application when the
 * scheduler is built:
 *
 * - `GlobalStacks`: wrap Rust's #[global_allocator]
 * - `BoundedStacks`: the global allocator behind a fixed byte budget, with
 *   free space statistics
 */

//! Memory Allocation
//!
//! The kernel asks a [`StackAllocator`] for stack words and charges it for
//! every task control block. Static tasks bypass the allocator for their stack
//! but are still charged for the control block.
//!
//! | Allocator | Use Case |
//! |-----------|----------|
//! | [`GlobalStacks`] | An existing `#[global_allocator]`, no budget |
//! | [`BoundedStacks`] | Deterministic budget, like `TOTAL_HEAP_SIZE` |

use crate::types::*;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::size_of;

// =============================================================================
// Heap Statistics (common to all implementations)
// =============================================================================

/// Heap statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes still available, `usize::MAX` when unbounded.
    pub available_bytes: usize,
    /// Lowest value `available_bytes` has reached.
    pub minimum_ever_free_bytes: usize,
    /// Number of successful allocations
    pub successful_allocations: usize,
    /// Number of successful frees
    pub successful_frees: usize,
}

/// Source of task stacks and control block storage.
pub trait StackAllocator: Send {
    /// Allocate a stack of `words` words.
    fn allocate_stack(&mut self, words: usize) -> Result<Box<[StackWord]>, TaskError>;

    /// Give back a stack obtained from [`StackAllocator::allocate_stack`].
    fn release_stack(&mut self, stack: Box<[StackWord]>);

    /// Charge `bytes` for a task control block.
    fn claim_control_block(&mut self, bytes: usize) -> Result<(), TaskError>;

    /// Refund a charge made by [`StackAllocator::claim_control_block`].
    fn release_control_block(&mut self, bytes: usize);

    fn stats(&self) -> HeapStats;
}

fn allocate_words(words: usize) -> Result<Box<[StackWord]>, TaskError> {
    let mut stack: Vec<StackWord> = Vec::new();
    stack
        .try_reserve_exact(words)
        .map_err(|_| TaskError::AllocationFailure)?;
    stack.resize(words, 0);
    Ok(stack.into_boxed_slice())
}

// =============================================================================
// Global allocator
// =============================================================================

/// Stacks straight from the global allocator.
#[derive(Debug, Default)]
pub struct GlobalStacks {
    allocations: usize,
    frees: usize,
}

impl GlobalStacks {
    pub const fn new() -> Self {
        GlobalStacks {
            allocations: 0,
            frees: 0,
        }
    }
}

impl StackAllocator for GlobalStacks {
    fn allocate_stack(&mut self, words: usize) -> Result<Box<[StackWord]>, TaskError> {
        let stack = allocate_words(words)?;
        self.allocations += 1;
        Ok(stack)
    }

    fn release_stack(&mut self, stack: Box<[StackWord]>) {
        drop(stack);
        self.frees += 1;
    }

    fn claim_control_block(&mut self, _bytes: usize) -> Result<(), TaskError> {
        self.allocations += 1;
        Ok(())
    }

    fn release_control_block(&mut self, _bytes: usize) {
        self.frees += 1;
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            available_bytes: usize::MAX,
            minimum_ever_free_bytes: usize::MAX,
            successful_allocations: self.allocations,
            successful_frees: self.frees,
        }
    }
}

// =============================================================================
// Bounded allocator
// =============================================================================

/// Stacks from the global allocator, limited to a byte budget.
#[derive(Debug)]
pub struct BoundedStacks {
    capacity: usize,
    free: usize,
    minimum_ever_free: usize,
    allocations: usize,
    frees: usize,
}

impl BoundedStacks {
    pub const fn new(capacity: usize) -> Self {
        BoundedStacks {
            capacity,
            free: capacity,
            minimum_ever_free: capacity,
            allocations: 0,
            frees: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn charge(&mut self, bytes: usize) -> Result<(), TaskError> {
        if bytes > self.free {
            return Err(TaskError::AllocationFailure);
        }
        self.free -= bytes;
        self.minimum_ever_free = self.minimum_ever_free.min(self.free);
        self.allocations += 1;
        Ok(())
    }

    fn refund(&mut self, bytes: usize) {
        self.free = (self.free + bytes).min(self.capacity);
        self.frees += 1;
    }
}

impl Default for BoundedStacks {
    fn default() -> Self {
        BoundedStacks::new(crate::config::TOTAL_HEAP_SIZE)
    }
}

impl StackAllocator for BoundedStacks {
    fn allocate_stack(&mut self, words: usize) -> Result<Box<[StackWord]>, TaskError> {
        let bytes = words
            .checked_mul(size_of::<StackWord>())
            .ok_or(TaskError::AllocationFailure)?;
        self.charge(bytes)?;
        match allocate_words(words) {
            Ok(stack) => Ok(stack),
            Err(e) => {
                self.free += bytes;
                self.allocations -= 1;
                Err(e)
            }
        }
    }

    fn release_stack(&mut self, stack: Box<[StackWord]>) {
        let bytes = stack.len() * size_of::<StackWord>();
        drop(stack);
        self.refund(bytes);
    }

    fn claim_control_block(&mut self, bytes: usize) -> Result<(), TaskError> {
        self.charge(bytes)
    }

    fn release_control_block(&mut self, bytes: usize) {
        self.refund(bytes);
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            available_bytes: self.free,
            minimum_ever_free_bytes: self.minimum_ever_free,
            successful_allocations: self.allocations,
            successful_frees: self.frees,
        }
    }
}
