/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 */

//! Task Stack Regions
//!
//! A task stack is a slice of [`StackWord`]s owned by the task (from the
//! allocator) or borrowed for `'static` (caller-supplied). The region is
//! split into a working part and [`STACK_GUARD_WORDS`] guard words at the far
//! boundary, i.e. the end the stack grows towards:
//!
//! ```text
//! Descending:  [ guard | ........ working ........ ]   sp starts at len
//! Ascending:   [ ........ working ........ | guard ]   sp starts at 0
//! ```
//!
//! A stack pointer here is an index: the boundary between used and unused
//! words. New stacks are filled with [`STACK_FILL_BYTE`] so the high water
//! mark can be found by scanning for untouched words.

use crate::config::{STACK_FILL_BYTE, STACK_GUARD_BYTE, STACK_GUARD_WORDS};
use crate::port::StackGrowth;
use crate::types::StackWord;
use alloc::boxed::Box;
use core::fmt;
use core::mem::size_of;

/// Word written over the whole stack at creation.
pub const STACK_FILL_WORD: StackWord = StackWord::from_ne_bytes([STACK_FILL_BYTE; size_of::<StackWord>()]);

/// Word written into the guard area at creation.
pub const STACK_GUARD_WORD: StackWord =
    StackWord::from_ne_bytes([STACK_GUARD_BYTE; size_of::<StackWord>()]);

/// Where the words of a stack came from.
pub enum StackStorage {
    /// Obtained from the stack allocator; handed back on deletion.
    Heap(Box<[StackWord]>),
    /// Supplied by the application; never freed.
    Static(&'static mut [StackWord]),
}

impl StackStorage {
    fn words(&self) -> &[StackWord] {
        match self {
            StackStorage::Heap(words) => words,
            StackStorage::Static(words) => words,
        }
    }

    fn words_mut(&mut self) -> &mut [StackWord] {
        match self {
            StackStorage::Heap(words) => words,
            StackStorage::Static(words) => words,
        }
    }

    pub fn len(&self) -> usize {
        self.words().len()
    }

    pub fn is_empty(&self) -> bool {
        self.words().is_empty()
    }

    pub fn is_static(&self) -> bool {
        matches!(self, StackStorage::Static(_))
    }
}

/// A stack check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFault {
    /// The stack pointer left the working region.
    PointerOutOfBounds { pointer: usize },
    /// A guard word no longer holds the guard pattern.
    GuardCorrupted { index: usize },
}

/// Bounds-checked stack memory of one task.
pub struct StackRegion {
    storage: StackStorage,
    growth: StackGrowth,
}

impl StackRegion {
    /// Take ownership of `storage`, fill it and lay down the guard words.
    ///
    /// The storage must be longer than [`STACK_GUARD_WORDS`].
    pub fn new(mut storage: StackStorage, growth: StackGrowth) -> Self {
        debug_assert!(storage.len() > STACK_GUARD_WORDS);
        let words = storage.words_mut();
        words.fill(STACK_FILL_WORD);
        let len = words.len();
        let guard = match growth {
            StackGrowth::Descending => 0..STACK_GUARD_WORDS.min(len),
            StackGrowth::Ascending => len.saturating_sub(STACK_GUARD_WORDS)..len,
        };
        words[guard].fill(STACK_GUARD_WORD);
        StackRegion { storage, growth }
    }

    /// Total words including the guard.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Words available to the task.
    pub fn capacity(&self) -> usize {
        self.len().saturating_sub(STACK_GUARD_WORDS)
    }

    pub fn growth(&self) -> StackGrowth {
        self.growth
    }

    pub fn is_static(&self) -> bool {
        self.storage.is_static()
    }

    /// Stack pointer of an empty stack.
    pub fn initial_pointer(&self) -> usize {
        match self.growth {
            StackGrowth::Descending => self.len(),
            StackGrowth::Ascending => 0,
        }
    }

    /// Lowest and highest stack pointer values inside the working region.
    fn pointer_bounds(&self) -> (usize, usize) {
        match self.growth {
            StackGrowth::Descending => (STACK_GUARD_WORDS, self.len()),
            StackGrowth::Ascending => (0, self.capacity()),
        }
    }

    fn guard_range(&self) -> core::ops::Range<usize> {
        match self.growth {
            StackGrowth::Descending => 0..STACK_GUARD_WORDS,
            StackGrowth::Ascending => self.capacity()..self.len(),
        }
    }

    /// Push `word` at `sp` and return the new stack pointer.
    pub fn push(&mut self, sp: usize, word: StackWord) -> Result<usize, StackFault> {
        let (low, high) = self.pointer_bounds();
        let (slot, next) = match self.growth {
            StackGrowth::Descending => match sp.checked_sub(1) {
                Some(next) if next >= low && sp <= high => (next, next),
                _ => return Err(StackFault::PointerOutOfBounds { pointer: sp }),
            },
            StackGrowth::Ascending => {
                if sp < low || sp >= high {
                    return Err(StackFault::PointerOutOfBounds { pointer: sp });
                }
                (sp, sp + 1)
            }
        };
        self.storage.words_mut()[slot] = word;
        Ok(next)
    }

    pub fn read(&self, index: usize) -> Option<StackWord> {
        self.storage.words().get(index).copied()
    }

    /// Raw write anywhere in the storage, guard included.
    pub fn write(&mut self, index: usize, word: StackWord) -> Result<(), StackFault> {
        match self.storage.words_mut().get_mut(index) {
            Some(slot) => {
                *slot = word;
                Ok(())
            }
            None => Err(StackFault::PointerOutOfBounds { pointer: index }),
        }
    }

    /// Whether `sp` lies inside the working region.
    pub fn check_pointer(&self, sp: usize) -> Result<(), StackFault> {
        let (low, high) = self.pointer_bounds();
        if sp < low || sp > high {
            return Err(StackFault::PointerOutOfBounds { pointer: sp });
        }
        Ok(())
    }

    /// Whether every guard word still holds the guard pattern.
    pub fn check_guard(&self) -> Result<(), StackFault> {
        let words = self.storage.words();
        for index in self.guard_range() {
            if words[index] != STACK_GUARD_WORD {
                return Err(StackFault::GuardCorrupted { index });
            }
        }
        Ok(())
    }

    pub fn check(&self, sp: usize) -> Result<(), StackFault> {
        self.check_pointer(sp)?;
        self.check_guard()
    }

    /// Minimum number of working words that have never been written.
    pub fn high_water_mark(&self) -> usize {
        let words = self.storage.words();
        match self.growth {
            StackGrowth::Descending => words[STACK_GUARD_WORDS..]
                .iter()
                .take_while(|w| **w == STACK_FILL_WORD)
                .count(),
            StackGrowth::Ascending => words[..self.capacity()]
                .iter()
                .rev()
                .take_while(|w| **w == STACK_FILL_WORD)
                .count(),
        }
    }

    pub fn into_storage(self) -> StackStorage {
        self.storage
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackRegion")
            .field("len", &self.len())
            .field("growth", &self.growth)
            .field("static", &self.is_static())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn region(len: usize, growth: StackGrowth) -> StackRegion {
        StackRegion::new(StackStorage::Heap(vec![0; len].into_boxed_slice()), growth)
    }

    #[test]
    fn fresh_stack_is_untouched() {
        let stack = region(32, StackGrowth::Descending);
        assert_eq!(stack.capacity(), 32 - STACK_GUARD_WORDS);
        assert_eq!(stack.high_water_mark(), stack.capacity());
        assert!(stack.check(stack.initial_pointer()).is_ok());
    }

    #[test]
    fn descending_push_moves_towards_guard() {
        let mut stack = region(16, StackGrowth::Descending);
        let mut sp = stack.initial_pointer();
        for i in 0..stack.capacity() {
            sp = stack.push(sp, i as StackWord).unwrap();
        }
        assert_eq!(sp, STACK_GUARD_WORDS);
        assert_eq!(
            stack.push(sp, 0),
            Err(StackFault::PointerOutOfBounds { pointer: sp })
        );
        assert_eq!(stack.high_water_mark(), 0);
        assert!(stack.check(sp).is_ok());
    }

    #[test]
    fn ascending_push_moves_towards_guard() {
        let mut stack = region(16, StackGrowth::Ascending);
        let mut sp = stack.initial_pointer();
        sp = stack.push(sp, 1).unwrap();
        sp = stack.push(sp, 2).unwrap();
        assert_eq!(sp, 2);
        assert_eq!(stack.high_water_mark(), stack.capacity() - 2);
        assert!(stack.check(sp).is_ok());
        assert!(stack.check_pointer(stack.capacity() + 1).is_err());
    }

    #[test]
    fn overwriting_guard_is_detected() {
        let mut stack = region(16, StackGrowth::Descending);
        stack.write(STACK_GUARD_WORDS - 1, 0).unwrap();
        assert_eq!(
            stack.check(stack.initial_pointer()),
            Err(StackFault::GuardCorrupted { index: STACK_GUARD_WORDS - 1 })
        );

        let mut stack = region(16, StackGrowth::Ascending);
        stack.write(stack.capacity(), 0).unwrap();
        assert_eq!(
            stack.check_guard(),
            Err(StackFault::GuardCorrupted { index: stack.capacity() })
        );
    }

    #[test]
    fn pointer_past_capacity_is_detected() {
        let stack = region(16, StackGrowth::Descending);
        assert_eq!(
            stack.check(STACK_GUARD_WORDS - 1),
            Err(StackFault::PointerOutOfBounds { pointer: STACK_GUARD_WORDS - 1 })
        );
        assert!(stack.check(17).is_err());
    }

    #[test]
    fn high_water_mark_tracks_deepest_use() {
        let mut stack = region(32, StackGrowth::Descending);
        let sp = stack.initial_pointer();
        let deep = stack.push(sp, 1).and_then(|sp| stack.push(sp, 2)).unwrap();
        let _ = stack.push(deep, 3).unwrap();
        // Popping does not restore the fill pattern.
        assert_eq!(stack.high_water_mark(), stack.capacity() - 3);
    }

    #[test]
    fn static_storage_round_trips() {
        let buffer: &'static mut [StackWord] = alloc::boxed::Box::leak(vec![0; 24].into_boxed_slice());
        let stack = StackRegion::new(StackStorage::Static(buffer), StackGrowth::Descending);
        assert!(stack.is_static());
        assert!(stack.into_storage().is_static());
    }
}
