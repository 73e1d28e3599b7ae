/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 */

//! Task Control Blocks
//!
//! Every task is a [`Tcb`] stored in the [`TaskArena`]. Tasks are named by a
//! [`TaskHandle`]: an arena index plus the generation of the slot. When a
//! task is deleted its slot generation advances, so stale handles are
//! rejected instead of aliasing a newer task.

use crate::config::*;
use crate::kernel::list::{ItemKind, ItemStore, ListItem};
use crate::kernel::stack::StackRegion;
use crate::types::*;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

#[cfg(feature = "task-notifications")]
use crate::kernel::notify::NotifySlot;

// =============================================================================
// Handles and names
// =============================================================================

/// Handle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

impl TaskHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        TaskHandle { index, generation }
    }

    /// Arena slot of the task.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

/// Bounded task name, truncated on a character boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskName {
    bytes: [u8; MAX_TASK_NAME_LEN],
    len: u8,
}

impl TaskName {
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(MAX_TASK_NAME_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; MAX_TASK_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        TaskName {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task state as reported by [`Scheduler::task_state`](crate::Scheduler::task_state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The task is the current task.
    Running,
    /// In a ready list or the pending ready list.
    Ready,
    /// Waiting on a delay, an event list or a notification.
    Blocked,
    /// Suspended until resumed.
    Suspended,
    /// Deleted itself; storage is reclaimed by the idle task.
    Deleted,
}

bitflags! {
    /// Per-task flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// The stack was supplied by the application and is never freed.
        const STATIC_STACK = 1 << 0;
        /// This is the idle task.
        const IDLE = 1 << 1;
        /// The last block was ended by `abort_delay`.
        const DELAY_ABORTED = 1 << 2;
    }
}

/// How the most recent block of a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Unblocked by the event it waited for.
    Woken,
    /// Unblocked because its timeout expired.
    TimedOut,
    /// Unblocked by `abort_delay`.
    Aborted,
}

// =============================================================================
// Task Control Block
// =============================================================================

/// Task control block.
#[derive(Debug)]
pub struct Tcb {
    /// Saved stack pointer, an index into `stack`.
    pub(crate) top_of_stack: usize,
    /// Membership of a ready, delayed, suspended or termination list.
    pub(crate) state_item: ListItem,
    /// Membership of an event list or the pending ready list.
    pub(crate) event_item: ListItem,
    /// Effective priority.
    pub(crate) priority: Priority,
    /// Priority absent inheritance.
    pub(crate) base_priority: Priority,
    pub(crate) mutexes_held: UBaseType,
    pub(crate) stack: StackRegion,
    pub(crate) name: TaskName,
    /// Creation sequence number, for debuggers and tracing.
    pub(crate) number: UBaseType,
    pub(crate) flags: TaskFlags,
    pub(crate) block_outcome: Option<BlockOutcome>,
    /// Number assigned by the application for trace tools.
    #[cfg(feature = "trace-facility")]
    pub(crate) trace_number: UBaseType,
    #[cfg(feature = "application-task-tag")]
    pub(crate) tag: Option<TaskHookFunction>,
    #[cfg(feature = "critical-nesting-in-tcb")]
    pub(crate) critical_nesting: UBaseType,
    #[cfg(feature = "task-notifications")]
    pub(crate) notify: [NotifySlot; TASK_NOTIFICATION_ARRAY_ENTRIES],
    #[cfg(feature = "thread-local-storage")]
    pub(crate) thread_local: [usize; NUM_THREAD_LOCAL_STORAGE_POINTERS],
    #[cfg(feature = "generate-run-time-stats")]
    pub(crate) run_time: RunTimeCounter,
}

impl Tcb {
    pub(crate) fn new(
        name: &str,
        priority: Priority,
        stack: StackRegion,
        top_of_stack: usize,
    ) -> Self {
        let mut flags = TaskFlags::empty();
        flags.set(TaskFlags::STATIC_STACK, stack.is_static());
        Tcb {
            top_of_stack,
            state_item: ListItem::new(),
            event_item: ListItem::new(),
            priority,
            base_priority: priority,
            mutexes_held: 0,
            stack,
            name: TaskName::new(name),
            number: 0,
            flags,
            block_outcome: None,
            #[cfg(feature = "trace-facility")]
            trace_number: 0,
            #[cfg(feature = "application-task-tag")]
            tag: None,
            #[cfg(feature = "critical-nesting-in-tcb")]
            critical_nesting: 0,
            #[cfg(feature = "task-notifications")]
            notify: [NotifySlot::new(); TASK_NOTIFICATION_ARRAY_ENTRIES],
            #[cfg(feature = "thread-local-storage")]
            thread_local: [0; NUM_THREAD_LOCAL_STORAGE_POINTERS],
            #[cfg(feature = "generate-run-time-stats")]
            run_time: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn number(&self) -> UBaseType {
        self.number
    }

    pub(crate) fn item(&self, kind: ItemKind) -> &ListItem {
        match kind {
            ItemKind::State => &self.state_item,
            ItemKind::Event => &self.event_item,
        }
    }

    pub(crate) fn item_mut(&mut self, kind: ItemKind) -> &mut ListItem {
        match kind {
            ItemKind::State => &mut self.state_item,
            ItemKind::Event => &mut self.event_item,
        }
    }
}

// =============================================================================
// Task Arena
// =============================================================================

struct Slot {
    generation: u32,
    tcb: Option<Tcb>,
}

/// Generation-checked storage of all task control blocks.
#[derive(Default)]
pub struct TaskArena {
    slots: Vec<Slot>,
    live: usize,
}

impl TaskArena {
    pub const fn new() -> Self {
        TaskArena {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `tcb` and return its handle.
    pub fn insert(&mut self, tcb: Tcb) -> Result<TaskHandle, Tcb> {
        if let Some(index) = self.slots.iter().position(|s| s.tcb.is_none()) {
            let slot = &mut self.slots[index];
            slot.tcb = Some(tcb);
            self.live += 1;
            return Ok(TaskHandle::new(index as u32, slot.generation));
        }
        if self.slots.try_reserve(1).is_err() {
            return Err(tcb);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            tcb: Some(tcb),
        });
        self.live += 1;
        Ok(TaskHandle::new(index, 0))
    }

    /// Take the control block out and retire the handle.
    pub fn remove(&mut self, handle: TaskHandle) -> Option<Tcb> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let tcb = slot.tcb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Some(tcb)
    }

    pub fn get(&self, handle: TaskHandle) -> Option<&Tcb> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.tcb.as_ref())
    }

    pub fn get_mut(&mut self, handle: TaskHandle) -> Option<&mut Tcb> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.tcb.as_mut())
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Handles of all live tasks in slot order.
    pub fn handles(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.tcb
                .as_ref()
                .map(|_| TaskHandle::new(i as u32, s.generation))
        })
    }

    /// Control block of a handle held by a kernel list. A dangling handle in
    /// a list means the list structure is corrupted.
    pub(crate) fn linked(&self, handle: TaskHandle) -> &Tcb {
        match self.get(handle) {
            Some(tcb) => tcb,
            None => fatal(FatalError::ListCorrupted),
        }
    }

    pub(crate) fn linked_mut(&mut self, handle: TaskHandle) -> &mut Tcb {
        match self.get_mut(handle) {
            Some(tcb) => tcb,
            None => fatal(FatalError::ListCorrupted),
        }
    }
}

impl ItemStore for TaskArena {
    fn item(&self, owner: TaskHandle, kind: ItemKind) -> &ListItem {
        self.linked(owner).item(kind)
    }

    fn item_mut(&mut self, owner: TaskHandle, kind: ItemKind) -> &mut ListItem {
        self.linked_mut(owner).item_mut(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::stack::StackStorage;
    use crate::port::StackGrowth;
    use alloc::vec;

    fn tcb(name: &str, priority: Priority) -> Tcb {
        let storage = StackStorage::Heap(vec![0; 16].into_boxed_slice());
        let stack = StackRegion::new(storage, StackGrowth::Descending);
        Tcb::new(name, priority, stack, 16)
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut arena = TaskArena::new();
        let a = arena.insert(tcb("a", 1)).unwrap();
        assert_eq!(arena.len(), 1);
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());

        let b = arena.insert(tcb("b", 2)).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|t| t.name()), Some("b"));
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn handles_lists_live_tasks() {
        let mut arena = TaskArena::new();
        let a = arena.insert(tcb("a", 1)).unwrap();
        let b = arena.insert(tcb("b", 1)).unwrap();
        arena.remove(a);
        assert_eq!(arena.handles().collect::<Vec<_>>(), [b]);
    }

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        assert_eq!(TaskName::new("short").as_str(), "short");
        let long = TaskName::new("a-very-long-task-name");
        assert_eq!(long.as_str().len(), MAX_TASK_NAME_LEN - 1);
        // 'é' is two bytes and straddles the cut.
        let name = TaskName::new("abcdefghijklmné");
        assert_eq!(name.as_str(), "abcdefghijklmn");
    }

    #[test]
    fn new_tcb_starts_unlinked() {
        let t = tcb("t", 3);
        assert_eq!(t.base_priority(), 3);
        assert!(!t.state_item.is_linked());
        assert!(!t.event_item.is_linked());
        assert!(!t.flags.contains(TaskFlags::STATIC_STACK));
    }
}
