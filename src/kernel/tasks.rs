/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module contains the scheduler core. The kernel lists are
 * fields of `Scheduler` rather than file-scope globals, and tasks are
 * addressed by generation-checked handles instead of TCB pointers.
 */

//! Task Management
//!
//! This module provides task creation, scheduling, and management.
//!
//! ## Key Operations
//! - [`Scheduler::create_task`] / `create_task_static` - Create a new task
//! - [`Scheduler::start_scheduler`] - Start the scheduler
//! - [`Scheduler::delay`] / [`Scheduler::delay_until`] - Delay the current task
//! - [`Scheduler::suspend_task`] / [`Scheduler::resume_task`] - Suspend/resume tasks
//! - [`Scheduler::increment_tick`] / [`Scheduler::switch_context`] - Called by the port
//!
//! ## Scheduler Lists
//! - one ready list per priority, with a bitmap of the non-empty levels
//! - two delayed lists; the second holds wake times past the next tick wrap
//! - the suspended list, which also holds tasks blocked without timeout
//! - the pending ready list, for tasks readied while the scheduler is suspended
//! - the list of tasks that deleted themselves and await the idle task

use crate::config::*;
use crate::kernel::list::{ItemKind, ItemStore, List, ListId};
use crate::kernel::stack::{StackFault, StackRegion, StackStorage};
use crate::kernel::task::{TaskArena, TaskFlags, TaskName, TaskState, Tcb};
use crate::memory::{GlobalStacks, HeapStats, StackAllocator};
use crate::port::Port;
use crate::trace;
use crate::types::*;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::size_of;

pub use crate::kernel::list::EventListId;
pub use crate::kernel::task::{BlockOutcome, TaskHandle};

#[cfg(feature = "use-mutexes")]
use crate::kernel::mutex::MutexArena;

// =============================================================================
// Ready index
// =============================================================================

/// Bitmap with one bit per non-empty ready list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyIndex(u32);

impl ReadyIndex {
    pub const fn new() -> Self {
        ReadyIndex(0)
    }

    pub fn record(&mut self, priority: Priority) {
        self.0 |= 1 << priority;
    }

    pub fn reset(&mut self, priority: Priority) {
        self.0 &= !(1 << priority);
    }

    #[cfg(test)]
    fn contains(&self, priority: Priority) -> bool {
        self.0 & (1 << priority) != 0
    }

    /// Highest priority with a ready task.
    pub fn highest(&self) -> Option<Priority> {
        if self.0 == 0 {
            None
        } else {
            Some((31 - self.0.leading_zeros()) as Priority)
        }
    }
}

// =============================================================================
// Kernel lists
// =============================================================================

struct EventSlot {
    generation: u32,
    list: Option<List>,
}

/// Every list the scheduler owns.
pub(crate) struct TaskLists {
    ready: [List; MAX_PRIORITIES],
    delayed: [List; 2],
    /// Index into `delayed` of the list for the current tick epoch.
    current_delayed: usize,
    suspended: List,
    pending_ready: List,
    waiting_termination: List,
    events: Vec<EventSlot>,
}

impl TaskLists {
    fn new() -> Self {
        TaskLists {
            ready: core::array::from_fn(|p| List::new(ListId::Ready(p as u8), ItemKind::State)),
            delayed: [
                List::new(ListId::Delayed(0), ItemKind::State),
                List::new(ListId::Delayed(1), ItemKind::State),
            ],
            current_delayed: 0,
            suspended: List::new(ListId::Suspended, ItemKind::State),
            pending_ready: List::new(ListId::PendingReady, ItemKind::Event),
            waiting_termination: List::new(ListId::WaitingTermination, ItemKind::State),
            events: Vec::new(),
        }
    }

    fn delayed(&self) -> &List {
        &self.delayed[self.current_delayed]
    }

    fn delayed_mut(&mut self) -> &mut List {
        &mut self.delayed[self.current_delayed]
    }

    fn overflow_delayed_mut(&mut self) -> &mut List {
        &mut self.delayed[1 - self.current_delayed]
    }

    pub(crate) fn get_mut(&mut self, id: ListId) -> Option<&mut List> {
        match id {
            ListId::Ready(p) => self.ready.get_mut(p as usize),
            ListId::Delayed(i) => self.delayed.get_mut(i as usize),
            ListId::Suspended => Some(&mut self.suspended),
            ListId::PendingReady => Some(&mut self.pending_ready),
            ListId::WaitingTermination => Some(&mut self.waiting_termination),
            ListId::Event(ev) => self.event_mut(ev),
        }
    }

    pub(crate) fn event(&self, id: EventListId) -> Option<&List> {
        self.events
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.list.as_ref())
    }

    pub(crate) fn event_mut(&mut self, id: EventListId) -> Option<&mut List> {
        self.events
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.list.as_mut())
    }

    pub(crate) fn create_event(&mut self) -> Result<EventListId, TaskError> {
        let index = match self.events.iter().position(|s| s.list.is_none()) {
            Some(index) => index,
            None => {
                self.events
                    .try_reserve(1)
                    .map_err(|_| TaskError::AllocationFailure)?;
                self.events.push(EventSlot {
                    generation: 0,
                    list: None,
                });
                self.events.len() - 1
            }
        };
        let slot = &mut self.events[index];
        let id = EventListId {
            index: index as u32,
            generation: slot.generation,
        };
        slot.list = Some(List::new(ListId::Event(id), ItemKind::Event));
        Ok(id)
    }

    pub(crate) fn delete_event(&mut self, id: EventListId) -> Result<(), TaskError> {
        let slot = self
            .events
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.list.is_some())
            .ok_or(TaskError::InvalidHandle)?;
        if slot.list.as_ref().is_some_and(|l| !l.is_empty()) {
            return Err(TaskError::EventListInUse);
        }
        slot.list = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Free a list created on a construction path that then failed.
    pub(crate) fn discard_event(&mut self, id: EventListId) {
        let freed = self.delete_event(id);
        debug_assert!(freed.is_ok(), "rollback of {:?} failed: {:?}", id, freed);
    }
}

// =============================================================================
// Public types
// =============================================================================

/// Scheduler state as reported by [`Scheduler::scheduler_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running,
    Suspended,
}

/// Application hooks.
#[derive(Clone, Copy, Default)]
pub struct KernelHooks {
    /// Called with the offending task before a stack overflow halts the kernel.
    pub stack_overflow: Option<fn(TaskHandle, &str)>,
    /// Called when stack or control block storage cannot be obtained.
    pub malloc_failed: Option<fn()>,
    /// Called on every idle iteration.
    pub idle: Option<fn()>,
}

/// Snapshot used by [`Scheduler::check_for_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOut {
    overflow_count: UBaseType,
    time_on_entering: Tick,
}

/// Task status as reported by [`Scheduler::task_info`].
#[cfg(feature = "trace-facility")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub handle: TaskHandle,
    pub name: TaskName,
    pub number: UBaseType,
    pub state: TaskState,
    pub current_priority: Priority,
    pub base_priority: Priority,
    pub run_time: RunTimeCounter,
    pub stack_high_water_mark: usize,
}

/// Body of the idle task. On a real target the port's idle loop also calls
/// [`Scheduler::idle_iteration`].
fn idle_task(_: usize) {
    loop {
        core::hint::spin_loop();
    }
}

/// Sort key of an event item: higher priority sorts first.
pub(crate) fn event_item_value(priority: Priority) -> Tick {
    (MAX_PRIORITIES as Tick).wrapping_sub(priority as Tick)
}

fn clamp_priority(priority: Priority) -> Priority {
    debug_assert!(
        (priority as usize) < MAX_PRIORITIES,
        "priority {} out of range",
        priority
    );
    priority.min((MAX_PRIORITIES - 1) as Priority)
}

// =============================================================================
// Scheduler
// =============================================================================

/// The task scheduler. One value holds every piece of kernel state.
pub struct Scheduler<P: Port> {
    port: P,
    allocator: Box<dyn StackAllocator>,
    pub(crate) tasks: TaskArena,
    pub(crate) lists: TaskLists,
    ready_index: ReadyIndex,
    current: Option<TaskHandle>,
    idle: Option<TaskHandle>,
    tick_count: Tick,
    num_overflows: UBaseType,
    next_unblock_time: Tick,
    pended_ticks: Tick,
    yield_pending: bool,
    running: bool,
    suspended: UBaseType,
    task_number: UBaseType,
    deleted_awaiting_cleanup: UBaseType,
    hooks: KernelHooks,
    #[cfg(feature = "use-mutexes")]
    pub(crate) mutexes: MutexArena,
    #[cfg(feature = "generate-run-time-stats")]
    total_run_time: RunTimeCounter,
    #[cfg(feature = "generate-run-time-stats")]
    switched_in_time: RunTimeCounter,
}

impl<P: Port> Scheduler<P> {
    pub fn new(port: P, allocator: Box<dyn StackAllocator>) -> Self {
        Scheduler {
            port,
            allocator,
            tasks: TaskArena::new(),
            lists: TaskLists::new(),
            ready_index: ReadyIndex::new(),
            current: None,
            idle: None,
            tick_count: INITIAL_TICK_COUNT,
            num_overflows: 0,
            next_unblock_time: MAX_DELAY,
            pended_ticks: 0,
            yield_pending: false,
            running: false,
            suspended: 0,
            task_number: 0,
            deleted_awaiting_cleanup: 0,
            hooks: KernelHooks::default(),
            #[cfg(feature = "use-mutexes")]
            mutexes: MutexArena::default(),
            #[cfg(feature = "generate-run-time-stats")]
            total_run_time: 0,
            #[cfg(feature = "generate-run-time-stats")]
            switched_in_time: 0,
        }
    }

    /// Scheduler whose stacks come from the global allocator.
    pub fn with_global_allocator(port: P) -> Self {
        Self::new(port, Box::new(GlobalStacks::new()))
    }

    pub fn set_hooks(&mut self, hooks: KernelHooks) {
        self.hooks = hooks;
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.allocator.stats()
    }

    // -------------------------------------------------------------------------
    // Critical sections
    // -------------------------------------------------------------------------

    /// Run `f` inside a task-level critical section.
    pub fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.port.enter_critical();
        #[cfg(feature = "critical-nesting-in-tcb")]
        self.adjust_critical_nesting(true);
        let result = f(self);
        #[cfg(feature = "critical-nesting-in-tcb")]
        self.adjust_critical_nesting(false);
        self.port.exit_critical();
        result
    }

    /// Run `f` with interrupts masked from interrupt context.
    fn isr_critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.port.set_interrupt_mask_from_isr();
        let result = f(self);
        self.port.clear_interrupt_mask_from_isr(saved);
        result
    }

    #[cfg(feature = "critical-nesting-in-tcb")]
    fn adjust_critical_nesting(&mut self, enter: bool) {
        let Some(tcb) = self.current.and_then(|h| self.tasks.get_mut(h)) else {
            return;
        };
        tcb.critical_nesting = if enter {
            tcb.critical_nesting + 1
        } else {
            tcb.critical_nesting.saturating_sub(1)
        };
    }

    /// Critical nesting depth recorded for `handle`.
    #[cfg(feature = "critical-nesting-in-tcb")]
    pub fn critical_nesting(&self, handle: TaskHandle) -> Result<UBaseType, TaskError> {
        Ok(self.tcb(handle)?.critical_nesting)
    }

    // -------------------------------------------------------------------------
    // Handle helpers
    // -------------------------------------------------------------------------

    fn tcb(&self, handle: TaskHandle) -> Result<&Tcb, TaskError> {
        self.tasks.get(handle).ok_or(TaskError::InvalidHandle)
    }

    /// `handle`, or the current task for `None`. Tasks awaiting cleanup are
    /// no longer addressable.
    pub(crate) fn resolve(&self, handle: Option<TaskHandle>) -> Result<TaskHandle, TaskError> {
        let handle = match handle {
            Some(h) => h,
            None => self.current.ok_or(TaskError::SchedulerNotRunning)?,
        };
        match self.tasks.get(handle) {
            Some(tcb) if tcb.state_item.container != Some(ListId::WaitingTermination) => Ok(handle),
            _ => Err(TaskError::InvalidHandle),
        }
    }

    /// The current task of a running scheduler.
    pub(crate) fn running_task(&self) -> Result<TaskHandle, TaskError> {
        if !self.running {
            return Err(TaskError::SchedulerNotRunning);
        }
        self.current.ok_or(TaskError::SchedulerNotRunning)
    }

    /// The current task, for calls that may block.
    pub(crate) fn blocking_task(&self) -> Result<TaskHandle, TaskError> {
        debug_assert!(
            !self.port.is_inside_interrupt(),
            "blocking call from interrupt context"
        );
        let task = self.running_task()?;
        if self.suspended > 0 {
            return Err(TaskError::SchedulerSuspended);
        }
        Ok(task)
    }

    // -------------------------------------------------------------------------
    // Task creation
    // -------------------------------------------------------------------------

    /// Create a task with a stack of `stack_words` words from the allocator.
    ///
    /// Priorities above `MAX_PRIORITIES - 1` are clamped (and trip a debug
    /// assertion).
    pub fn create_task(
        &mut self,
        entry: TaskFunction,
        name: &str,
        stack_words: usize,
        param: usize,
        priority: Priority,
    ) -> Result<TaskHandle, TaskError> {
        self.check_stack_size(stack_words)?;
        let words = match self.allocator.allocate_stack(stack_words) {
            Ok(words) => words,
            Err(e) => {
                self.allocation_failed(stack_words);
                return Err(e);
            }
        };
        self.spawn(entry, name, StackStorage::Heap(words), param, priority)
    }

    /// Create a task on a caller-supplied stack. The stack is never freed.
    #[cfg(feature = "static-allocation")]
    pub fn create_task_static(
        &mut self,
        entry: TaskFunction,
        name: &str,
        stack: &'static mut [StackWord],
        param: usize,
        priority: Priority,
    ) -> Result<TaskHandle, TaskError> {
        self.check_stack_size(stack.len())?;
        debug_assert!(
            stack.as_ptr() as usize % P::BYTE_ALIGNMENT == 0,
            "static stack misaligned"
        );
        self.spawn(entry, name, StackStorage::Static(stack), param, priority)
    }

    fn check_stack_size(&self, words: usize) -> Result<(), TaskError> {
        if words <= STACK_GUARD_WORDS + P::INITIAL_FRAME_WORDS {
            return Err(TaskError::StackTooSmall);
        }
        Ok(())
    }

    fn allocation_failed(&self, words: usize) {
        trace::malloc_failed(words);
        if let Some(hook) = self.hooks.malloc_failed {
            hook();
        }
        trace::task_create_failed();
    }

    fn spawn(
        &mut self,
        entry: TaskFunction,
        name: &str,
        storage: StackStorage,
        param: usize,
        priority: Priority,
    ) -> Result<TaskHandle, TaskError> {
        let priority = clamp_priority(priority);
        let mut stack = StackRegion::new(storage, P::STACK_GROWTH);
        let top_of_stack = match self.port.initialise_stack(&mut stack, entry, param) {
            Ok(sp) => sp,
            Err(_) => {
                self.reclaim_stack(stack);
                trace::task_create_failed();
                return Err(TaskError::StackTooSmall);
            }
        };
        if let Err(e) = self.allocator.claim_control_block(size_of::<Tcb>()) {
            let words = stack.len();
            self.reclaim_stack(stack);
            self.allocation_failed(words);
            return Err(e);
        }
        let tcb = Tcb::new(name, priority, stack, top_of_stack);
        let handle = match self.tasks.insert(tcb) {
            Ok(handle) => handle,
            Err(tcb) => {
                self.allocator.release_control_block(size_of::<Tcb>());
                let words = tcb.stack.len();
                self.reclaim_stack(tcb.stack);
                self.allocation_failed(words);
                return Err(TaskError::AllocationFailure);
            }
        };
        self.critical(|s| s.add_new_task_to_ready_list(handle));
        Ok(handle)
    }

    fn add_new_task_to_ready_list(&mut self, handle: TaskHandle) {
        self.task_number += 1;
        let number = self.task_number;
        let tcb = self.tasks.linked_mut(handle);
        tcb.number = number;
        let priority = tcb.priority;
        trace::task_create(handle, tcb.name(), priority);

        match self.current {
            None => self.current = Some(handle),
            // Before the start the highest priority task created so far runs first.
            Some(current) if !self.running => {
                if self.tasks.linked(current).priority <= priority {
                    self.current = Some(handle);
                }
            }
            Some(_) => {}
        }

        self.add_to_ready(handle);
        if self.running {
            self.yield_if_preempts(handle);
        }
    }

    fn reclaim_stack(&mut self, stack: StackRegion) {
        if let StackStorage::Heap(words) = stack.into_storage() {
            self.allocator.release_stack(words);
        }
    }

    fn free_task(&mut self, handle: TaskHandle) {
        if let Some(tcb) = self.tasks.remove(handle) {
            self.allocator.release_control_block(size_of::<Tcb>());
            self.reclaim_stack(tcb.stack);
        }
    }

    // -------------------------------------------------------------------------
    // Scheduler control
    // -------------------------------------------------------------------------

    /// Create the idle task and hand control to the port.
    pub fn start_scheduler(&mut self) -> Result<(), TaskError> {
        if self.running {
            return Err(TaskError::AlreadyStarted);
        }
        let idle = self.create_task(
            idle_task,
            IDLE_TASK_NAME,
            P::MINIMAL_STACK_SIZE,
            0,
            IDLE_PRIORITY,
        )?;
        self.tasks.linked_mut(idle).flags.insert(TaskFlags::IDLE);
        self.idle = Some(idle);
        self.select_first_task();

        self.critical(|s| {
            s.next_unblock_time = MAX_DELAY;
            s.tick_count = INITIAL_TICK_COUNT;
            s.running = true;
        });
        #[cfg(feature = "generate-run-time-stats")]
        {
            self.total_run_time = 0;
            self.switched_in_time = 0;
        }
        if let Err(e) = self.port.start_scheduler() {
            self.running = false;
            return Err(e);
        }
        trace::scheduler_start(P::NAME, idle);
        if let Some(current) = self.current {
            trace::task_switched_in(current, self.tasks.linked(current).priority);
        }
        Ok(())
    }

    /// Stop the tick source. Tasks are left in place.
    pub fn end_scheduler(&mut self) {
        self.critical(|s| s.running = false);
        self.port.end_scheduler();
        trace::scheduler_end();
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        if !self.running {
            SchedulerState::NotStarted
        } else if self.suspended > 0 {
            SchedulerState::Suspended
        } else {
            SchedulerState::Running
        }
    }

    /// Stop context switches without masking interrupts. Calls nest.
    pub fn suspend_all(&mut self) {
        self.suspended += 1;
    }

    /// Undo one [`Scheduler::suspend_all`]. At depth zero, tasks readied in the
    /// meantime move to their ready lists and pended ticks are replayed.
    /// Returns whether a switch was requested.
    pub fn resume_all(&mut self) -> Result<bool, TaskError> {
        if self.suspended == 0 {
            return Err(TaskError::SchedulerNotSuspended);
        }
        let yielded = self.critical(|s| {
            s.suspended -= 1;
            if s.suspended > 0 {
                return false;
            }

            let mut moved = false;
            while let Some(task) = s.lists.pending_ready.pop_head(&mut s.tasks) {
                s.unlink(task, ItemKind::State);
                s.add_to_ready(task);
                if s.preempts(task) {
                    s.yield_pending = true;
                }
                moved = true;
            }
            if moved {
                s.reset_next_unblock_time();
            }

            while s.pended_ticks > 0 {
                if s.tick_locked() {
                    s.yield_pending = true;
                }
                s.pended_ticks -= 1;
            }

            if s.yield_pending && s.running && CONFIG.use_preemption {
                s.port.request_switch();
                return true;
            }
            false
        });
        Ok(yielded)
    }

    // -------------------------------------------------------------------------
    // Tick handling
    // -------------------------------------------------------------------------

    /// Called by the port's tick interrupt. Returns whether a switch is required.
    pub fn increment_tick(&mut self) -> bool {
        self.isr_critical(|s| s.tick_locked())
    }

    fn tick_locked(&mut self) -> bool {
        if self.suspended > 0 {
            self.pended_ticks += 1;
            return false;
        }

        let mut switch_required = false;
        let now = self.tick_count.wrapping_add(1);
        self.tick_count = now;
        trace::task_increment_tick(now);

        if now == 0 {
            self.switch_delayed_lists();
        }

        if now >= self.next_unblock_time {
            loop {
                let Some(task) = self.lists.delayed().head() else {
                    self.next_unblock_time = MAX_DELAY;
                    break;
                };
                let wake = self.tasks.item(task, ItemKind::State).value;
                if now < wake {
                    self.next_unblock_time = wake;
                    break;
                }
                self.unlink(task, ItemKind::State);
                self.detach_event(task);
                self.tasks.linked_mut(task).block_outcome = Some(BlockOutcome::TimedOut);
                self.add_to_ready(task);
                if CONFIG.use_preemption && self.preempts(task) {
                    switch_required = true;
                }
            }
        }

        if CONFIG.use_preemption && CONFIG.use_time_slicing {
            if let Some(current) = self.current.and_then(|h| self.tasks.get(h)) {
                if self.lists.ready[current.priority as usize].len() > 1 {
                    switch_required = true;
                }
            }
        }

        if CONFIG.use_preemption && self.yield_pending {
            switch_required = true;
        }
        switch_required
    }

    /// Advance the tick count after a tickless idle period.
    pub fn step_tick(&mut self, ticks: Tick) {
        let target = self
            .tick_count
            .checked_add(ticks)
            .filter(|t| *t <= self.next_unblock_time);
        debug_assert!(target.is_some(), "stepped past the next unblock time");
        self.tick_count = target.unwrap_or(self.next_unblock_time);
    }

    pub fn tick_count(&self) -> Tick {
        self.tick_count
    }

    /// Tick count from interrupt context.
    pub fn tick_count_from_isr(&self) -> Tick {
        let saved = self.port.set_interrupt_mask_from_isr();
        let tick = self.tick_count;
        self.port.clear_interrupt_mask_from_isr(saved);
        tick
    }

    /// Ticks counted while the scheduler was suspended.
    pub fn pended_ticks(&self) -> Tick {
        self.pended_ticks
    }

    fn switch_delayed_lists(&mut self) {
        if !self.lists.delayed().is_empty() {
            fatal(FatalError::ListCorrupted);
        }
        self.lists.current_delayed = 1 - self.lists.current_delayed;
        self.num_overflows = self.num_overflows.wrapping_add(1);
        trace::delayed_lists_switched(self.num_overflows);
        self.reset_next_unblock_time();
    }

    fn reset_next_unblock_time(&mut self) {
        self.next_unblock_time = self
            .lists
            .delayed()
            .head_value(&self.tasks)
            .unwrap_or(MAX_DELAY);
    }

    // -------------------------------------------------------------------------
    // Context switching
    // -------------------------------------------------------------------------

    /// Pick the task to run next. Called by the port's switch handler.
    ///
    /// With the scheduler suspended the switch is recorded as pending and the
    /// current task is kept.
    pub fn switch_context(&mut self) -> Option<TaskHandle> {
        if self.suspended > 0 {
            self.yield_pending = true;
            return self.current;
        }
        self.yield_pending = false;

        if let Some(current) = self.current {
            trace::task_switched_out(current);
            self.check_for_stack_overflow(current);
        }

        #[cfg(feature = "generate-run-time-stats")]
        {
            let now = self.port.run_time_counter();
            if now > self.switched_in_time {
                let spent = now - self.switched_in_time;
                if let Some(tcb) = self.current.and_then(|h| self.tasks.get_mut(h)) {
                    tcb.run_time = tcb.run_time.wrapping_add(spent);
                }
            }
            self.total_run_time = now;
            self.switched_in_time = now;
        }

        self.select_next_task();

        if let Some(current) = self.current {
            trace::task_switched_in(current, self.tasks.linked(current).priority);
        }
        self.current
    }

    /// Make the head of the highest non-empty ready list current, rotating
    /// the list first when the current task is at its head.
    fn select_next_task(&mut self) {
        let Some(top) = self.ready_index.highest() else {
            return;
        };
        let list = &mut self.lists.ready[top as usize];
        if list.len() > 1 && list.head() == self.current {
            list.rotate(&mut self.tasks);
        }
        self.current = list.head();
    }

    /// Pre-start priority changes, resumes and deletions leave `current`
    /// alone. Settle on the highest ready level without rotating it.
    fn select_first_task(&mut self) {
        let Some(top) = self.ready_index.highest() else {
            return;
        };
        let on_top = self
            .current
            .and_then(|h| self.tasks.get(h))
            .is_some_and(|t| t.state_item.container == Some(ListId::Ready(top as u8)));
        if !on_top {
            self.current = self.lists.ready[top as usize].head();
        }
    }

    fn check_for_stack_overflow(&self, handle: TaskHandle) {
        let Some(tcb) = self.tasks.get(handle) else {
            return;
        };
        let result = match CONFIG.check_for_stack_overflow {
            StackOverflowCheck::Disabled => Ok(()),
            StackOverflowCheck::Pointer => tcb.stack.check_pointer(tcb.top_of_stack),
            StackOverflowCheck::PointerAndGuard => tcb.stack.check(tcb.top_of_stack),
        };
        if result.is_err() {
            trace::stack_overflow(handle, tcb.name());
            if let Some(hook) = self.hooks.stack_overflow {
                hook(handle, tcb.name());
            }
            fatal(FatalError::StackOverflow);
        }
    }

    /// Ask the port for a switch.
    pub fn yield_now(&mut self) -> Result<(), TaskError> {
        self.running_task()?;
        self.port.request_switch();
        Ok(())
    }

    pub(crate) fn yield_within_api(&self) {
        if self.running && CONFIG.use_preemption {
            self.port.request_switch();
        }
    }

    /// Whether `task` may displace the current task.
    pub(crate) fn preempts(&self, task: TaskHandle) -> bool {
        match self.current.and_then(|h| self.tasks.get(h)) {
            Some(current) => self.tasks.linked(task).priority >= current.priority,
            None => true,
        }
    }

    pub(crate) fn yield_if_preempts(&mut self, task: TaskHandle) {
        if Some(task) != self.current && self.preempts(task) {
            self.yield_within_api();
        }
    }

    /// A switch was requested while the scheduler was suspended.
    pub fn yield_pending(&self) -> bool {
        self.yield_pending
    }

    // -------------------------------------------------------------------------
    // List helpers
    // -------------------------------------------------------------------------

    pub(crate) fn add_to_ready(&mut self, task: TaskHandle) {
        let priority = self.tasks.linked(task).priority;
        trace::moved_task_to_ready_state(task, priority);
        self.ready_index.record(priority);
        self.lists.ready[priority as usize].insert_end(&mut self.tasks, task);
    }

    /// Remove `task`'s `kind` item from whatever list holds it.
    pub(crate) fn unlink(&mut self, task: TaskHandle, kind: ItemKind) -> Option<ListId> {
        let id = self.tasks.item(task, kind).container?;
        let Some(list) = self.lists.get_mut(id) else {
            fatal(FatalError::ListCorrupted);
        };
        let remaining = list.remove(&mut self.tasks, task);
        if let ListId::Ready(priority) = id {
            if remaining == 0 {
                self.ready_index.reset(priority as Priority);
            }
        }
        Some(id)
    }

    /// Take `task` off its event list. A mutex whose waiter leaves has its
    /// holder's inherited priority recomputed.
    pub(crate) fn detach_event(&mut self, task: TaskHandle) -> Option<ListId> {
        let id = self.unlink(task, ItemKind::Event)?;
        #[cfg(feature = "use-mutexes")]
        if let ListId::Event(ev) = id {
            self.waiter_left(ev);
        }
        Some(id)
    }

    /// Ready `task`, or park it on the pending ready list while the scheduler
    /// is suspended. Returns whether it should preempt the current task.
    pub(crate) fn make_ready(&mut self, task: TaskHandle) -> bool {
        if self.suspended == 0 {
            self.unlink(task, ItemKind::State);
            self.add_to_ready(task);
        } else {
            self.lists.pending_ready.insert_end(&mut self.tasks, task);
            trace::post_moved_task_to_ready_state_from_isr(task);
        }
        let preempts = CONFIG.use_preemption && self.preempts(task);
        if preempts {
            self.yield_pending = true;
        }
        preempts
    }

    /// Record `outcome` for a blocked task and ready it.
    pub(crate) fn wake(&mut self, task: TaskHandle, outcome: BlockOutcome) -> bool {
        self.tasks.linked_mut(task).block_outcome = Some(outcome);
        self.make_ready(task)
    }

    /// Move the current task from its ready list to a delayed list, or to the
    /// suspended list for an indefinite wait.
    pub(crate) fn add_current_to_delayed_list(
        &mut self,
        task: TaskHandle,
        ticks: Tick,
        can_block_indefinitely: bool,
    ) {
        let now = self.tick_count;
        self.tasks.linked_mut(task).flags.remove(TaskFlags::DELAY_ABORTED);
        self.unlink(task, ItemKind::State);

        if ticks == MAX_DELAY && can_block_indefinitely {
            self.lists.suspended.insert_end(&mut self.tasks, task);
            return;
        }

        let wake = now.wrapping_add(ticks);
        self.tasks.linked_mut(task).state_item.value = wake;
        if wake < now {
            self.lists.overflow_delayed_mut().insert(&mut self.tasks, task);
        } else {
            self.lists.delayed_mut().insert(&mut self.tasks, task);
            if wake < self.next_unblock_time {
                self.next_unblock_time = wake;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Delays
    // -------------------------------------------------------------------------

    /// Block the current task for `ticks` ticks. Zero only yields.
    pub fn delay(&mut self, ticks: Tick) -> Result<(), TaskError> {
        let task = self.blocking_task()?;
        if ticks > 0 {
            self.critical(|s| {
                trace::task_delay(task, ticks);
                s.tasks.linked_mut(task).block_outcome = None;
                s.add_current_to_delayed_list(task, ticks, false);
            });
        }
        self.yield_within_api();
        Ok(())
    }

    /// Block until `previous_wake + increment` for fixed-frequency execution.
    /// `previous_wake` is advanced. Returns whether the task was delayed; a
    /// wake time already in the past does not delay.
    pub fn delay_until(&mut self, previous_wake: &mut Tick, increment: Tick) -> Result<bool, TaskError> {
        debug_assert!(increment > 0);
        let task = self.blocking_task()?;
        let delayed = self.critical(|s| {
            let now = s.tick_count;
            let wake = previous_wake.wrapping_add(increment);
            let should_delay = if now < *previous_wake {
                // The tick count wrapped since the last wake.
                wake < *previous_wake && wake > now
            } else {
                wake < *previous_wake || wake > now
            };
            *previous_wake = wake;
            if should_delay {
                trace::task_delay_until(task, wake);
                s.tasks.linked_mut(task).block_outcome = None;
                s.add_current_to_delayed_list(task, wake.wrapping_sub(now), false);
            }
            should_delay
        });
        self.yield_within_api();
        Ok(delayed)
    }

    /// Force a blocked task back to ready. Its block ends with
    /// [`BlockOutcome::Aborted`]. Returns `false` if it was not blocked.
    #[cfg(feature = "abort-delay")]
    pub fn abort_delay(&mut self, handle: TaskHandle) -> Result<bool, TaskError> {
        let handle = self.resolve(Some(handle))?;
        if self.task_state(handle)? != TaskState::Blocked {
            return Ok(false);
        }
        let preempts = self.critical(|s| {
            s.detach_event(handle);
            #[cfg(feature = "task-notifications")]
            s.cancel_notification_waits(handle);
            s.tasks.linked_mut(handle).flags.insert(TaskFlags::DELAY_ABORTED);
            trace::task_delay_aborted(handle);
            s.wake(handle, BlockOutcome::Aborted)
        });
        if preempts && self.suspended == 0 {
            self.yield_within_api();
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------------

    /// Capture the current time for a later [`Scheduler::check_for_timeout`].
    pub fn set_timeout_state(&self) -> TimeOut {
        TimeOut {
            overflow_count: self.num_overflows,
            time_on_entering: self.tick_count,
        }
    }

    /// Whether a wait of `ticks_to_wait` that began at `timeout` has expired.
    /// Otherwise `ticks_to_wait` is reduced by the elapsed time and `timeout`
    /// restarts from now. An aborted wait counts as expired.
    pub fn check_for_timeout(&mut self, timeout: &mut TimeOut, ticks_to_wait: &mut Tick) -> bool {
        let now = self.tick_count;
        let elapsed = now.wrapping_sub(timeout.time_on_entering);

        #[cfg(feature = "abort-delay")]
        if let Some(tcb) = self.current.and_then(|h| self.tasks.get_mut(h)) {
            if tcb.flags.contains(TaskFlags::DELAY_ABORTED) {
                tcb.flags.remove(TaskFlags::DELAY_ABORTED);
                return true;
            }
        }

        if *ticks_to_wait == MAX_DELAY {
            return false;
        }
        if self.num_overflows != timeout.overflow_count && now >= timeout.time_on_entering {
            // A full wrap has passed.
            *ticks_to_wait = 0;
            return true;
        }
        if elapsed < *ticks_to_wait {
            *ticks_to_wait -= elapsed;
            *timeout = self.set_timeout_state();
            false
        } else {
            *ticks_to_wait = 0;
            true
        }
    }

    // -------------------------------------------------------------------------
    // Event lists
    // -------------------------------------------------------------------------

    /// Allocate a priority-ordered list of waiting tasks.
    pub fn create_event_list(&mut self) -> Result<EventListId, TaskError> {
        self.lists.create_event()
    }

    /// Free an event list. Fails while tasks wait on it.
    pub fn delete_event_list(&mut self, id: EventListId) -> Result<(), TaskError> {
        self.lists.delete_event(id)
    }

    /// Waiters in wake order.
    pub fn event_list_waiters(&self, id: EventListId) -> Result<Vec<TaskHandle>, TaskError> {
        let list = self.lists.event(id).ok_or(TaskError::InvalidHandle)?;
        Ok(list.iter(&self.tasks).collect())
    }

    /// Block the current task on `id` for at most `timeout` ticks
    /// ([`MAX_DELAY`] waits forever). A switch is requested; once the task
    /// runs again [`Scheduler::take_block_outcome`] tells how the wait ended.
    /// A zero timeout records [`BlockOutcome::TimedOut`] without blocking.
    pub fn block_on_event_list(&mut self, id: EventListId, timeout: Tick) -> Result<(), TaskError> {
        let task = self.blocking_task()?;
        if self.lists.event(id).is_none() {
            return Err(TaskError::InvalidHandle);
        }
        if self.tasks.linked(task).event_item.is_linked() {
            return Err(TaskError::AlreadyWaiting);
        }
        if timeout == 0 {
            self.tasks.linked_mut(task).block_outcome = Some(BlockOutcome::TimedOut);
            return Ok(());
        }
        self.critical(|s| s.place_on_event_list(task, id, timeout));
        self.yield_within_api();
        Ok(())
    }

    pub(crate) fn place_on_event_list(&mut self, task: TaskHandle, id: EventListId, timeout: Tick) {
        let tcb = self.tasks.linked_mut(task);
        tcb.block_outcome = None;
        tcb.event_item.value = event_item_value(tcb.priority);
        match self.lists.event_mut(id) {
            Some(list) => list.insert(&mut self.tasks, task),
            None => fatal(FatalError::ListCorrupted),
        }
        trace::blocking_on_event_list(task, timeout);
        self.add_current_to_delayed_list(task, timeout, true);
    }

    /// Wake the highest priority waiter of `id`. Returns whether one was woken.
    pub fn unblock_highest_priority(&mut self, id: EventListId) -> Result<bool, TaskError> {
        let woken = self.critical(|s| s.remove_from_event_list(id))?;
        match woken {
            Some(preempts) => {
                if preempts && self.suspended == 0 {
                    self.yield_within_api();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Interrupt-context [`Scheduler::unblock_highest_priority`]. Returns
    /// whether the port should switch on interrupt exit.
    pub fn unblock_highest_priority_from_isr(&mut self, id: EventListId) -> Result<bool, TaskError> {
        let woken = self.isr_critical(|s| s.remove_from_event_list(id))?;
        Ok(woken.unwrap_or(false))
    }

    fn remove_from_event_list(&mut self, id: EventListId) -> Result<Option<bool>, TaskError> {
        let head = self.lists.event(id).ok_or(TaskError::InvalidHandle)?.head();
        let Some(task) = head else {
            return Ok(None);
        };
        self.detach_event(task);
        Ok(Some(self.wake(task, BlockOutcome::Woken)))
    }

    /// Consume how the current task's most recent block ended. `None` while
    /// no outcome is recorded.
    pub fn take_block_outcome(&mut self) -> Result<Option<BlockOutcome>, TaskError> {
        let task = self.current.ok_or(TaskError::SchedulerNotRunning)?;
        Ok(self.tasks.linked_mut(task).block_outcome.take())
    }

    /// How the most recent block of `handle` ended, without consuming it.
    pub fn block_outcome(&self, handle: TaskHandle) -> Result<Option<BlockOutcome>, TaskError> {
        Ok(self.tcb(handle)?.block_outcome)
    }

    // -------------------------------------------------------------------------
    // Suspend and resume
    // -------------------------------------------------------------------------

    /// Suspend `handle`, or the current task for `None`. A blocked task
    /// leaves its wait; its block ends as timed out.
    pub fn suspend_task(&mut self, handle: Option<TaskHandle>) -> Result<(), TaskError> {
        let task = self.resolve(handle)?;
        if Some(task) == self.idle {
            return Err(TaskError::IdleTaskProtected);
        }
        let is_current = Some(task) == self.current;
        if is_current && self.running && self.suspended > 0 {
            return Err(TaskError::SchedulerSuspended);
        }

        self.critical(|s| {
            trace::task_suspend(task);
            let was_blocked = matches!(s.task_state(task), Ok(TaskState::Blocked));
            s.unlink(task, ItemKind::State);
            s.detach_event(task);
            #[cfg(feature = "task-notifications")]
            s.cancel_notification_waits(task);
            if was_blocked {
                s.tasks.linked_mut(task).block_outcome = Some(BlockOutcome::TimedOut);
            }
            s.lists.suspended.insert_end(&mut s.tasks, task);
            if s.running {
                s.reset_next_unblock_time();
            }
        });

        if is_current {
            if self.running {
                self.yield_within_api();
            } else if self.lists.suspended.len() == self.tasks.len() {
                self.current = None;
            } else {
                self.select_next_task();
            }
        }
        Ok(())
    }

    /// Resume a suspended task. Returns `false` if it was not suspended.
    pub fn resume_task(&mut self, handle: TaskHandle) -> Result<bool, TaskError> {
        let task = self.resolve(Some(handle))?;
        if Some(task) == self.current || self.task_state(task)? != TaskState::Suspended {
            return Ok(false);
        }
        self.critical(|s| {
            trace::task_resume(task);
            s.unlink(task, ItemKind::State);
            s.add_to_ready(task);
        });
        self.yield_if_preempts(task);
        Ok(true)
    }

    /// Interrupt-context [`Scheduler::resume_task`]. Returns whether the port
    /// should switch on interrupt exit.
    pub fn resume_task_from_isr(&mut self, handle: TaskHandle) -> Result<bool, TaskError> {
        let task = self.resolve(Some(handle))?;
        if self.task_state(task)? != TaskState::Suspended {
            return Ok(false);
        }
        Ok(self.isr_critical(|s| {
            trace::task_resume_from_isr(task);
            s.make_ready(task)
        }))
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Delete `handle`, or the current task for `None`. A running task that
    /// deletes itself is freed later by the idle task.
    pub fn delete_task(&mut self, handle: Option<TaskHandle>) -> Result<(), TaskError> {
        let task = self.resolve(handle)?;
        if Some(task) == self.idle {
            return Err(TaskError::IdleTaskProtected);
        }
        let is_current = Some(task) == self.current;
        if is_current && self.running && self.suspended > 0 {
            return Err(TaskError::SchedulerSuspended);
        }

        let deferred = self.critical(|s| {
            s.unlink(task, ItemKind::State);
            s.detach_event(task);
            #[cfg(feature = "use-mutexes")]
            s.release_mutexes_of_deleted(task);
            s.task_number += 1;
            trace::task_delete(task);
            if is_current && s.running {
                s.lists.waiting_termination.insert_end(&mut s.tasks, task);
                s.deleted_awaiting_cleanup += 1;
                true
            } else {
                s.reset_next_unblock_time();
                false
            }
        });

        if deferred {
            self.yield_within_api();
        } else {
            self.free_task(task);
            if is_current {
                self.current = None;
                self.select_next_task();
            }
        }
        Ok(())
    }

    /// Free tasks that deleted themselves. Returns how many were freed.
    pub fn check_tasks_waiting_termination(&mut self) -> usize {
        let mut freed = 0;
        while self.deleted_awaiting_cleanup > 0 {
            let next = self.critical(|s| {
                let task = s.lists.waiting_termination.pop_head(&mut s.tasks);
                if task.is_some() {
                    s.deleted_awaiting_cleanup -= 1;
                }
                task
            });
            let Some(task) = next else {
                break;
            };
            self.free_task(task);
            freed += 1;
        }
        freed
    }

    /// One pass of the idle task's loop.
    pub fn idle_iteration(&mut self) {
        self.check_tasks_waiting_termination();
        if let Some(hook) = self.hooks.idle {
            hook();
        }
    }

    // -------------------------------------------------------------------------
    // Priorities
    // -------------------------------------------------------------------------

    /// Change the base priority of `handle`, or of the current task for
    /// `None`. An inherited priority above the new base is kept.
    pub fn set_priority(&mut self, handle: Option<TaskHandle>, priority: Priority) -> Result<(), TaskError> {
        let task = self.resolve(handle)?;
        let priority = clamp_priority(priority);
        self.critical(|s| {
            let tcb = s.tasks.linked_mut(task);
            if tcb.base_priority == priority {
                return;
            }
            tcb.base_priority = priority;
            trace::task_priority_set(task, priority);
            let target = s.justified_priority(task);
            s.change_effective_priority(task, target);
            #[cfg(feature = "use-mutexes")]
            if let Some(holder) = s.blocking_holder(task) {
                s.refresh_priority(holder);
            }
        });
        Ok(())
    }

    /// Effective priority of `handle`, or of the current task for `None`.
    pub fn priority(&self, handle: Option<TaskHandle>) -> Result<Priority, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).priority)
    }

    pub fn priority_from_isr(&self, handle: Option<TaskHandle>) -> Result<Priority, TaskError> {
        let saved = self.port.set_interrupt_mask_from_isr();
        let priority = self.priority(handle);
        self.port.clear_interrupt_mask_from_isr(saved);
        priority
    }

    /// Priority of `handle` absent inheritance.
    pub fn base_priority(&self, handle: Option<TaskHandle>) -> Result<Priority, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).base_priority)
    }

    /// The priority `task` should run at: its base priority, raised by any
    /// waiter of a mutex it holds.
    pub(crate) fn justified_priority(&self, task: TaskHandle) -> Priority {
        let base = self.tasks.linked(task).base_priority;
        #[cfg(feature = "use-mutexes")]
        if let Some(inherited) = self.inherited_priority(task) {
            return base.max(inherited);
        }
        base
    }

    /// Set the effective priority of `task`, keeping its ready list and event
    /// list positions consistent, and request a switch where needed.
    pub(crate) fn change_effective_priority(&mut self, task: TaskHandle, priority: Priority) {
        let tcb = self.tasks.linked(task);
        let old = tcb.priority;
        if old == priority {
            return;
        }
        let in_ready = matches!(tcb.state_item.container, Some(ListId::Ready(_)));
        let event_list = match tcb.event_item.container {
            Some(ListId::Event(ev)) => Some(ev),
            _ => None,
        };

        if in_ready {
            self.unlink(task, ItemKind::State);
            self.tasks.linked_mut(task).priority = priority;
            self.add_to_ready(task);
        } else {
            self.tasks.linked_mut(task).priority = priority;
        }

        if let Some(ev) = event_list {
            if let Some(list) = self.lists.event_mut(ev) {
                list.remove(&mut self.tasks, task);
                self.tasks.linked_mut(task).event_item.value = event_item_value(priority);
                list.insert(&mut self.tasks, task);
            }
        }

        if Some(task) == self.current {
            if priority < old {
                self.yield_within_api();
            }
        } else if in_ready && priority > old {
            self.yield_if_preempts(task);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn current(&self) -> Option<TaskHandle> {
        self.current
    }

    pub fn idle_task(&self) -> Option<TaskHandle> {
        self.idle
    }

    /// Live tasks, including those awaiting cleanup.
    pub fn number_of_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_name(&self, handle: Option<TaskHandle>) -> Result<TaskName, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).name)
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskHandle> {
        let name = TaskName::new(name);
        self.tasks.handles().find(|h| {
            self.tasks.get(*h).is_some_and(|t| {
                t.name == name && t.state_item.container != Some(ListId::WaitingTermination)
            })
        })
    }

    pub fn highest_ready_priority(&self) -> Option<Priority> {
        self.ready_index.highest()
    }

    /// Tasks of one ready list, head first.
    pub fn ready_tasks(&self, priority: Priority) -> Vec<TaskHandle> {
        match self.lists.ready.get(priority as usize) {
            Some(list) => list.iter(&self.tasks).collect(),
            None => Vec::new(),
        }
    }

    pub fn task_state(&self, handle: TaskHandle) -> Result<TaskState, TaskError> {
        let tcb = self.tcb(handle)?;
        if tcb.event_item.container == Some(ListId::PendingReady) {
            return Ok(TaskState::Ready);
        }
        Ok(match tcb.state_item.container {
            Some(ListId::Ready(_)) if Some(handle) == self.current => TaskState::Running,
            Some(ListId::Ready(_)) => TaskState::Ready,
            Some(ListId::Delayed(_)) => TaskState::Blocked,
            Some(ListId::Suspended) => {
                if tcb.event_item.is_linked() || Self::waiting_notification(tcb) {
                    TaskState::Blocked
                } else {
                    TaskState::Suspended
                }
            }
            Some(ListId::WaitingTermination) | None => TaskState::Deleted,
            Some(ListId::PendingReady) | Some(ListId::Event(_)) => fatal(FatalError::ListCorrupted),
        })
    }

    #[cfg(feature = "task-notifications")]
    fn waiting_notification(tcb: &Tcb) -> bool {
        use crate::kernel::notify::NotifyState;
        tcb.notify.iter().any(|slot| slot.state == NotifyState::Waiting)
    }

    #[cfg(not(feature = "task-notifications"))]
    fn waiting_notification(_: &Tcb) -> bool {
        false
    }

    // -------------------------------------------------------------------------
    // Stacks
    // -------------------------------------------------------------------------

    /// Fewest stack words that have stayed unused since creation.
    pub fn stack_high_water_mark(&self, handle: Option<TaskHandle>) -> Result<usize, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).stack.high_water_mark())
    }

    /// Check the saved stack pointer and guard words of `handle` now.
    pub fn inspect_stack(&self, handle: TaskHandle) -> Result<Option<StackFault>, TaskError> {
        let tcb = self.tcb(handle)?;
        Ok(tcb.stack.check(tcb.top_of_stack).err())
    }

    /// Save the current task's stack pointer. Called by the port on switch-out.
    pub fn record_stack_pointer(&mut self, sp: usize) -> Result<(), TaskError> {
        let task = self.current.ok_or(TaskError::SchedulerNotRunning)?;
        self.tasks.linked_mut(task).top_of_stack = sp;
        Ok(())
    }

    /// Saved stack pointer of the current task, for the port's switch-in.
    pub fn current_stack_pointer(&self) -> Option<usize> {
        self.current
            .and_then(|h| self.tasks.get(h))
            .map(|t| t.top_of_stack)
    }

    /// Give the port access to a task's stack memory.
    pub fn with_stack<R>(
        &mut self,
        handle: TaskHandle,
        f: impl FnOnce(&mut StackRegion) -> R,
    ) -> Result<R, TaskError> {
        let tcb = self.tasks.get_mut(handle).ok_or(TaskError::InvalidHandle)?;
        Ok(f(&mut tcb.stack))
    }

    // -------------------------------------------------------------------------
    // Thread-local storage
    // -------------------------------------------------------------------------

    #[cfg(feature = "thread-local-storage")]
    pub fn set_thread_local(
        &mut self,
        handle: Option<TaskHandle>,
        index: usize,
        value: usize,
    ) -> Result<(), TaskError> {
        let task = self.resolve(handle)?;
        let slot = self
            .tasks
            .linked_mut(task)
            .thread_local
            .get_mut(index)
            .ok_or(TaskError::InvalidStorageIndex)?;
        *slot = value;
        Ok(())
    }

    #[cfg(feature = "thread-local-storage")]
    pub fn thread_local(&self, handle: Option<TaskHandle>, index: usize) -> Result<usize, TaskError> {
        let task = self.resolve(handle)?;
        self.tasks
            .linked(task)
            .thread_local
            .get(index)
            .copied()
            .ok_or(TaskError::InvalidStorageIndex)
    }

    // -------------------------------------------------------------------------
    // Application task tag
    // -------------------------------------------------------------------------

    #[cfg(feature = "application-task-tag")]
    pub fn set_application_task_tag(
        &mut self,
        handle: Option<TaskHandle>,
        tag: Option<TaskHookFunction>,
    ) -> Result<(), TaskError> {
        let task = self.resolve(handle)?;
        self.critical(|s| s.tasks.linked_mut(task).tag = tag);
        Ok(())
    }

    #[cfg(feature = "application-task-tag")]
    pub fn application_task_tag(
        &self,
        handle: Option<TaskHandle>,
    ) -> Result<Option<TaskHookFunction>, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).tag)
    }

    /// Run the tag of `handle` with `param`. `None` if no tag is set.
    #[cfg(feature = "application-task-tag")]
    pub fn call_application_task_hook(
        &self,
        handle: Option<TaskHandle>,
        param: usize,
    ) -> Result<Option<BaseType>, TaskError> {
        Ok(self.application_task_tag(handle)?.map(|hook| hook(param)))
    }

    // -------------------------------------------------------------------------
    // Run-time statistics
    // -------------------------------------------------------------------------

    #[cfg(feature = "generate-run-time-stats")]
    pub fn run_time_counter(&self, handle: Option<TaskHandle>) -> Result<RunTimeCounter, TaskError> {
        let task = self.resolve(handle)?;
        Ok(self.tasks.linked(task).run_time)
    }

    /// Share of the total run time spent in `handle`, in percent.
    #[cfg(feature = "generate-run-time-stats")]
    pub fn run_time_percent(&self, handle: Option<TaskHandle>) -> Result<RunTimeCounter, TaskError> {
        let run_time = self.run_time_counter(handle)?;
        let total = self.total_run_time / 100;
        Ok(if total > 0 { run_time / total } else { 0 })
    }

    #[cfg(feature = "generate-run-time-stats")]
    pub fn total_run_time(&self) -> RunTimeCounter {
        self.total_run_time
    }

    // -------------------------------------------------------------------------
    // Status snapshots
    // -------------------------------------------------------------------------

    /// Tag `handle` with a number of the application's choosing for trace
    /// tools. Independent of the creation number.
    #[cfg(feature = "trace-facility")]
    pub fn set_task_number(&mut self, handle: TaskHandle, number: UBaseType) -> Result<(), TaskError> {
        let tcb = self.tasks.get_mut(handle).ok_or(TaskError::InvalidHandle)?;
        tcb.trace_number = number;
        Ok(())
    }

    #[cfg(feature = "trace-facility")]
    pub fn task_number(&self, handle: TaskHandle) -> Result<UBaseType, TaskError> {
        Ok(self.tcb(handle)?.trace_number)
    }

    #[cfg(feature = "trace-facility")]
    pub fn task_info(&self, handle: TaskHandle) -> Result<TaskStatus, TaskError> {
        let tcb = self.tcb(handle)?;
        Ok(TaskStatus {
            handle,
            name: tcb.name,
            number: tcb.number,
            state: self.task_state(handle)?,
            current_priority: tcb.priority,
            base_priority: tcb.base_priority,
            #[cfg(feature = "generate-run-time-stats")]
            run_time: tcb.run_time,
            #[cfg(not(feature = "generate-run-time-stats"))]
            run_time: 0,
            stack_high_water_mark: tcb.stack.high_water_mark(),
        })
    }

    /// Status of every live task, in creation slot order.
    #[cfg(feature = "trace-facility")]
    pub fn system_state(&self) -> Vec<TaskStatus> {
        self.tasks
            .handles()
            .filter_map(|h| self.task_info(h).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::HostPort;

    fn entry(_: usize) {}

    fn scheduler() -> Scheduler<HostPort> {
        Scheduler::with_global_allocator(HostPort::new())
    }

    #[test]
    fn ready_index_tracks_highest_level() {
        let mut index = ReadyIndex::new();
        assert_eq!(index.highest(), None);
        index.record(3);
        index.record(9);
        assert_eq!(index.highest(), Some(9));
        index.reset(9);
        assert_eq!(index.highest(), Some(3));
        assert!(index.contains(3));
        assert!(!index.contains(9));
    }

    #[test]
    fn event_item_values_sort_high_priority_first() {
        assert!(event_item_value(9) < event_item_value(1));
        assert_eq!(event_item_value(0), MAX_PRIORITIES as Tick);
    }

    #[test]
    fn highest_task_created_before_start_runs_first() {
        let mut s = scheduler();
        let a = s.create_task(entry, "A", 64, 0, 2).unwrap();
        let c = s.create_task(entry, "C", 64, 0, 5).unwrap();
        let _b = s.create_task(entry, "B", 64, 0, 2).unwrap();
        assert_eq!(s.current(), Some(c));
        s.start_scheduler().unwrap();
        assert_eq!(s.task_state(c), Ok(TaskState::Running));
        assert_eq!(s.task_state(a), Ok(TaskState::Ready));
        assert_eq!(s.number_of_tasks(), 4);
    }

    #[test]
    fn empty_ready_level_clears_bitmap() {
        let mut s = scheduler();
        let a = s.create_task(entry, "A", 64, 0, 7).unwrap();
        assert_eq!(s.highest_ready_priority(), Some(7));
        s.delete_task(Some(a)).unwrap();
        assert_eq!(s.highest_ready_priority(), None);
        assert_eq!(s.current(), None);
    }

    #[test]
    fn discarded_event_list_is_freed() {
        let mut s = scheduler();
        let id = s.create_event_list().unwrap();
        s.lists.discard_event(id);
        assert_eq!(s.event_list_waiters(id), Err(TaskError::InvalidHandle));
        assert_ne!(s.create_event_list().unwrap(), id);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "rollback")]
    fn failed_rollback_is_not_silent() {
        let mut s = scheduler();
        let id = s.create_event_list().unwrap();
        s.lists.discard_event(id);
        s.lists.discard_event(id);
    }

    #[test]
    fn start_settles_on_highest_ready_level() {
        let mut s = scheduler();
        let a = s.create_task(entry, "A", 64, 0, 3).unwrap();
        let b = s.create_task(entry, "B", 64, 0, 2).unwrap();
        s.set_priority(Some(a), 1).unwrap();
        assert_eq!(s.current(), Some(a));
        s.start_scheduler().unwrap();
        assert_eq!(s.current(), Some(b));
        assert_eq!(s.task_state(b), Ok(TaskState::Running));
        assert_eq!(s.task_state(a), Ok(TaskState::Ready));
    }

    #[test]
    fn stack_too_small_is_rejected() {
        let mut s = scheduler();
        let words = STACK_GUARD_WORDS + HostPort::INITIAL_FRAME_WORDS;
        assert_eq!(
            s.create_task(entry, "tiny", words, 0, 1),
            Err(TaskError::StackTooSmall)
        );
        assert_eq!(s.number_of_tasks(), 0);
    }

    #[test]
    fn event_list_delete_requires_no_waiters() {
        let mut s = scheduler();
        let id = s.create_event_list().unwrap();
        s.delete_event_list(id).unwrap();
        assert_eq!(s.delete_event_list(id), Err(TaskError::InvalidHandle));
        let again = s.create_event_list().unwrap();
        assert_ne!(again, id);
        assert_eq!(s.event_list_waiters(id), Err(TaskError::InvalidHandle));
    }

    #[test]
    fn blocking_needs_running_scheduler() {
        let mut s = scheduler();
        s.create_task(entry, "A", 64, 0, 1).unwrap();
        assert_eq!(s.delay(5), Err(TaskError::SchedulerNotRunning));
        s.start_scheduler().unwrap();
        s.suspend_all();
        assert_eq!(s.delay(5), Err(TaskError::SchedulerSuspended));
        assert_eq!(s.resume_all(), Ok(false));
        assert_eq!(s.resume_all(), Err(TaskError::SchedulerNotSuspended));
    }

    #[test]
    fn critical_sections_are_balanced() {
        let mut s = scheduler();
        let a = s.create_task(entry, "A", 64, 0, 1).unwrap();
        s.start_scheduler().unwrap();
        s.delay(3).unwrap();
        s.switch_context();
        s.suspend_task(Some(a)).unwrap();
        s.resume_task(a).unwrap();
        assert_eq!(s.port().critical_nesting(), 0);
        assert!(!s.port().interrupts_masked());
    }
}
