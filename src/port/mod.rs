/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module provides the port layer abstraction. The port layer
 * contains hardware-specific implementations of:
 * - Critical sections (interrupt enable/disable)
 * - Context switch requests
 * - Stack initialization
 * - Scheduler start/stop
 *
 * A port is a type implementing [`Port`], and the scheduler is generic
 * over it.
 */

//! Port Layer
//!
//! Hardware abstraction consumed by the kernel. A port saves the outgoing
//! context, calls [`Scheduler::record_stack_pointer`] and
//! [`Scheduler::switch_context`], then restores the context found at
//! [`Scheduler::current_stack_pointer`].
//!
//! ## Available Ports
//!
//! - [`HostPort`] - runs the kernel logic on a development machine; switch
//!   requests are latched for the caller to act on.
//!
//! [`Scheduler::record_stack_pointer`]: crate::Scheduler::record_stack_pointer
//! [`Scheduler::switch_context`]: crate::Scheduler::switch_context
//! [`Scheduler::current_stack_pointer`]: crate::Scheduler::current_stack_pointer

mod host;

pub use host::HostPort;

use crate::kernel::stack::{StackFault, StackRegion};
use crate::types::*;

/// Direction in which a task's stack grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowth {
    /// Towards lower addresses (most common).
    Descending,
    /// Towards higher addresses.
    Ascending,
}

/// Services the kernel needs from the target.
pub trait Port: Send {
    /// Architecture name for diagnostics.
    const NAME: &'static str;
    /// Stack growth direction.
    const STACK_GROWTH: StackGrowth;
    /// Byte alignment requirement for stacks.
    const BYTE_ALIGNMENT: usize;
    /// Stack size of the idle task (words).
    const MINIMAL_STACK_SIZE: usize;
    /// Words consumed by the initial context frame.
    const INITIAL_FRAME_WORDS: usize;

    /// Enter a critical section (mask the tick and kernel interrupts).
    fn enter_critical(&self);

    /// Leave a critical section; interrupts return when nesting reaches zero.
    fn exit_critical(&self);

    /// Mask interrupts from an ISR and return the previous mask.
    fn set_interrupt_mask_from_isr(&self) -> UBaseType;

    /// Restore the mask saved by [`Port::set_interrupt_mask_from_isr`].
    fn clear_interrupt_mask_from_isr(&self, saved: UBaseType);

    /// Request a context switch (PendSV or equivalent).
    fn request_switch(&self);

    /// Request a switch on interrupt exit if `switch_required`.
    fn yield_from_isr(&self, switch_required: bool) {
        if switch_required {
            self.request_switch();
        }
    }

    /// Build the first context frame of a task and return its stack pointer.
    fn initialise_stack(
        &self,
        stack: &mut StackRegion,
        entry: TaskFunction,
        param: usize,
    ) -> Result<usize, StackFault>;

    /// Start the tick source and the first task.
    fn start_scheduler(&self) -> Result<(), TaskError>;

    /// Stop the tick source.
    fn end_scheduler(&self);

    /// Whether the caller runs in interrupt context.
    fn is_inside_interrupt(&self) -> bool;

    /// Time base for run-time statistics.
    fn run_time_counter(&self) -> RunTimeCounter {
        0
    }
}
