/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module is the Rust equivalent of FreeRTOSConfig.h.
 * Configuration is done via:
 * - Cargo features for capability toggles
 * - Constants in this module for numeric values
 */

//! Kernel Configuration
//!
//! Numeric limits are plain constants. Capability toggles come from Cargo
//! features and are gathered in [`CONFIG`] so kernel code can branch on them
//! with ordinary `if` statements; fields that change the task layout are
//! additionally gated with `#[cfg]`.

use crate::types::*;
use static_assertions::const_assert;

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Number of priority levels. Priorities run from 0 to `MAX_PRIORITIES - 1`.
pub const MAX_PRIORITIES: usize = 16;

/// Stack size for the idle task when the port does not ask for more (words).
pub const MINIMAL_STACK_SIZE: usize = 128;

/// Tick rate in Hz
pub const TICK_RATE_HZ: u32 = 1000;

/// Maximum length of task names, including the terminator slot.
pub const MAX_TASK_NAME_LEN: usize = 16;

/// Initial tick count value
pub const INITIAL_TICK_COUNT: Tick = 0;

/// Idle task priority (always lowest)
pub const IDLE_PRIORITY: Priority = 0;

/// Name given to the idle task.
pub const IDLE_TASK_NAME: &str = "IDLE";

// =============================================================================
// Memory Allocation
// =============================================================================

/// Byte budget of [`crate::memory::BoundedStacks`].
pub const TOTAL_HEAP_SIZE: usize = 16 * 1024;

// =============================================================================
// Optional Features
// =============================================================================

/// Number of notification slots per task.
pub const TASK_NOTIFICATION_ARRAY_ENTRIES: usize = 2;

/// Number of thread local storage slots per task.
#[cfg(feature = "thread-local-storage")]
pub const NUM_THREAD_LOCAL_STORAGE_POINTERS: usize = 5;
#[cfg(not(feature = "thread-local-storage"))]
pub const NUM_THREAD_LOCAL_STORAGE_POINTERS: usize = 0;

// =============================================================================
// Stack Checking
// =============================================================================

/// Byte value used to fill task stacks for high water mark detection.
pub const STACK_FILL_BYTE: u8 = 0xA5;

/// Byte value of the guard words placed beyond the working region.
pub const STACK_GUARD_BYTE: u8 = 0x5A;

/// Number of guard words at the far boundary of every stack.
pub const STACK_GUARD_WORDS: usize = 4;

/// Stack overflow checking level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOverflowCheck {
    /// No checks at context switch.
    Disabled,
    /// Saved stack pointer must lie inside the working region.
    Pointer,
    /// Pointer check plus the guard words must be intact.
    PointerAndGuard,
}

#[cfg(all(
    feature = "stack-overflow-check",
    not(feature = "stack-overflow-check-pointer")
))]
pub const CHECK_FOR_STACK_OVERFLOW: StackOverflowCheck = StackOverflowCheck::PointerAndGuard;
#[cfg(feature = "stack-overflow-check-pointer")]
pub const CHECK_FOR_STACK_OVERFLOW: StackOverflowCheck = StackOverflowCheck::Pointer;
#[cfg(not(feature = "stack-overflow-check"))]
pub const CHECK_FOR_STACK_OVERFLOW: StackOverflowCheck = StackOverflowCheck::Disabled;

// =============================================================================
// Collected Configuration
// =============================================================================

/// The build-time configuration as one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_priorities: usize,
    pub use_preemption: bool,
    pub use_time_slicing: bool,
    pub use_mutexes: bool,
    pub use_task_notifications: bool,
    pub support_static_allocation: bool,
    pub abort_delay: bool,
    pub generate_run_time_stats: bool,
    pub use_trace_facility: bool,
    pub use_application_task_tag: bool,
    pub critical_nesting_in_tcb: bool,
    pub list_data_integrity_check: bool,
    pub check_for_stack_overflow: StackOverflowCheck,
    pub notification_array_entries: usize,
    pub thread_local_storage_pointers: usize,
}

/// Configuration selected by this build.
pub const CONFIG: KernelConfig = KernelConfig {
    max_priorities: MAX_PRIORITIES,
    use_preemption: cfg!(feature = "preemption"),
    use_time_slicing: cfg!(feature = "time-slicing"),
    use_mutexes: cfg!(feature = "use-mutexes"),
    use_task_notifications: cfg!(feature = "task-notifications"),
    support_static_allocation: cfg!(feature = "static-allocation"),
    abort_delay: cfg!(feature = "abort-delay"),
    generate_run_time_stats: cfg!(feature = "generate-run-time-stats"),
    use_trace_facility: cfg!(feature = "trace-facility"),
    use_application_task_tag: cfg!(feature = "application-task-tag"),
    critical_nesting_in_tcb: cfg!(feature = "critical-nesting-in-tcb"),
    list_data_integrity_check: cfg!(feature = "list-data-integrity-check"),
    check_for_stack_overflow: CHECK_FOR_STACK_OVERFLOW,
    notification_array_entries: TASK_NOTIFICATION_ARRAY_ENTRIES,
    thread_local_storage_pointers: NUM_THREAD_LOCAL_STORAGE_POINTERS,
};

// The ready index is a single 32-bit word.
const_assert!(MAX_PRIORITIES >= 2 && MAX_PRIORITIES <= 32);
const_assert!(MAX_TASK_NAME_LEN >= 2);
const_assert!(TASK_NOTIFICATION_ARRAY_ENTRIES >= 1);
const_assert!(STACK_GUARD_WORDS >= 1);
const_assert!(STACK_FILL_BYTE != STACK_GUARD_BYTE);
