/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Base types of the kernel. In C these come from portmacro.h and
 * projdefs.h; here their widths are selected with Cargo features.
 */

//! Kernel Base Types
//!
//! - [`BaseType`] / [`UBaseType`] - architecture word size
//! - [`StackWord`] - one stack slot
//! - [`Tick`] - tick counter
//! - [`TaskError`] / [`FatalError`] - error taxonomy
//!
//! ## Architecture Width
//! - `arch-32bit` feature: 32-bit types (default)
//! - `arch-64bit` feature: 64-bit types (takes precedence when both are set)
//!
//! ## Tick Width
//! - `tick-16bit`, `tick-32bit` (default), `tick-64bit`; the widest selected
//!   width other than the default wins.

use core::fmt;

// =============================================================================
// Architecture-dependent types
// =============================================================================

#[cfg(not(any(feature = "arch-32bit", feature = "arch-64bit")))]
compile_error!("select an architecture width: `arch-32bit` or `arch-64bit`");

/// Signed base type, architecture word size.
#[cfg(feature = "arch-64bit")]
pub type BaseType = i64;
#[cfg(all(feature = "arch-32bit", not(feature = "arch-64bit")))]
pub type BaseType = i32;

/// Unsigned base type, architecture word size. Used for counts and priorities.
#[cfg(feature = "arch-64bit")]
pub type UBaseType = u64;
#[cfg(all(feature = "arch-32bit", not(feature = "arch-64bit")))]
pub type UBaseType = u32;

/// Stack element type.
#[cfg(feature = "arch-64bit")]
pub type StackWord = u64;
#[cfg(all(feature = "arch-32bit", not(feature = "arch-64bit")))]
pub type StackWord = u32;

// =============================================================================
// Tick type (configurable width independent of architecture)
// =============================================================================

#[cfg(not(any(feature = "tick-16bit", feature = "tick-32bit", feature = "tick-64bit")))]
compile_error!("select a tick width: `tick-16bit`, `tick-32bit` or `tick-64bit`");

/// Tick counter type.
#[cfg(feature = "tick-64bit")]
pub type Tick = u64;
#[cfg(all(feature = "tick-16bit", not(feature = "tick-64bit")))]
pub type Tick = u16;
#[cfg(all(
    feature = "tick-32bit",
    not(any(feature = "tick-16bit", feature = "tick-64bit"))
))]
pub type Tick = u32;

/// Block forever. Also the "no task is waiting" value of the next unblock time.
pub const MAX_DELAY: Tick = Tick::MAX;

/// Known value placed in list structures by `list-data-integrity-check`.
#[cfg(feature = "tick-16bit")]
pub const INTEGRITY_CHECK_VALUE: Tick = 0x5A5A as Tick;
#[cfg(not(feature = "tick-16bit"))]
pub const INTEGRITY_CHECK_VALUE: Tick = 0x5A5A_5A5A as Tick;

/// Task priority. 0 is the lowest, `MAX_PRIORITIES - 1` the highest.
pub type Priority = UBaseType;

/// Run-time accounting counter.
pub type RunTimeCounter = u32;

/// Task entry point. The parameter is the value given at creation.
pub type TaskFunction = fn(usize);

/// Application hook attached to a task as its tag.
pub type TaskHookFunction = fn(usize) -> BaseType;

/// Convert milliseconds to ticks.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Tick {
    ((ms as u64 * crate::config::TICK_RATE_HZ as u64) / 1000) as Tick
}

/// Convert ticks to milliseconds.
#[inline]
pub const fn ticks_to_ms(ticks: Tick) -> u64 {
    (ticks as u64 * 1000) / crate::config::TICK_RATE_HZ as u64
}

// =============================================================================
// Error codes
// =============================================================================

/// Recoverable kernel errors, returned to the caller.
///
/// Timeouts are not errors; blocking calls report them as outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Stack or control block storage could not be obtained.
    AllocationFailure,
    /// The handle does not name a live task or kernel object.
    InvalidHandle,
    /// Priority outside `0..MAX_PRIORITIES` where it cannot be clamped.
    PriorityOutOfRange,
    /// Requested stack cannot hold the guard words and the initial frame.
    StackTooSmall,
    /// Notification index is not below `TASK_NOTIFICATION_ARRAY_ENTRIES`.
    InvalidNotificationIndex,
    /// Thread-local storage index is not below `NUM_THREAD_LOCAL_STORAGE_POINTERS`.
    InvalidStorageIndex,
    /// The calling task does not hold the mutex.
    NotOwner,
    /// Blocking would close a cycle of mutex holders.
    WouldDeadlock,
    /// The object still has waiting tasks.
    EventListInUse,
    /// The calling task is already waiting on an event list.
    AlreadyWaiting,
    /// The idle task cannot be deleted or suspended.
    IdleTaskProtected,
    /// The call needs a running scheduler (or a current task).
    SchedulerNotRunning,
    /// The call cannot be made while the scheduler is suspended.
    SchedulerSuspended,
    /// `resume_all` without a matching `suspend_all`.
    SchedulerNotSuspended,
    /// The scheduler has already been started.
    AlreadyStarted,
    /// The kernel context already holds a scheduler.
    AlreadyInstalled,
    /// The kernel context holds no scheduler.
    NotInstalled,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TaskError::AllocationFailure => "could not allocate required memory",
            TaskError::InvalidHandle => "invalid or stale handle",
            TaskError::PriorityOutOfRange => "priority out of range",
            TaskError::StackTooSmall => "stack too small",
            TaskError::InvalidNotificationIndex => "notification index out of range",
            TaskError::InvalidStorageIndex => "thread-local storage index out of range",
            TaskError::NotOwner => "mutex not held by caller",
            TaskError::WouldDeadlock => "blocking would deadlock",
            TaskError::EventListInUse => "event list has waiting tasks",
            TaskError::AlreadyWaiting => "task already waiting on an event list",
            TaskError::IdleTaskProtected => "operation not permitted on the idle task",
            TaskError::SchedulerNotRunning => "scheduler not running",
            TaskError::SchedulerSuspended => "scheduler suspended",
            TaskError::SchedulerNotSuspended => "scheduler not suspended",
            TaskError::AlreadyStarted => "scheduler already started",
            TaskError::AlreadyInstalled => "scheduler already installed",
            TaskError::NotInstalled => "no scheduler installed",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TaskError {}

/// Conditions that make continued execution unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// Stack pointer out of bounds or guard words overwritten.
    StackOverflow,
    /// A list or list item lost its integrity values or linkage.
    ListCorrupted,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::StackOverflow => f.write_str("stack overflow"),
            FatalError::ListCorrupted => f.write_str("list data corrupted"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FatalError {}

/// Halt on an unrecoverable kernel condition.
#[cold]
pub fn fatal(error: FatalError) -> ! {
    crate::trace::fatal(error);
    panic!("kernel fatal error: {}", error)
}
