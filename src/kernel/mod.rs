/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module contains the task and scheduling core of the
 * kernel:
 * - list.rs   (ordered wait lists)
 * - task.rs   (task control blocks and their arena)
 * - stack.rs  (stack regions and the stack guard)
 * - tasks.rs  (the scheduler)
 * - mutex.rs  (mutexes with priority inheritance)
 * - notify.rs (direct-to-task notifications)
 */

//! Kernel Core
//!
//! - [`list`] - Linked list implementation used by the scheduler
//! - [`task`] - Task control blocks and handles
//! - [`stack`] - Task stack memory and overflow detection
//! - [`tasks`] - Task management and scheduler
//! - `mutex` - Priority inheritance mutexes
//! - `notify` - Task notifications
//!
//! The scheduler is a plain value. [`KernelCell`] makes it reachable from
//! interrupt handlers and tasks alike through a critical section.

use crate::port::Port;
use crate::types::TaskError;
use core::cell::RefCell;
use critical_section::Mutex;

pub mod list;
pub mod stack;
pub mod task;
pub mod tasks;

#[cfg(feature = "use-mutexes")]
pub mod mutex;

#[cfg(feature = "task-notifications")]
pub mod notify;

use tasks::Scheduler;

/// Global home of the scheduler.
///
/// ```ignore
/// static KERNEL: KernelCell<MyPort> = KernelCell::new();
///
/// fn tick_handler() {
///     let switch = KERNEL.with(|k| k.increment_tick()).unwrap_or(false);
///     // pend the switch handler if `switch`
/// }
/// ```
///
/// Calls do not nest: `f` must not call back into the same cell.
pub struct KernelCell<P: Port> {
    inner: Mutex<RefCell<Option<Scheduler<P>>>>,
}

impl<P: Port> KernelCell<P> {
    pub const fn new() -> Self {
        KernelCell {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Store the scheduler. Fails if one is installed already.
    pub fn install(&self, scheduler: Scheduler<P>) -> Result<(), TaskError> {
        critical_section::with(|cs| {
            let mut slot = self.inner.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err(TaskError::AlreadyInstalled);
            }
            *slot = Some(scheduler);
            Ok(())
        })
    }

    /// Run `f` on the installed scheduler inside a critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut Scheduler<P>) -> R) -> Result<R, TaskError> {
        critical_section::with(|cs| {
            let mut slot = self.inner.borrow_ref_mut(cs);
            let scheduler = slot.as_mut().ok_or(TaskError::NotInstalled)?;
            Ok(f(scheduler))
        })
    }

    /// Remove and return the scheduler.
    pub fn take(&self) -> Option<Scheduler<P>> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).take())
    }

    pub fn is_installed(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).is_some())
    }
}

impl<P: Port> Default for KernelCell<P> {
    fn default() -> Self {
        KernelCell::new()
    }
}
