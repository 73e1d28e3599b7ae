/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] This module provides the trace hook functions of the kernel.
 * In C these are macros in FreeRTOS.h that default to nothing. Here each hook
 * emits a `log` record, so any `log` backend becomes the trace recorder.
 */

//! Trace Hooks
//!
//! The kernel calls these functions at key points. They forward to the `log`
//! facade under the `rtos::*` targets:
//!
//! - `rtos::sched` - context switches, ticks, scheduler lifecycle
//! - `rtos::task` - task lifecycle and priority changes
//! - `rtos::mutex` - mutex operations and inheritance
//! - `rtos::notify` - task notifications
//!
//! Per-tick and per-switch records use `trace!`; lifecycle records `debug!`.

use crate::kernel::task::TaskHandle;
use crate::types::*;
use log::{debug, error, trace, warn};

// =============================================================================
// Scheduler tracing
// =============================================================================

#[inline]
pub fn scheduler_start(port: &str, idle: TaskHandle) {
    debug!(target: "rtos::sched", "scheduler started on {} port, idle task {}", port, idle);
}

#[inline]
pub fn scheduler_end() {
    debug!(target: "rtos::sched", "scheduler ended");
}

#[inline]
pub fn task_switched_out(task: TaskHandle) {
    trace!(target: "rtos::sched", "switched out {}", task);
}

#[inline]
pub fn task_switched_in(task: TaskHandle, priority: Priority) {
    trace!(target: "rtos::sched", "switched in {} at priority {}", task, priority);
}

#[inline]
pub fn task_increment_tick(tick: Tick) {
    trace!(target: "rtos::sched", "tick {}", tick);
}

#[inline]
pub fn delayed_lists_switched(overflows: UBaseType) {
    debug!(target: "rtos::sched", "tick count wrapped, overflow {}", overflows);
}

#[inline]
pub fn moved_task_to_ready_state(task: TaskHandle, priority: Priority) {
    trace!(target: "rtos::sched", "{} ready at priority {}", task, priority);
}

#[inline]
pub fn post_moved_task_to_ready_state_from_isr(task: TaskHandle) {
    trace!(target: "rtos::sched", "{} deferred to pending ready list", task);
}

// =============================================================================
// Task tracing
// =============================================================================

#[inline]
pub fn task_create(task: TaskHandle, name: &str, priority: Priority) {
    debug!(target: "rtos::task", "create {} '{}' priority {}", task, name, priority);
}

#[inline]
pub fn task_create_failed() {
    warn!(target: "rtos::task", "task creation failed");
}

#[inline]
pub fn task_delete(task: TaskHandle) {
    debug!(target: "rtos::task", "delete {}", task);
}

#[inline]
pub fn task_delay(task: TaskHandle, ticks: Tick) {
    trace!(target: "rtos::task", "{} delay {} ticks", task, ticks);
}

#[inline]
pub fn task_delay_until(task: TaskHandle, wake: Tick) {
    trace!(target: "rtos::task", "{} delay until tick {}", task, wake);
}

#[inline]
pub fn task_delay_aborted(task: TaskHandle) {
    debug!(target: "rtos::task", "{} delay aborted", task);
}

#[inline]
pub fn task_suspend(task: TaskHandle) {
    debug!(target: "rtos::task", "suspend {}", task);
}

#[inline]
pub fn task_resume(task: TaskHandle) {
    debug!(target: "rtos::task", "resume {}", task);
}

#[inline]
pub fn task_resume_from_isr(task: TaskHandle) {
    debug!(target: "rtos::task", "resume {} from isr", task);
}

#[inline]
pub fn task_priority_set(task: TaskHandle, priority: Priority) {
    debug!(target: "rtos::task", "{} base priority set to {}", task, priority);
}

#[inline]
pub fn blocking_on_event_list(task: TaskHandle, ticks: Tick) {
    trace!(target: "rtos::task", "{} blocking on event list for {} ticks", task, ticks);
}

#[inline]
pub fn malloc_failed(words: usize) {
    warn!(target: "rtos::task", "stack allocation of {} words failed", words);
}

// =============================================================================
// Mutex tracing
// =============================================================================

#[inline]
pub fn task_priority_inherit(task: TaskHandle, priority: Priority) {
    debug!(target: "rtos::mutex", "{} inherits priority {}", task, priority);
}

#[inline]
pub fn task_priority_disinherit(task: TaskHandle, priority: Priority) {
    debug!(target: "rtos::mutex", "{} priority restored to {}", task, priority);
}

#[inline]
pub fn mutex_take(task: TaskHandle, index: usize) {
    trace!(target: "rtos::mutex", "{} took mutex {}", task, index);
}

#[inline]
pub fn mutex_give(task: TaskHandle, index: usize) {
    trace!(target: "rtos::mutex", "{} gave mutex {}", task, index);
}

// =============================================================================
// Notification tracing
// =============================================================================

#[inline]
pub fn task_notify(task: TaskHandle, index: usize) {
    trace!(target: "rtos::notify", "notify {} slot {}", task, index);
}

#[inline]
pub fn task_notify_from_isr(task: TaskHandle, index: usize) {
    trace!(target: "rtos::notify", "notify {} slot {} from isr", task, index);
}

#[inline]
pub fn task_notify_wait_block(task: TaskHandle, index: usize) {
    trace!(target: "rtos::notify", "{} waiting on slot {}", task, index);
}

#[inline]
pub fn task_notify_wait(task: TaskHandle, index: usize) {
    trace!(target: "rtos::notify", "{} finished wait on slot {}", task, index);
}

// =============================================================================
// Fatal conditions
// =============================================================================

#[cold]
pub fn stack_overflow(task: TaskHandle, name: &str) {
    error!(target: "rtos::task", "stack overflow in {} '{}'", task, name);
}

#[cold]
pub fn fatal(err: FatalError) {
    error!(target: "rtos::sched", "fatal: {}", err);
}
