/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy of
 * this software and associated documentation files (the "Software"), to deal in
 * the Software without restriction, including without limitation the rights to
 * use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
 * the Software, and to permit persons to whom the Software is furnished to do so,
 * subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
 * FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
 * COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
 * IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
 * CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
 *
 * https://www.FreeRTOS.org
 * https://github.com/FreeRTOS
 *
 * [AMENDMENT] This crate carries the task and scheduling core of the FreeRTOS
 * kernel over to Rust. Kernel state lives in an owned `Scheduler` value and
 * tasks are addressed through generation-checked handles.
 */

//! # rtos-task-core - FreeRTOS-style task scheduling core
//!
//! Fixed-priority preemptive scheduling with round robin among equal
//! priorities, delayed and event wait lists, priority-inheritance mutexes,
//! direct-to-task notifications and stack overflow detection.
//!
//! The architecture-specific context switch is supplied through the
//! [`port::Port`] trait and stack memory through [`memory::StackAllocator`].
//! [`port::HostPort`] drives the kernel on a development machine.
//!
//! ## Features
//!
//! - `tick-16bit` / `tick-32bit` (default) / `tick-64bit` - tick counter width
//! - `arch-32bit` (default) / `arch-64bit` - architecture word width
//! - `preemption`, `time-slicing` - scheduling policy
//! - `use-mutexes` - mutexes with priority inheritance
//! - `task-notifications` - per-task notification slots
//! - `static-allocation` - tasks on caller-supplied stacks
//! - `abort-delay` - force-unblock of a blocked task
//! - `stack-overflow-check` - stack guard checked at every context switch
//! - `stack-overflow-check-pointer` - check the saved stack pointer only
//! - `thread-local-storage` - per-task storage slots
//! - `application-task-tag` - per-task application hook
//! - `generate-run-time-stats` - per-task run-time accounting
//! - `trace-facility` - task status snapshots
//! - `critical-nesting-in-tcb` - critical nesting tracked per task
//! - `list-data-integrity-check` - known values inside list structures
//! - `std` - `std::error::Error` implementations

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

// Core modules
pub mod config;
pub mod trace;
pub mod types;

// Port layer
pub mod port;

// Memory management
pub mod memory;

// Kernel modules
pub mod kernel;

pub use config::*;
pub use types::*;

pub use kernel::list::ListId;
pub use kernel::stack::{StackFault, StackRegion, StackStorage};
pub use kernel::task::{TaskHandle, TaskName, TaskState};
pub use kernel::tasks::{
    BlockOutcome, EventListId, KernelHooks, Scheduler, SchedulerState, TimeOut,
};
pub use kernel::KernelCell;

#[cfg(feature = "use-mutexes")]
pub use kernel::mutex::{Acquire, MutexId, MutexKind};

#[cfg(feature = "task-notifications")]
pub use kernel::notify::{NotifyAction, NotifyState, NotifyWait, Notified};

#[cfg(feature = "trace-facility")]
pub use kernel::tasks::TaskStatus;
