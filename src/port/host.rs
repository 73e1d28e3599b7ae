/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Host port. Nothing is switched for real: critical sections are
 * counted, switch requests are latched, and the run-time counter is advanced
 * by the caller.
 */

//! Host Port Implementation
//!
//! Lets the kernel run on a development machine. A test harness plays the role
//! of the PendSV handler: it polls [`HostPort::take_switch_request`] and calls
//! [`Scheduler::switch_context`](crate::Scheduler::switch_context) when set.

use super::{Port, StackGrowth};
use crate::kernel::stack::{StackFault, StackRegion};
use crate::types::*;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Status word placed at the bottom of a fresh frame.
const INITIAL_STATUS_WORD: StackWord = 0x0100_0000;

/// Host port state.
#[derive(Debug, Default)]
pub struct HostPort {
    critical_nesting: AtomicUsize,
    interrupts_masked: AtomicBool,
    switch_requested: AtomicBool,
    switch_requests: AtomicUsize,
    in_isr: AtomicBool,
    started: AtomicBool,
    run_time: AtomicU32,
}

impl HostPort {
    pub const fn new() -> Self {
        HostPort {
            critical_nesting: AtomicUsize::new(0),
            interrupts_masked: AtomicBool::new(false),
            switch_requested: AtomicBool::new(false),
            switch_requests: AtomicUsize::new(0),
            in_isr: AtomicBool::new(false),
            started: AtomicBool::new(false),
            run_time: AtomicU32::new(0),
        }
    }

    /// Consume a pending switch request.
    pub fn take_switch_request(&self) -> bool {
        self.switch_requested.swap(false, Ordering::SeqCst)
    }

    /// Whether a switch request is latched.
    pub fn switch_pending(&self) -> bool {
        self.switch_requested.load(Ordering::SeqCst)
    }

    /// Total switch requests since creation.
    pub fn switch_requests(&self) -> usize {
        self.switch_requests.load(Ordering::SeqCst)
    }

    pub fn critical_nesting(&self) -> usize {
        self.critical_nesting.load(Ordering::SeqCst)
    }

    pub fn interrupts_masked(&self) -> bool {
        self.interrupts_masked.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Mark entry into simulated interrupt context.
    pub fn enter_isr(&self) {
        self.in_isr.store(true, Ordering::SeqCst);
    }

    pub fn exit_isr(&self) {
        self.in_isr.store(false, Ordering::SeqCst);
    }

    /// Advance the run-time statistics time base.
    pub fn advance_run_time(&self, delta: RunTimeCounter) {
        self.run_time.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Port for HostPort {
    const NAME: &'static str = "Host";
    const STACK_GROWTH: StackGrowth = StackGrowth::Descending;
    const BYTE_ALIGNMENT: usize = core::mem::align_of::<StackWord>();
    const MINIMAL_STACK_SIZE: usize = crate::config::MINIMAL_STACK_SIZE;
    const INITIAL_FRAME_WORDS: usize = 4;

    fn enter_critical(&self) {
        self.interrupts_masked.store(true, Ordering::SeqCst);
        self.critical_nesting.fetch_add(1, Ordering::SeqCst);
    }

    fn exit_critical(&self) {
        let prev = self.critical_nesting.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unbalanced critical section");
        if prev == 1 {
            self.interrupts_masked.store(false, Ordering::SeqCst);
        }
    }

    fn set_interrupt_mask_from_isr(&self) -> UBaseType {
        UBaseType::from(self.interrupts_masked.swap(true, Ordering::SeqCst))
    }

    fn clear_interrupt_mask_from_isr(&self, saved: UBaseType) {
        self.interrupts_masked.store(saved != 0, Ordering::SeqCst);
    }

    fn request_switch(&self) {
        self.switch_requests.fetch_add(1, Ordering::SeqCst);
        self.switch_requested.store(true, Ordering::SeqCst);
    }

    fn initialise_stack(
        &self,
        stack: &mut StackRegion,
        entry: TaskFunction,
        param: usize,
    ) -> Result<usize, StackFault> {
        // Frame, outermost first: status, entry, parameter, link register.
        let mut sp = stack.initial_pointer();
        sp = stack.push(sp, INITIAL_STATUS_WORD)?;
        sp = stack.push(sp, entry as usize as StackWord)?;
        sp = stack.push(sp, param as StackWord)?;
        sp = stack.push(sp, 0)?;
        Ok(sp)
    }

    fn start_scheduler(&self) -> Result<(), TaskError> {
        self.run_time.store(0, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end_scheduler(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_inside_interrupt(&self) -> bool {
        self.in_isr.load(Ordering::SeqCst)
    }

    fn run_time_counter(&self) -> RunTimeCounter {
        self.run_time.load(Ordering::SeqCst)
    }
}
