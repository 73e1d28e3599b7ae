/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 */

//! Direct-to-task Notifications
//!
//! Every task has `TASK_NOTIFICATION_ARRAY_ENTRIES` slots, each a 32-bit
//! value plus a [`NotifyState`]. A notification can update the value and
//! always marks the slot as received; a task waiting on the slot is readied.
//!
//! Waiting is two-phase like every other blocking call: the wait either
//! completes at once or returns [`NotifyWait::Blocked`] after requesting a
//! switch, and the task calls [`Scheduler::finish_notification_wait`] once it
//! runs again.

use crate::kernel::list::ItemKind;
use crate::kernel::task::{BlockOutcome, TaskHandle};
use crate::kernel::tasks::Scheduler;
use crate::port::Port;
use crate::trace;
use crate::types::*;

/// How a notification updates the slot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Leave the value alone; only the state changes.
    NoAction,
    /// OR the bits into the value.
    SetBits(u32),
    /// Add one, wrapping.
    Increment,
    /// Replace the value.
    SetValueWithOverwrite(u32),
    /// Replace the value unless a notification is already pending.
    SetValueWithoutOverwrite(u32),
}

/// State of one notification slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    NotWaiting,
    Waiting,
    Received,
}

/// What leaving a wait does to the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitAction {
    /// Clear these bits if a notification was received.
    ClearBits(u32),
    /// Counting semaphore take: decrement a non-zero value.
    TakeDecrement,
    /// Binary semaphore take: zero a non-zero value.
    TakeClear,
}

/// One notification slot of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySlot {
    pub(crate) value: u32,
    pub(crate) state: NotifyState,
    pub(crate) on_exit: ExitAction,
}

impl NotifySlot {
    pub const fn new() -> Self {
        NotifySlot {
            value: 0,
            state: NotifyState::NotWaiting,
            on_exit: ExitAction::ClearBits(0),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn state(&self) -> NotifyState {
        self.state
    }

    /// Consume the slot when a wait ends.
    fn finish(&mut self) -> Option<u32> {
        let value = self.value;
        let received = match self.on_exit {
            ExitAction::ClearBits(bits) => {
                if self.state == NotifyState::Received {
                    self.value &= !bits;
                    Some(value)
                } else {
                    None
                }
            }
            ExitAction::TakeDecrement | ExitAction::TakeClear if value != 0 => {
                self.value = if self.on_exit == ExitAction::TakeClear {
                    0
                } else {
                    value - 1
                };
                Some(value)
            }
            ExitAction::TakeDecrement | ExitAction::TakeClear => None,
        };
        self.state = NotifyState::NotWaiting;
        received
    }
}

impl Default for NotifySlot {
    fn default() -> Self {
        NotifySlot::new()
    }
}

/// Whether a notification changed the slot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notified {
    Updated,
    /// `SetValueWithoutOverwrite` found a pending notification.
    Unchanged,
}

/// Result of a notification wait. Every finished variant carries the slot
/// value as seen by the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyWait {
    Received(u32),
    TimedOut(u32),
    Aborted(u32),
    /// The task is blocked; call `finish_notification_wait` once it runs.
    Blocked,
}

impl<P: Port> Scheduler<P> {
    fn check_notify_index(index: usize) -> Result<(), TaskError> {
        if index >= crate::config::TASK_NOTIFICATION_ARRAY_ENTRIES {
            return Err(TaskError::InvalidNotificationIndex);
        }
        Ok(())
    }

    /// Update slot `index` of `task`. Returns the outcome, the previous value
    /// and whether the task was waiting on the slot.
    fn apply_notification(
        &mut self,
        task: TaskHandle,
        index: usize,
        action: NotifyAction,
    ) -> (Notified, u32, bool) {
        let slot = &mut self.tasks.linked_mut(task).notify[index];
        let previous = slot.value;
        let original = slot.state;
        slot.state = NotifyState::Received;

        let mut notified = Notified::Updated;
        match action {
            NotifyAction::NoAction => {}
            NotifyAction::SetBits(bits) => slot.value |= bits,
            NotifyAction::Increment => slot.value = slot.value.wrapping_add(1),
            NotifyAction::SetValueWithOverwrite(value) => slot.value = value,
            NotifyAction::SetValueWithoutOverwrite(value) => {
                if original != NotifyState::Received {
                    slot.value = value;
                } else {
                    notified = Notified::Unchanged;
                }
            }
        }
        (notified, previous, original == NotifyState::Waiting)
    }

    /// Notify slot `index` of `handle`.
    pub fn notify(&mut self, handle: TaskHandle, index: usize, action: NotifyAction) -> Result<Notified, TaskError> {
        self.notify_and_query(handle, index, action)
            .map(|(notified, _)| notified)
    }

    /// [`Scheduler::notify`], also returning the value before the update.
    pub fn notify_and_query(
        &mut self,
        handle: TaskHandle,
        index: usize,
        action: NotifyAction,
    ) -> Result<(Notified, u32), TaskError> {
        Self::check_notify_index(index)?;
        let task = self.resolve(Some(handle))?;
        let (notified, previous, preempts) = self.critical(|s| {
            let (notified, previous, was_waiting) = s.apply_notification(task, index, action);
            trace::task_notify(task, index);
            let mut preempts = false;
            if was_waiting {
                s.unlink(task, ItemKind::State);
                s.tasks.linked_mut(task).block_outcome = Some(BlockOutcome::Woken);
                s.add_to_ready(task);
                preempts = s.preempts(task);
            }
            (notified, previous, preempts)
        });
        if preempts {
            self.yield_within_api();
        }
        Ok((notified, previous))
    }

    /// Interrupt-context [`Scheduler::notify`]. The second value tells
    /// whether the port should switch on interrupt exit.
    pub fn notify_from_isr(
        &mut self,
        handle: TaskHandle,
        index: usize,
        action: NotifyAction,
    ) -> Result<(Notified, bool), TaskError> {
        Self::check_notify_index(index)?;
        let task = self.resolve(Some(handle))?;
        Ok(self.isr_notify(task, index, action))
    }

    fn isr_notify(&mut self, task: TaskHandle, index: usize, action: NotifyAction) -> (Notified, bool) {
        let saved = self.port().set_interrupt_mask_from_isr();
        let (notified, _, was_waiting) = self.apply_notification(task, index, action);
        trace::task_notify_from_isr(task, index);
        let switch_required = was_waiting && self.wake(task, BlockOutcome::Woken);
        self.port().clear_interrupt_mask_from_isr(saved);
        (notified, switch_required)
    }

    /// Lightweight counting semaphore give.
    pub fn notify_give(&mut self, handle: TaskHandle, index: usize) -> Result<(), TaskError> {
        self.notify(handle, index, NotifyAction::Increment).map(|_| ())
    }

    /// Interrupt-context [`Scheduler::notify_give`]. Returns whether the port
    /// should switch on interrupt exit.
    pub fn notify_give_from_isr(&mut self, handle: TaskHandle, index: usize) -> Result<bool, TaskError> {
        self.notify_from_isr(handle, index, NotifyAction::Increment)
            .map(|(_, switch_required)| switch_required)
    }

    /// Wait for a notification on slot `index` of the current task.
    ///
    /// A pending notification completes the wait at once. Otherwise the bits
    /// in `clear_on_entry` are cleared and the task blocks for `timeout`
    /// ticks. Whenever a notification is received the bits in `clear_on_exit`
    /// are cleared from the value after it is reported.
    pub fn wait_for_notification(
        &mut self,
        index: usize,
        clear_on_entry: u32,
        clear_on_exit: u32,
        timeout: Tick,
    ) -> Result<NotifyWait, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        self.begin_wait(task, index, timeout, clear_on_entry, ExitAction::ClearBits(clear_on_exit))
    }

    /// Lightweight semaphore take on slot `index`: a non-zero value is
    /// decremented, or zeroed when `clear` is set. Blocks for `timeout` ticks
    /// while the value is zero.
    pub fn notify_take(&mut self, index: usize, clear: bool, timeout: Tick) -> Result<NotifyWait, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        let on_exit = if clear {
            ExitAction::TakeClear
        } else {
            ExitAction::TakeDecrement
        };
        self.begin_wait(task, index, timeout, 0, on_exit)
    }

    fn begin_wait(
        &mut self,
        task: TaskHandle,
        index: usize,
        timeout: Tick,
        clear_on_entry: u32,
        on_exit: ExitAction,
    ) -> Result<NotifyWait, TaskError> {
        let slot = self.tasks.linked(task).notify[index];
        let ready = match on_exit {
            ExitAction::ClearBits(_) => slot.state == NotifyState::Received,
            ExitAction::TakeDecrement | ExitAction::TakeClear => slot.value != 0,
        };
        if ready || timeout == 0 {
            let slot = &mut self.tasks.linked_mut(task).notify[index];
            if !ready {
                slot.value &= !clear_on_entry;
            }
            slot.on_exit = on_exit;
            let value = slot.value;
            return Ok(match slot.finish() {
                Some(received) => NotifyWait::Received(received),
                None => NotifyWait::TimedOut(value),
            });
        }

        self.blocking_task()?;
        self.critical(|s| {
            let tcb = s.tasks.linked_mut(task);
            let slot = &mut tcb.notify[index];
            slot.value &= !clear_on_entry;
            slot.state = NotifyState::Waiting;
            slot.on_exit = on_exit;
            tcb.block_outcome = None;
            trace::task_notify_wait_block(task, index);
            s.add_current_to_delayed_list(task, timeout, true);
        });
        self.yield_within_api();
        Ok(NotifyWait::Blocked)
    }

    /// Complete a wait that returned [`NotifyWait::Blocked`]. Still
    /// [`NotifyWait::Blocked`] if the task has not been unblocked yet.
    pub fn finish_notification_wait(&mut self, index: usize) -> Result<NotifyWait, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        Ok(self.critical(|s| {
            let tcb = s.tasks.linked_mut(task);
            let slot = &mut tcb.notify[index];
            if tcb.block_outcome.is_none() && slot.state == NotifyState::Waiting {
                return NotifyWait::Blocked;
            }
            let outcome = tcb.block_outcome.take();
            let received = slot.finish();
            let value = slot.value;
            trace::task_notify_wait(task, index);
            match (received, outcome) {
                (Some(v), _) => NotifyWait::Received(v),
                (None, Some(BlockOutcome::Aborted)) => NotifyWait::Aborted(value),
                (None, _) => NotifyWait::TimedOut(value),
            }
        }))
    }

    /// Drop a pending notification of slot `index`. Returns whether one was
    /// pending.
    pub fn notify_state_clear(&mut self, handle: Option<TaskHandle>, index: usize) -> Result<bool, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.resolve(handle)?;
        Ok(self.critical(|s| {
            let slot = &mut s.tasks.linked_mut(task).notify[index];
            if slot.state == NotifyState::Received {
                slot.state = NotifyState::NotWaiting;
                true
            } else {
                false
            }
        }))
    }

    /// Clear `bits` in slot `index` and return the value before clearing.
    pub fn notify_value_clear(
        &mut self,
        handle: Option<TaskHandle>,
        index: usize,
        bits: u32,
    ) -> Result<u32, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.resolve(handle)?;
        Ok(self.critical(|s| {
            let slot = &mut s.tasks.linked_mut(task).notify[index];
            let previous = slot.value;
            slot.value &= !bits;
            previous
        }))
    }

    pub fn notify_slot(&self, handle: TaskHandle, index: usize) -> Result<NotifySlot, TaskError> {
        Self::check_notify_index(index)?;
        let task = self.resolve(Some(handle))?;
        Ok(self.tasks.linked(task).notify[index])
    }

    /// Stop any notification wait of `task`, leaving values untouched.
    pub(crate) fn cancel_notification_waits(&mut self, task: TaskHandle) {
        for slot in self.tasks.linked_mut(task).notify.iter_mut() {
            if slot.state == NotifyState::Waiting {
                slot.state = NotifyState::NotWaiting;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_bits_exit_reports_value_before_clearing() {
        let mut slot = NotifySlot::new();
        slot.value = 0b1011;
        slot.state = NotifyState::Received;
        slot.on_exit = ExitAction::ClearBits(0b0011);
        assert_eq!(slot.finish(), Some(0b1011));
        assert_eq!(slot.value, 0b1000);
        assert_eq!(slot.state, NotifyState::NotWaiting);
    }

    #[test]
    fn clear_bits_exit_without_notification_keeps_value() {
        let mut slot = NotifySlot::new();
        slot.value = 7;
        slot.state = NotifyState::Waiting;
        slot.on_exit = ExitAction::ClearBits(u32::MAX);
        assert_eq!(slot.finish(), None);
        assert_eq!(slot.value, 7);
    }

    #[test]
    fn take_exits_count_down() {
        let mut slot = NotifySlot::new();
        slot.value = 3;
        slot.on_exit = ExitAction::TakeDecrement;
        assert_eq!(slot.finish(), Some(3));
        assert_eq!(slot.value, 2);

        slot.on_exit = ExitAction::TakeClear;
        assert_eq!(slot.finish(), Some(2));
        assert_eq!(slot.value, 0);
        assert_eq!(slot.finish(), None);
    }
}
