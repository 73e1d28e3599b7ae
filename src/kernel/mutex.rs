/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Mutexes with priority inheritance. Inheritance follows one
 * rule: a holder runs at the maximum of its base priority and the priority
 * of the highest waiter of any mutex it holds.
 */

//! Mutexes and Priority Inheritance
//!
//! A mutex is a holder plus an event list of waiters. Whenever a holder's
//! waiter set changes, [`Scheduler::refresh_priority`] recomputes the
//! holder's effective priority and follows the chain of holders (a holder
//! that itself waits on another mutex) so inheritance is transitive.
//!
//! A release hands the mutex directly to the highest priority waiter. A
//! blocking acquire is two-phase: [`Scheduler::acquire_mutex`] returns
//! [`Acquire::Blocked`] and the task calls [`Scheduler::finish_mutex_wait`]
//! once it runs again.

use crate::kernel::list::{ItemKind, ListId};
use crate::kernel::task::{BlockOutcome, TaskHandle};
use crate::kernel::tasks::{EventListId, Scheduler, SchedulerState};
use crate::port::Port;
use crate::trace;
use crate::types::*;
use alloc::vec::Vec;

/// Handle of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId {
    index: u32,
    generation: u32,
}

impl MutexId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    Normal,
    /// May be taken again by its holder; released after as many gives.
    Recursive,
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// The caller is blocked; call `finish_mutex_wait` once it runs.
    Blocked,
    TimedOut,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct MutexCb {
    holder: Option<TaskHandle>,
    recursion: UBaseType,
    kind: MutexKind,
    waiters: EventListId,
}

struct MutexSlot {
    generation: u32,
    mutex: Option<MutexCb>,
}

/// Generation-checked storage of all mutexes.
#[derive(Default)]
pub(crate) struct MutexArena {
    slots: Vec<MutexSlot>,
}

impl MutexArena {
    fn insert(&mut self, mutex: MutexCb) -> Result<MutexId, TaskError> {
        let index = match self.slots.iter().position(|s| s.mutex.is_none()) {
            Some(index) => index,
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| TaskError::AllocationFailure)?;
                self.slots.push(MutexSlot {
                    generation: 0,
                    mutex: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.mutex = Some(mutex);
        Ok(MutexId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn remove(&mut self, id: MutexId) -> Option<MutexCb> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let mutex = slot.mutex.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(mutex)
    }

    fn get(&self, id: MutexId) -> Option<&MutexCb> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.mutex.as_ref())
    }

    fn get_mut(&mut self, id: MutexId) -> Option<&mut MutexCb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.mutex.as_mut())
    }

    fn iter(&self) -> impl Iterator<Item = (MutexId, &MutexCb)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.mutex.as_ref().map(|m| {
                (
                    MutexId {
                        index: i as u32,
                        generation: s.generation,
                    },
                    m,
                )
            })
        })
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.mutex.is_some()).count()
    }

    /// The mutex whose waiters live in `waiters`.
    fn by_waiters(&self, waiters: EventListId) -> Option<MutexId> {
        self.iter()
            .find(|(_, m)| m.waiters == waiters)
            .map(|(id, _)| id)
    }
}

impl<P: Port> Scheduler<P> {
    pub fn create_mutex(&mut self, kind: MutexKind) -> Result<MutexId, TaskError> {
        let waiters = self.lists.create_event()?;
        let mutex = MutexCb {
            holder: None,
            recursion: 0,
            kind,
            waiters,
        };
        match self.mutexes.insert(mutex) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.lists.discard_event(waiters);
                Err(e)
            }
        }
    }

    /// Delete an unheld mutex without waiters.
    pub fn delete_mutex(&mut self, id: MutexId) -> Result<(), TaskError> {
        let mutex = self.mutexes.get(id).ok_or(TaskError::InvalidHandle)?;
        if mutex.holder.is_some() {
            return Err(TaskError::EventListInUse);
        }
        let waiters = mutex.waiters;
        self.lists.delete_event(waiters)?;
        self.mutexes.remove(id);
        Ok(())
    }

    pub fn mutex_holder(&self, id: MutexId) -> Result<Option<TaskHandle>, TaskError> {
        Ok(self.mutexes.get(id).ok_or(TaskError::InvalidHandle)?.holder)
    }

    /// Waiters of `id` in hand-off order.
    pub fn mutex_waiters(&self, id: MutexId) -> Result<Vec<TaskHandle>, TaskError> {
        let waiters = self.mutexes.get(id).ok_or(TaskError::InvalidHandle)?.waiters;
        self.event_list_waiters(waiters)
    }

    /// Take `id` for the current task, blocking for at most `timeout` ticks.
    ///
    /// Blocking raises the holder (and every holder it in turn waits for) to
    /// the caller's priority. Fails with [`TaskError::WouldDeadlock`] if the
    /// holder chain leads back to the caller.
    pub fn acquire_mutex(&mut self, id: MutexId, timeout: Tick) -> Result<Acquire, TaskError> {
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        let mutex = self.mutexes.get_mut(id).ok_or(TaskError::InvalidHandle)?;

        let holder = match mutex.holder {
            None => {
                mutex.holder = Some(task);
                mutex.recursion = 1;
                self.tasks.linked_mut(task).mutexes_held += 1;
                trace::mutex_take(task, id.index());
                return Ok(Acquire::Acquired);
            }
            Some(holder) if holder == task => {
                return match mutex.kind {
                    MutexKind::Recursive => {
                        mutex.recursion += 1;
                        trace::mutex_take(task, id.index());
                        Ok(Acquire::Acquired)
                    }
                    MutexKind::Normal => Err(TaskError::WouldDeadlock),
                };
            }
            Some(holder) => holder,
        };
        let waiters = mutex.waiters;

        if timeout == 0 {
            return Ok(Acquire::TimedOut);
        }
        self.blocking_task()?;
        if self.holder_chain_reaches(holder, task) {
            return Err(TaskError::WouldDeadlock);
        }
        if self.tasks.linked(task).event_item.is_linked() {
            return Err(TaskError::AlreadyWaiting);
        }

        self.critical(|s| {
            s.place_on_event_list(task, waiters, timeout);
            s.refresh_priority(holder);
        });
        self.yield_within_api();
        Ok(Acquire::Blocked)
    }

    /// Complete an acquire that returned [`Acquire::Blocked`]. Still
    /// [`Acquire::Blocked`] while the task waits.
    pub fn finish_mutex_wait(&mut self, id: MutexId) -> Result<Acquire, TaskError> {
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        let holder = self.mutex_holder(id)?;
        if self.tasks.linked(task).event_item.is_linked() {
            return Ok(Acquire::Blocked);
        }
        Ok(match self.take_block_outcome()? {
            _ if holder == Some(task) => Acquire::Acquired,
            Some(BlockOutcome::Aborted) => Acquire::Aborted,
            _ => Acquire::TimedOut,
        })
    }

    /// Give `id` back. Only the holder may release. With waiters the mutex
    /// passes straight to the highest priority one; returns whether it did.
    pub fn release_mutex(&mut self, id: MutexId) -> Result<bool, TaskError> {
        let task = self.current().ok_or(TaskError::SchedulerNotRunning)?;
        let mutex = self.mutexes.get_mut(id).ok_or(TaskError::InvalidHandle)?;
        if mutex.holder != Some(task) {
            return Err(TaskError::NotOwner);
        }
        if mutex.recursion > 1 {
            mutex.recursion -= 1;
            trace::mutex_give(task, id.index());
            return Ok(false);
        }

        let (handed_over, preempts) = self.critical(|s| {
            let handed = s.hand_over(id, task);
            s.refresh_priority(task);
            handed
        });
        if preempts && self.scheduler_state() != SchedulerState::Suspended {
            self.yield_within_api();
        }
        Ok(handed_over)
    }

    /// Pass `id` from `from` to its highest priority waiter, or leave it
    /// free. Returns whether a waiter took it and whether that waiter
    /// should preempt the current task.
    fn hand_over(&mut self, id: MutexId, from: TaskHandle) -> (bool, bool) {
        let Some(mutex) = self.mutexes.get_mut(id) else {
            return (false, false);
        };
        mutex.holder = None;
        mutex.recursion = 0;
        let waiters = mutex.waiters;
        if let Some(tcb) = self.tasks.get_mut(from) {
            tcb.mutexes_held = tcb.mutexes_held.saturating_sub(1);
        }
        trace::mutex_give(from, id.index());

        let Some(next) = self.lists.event(waiters).and_then(|l| l.head()) else {
            return (false, false);
        };
        self.detach_event(next);
        if let Some(mutex) = self.mutexes.get_mut(id) {
            mutex.holder = Some(next);
            mutex.recursion = 1;
        }
        self.tasks.linked_mut(next).mutexes_held += 1;
        trace::mutex_take(next, id.index());
        let preempts = self.wake(next, BlockOutcome::Woken);
        self.refresh_priority(next);
        (true, preempts)
    }

    /// Hand every mutex held by a task being deleted to its next waiter.
    pub(crate) fn release_mutexes_of_deleted(&mut self, task: TaskHandle) {
        let held: Vec<MutexId> = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.holder == Some(task))
            .map(|(id, _)| id)
            .collect();
        for id in held {
            self.hand_over(id, task);
        }
    }

    /// Highest priority of any task waiting on a mutex held by `task`.
    pub(crate) fn inherited_priority(&self, task: TaskHandle) -> Option<Priority> {
        self.mutexes
            .iter()
            .filter(|(_, m)| m.holder == Some(task))
            .filter_map(|(_, m)| self.lists.event(m.waiters)?.head())
            .map(|waiter| self.tasks.linked(waiter).priority)
            .max()
    }

    /// Holder of the mutex `task` is waiting for.
    pub(crate) fn blocking_holder(&self, task: TaskHandle) -> Option<TaskHandle> {
        let Some(ListId::Event(waiters)) = self.tasks.get(task)?.item(ItemKind::Event).container else {
            return None;
        };
        let id = self.mutexes.by_waiters(waiters)?;
        self.mutexes.get(id)?.holder
    }

    fn holder_chain_reaches(&self, holder: TaskHandle, task: TaskHandle) -> bool {
        let mut next = Some(holder);
        for _ in 0..=self.mutexes.len() {
            match next {
                Some(h) if h == task => return true,
                Some(h) => next = self.blocking_holder(h),
                None => return false,
            }
        }
        false
    }

    /// A waiter left the event list `waiters`; recompute its mutex holder.
    pub(crate) fn waiter_left(&mut self, waiters: EventListId) {
        let holder = self
            .mutexes
            .by_waiters(waiters)
            .and_then(|id| self.mutexes.get(id))
            .and_then(|m| m.holder);
        if let Some(holder) = holder {
            self.refresh_priority(holder);
        }
    }

    /// Recompute the effective priority of `task` and of every holder
    /// reachable through the mutexes it waits on. Each step moves one link
    /// along the chain, so a chain is at most one step per mutex long.
    pub(crate) fn refresh_priority(&mut self, task: TaskHandle) {
        let mut next = Some(task);
        for _ in 0..=self.mutexes.len() {
            let Some(task) = next else {
                break;
            };
            let Some(current) = self.tasks.get(task).map(|t| t.priority) else {
                break;
            };
            let target = self.justified_priority(task);
            if target == current {
                break;
            }
            if target > current {
                trace::task_priority_inherit(task, target);
            } else {
                trace::task_priority_disinherit(task, target);
            }
            self.change_effective_priority(task, target);
            next = self.blocking_holder(task);
        }
    }
}
