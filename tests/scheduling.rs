//! Scheduler behaviour driven through the host port.

#![cfg(all(feature = "preemption", feature = "time-slicing"))]

mod common;

use common::*;
use rtos_task_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn highest_priority_runs_and_equal_priorities_share_ticks() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 2);
    let c = spawn(&mut k, "C", 5);
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(c));

    k.delay(3).unwrap();
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(tick(&mut k), Some(b));
    assert_eq!(tick(&mut k), Some(a));
    assert_eq!(tick(&mut k), Some(c));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::TimedOut)));
    assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    assert_eq!(k.task_state(b), Ok(TaskState::Ready));
}

#[test]
fn round_robin_visits_every_equal_task() {
    let mut k = kernel();
    let x = spawn(&mut k, "X", 1);
    let y = spawn(&mut k, "Y", 1);
    let z = spawn(&mut k, "Z", 1);
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(z));

    let order: Vec<_> = (0..6).map(|_| tick(&mut k).unwrap()).collect();
    assert_eq!(order, [x, y, z, x, y, z]);
}

#[test]
fn equal_priority_task_made_ready_takes_the_processor() {
    let mut k = kernel();
    let b = spawn(&mut k, "B", 2);
    k.start_scheduler().unwrap();
    let c = spawn(&mut k, "C", 2);
    assert!(k.port().switch_pending());
    assert_eq!(service(&mut k), Some(c));
    assert_eq!(k.task_state(b), Ok(TaskState::Ready));
}

#[test]
fn delay_until_keeps_a_fixed_period() {
    let mut k = kernel();
    let p = spawn(&mut k, "P", 3);
    k.start_scheduler().unwrap();

    let mut last = k.tick_count();
    assert_eq!(k.delay_until(&mut last, 10), Ok(true));
    assert_eq!(last, 10);
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(ticks(&mut k, 9), k.idle_task());
    assert_eq!(tick(&mut k), Some(p));
    assert_eq!(k.tick_count(), 10);

    // Overrun the next period: the wake time is already past.
    ticks(&mut k, 15);
    assert_eq!(k.delay_until(&mut last, 10), Ok(false));
    assert_eq!(last, 20);
    assert_eq!(service(&mut k), Some(p));
}

#[test]
fn suspended_task_waits_for_resume() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 3);
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(b));

    k.suspend_task(None).unwrap();
    assert_eq!(k.task_state(b), Ok(TaskState::Suspended));
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(ticks(&mut k, 50), Some(a));

    assert_eq!(k.resume_task(b), Ok(true));
    assert_eq!(service(&mut k), Some(b));
    assert_eq!(k.resume_task(a), Ok(false));
}

#[test]
fn suspending_a_blocked_task_ends_its_wait() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    k.delay(10).unwrap();
    assert_eq!(service(&mut k), k.idle_task());

    k.suspend_task(Some(a)).unwrap();
    assert_eq!(k.task_state(a), Ok(TaskState::Suspended));
    assert_eq!(ticks(&mut k, 20), k.idle_task());

    assert_eq!(k.resume_task(a), Ok(true));
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::TimedOut)));
}

#[test]
fn idle_task_is_protected() {
    let mut k = kernel();
    spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    let idle = k.idle_task();
    assert_eq!(k.suspend_task(idle), Err(TaskError::IdleTaskProtected));
    assert_eq!(k.delete_task(idle), Err(TaskError::IdleTaskProtected));
    assert_eq!(k.start_scheduler(), Err(TaskError::AlreadyStarted));
}

static IDLE_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_idle() {
    IDLE_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn self_deleted_task_is_freed_by_idle() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    k.set_hooks(KernelHooks {
        idle: Some(count_idle),
        ..KernelHooks::default()
    });
    let before = k.heap_stats();

    k.delete_task(None).unwrap();
    assert_eq!(k.task_state(a), Ok(TaskState::Deleted));
    assert_eq!(k.priority(Some(a)), Err(TaskError::InvalidHandle));
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(k.number_of_tasks(), 2);

    k.idle_iteration();
    assert_eq!(k.number_of_tasks(), 1);
    assert_eq!(k.task_state(a), Err(TaskError::InvalidHandle));
    assert_eq!(k.heap_stats().successful_frees, before.successful_frees + 2);
    assert!(IDLE_CALLS.load(Ordering::SeqCst) >= 1);
}

#[test]
fn deleting_a_blocked_task_frees_it_at_once() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 3);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();
    k.delay(5).unwrap();
    assert_eq!(service(&mut k), Some(b));

    k.delete_task(Some(a)).unwrap();
    assert_eq!(k.task_state(a), Err(TaskError::InvalidHandle));
    assert_eq!(ticks(&mut k, 10), Some(b));
}

#[test]
fn delays_survive_tick_wrap() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 3);
    k.start_scheduler().unwrap();
    k.step_tick(MAX_DELAY - 5);
    assert_eq!(k.tick_count(), MAX_DELAY - 5);

    k.delay(2).unwrap();
    assert_eq!(service(&mut k), Some(a));
    // Wakes past the wrap, so lands in the overflow list.
    k.delay(10).unwrap();
    assert_eq!(service(&mut k), k.idle_task());

    assert_eq!(ticks(&mut k, 2), Some(b));
    k.suspend_task(None).unwrap();
    assert_eq!(service(&mut k), k.idle_task());

    assert_eq!(ticks(&mut k, 6), k.idle_task());
    assert_eq!(k.tick_count(), 2);
    assert_eq!(k.task_state(a), Ok(TaskState::Blocked));
    assert_eq!(ticks(&mut k, 2), Some(a));
    assert_eq!(k.tick_count(), 4);
}

#[test]
fn ticks_during_suspension_are_replayed() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    k.delay(2).unwrap();
    assert_eq!(service(&mut k), k.idle_task());

    k.suspend_all();
    assert_eq!(k.scheduler_state(), SchedulerState::Suspended);
    assert_eq!(ticks(&mut k, 3), k.idle_task());
    assert_eq!(k.tick_count(), 0);
    assert_eq!(k.pended_ticks(), 3);
    assert_eq!(k.task_state(a), Ok(TaskState::Blocked));

    assert_eq!(k.resume_all(), Ok(true));
    assert_eq!(k.tick_count(), 3);
    assert_eq!(service(&mut k), Some(a));
}

#[test]
fn wake_while_suspended_goes_through_pending_ready() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    let ev = k.create_event_list().unwrap();
    k.block_on_event_list(ev, MAX_DELAY).unwrap();
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(k.task_state(a), Ok(TaskState::Blocked));

    k.suspend_all();
    assert_eq!(k.unblock_highest_priority_from_isr(ev), Ok(true));
    assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    assert!(k.ready_tasks(2).is_empty());

    assert_eq!(k.resume_all(), Ok(true));
    assert_eq!(k.ready_tasks(2), vec![a]);
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::Woken)));
}

#[test]
fn event_waiters_are_ordered_by_priority() {
    let mut k = kernel();
    let l = spawn(&mut k, "L", 1);
    let m = spawn(&mut k, "M", 3);
    let h = spawn(&mut k, "H", 5);
    k.start_scheduler().unwrap();
    let ev = k.create_event_list().unwrap();

    for expected in [m, l] {
        k.block_on_event_list(ev, MAX_DELAY).unwrap();
        assert_eq!(service(&mut k), Some(expected));
    }
    k.block_on_event_list(ev, MAX_DELAY).unwrap();
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(k.event_list_waiters(ev).unwrap(), vec![h, m, l]);
    assert_eq!(k.delete_event_list(ev), Err(TaskError::EventListInUse));

    assert_eq!(k.unblock_highest_priority(ev), Ok(true));
    assert_eq!(service(&mut k), Some(h));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::Woken)));
    assert_eq!(k.event_list_waiters(ev).unwrap(), vec![m, l]);
}

#[test]
fn equal_priority_waiters_are_fifo_until_reprioritised() {
    let mut k = kernel();
    let x1 = spawn(&mut k, "X1", 3);
    let x2 = spawn(&mut k, "X2", 3);
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(x2));
    let ev = k.create_event_list().unwrap();

    k.block_on_event_list(ev, MAX_DELAY).unwrap();
    assert_eq!(service(&mut k), Some(x1));
    k.block_on_event_list(ev, MAX_DELAY).unwrap();
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(k.event_list_waiters(ev).unwrap(), vec![x2, x1]);

    k.set_priority(Some(x1), 4).unwrap();
    assert_eq!(k.event_list_waiters(ev).unwrap(), vec![x1, x2]);
}

#[test]
fn event_wait_times_out() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    let ev = k.create_event_list().unwrap();

    k.block_on_event_list(ev, 0).unwrap();
    assert!(!k.port().switch_pending());
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::TimedOut)));

    k.block_on_event_list(ev, 5).unwrap();
    assert_eq!(service(&mut k), k.idle_task());
    assert_eq!(ticks(&mut k, 4), k.idle_task());
    assert_eq!(tick(&mut k), Some(a));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::TimedOut)));
    assert!(k.event_list_waiters(ev).unwrap().is_empty());
    assert_eq!(k.unblock_highest_priority(ev), Ok(false));
}

#[cfg(feature = "abort-delay")]
#[test]
fn aborted_delay_reports_aborted() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();
    k.delay(100).unwrap();
    assert_eq!(service(&mut k), Some(b));

    assert_eq!(k.abort_delay(b), Ok(false));
    assert_eq!(k.abort_delay(a), Ok(true));
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::Aborted)));
}

#[cfg(feature = "abort-delay")]
#[test]
fn aborted_event_wait_leaves_the_list() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();
    let ev = k.create_event_list().unwrap();
    k.block_on_event_list(ev, MAX_DELAY).unwrap();
    assert_eq!(service(&mut k), Some(b));

    assert_eq!(k.abort_delay(a), Ok(true));
    assert!(k.event_list_waiters(ev).unwrap().is_empty());
    assert_eq!(service(&mut k), Some(a));
    assert_eq!(k.take_block_outcome(), Ok(Some(BlockOutcome::Aborted)));
}

#[test]
fn lowering_own_priority_yields() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 3);
    let b = spawn(&mut k, "B", 2);
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(a));

    k.set_priority(None, 1).unwrap();
    assert_eq!(service(&mut k), Some(b));
    assert_eq!(k.base_priority(Some(a)), Ok(1));

    k.set_priority(Some(a), 5).unwrap();
    assert_eq!(service(&mut k), Some(a));
}

#[cfg(not(debug_assertions))]
#[test]
fn out_of_range_priority_is_clamped() {
    let mut k = kernel();
    let t = spawn(&mut k, "T", 99);
    assert_eq!(k.priority(Some(t)), Ok((MAX_PRIORITIES - 1) as Priority));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_priority_asserts_in_debug_builds() {
    let mut k = kernel();
    spawn(&mut k, "T", 99);
}

#[test]
fn check_for_timeout_counts_down() {
    let mut k = kernel();
    spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();

    let mut timeout = k.set_timeout_state();
    let mut remaining = 10;
    ticks(&mut k, 4);
    assert!(!k.check_for_timeout(&mut timeout, &mut remaining));
    assert_eq!(remaining, 6);
    ticks(&mut k, 6);
    assert!(k.check_for_timeout(&mut timeout, &mut remaining));
    assert_eq!(remaining, 0);

    let mut forever = MAX_DELAY;
    assert!(!k.check_for_timeout(&mut timeout, &mut forever));
}

#[test]
fn bounded_heap_reports_exhaustion() {
    init_logging();
    let heap = rtos_task_core::memory::BoundedStacks::new(2048);
    let mut k = Scheduler::new(rtos_task_core::port::HostPort::new(), Box::new(heap));
    let mut created = 0;
    loop {
        match k.create_task(entry, "T", 96, 0, 1) {
            Ok(_) => created += 1,
            Err(e) => {
                assert_eq!(e, TaskError::AllocationFailure);
                break;
            }
        }
    }
    assert!(created > 0);
    assert_eq!(k.number_of_tasks(), created);
}

#[cfg(feature = "generate-run-time-stats")]
#[test]
fn run_time_is_charged_to_the_running_task() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();

    k.port().advance_run_time(3000);
    k.delay(5).unwrap();
    assert_eq!(service(&mut k), Some(b));
    k.port().advance_run_time(1000);
    assert_eq!(ticks(&mut k, 5), Some(a));

    assert_eq!(k.run_time_counter(Some(a)), Ok(3000));
    assert_eq!(k.run_time_counter(Some(b)), Ok(1000));
    assert_eq!(k.total_run_time(), 4000);
    assert_eq!(k.run_time_percent(Some(a)), Ok(75));
}

#[cfg(feature = "thread-local-storage")]
#[test]
fn thread_local_slots_are_per_task() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.set_thread_local(Some(a), 1, 42).unwrap();
    assert_eq!(k.thread_local(Some(a), 1), Ok(42));
    assert_eq!(k.thread_local(Some(b), 1), Ok(0));
    assert_eq!(
        k.set_thread_local(Some(a), NUM_THREAD_LOCAL_STORAGE_POINTERS, 1),
        Err(TaskError::InvalidStorageIndex)
    );
}

#[cfg(feature = "trace-facility")]
#[test]
fn system_state_describes_every_task() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();
    k.delay(5).unwrap();
    service(&mut k);

    let states = k.system_state();
    assert_eq!(states.len(), 3);
    assert_eq!(k.task_by_name("IDLE"), k.idle_task());
    assert_eq!(k.task_by_name("B"), Some(b));

    let info = k.task_info(a).unwrap();
    assert_eq!(info.name.as_str(), "A");
    assert_eq!(info.state, TaskState::Blocked);
    assert_eq!(info.current_priority, 2);
    assert_eq!(
        info.stack_high_water_mark,
        96 - STACK_GUARD_WORDS - <port::HostPort as port::Port>::INITIAL_FRAME_WORDS
    );
    assert_eq!(k.task_info(b).unwrap().state, TaskState::Running);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "interrupt context")]
fn blocking_from_interrupt_context_is_refused() {
    let mut k = kernel();
    spawn(&mut k, "A", 2);
    k.start_scheduler().unwrap();
    k.port().enter_isr();
    let _ = k.delay(1);
}

#[test]
fn priority_lowered_before_start_yields_to_next_level() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.set_priority(Some(a), 0).unwrap();
    k.start_scheduler().unwrap();

    assert_eq!(service(&mut k), Some(b));
    assert_eq!(k.highest_ready_priority(), Some(1));
    assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    assert_eq!(ticks(&mut k, 3), Some(b));
}

#[test]
fn task_resumed_before_start_runs_first() {
    let mut k = kernel();
    let h = spawn(&mut k, "H", 5);
    let l = spawn(&mut k, "L", 1);
    k.suspend_task(Some(h)).unwrap();
    assert_eq!(k.current(), Some(l));
    assert_eq!(k.resume_task(h), Ok(true));
    k.start_scheduler().unwrap();

    assert_eq!(service(&mut k), Some(h));
    assert_eq!(k.task_state(h), Ok(TaskState::Running));
    assert_eq!(k.task_state(l), Ok(TaskState::Ready));
}

#[test]
fn current_deleted_before_start_is_replaced() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 3);
    let b = spawn(&mut k, "B", 4);
    k.delete_task(Some(b)).unwrap();
    k.start_scheduler().unwrap();
    assert_eq!(k.current(), Some(a));
    assert_eq!(k.number_of_tasks(), 2);
}

#[cfg(feature = "application-task-tag")]
fn scaled(param: usize) -> BaseType {
    (param * 3) as BaseType
}

#[cfg(feature = "application-task-tag")]
#[test]
fn application_tag_is_called_with_the_given_parameter() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let b = spawn(&mut k, "B", 1);
    k.start_scheduler().unwrap();

    assert!(k.application_task_tag(Some(b)).unwrap().is_none());
    assert_eq!(k.call_application_task_hook(Some(b), 7), Ok(None));

    k.set_application_task_tag(None, Some(scaled)).unwrap();
    assert!(k.application_task_tag(Some(a)).unwrap().is_some());
    assert_eq!(k.call_application_task_hook(None, 7), Ok(Some(21)));
    assert_eq!(k.call_application_task_hook(Some(b), 7), Ok(None));

    k.set_application_task_tag(Some(a), None).unwrap();
    assert_eq!(k.call_application_task_hook(Some(a), 7), Ok(None));
}

#[cfg(feature = "trace-facility")]
#[test]
fn task_number_is_set_by_the_application() {
    let mut k = kernel();
    let a = spawn(&mut k, "A", 2);
    let created = k.task_info(a).unwrap().number;
    assert_eq!(k.task_number(a), Ok(0));
    k.set_task_number(a, 42).unwrap();
    assert_eq!(k.task_number(a), Ok(42));
    assert_eq!(k.task_info(a).unwrap().number, created);

    k.delete_task(Some(a)).unwrap();
    assert_eq!(k.task_number(a), Err(TaskError::InvalidHandle));
}
