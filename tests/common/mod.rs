//! Shared harness: the test plays the part of the port's tick and switch
//! interrupt handlers.

#![allow(dead_code)]

use rtos_task_core::port::{HostPort, Port};
use rtos_task_core::*;

pub type Kernel = Scheduler<HostPort>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn entry(_: usize) {}

pub fn kernel() -> Kernel {
    init_logging();
    Scheduler::with_global_allocator(HostPort::new())
}

/// Run the switch handler if a switch is pending and return the current task.
pub fn service(k: &mut Kernel) -> Option<TaskHandle> {
    if k.port().take_switch_request() {
        k.switch_context()
    } else {
        k.current()
    }
}

/// One tick interrupt followed by the switch handler.
pub fn tick(k: &mut Kernel) -> Option<TaskHandle> {
    let switch = k.increment_tick();
    k.port().yield_from_isr(switch);
    service(k)
}

pub fn ticks(k: &mut Kernel, n: usize) -> Option<TaskHandle> {
    for _ in 0..n {
        tick(k);
    }
    k.current()
}

pub fn spawn(k: &mut Kernel, name: &str, priority: Priority) -> TaskHandle {
    k.create_task(entry, name, 96, 0, priority).unwrap()
}
