//! The stop-the-world barrier.
//!
//! [`synchronize_cpus`] blocks the lock holder until no other started processor is executing
//! instructions. Every other started processor must either be blocked acquiring the interrupt lock,
//! idle in the wait state, or report to the barrier by acquiring the lock.
//!
//! The barrier is two-phase:
//! 1. The requester publishes the set of processors it expects to hear from and
//!     waits on `sync_cond` until that set is empty.
//! 2. Each responder removes itself from the set (the last one signals `sync_cond`)
//!     and waits on `sync_bc_cond` until the requester broadcasts that it is done.
//!
//! There is no timeout. A processor that never reaches a syncpoint stalls the requester.

use super::cpu::IC_INTERRUPT;
use super::lock::{IntGuard, LOCK_OWNER_NONE, LOCK_OWNER_OTHER};
use super::System;

/// Waits until every other started processor has reached a syncpoint.
///
/// The caller must hold the interrupt lock (on behalf of a processor or otherwise).
/// When this returns, the lock is still held and no other started processor is
/// executing instructions until it is released.
pub fn synchronize_cpus(guard: &mut IntGuard<'_>) {
    let sys = guard.system();
    let me = guard.owner();

    let mut mask = guard.started_mask().without(guard.waiting_mask());
    if let Some(cpuad) = me {
        mask.remove(cpuad);
    }

    for cpuad in mask.iter() {
        let Ok(cpu) = sys.cpu(cpuad) else { continue };
        if cpu.intwait() {
            mask.remove(cpuad);
        } else {
            cpu.ints.on(guard, IC_INTERRUPT);
            if cpu.sie_active() {
                cpu.guest_ints.on(guard, IC_INTERRUPT);
            }
        }
    }

    if mask.is_empty() {
        return;
    }

    log::trace!("{}: synchronizing {:?}", requester(me), mask);
    let intlock = &sys.intlock;
    guard.state.sync_mask = mask;
    intlock.set_syncing(&mut guard.state, true);
    intlock.set_owner(LOCK_OWNER_NONE);

    while !guard.state.sync_mask.is_empty() {
        intlock.sync_cond.wait(&mut guard.state);
    }

    intlock.set_owner(me.unwrap_or(LOCK_OWNER_OTHER));
    intlock.set_syncing(&mut guard.state, false);
    intlock.sync_bc_cond.notify_all();
    log::trace!("{}: synchronized", requester(me));
}

fn requester(cpuad: Option<u16>) -> String {
    match cpuad {
        Some(ad) => format!("CPU{ad:04X}"),
        None => String::from("host"),
    }
}

impl System {
    /// Reports that processor `cpuad` is at a safe point between instructions.
    ///
    /// If a barrier is in progress, this reports to it and returns once it is released.
    /// Otherwise, this returns immediately without taking the lock.
    pub fn syncpoint(&self, cpuad: u16) {
        if self.intlock.syncing_hint() {
            self.acquire(Some(cpuad)).release();
        }
    }
}
