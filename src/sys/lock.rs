//! The interrupt lock.
//!
//! All pending-interrupt state is mutated under a single system-wide lock.
//! Holding the lock is represented by an [`IntGuard`], which functions that
//! mutate interrupt state take as proof.
//!
//! Acquiring the lock on behalf of a processor is also how that processor
//! reports to an in-progress barrier (see [`sync`]): a processor that obtains the mutex while
//! a barrier is being requested must first check in and wait for the barrier to be released.
//!
//! The lock's logical owner is mirrored in an atomic so that [`System::is_held_by`]
//! can be answered without taking the lock.
//!
//! [`sync`]: super::sync

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::cpu::CpuShared;
use super::signal::ServiceRequest;
use super::{CpuMask, System};

/// Owner value: the lock is not held.
pub const LOCK_OWNER_NONE: u16 = 0xFFFF;
/// Owner value: the lock is held by a thread that is not a processor.
pub const LOCK_OWNER_OTHER: u16 = 0xFFFE;

/// State guarded by the interrupt lock.
#[derive(Debug)]
pub(crate) struct SysState {
    pub(crate) config_mask: CpuMask,
    pub(crate) started_mask: CpuMask,
    pub(crate) waiting_mask: CpuMask,

    pub(crate) syncing: bool,
    pub(crate) sync_mask: CpuMask,

    pub(crate) service: Option<ServiceRequest>,

    /// TOD value at which each processor last entered the wait state (0 while not waiting).
    pub(crate) waittod: Box<[u64]>,
    /// Accumulated TOD units each processor has spent waiting.
    pub(crate) waittime: Box<[u64]>,
}

/// The interrupt lock and its condition variables.
pub(crate) struct IntLock {
    state: Mutex<SysState>,
    owner: AtomicU16,
    syncing: AtomicBool,

    /// Signalled when the last expected responder reports to the barrier.
    pub(crate) sync_cond: Condvar,
    /// Broadcast when the barrier requester is done.
    pub(crate) sync_bc_cond: Condvar,
}
impl IntLock {
    pub(crate) fn new(config_mask: CpuMask, num_cpus: usize) -> Self {
        Self {
            state: Mutex::new(SysState {
                config_mask,
                started_mask: CpuMask::EMPTY,
                waiting_mask: CpuMask::EMPTY,
                syncing: false,
                sync_mask: CpuMask::EMPTY,
                service: None,
                waittod: vec![0; num_cpus].into_boxed_slice(),
                waittime: vec![0; num_cpus].into_boxed_slice(),
            }),
            owner: AtomicU16::new(LOCK_OWNER_NONE),
            syncing: AtomicBool::new(false),
            sync_cond: Condvar::new(),
            sync_bc_cond: Condvar::new(),
        }
    }

    /// Whether a barrier is in progress, read without the lock.
    pub(crate) fn syncing_hint(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }
    pub(crate) fn set_syncing(&self, state: &mut SysState, value: bool) {
        state.syncing = value;
        self.syncing.store(value, Ordering::Release);
    }
    pub(crate) fn set_owner(&self, owner: u16) {
        self.owner.store(owner, Ordering::Release);
    }
}
impl std::fmt::Debug for IntLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntLock")
            .field("owner", &format_args!("{:04X}", self.owner.load(Ordering::Relaxed)))
            .field("syncing", &self.syncing_hint())
            .finish_non_exhaustive()
    }
}

/// Proof that the interrupt lock is held.
///
/// Dropping the guard releases the lock.
pub struct IntGuard<'s> {
    sys: &'s System,
    pub(crate) state: MutexGuard<'s, SysState>,
    owner: u16,
}
impl<'s> IntGuard<'s> {
    /// The system this lock belongs to.
    pub fn system(&self) -> &'s System {
        self.sys
    }
    /// The processor holding the lock, or `None` for a non-processor thread.
    pub fn owner(&self) -> Option<u16> {
        match self.owner {
            LOCK_OWNER_OTHER => None,
            cpuad => Some(cpuad),
        }
    }

    /// Processors in the configuration.
    pub fn config_mask(&self) -> CpuMask {
        self.state.config_mask
    }
    /// Processors that are started.
    pub fn started_mask(&self) -> CpuMask {
        self.state.started_mask
    }
    /// Processors idling in the wait state.
    pub fn waiting_mask(&self) -> CpuMask {
        self.state.waiting_mask
    }

    /// Releases the lock.
    pub fn release(self) {}

    /// Waits on `cond`, temporarily releasing the lock.
    ///
    /// On wakeup, this reports to any barrier in progress before returning, so a processor
    /// resuming from an idle wait never runs concurrently with a barrier requester.
    pub(crate) fn wait_on(&mut self, cpu: Option<&CpuShared>, cond: &Condvar) {
        let sys = self.sys;
        let intlock = &sys.intlock;
        intlock.set_owner(LOCK_OWNER_NONE);
        cond.wait(&mut self.state);
        if let Some(cpu) = cpu {
            respond_to_barrier(intlock, &mut self.state, cpu);
        }
        intlock.set_owner(self.owner);
    }
}
impl Drop for IntGuard<'_> {
    fn drop(&mut self) {
        self.sys.intlock.set_owner(LOCK_OWNER_NONE);
    }
}
impl std::fmt::Debug for IntGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntGuard")
            .field("owner", &self.owner())
            .field("state", &*self.state)
            .finish()
    }
}

/// The responder half of the barrier.
///
/// While a barrier is in progress, the processor removes itself from the expected set
/// (waking the requester if it was the last), then waits until the requester is done.
fn respond_to_barrier(intlock: &IntLock, state: &mut MutexGuard<'_, SysState>, cpu: &CpuShared) {
    while state.syncing {
        state.sync_mask.remove(cpu.cpuad());
        if state.sync_mask.is_empty() {
            intlock.sync_cond.notify_one();
        }
        log::trace!("CPU{:04X}: reported to barrier", cpu.cpuad());
        intlock.sync_bc_cond.wait(state);
    }
}

impl System {
    /// Acquires the interrupt lock.
    ///
    /// `cpuad` identifies the processor acquiring the lock, or is `None` for other threads.
    /// While blocked, a processor counts as having reached a syncpoint.
    /// If a barrier is in progress when the mutex is obtained, this waits for the barrier
    /// to be released before returning (a processor first reports to it).
    pub fn acquire(&self, cpuad: Option<u16>) -> IntGuard<'_> {
        let cpu = cpuad.and_then(|ad| self.cpu(ad).ok());
        if let Some(cpu) = cpu {
            cpu.set_intwait(true);
        }

        let mut state = self.intlock.state.lock();
        match cpu {
            Some(cpu) => {
                respond_to_barrier(&self.intlock, &mut state, cpu);
                cpu.set_intwait(false);
            },
            // another requester is mid-barrier with the mutex released
            None => while state.syncing {
                self.intlock.sync_bc_cond.wait(&mut state);
            },
        }

        let owner = cpuad.unwrap_or(LOCK_OWNER_OTHER);
        self.intlock.set_owner(owner);
        IntGuard { sys: self, state, owner }
    }

    /// Acquires the interrupt lock if it is immediately available.
    ///
    /// The lock is never acquired this way while a barrier is in progress.
    /// A processor should instead [`acquire`](Self::acquire) the lock and report to the barrier.
    pub fn try_acquire(&self, cpuad: Option<u16>) -> Option<IntGuard<'_>> {
        let state = self.intlock.state.try_lock()?;
        if state.syncing {
            return None;
        }

        let owner = cpuad.unwrap_or(LOCK_OWNER_OTHER);
        self.intlock.set_owner(owner);
        Some(IntGuard { sys: self, state, owner })
    }

    /// Releases the interrupt lock.
    pub fn release(&self, guard: IntGuard<'_>) {
        guard.release();
    }

    /// Whether the interrupt lock is held by `cpuad` (or by a non-processor thread, if `None`).
    pub fn is_held_by(&self, cpuad: Option<u16>) -> bool {
        self.intlock.owner.load(Ordering::Acquire) == cpuad.unwrap_or(LOCK_OWNER_OTHER)
    }
}
