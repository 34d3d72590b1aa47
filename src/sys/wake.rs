//! Waking and idling processors.
//!
//! Idle processors sleep on their own condition (`intcond`) with the interrupt lock released.
//! Anything that makes work for a processor (a pending bit, a run-state change)
//! happens under the lock and is followed by a wakeup, so no wakeup is lost.
//!
//! This module provides:
//! - [`System::wake`]: wake one specific processor.
//! - [`IntGuard::wake_one_of`]: wake the least-recently-used idle processor of a set.
//! - [`IntGuard::wake_all`]: wake every processor of a set.
//! - [`System::stop_all`], [`System::start_all`]: operator start/stop requests.
//! - [`System::all_stopped`], [`System::any_started`]: polling helpers for those requests.

use super::cpu::{CpuShared, CpuState, IC_INTERRUPT};
use super::lock::IntGuard;
use super::{CpuMask, System};

impl System {
    /// Wakes processor `cpu` if it is idle.
    ///
    /// This is idempotent. Callers should make the processor's new work visible under the lock first.
    pub fn wake(&self, cpu: &CpuShared) {
        cpu.intcond.notify_one();
    }

    /// Asks every started processor to stop.
    ///
    /// This does not wait for the processors to stop (see [`System::all_stopped`]).
    /// Returns the number of processors asked.
    pub fn stop_all(&self) -> usize {
        let guard = self.acquire(None);
        let mut n = 0;
        for cpu in self.cpus() {
            if cpu.state() == CpuState::Started {
                cpu.set_opinterv(&guard, true);
                cpu.set_state(&guard, CpuState::Stopping);
                cpu.ints.on(&guard, IC_INTERRUPT);
                self.wake(cpu);
                n += 1;
            }
        }
        log::info!("Stop requested for {n} processor(s)");
        n
    }

    /// Starts every processor that is not started.
    ///
    /// Each one is asked to rescan its interrupts when it resumes.
    /// This does not wait for the processors to start (see [`System::any_started`]).
    /// Returns the number of processors started.
    pub fn start_all(&self) -> usize {
        let guard = self.acquire(None);
        let mut n = 0;
        for cpu in self.cpus() {
            if cpu.state() != CpuState::Started {
                cpu.set_opinterv(&guard, false);
                cpu.set_state(&guard, CpuState::Started);
                cpu.ints.on(&guard, IC_INTERRUPT);
                self.wake(cpu);
                n += 1;
            }
        }
        log::info!("Start requested for {n} processor(s)");
        n
    }

    /// Whether every configured processor is stopped.
    pub fn all_stopped(&self) -> bool {
        let _guard = self.acquire(None);
        self.cpus().iter().all(|cpu| cpu.state() == CpuState::Stopped)
    }

    /// Whether any configured processor is started.
    pub fn any_started(&self) -> bool {
        let _guard = self.acquire(None);
        self.cpus().iter().any(|cpu| cpu.state() == CpuState::Started)
    }
}

impl IntGuard<'_> {
    /// Wakes the least-recently-used processor of `mask`.
    ///
    /// The processor chosen is the one that entered the wait state earliest,
    /// with ties broken by the most accumulated wait time.
    /// A wait timestamp of zero (a processor not known to be waiting) never wins on age.
    ///
    /// Returns the processor woken, if any.
    pub fn wake_one_of(&self, mask: CpuMask) -> Option<u16> {
        let sys = self.system();
        let mut lru: Option<(u16, u64, u64)> = None;

        for cpuad in mask.iter() {
            let i = usize::from(cpuad);
            let (Some(&tod), Some(&time)) = (self.state.waittod.get(i), self.state.waittime.get(i)) else { continue };

            let pick = match lru {
                None => true,
                Some((_, lru_tod, lru_time)) => {
                    (tod > 0 && tod < lru_tod) || (tod == lru_tod && time >= lru_time)
                }
            };
            if pick {
                lru = Some((cpuad, tod, time));
            }
        }

        let (cpuad, _, _) = lru?;
        let cpu = sys.cpu(cpuad).ok()?;
        log::trace!("CPU{cpuad:04X}: woken as least recently used of {mask:?}");
        sys.wake(cpu);
        Some(cpuad)
    }

    /// Wakes every processor of `mask`.
    pub fn wake_all(&self, mask: CpuMask) {
        let sys = self.system();
        for cpu in mask.iter().filter_map(|ad| sys.cpu(ad).ok()) {
            sys.wake(cpu);
        }
    }

    /// Sets the run state of processor `cpuad`, keeping the started set in step.
    ///
    /// A stopping processor is still considered started.
    pub(crate) fn set_cpu_state(&mut self, cpuad: u16, state: CpuState) {
        let Ok(cpu) = self.system().cpu(cpuad) else { return };
        cpu.set_state(self, state);
        match state {
            CpuState::Started => self.state.started_mask.insert(cpuad),
            CpuState::Stopping => {},
            CpuState::Stopped | CpuState::Load => self.state.started_mask.remove(cpuad),
        }
    }

    /// Idles processor `cpu` until it is woken.
    ///
    /// If `wait_state` is set, the processor is idling in the architected wait state:
    /// it is counted in the waiting set and its wait timestamps are maintained.
    /// Otherwise, it is idling because it is not started.
    pub(crate) fn wait_for_wakeup(&mut self, cpu: &CpuShared, wait_state: bool) {
        let sys = self.system();
        let cpuad = cpu.cpuad();
        let i = usize::from(cpuad);

        if wait_state {
            if let Some(tod) = self.state.waittod.get_mut(i) {
                *tod = sys.tod().now().max(1);
            }
            self.state.waiting_mask.insert(cpuad);
        }

        self.wait_on(Some(cpu), &cpu.intcond);

        if wait_state {
            self.state.waiting_mask.remove(cpuad);
            let now = sys.tod().now();
            let state = &mut *self.state;
            if let (Some(tod), Some(time)) = (state.waittod.get_mut(i), state.waittime.get_mut(i)) {
                *time += now.saturating_sub(*tod);
                *tod = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::sys::config::SysConfig;
    use crate::sys::storage::MainStorage;

    use super::*;

    fn sys(n: usize) -> Arc<System> {
        let config = SysConfig { num_cpus: n, main_storage: 1 << 20, ..Default::default() };
        System::new(config, Arc::new(MainStorage::new(1 << 20))).unwrap()
    }

    #[test]
    fn test_lru_oldest_waiter() {
        let sys = sys(4);
        let mut guard = sys.acquire(None);
        guard.state.waittod.copy_from_slice(&[300, 100, 200, 400]);
        assert_eq!(guard.wake_one_of(CpuMask(0b1111)), Some(1));
        assert_eq!(guard.wake_one_of(CpuMask(0b1101)), Some(2));
    }

    #[test]
    fn test_lru_tie_prefers_longest_waiting() {
        let sys = sys(3);
        let mut guard = sys.acquire(None);
        guard.state.waittod.copy_from_slice(&[100, 100, 100]);
        guard.state.waittime.copy_from_slice(&[5, 50, 20]);
        assert_eq!(guard.wake_one_of(CpuMask(0b111)), Some(1));
    }

    #[test]
    fn test_lru_zero_timestamp_never_wins_on_age() {
        let sys = sys(2);
        let mut guard = sys.acquire(None);
        guard.state.waittod.copy_from_slice(&[100, 0]);
        assert_eq!(guard.wake_one_of(CpuMask(0b11)), Some(0));
        assert_eq!(guard.wake_one_of(CpuMask::EMPTY), None);
    }

    #[test]
    fn test_start_stop_all() {
        let sys = sys(3);
        assert!(sys.all_stopped());
        assert!(!sys.any_started());

        assert_eq!(sys.start_all(), 3);
        assert!(sys.any_started());
        assert!(!sys.cpu(0).unwrap().opinterv());
        assert!(sys.cpus().iter().all(|c| c.ints.is_on(IC_INTERRUPT)));
        assert_eq!(sys.start_all(), 0);

        assert_eq!(sys.stop_all(), 3);
        let cpu = sys.cpu(2).unwrap();
        assert_eq!(cpu.state(), CpuState::Stopping);
        assert!(cpu.opinterv());
        assert!(cpu.ints.is_on(IC_INTERRUPT));
        // nobody has actually stopped yet
        assert!(!sys.all_stopped());
    }

    #[test]
    fn test_started_mask_follows_state() {
        let sys = sys(2);
        let mut guard = sys.acquire(None);
        guard.set_cpu_state(1, CpuState::Started);
        assert_eq!(guard.started_mask(), CpuMask(0b10));
        guard.set_cpu_state(1, CpuState::Stopping);
        assert_eq!(guard.started_mask(), CpuMask(0b10));
        guard.set_cpu_state(1, CpuState::Stopped);
        assert!(guard.started_mask().is_empty());
    }
}
