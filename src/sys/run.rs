//! The processor thread loop.
//!
//! Each processor runs [`run_cpu`] on its own OS thread. Between instructions the loop:
//! 1. leaves interpretive execution when the host has an open external interrupt,
//! 2. handles run-state changes (stop requests, idling while stopped),
//! 3. delivers open external interrupts,
//! 4. idles while the PSW is in the wait state,
//! 5. reports a syncpoint, then executes one instruction through the [`Executor`].
//!
//! The loop is the only consumer of [`Transfer`] results.

use std::sync::Arc;
use std::thread::JoinHandle;

use super::cpu::{CpuShared, CpuState, Processor, IC_EXTPENDING, IC_INTERRUPT};
use super::external::{scan_and_dispatch, ExtCode, Scan, Transfer};
use super::{ProgramCheck, SysErr, System};

/// Why interpretive execution of a SIE guest ended.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SieExit {
    /// A guest external interrupt was intercepted.
    Intercept(ExtCode),
    /// The host has an open external interrupt of its own.
    ///
    /// The host takes it through its own PSA on the next pass of the loop.
    HostInterrupt,
}

/// Executes instructions on behalf of the processor loop.
pub trait Executor: Send + 'static {
    /// Executes one instruction on `cpu`.
    ///
    /// `cpu` is the guest context when the processor is interpreting a SIE guest.
    fn execute(&mut self, sys: &System, cpu: &mut Processor);

    /// Delivers a program interruption to `cpu`.
    ///
    /// By default, this logs the interruption and does nothing else.
    fn program_interrupt(&mut self, _sys: &System, cpu: &mut Processor, pc: ProgramCheck) {
        log::warn!("CPU{:04X}: unhandled {pc}", cpu.cpuad);
    }

    /// Handles the end of interpretive execution of `guest`.
    ///
    /// `host` has already left interpretive execution. By default, the guest is discarded.
    fn sie_exit(&mut self, _sys: &System, host: &mut Processor, _guest: Processor, reason: SieExit) {
        match reason {
            SieExit::Intercept(code) => log::debug!("CPU{:04X}: SIE exit for external interrupt {:04X}", host.cpuad, code.code()),
            SieExit::HostInterrupt => log::debug!("CPU{:04X}: SIE exit for host interrupt", host.cpuad),
        }
    }
}
impl dyn Executor {} // assert Executor is dyn safe

impl<F: FnMut(&System, &mut Processor) + Send + 'static> Executor for F {
    fn execute(&mut self, sys: &System, cpu: &mut Processor) {
        self(sys, cpu)
    }
}

/// Runs processor `cpu` until the system shuts down, returning its final state.
pub fn run_cpu(sys: &System, mut cpu: Processor, mut exec: impl Executor) -> Processor {
    let cpuad = cpu.cpuad;
    let shared = Arc::clone(cpu.shared());
    log::debug!("CPU{cpuad:04X}: thread started");

    // the run state may have changed before this thread existed
    {
        let mut guard = sys.acquire(Some(cpuad));
        let state = shared.state();
        guard.set_cpu_state(cpuad, state);
    }

    while !sys.is_shutdown() {
        if host_pending(&shared) && shared.state() == CpuState::Started {
            if let Some(guest) = cpu.exit_sie() {
                exec.sie_exit(sys, &mut cpu, guest, SieExit::HostInterrupt);
            }
            continue;
        }
        let ctx = cpu.context_mut();

        if ctx.ints().open() != 0 || shared.ints.is_on(IC_INTERRUPT) || shared.state() != CpuState::Started {
            let mut guard = sys.acquire(Some(cpuad));
            shared.ints.off(&guard, IC_INTERRUPT);
            shared.guest_ints.off(&guard, IC_INTERRUPT);

            if shared.state() == CpuState::Stopping {
                guard.set_cpu_state(cpuad, CpuState::Stopped);
                log::info!("CPU{cpuad:04X}: stopped");
            }
            if shared.state() != CpuState::Started {
                guard.set_cpu_state(cpuad, shared.state());
                while shared.state() != CpuState::Started && !sys.is_shutdown() {
                    guard.wait_for_wakeup(&shared, false);
                }
                if shared.state() == CpuState::Started {
                    guard.set_cpu_state(cpuad, CpuState::Started);
                    log::info!("CPU{cpuad:04X}: started");
                }
                continue;
            }

            let guard = match scan_and_dispatch(ctx, guard) {
                Scan::Delivered(transfer) => {
                    handle_transfer(sys, &mut cpu, &mut exec, transfer);
                    continue;
                },
                Scan::Idle(guard) => guard,
            };

            if ctx.psw.wait() {
                let mut guard = guard;
                if !host_pending(&shared) && !sys.is_shutdown() {
                    guard.wait_for_wakeup(&shared, true);
                }
                continue;
            }
            drop(guard);
        } else if ctx.psw.wait() {
            let mut guard = sys.acquire(Some(cpuad));
            // recheck under the lock so a wakeup is not missed
            if may_idle(sys, &shared, ctx) {
                guard.wait_for_wakeup(&shared, true);
            }
            continue;
        }

        sys.syncpoint(cpuad);
        exec.execute(sys, ctx);
    }

    log::debug!("CPU{cpuad:04X}: thread exiting");
    cpu
}

/// Whether the host has an open external interrupt while a guest is being interpreted.
fn host_pending(shared: &CpuShared) -> bool {
    shared.sie_active() && shared.ints.open() & IC_EXTPENDING != 0
}

/// Whether nothing the loop reacts to has arrived for `ctx`.
///
/// Only meaningful with the interrupt lock held.
fn may_idle(sys: &System, shared: &CpuShared, ctx: &Processor) -> bool {
    ctx.ints().open() == 0
        && !shared.ints.is_on(IC_INTERRUPT)
        && shared.state() == CpuState::Started
        && !host_pending(shared)
        && !sys.is_shutdown()
}

fn handle_transfer(sys: &System, cpu: &mut Processor, exec: &mut impl Executor, transfer: Transfer) {
    match transfer {
        Transfer::Resume => {},
        Transfer::Intercept(code) => {
            if let Some(guest) = cpu.exit_sie() {
                exec.sie_exit(sys, cpu, guest, SieExit::Intercept(code));
            }
        },
        Transfer::Program(pc) => {
            exec.program_interrupt(sys, cpu.context_mut(), pc);
        },
    }
}

/// Spawns a thread running [`run_cpu`] for processor `cpuad`.
///
/// The thread is named after the processor and yields the processor's final state when joined.
pub fn spawn_cpu(sys: Arc<System>, cpuad: u16, exec: impl Executor) -> Result<JoinHandle<Processor>, SysErr> {
    let cpu = sys.processor(cpuad)?;
    std::thread::Builder::new()
        .name(format!("CPU{cpuad:04X}"))
        .spawn(move || run_cpu(&sys, cpu, exec))
        .map_err(|e| SysErr::ThreadSpawn(format!("CPU{cpuad:04X}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crossbeam_channel as cbc;

    use crate::sys::config::SysConfig;
    use crate::sys::cpu::{SieGuest, IC_EXTCALL};
    use crate::sys::psa::Arch;
    use crate::sys::psw::{Psw, PSW_EXT_MASK};
    use crate::sys::storage::{MainStorage, Storage};

    use super::*;

    fn sys(n: usize) -> Arc<System> {
        let config = SysConfig { num_cpus: n, main_storage: 1 << 20, ..Default::default() };
        System::new(config, Arc::new(MainStorage::new(1 << 20))).unwrap()
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Executed(u64),
        Program(ProgramCheck),
        SieExit(SieExit),
    }

    /// Records what the loop asked of it, then shuts the system down.
    struct Recorder(cbc::Sender<Event>);
    impl Executor for Recorder {
        fn execute(&mut self, sys: &System, cpu: &mut Processor) {
            let _ = self.0.send(Event::Executed(cpu.psw.ia));
            sys.shutdown();
        }
        fn program_interrupt(&mut self, sys: &System, _cpu: &mut Processor, pc: ProgramCheck) {
            let _ = self.0.send(Event::Program(pc));
            sys.shutdown();
        }
        fn sie_exit(&mut self, sys: &System, host: &mut Processor, _guest: Processor, reason: SieExit) {
            assert!(!host.sie_mode());
            let _ = self.0.send(Event::SieExit(reason));
            sys.shutdown();
        }
    }

    fn enabled(cpu: &mut Processor) {
        cpu.psw = Psw { sysmask: PSW_EXT_MASK, amode64: true, amode31: true, ia: 0x1000, ..Default::default() };
        cpu.cr[0] = u64::from(IC_EXTCALL);
        cpu.set_ic_mask();
    }

    #[test]
    fn test_exits_on_shutdown() {
        let sys = sys(1);
        let cpu = sys.processor(0).unwrap();
        sys.shutdown();

        let (tx, rx) = cbc::unbounded();
        let cpu = run_cpu(&sys, cpu, Recorder(tx));
        assert_eq!(cpu.cpuad, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_executes_when_started() {
        let sys = sys(1);
        let cpu = sys.processor(0).unwrap();
        sys.start_all();

        let (tx, rx) = cbc::unbounded();
        run_cpu(&sys, cpu, Recorder(tx));
        assert_eq!(rx.try_recv(), Ok(Event::Executed(0)));
    }

    #[test]
    fn test_invalid_new_psw_becomes_program_check() {
        let sys = sys(2);
        let mut cpu = sys.processor(1).unwrap();
        enabled(&mut cpu);
        // EC bit set: not a valid z/Architecture PSW
        let mut new = [0; 16];
        new[1] = 0x08;
        new[8..].copy_from_slice(&0x6000u64.to_be_bytes());
        sys.storage().store(cpu.px + 0x1B0, &new).unwrap();
        sys.acquire(Some(0)).signal_external_call(0, 1).unwrap();
        sys.start_all();

        let (tx, rx) = cbc::unbounded();
        let cpu = run_cpu(&sys, cpu, Recorder(tx));
        assert_eq!(rx.try_recv(), Ok(Event::Program(ProgramCheck::SPECIFICATION)));
        // the program interruption sees the loaded PSW, not the interrupted one
        assert_eq!(cpu.psw.ia, 0x6000);
        assert!(!cpu.psw.ext_enabled());
    }

    #[test]
    fn test_intercept_leaves_sie() {
        let sys = sys(1);
        let mut host = sys.processor(0).unwrap();
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ..Default::default() };
        let mut guest = host.new_guest(Arch::ZArch, sie);
        enabled(&mut guest);
        host.enter_sie(guest);
        sys.cpu(0).unwrap().guest_ints.on(&sys.acquire(None), IC_EXTCALL);
        sys.start_all();

        let (tx, rx) = cbc::unbounded();
        let host = run_cpu(&sys, host, Recorder(tx));
        assert_eq!(rx.try_recv(), Ok(Event::SieExit(SieExit::Intercept(ExtCode::ExternalCall))));
        assert!(host.guest.is_none());
        assert!(!host.shared().sie_active());
    }

    #[test]
    fn test_host_interrupt_leaves_sie() {
        let sys = sys(2);
        let mut host = sys.processor(1).unwrap();
        enabled(&mut host);
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ..Default::default() };
        let mut guest = host.new_guest(Arch::ZArch, sie);
        enabled(&mut guest);
        host.enter_sie(guest);
        sys.acquire(Some(0)).signal_external_call(0, 1).unwrap();
        sys.start_all();

        let (tx, rx) = cbc::unbounded();
        let host = run_cpu(&sys, host, Recorder(tx));
        assert_eq!(rx.try_recv(), Ok(Event::SieExit(SieExit::HostInterrupt)));
        assert!(host.guest.is_none());
        // still pending for the host, not consumed by the guest
        assert!(host.shared().ints.is_on(IC_EXTCALL));
        assert!(!host.shared().guest_ints.is_on(IC_EXTCALL));
    }

    #[test]
    fn test_host_interrupt_disabled_keeps_guest() {
        let sys = sys(2);
        let mut host = sys.processor(1).unwrap();
        host.psw.sysmask = 0;
        host.set_ic_mask();
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ..Default::default() };
        let mut guest = host.new_guest(Arch::ZArch, sie);
        enabled(&mut guest);
        guest.psw.ia = 0x2000;
        host.enter_sie(guest);
        sys.acquire(Some(0)).signal_external_call(0, 1).unwrap();
        sys.start_all();

        let (tx, rx) = cbc::unbounded();
        let host = run_cpu(&sys, host, Recorder(tx));
        assert_eq!(rx.try_recv(), Ok(Event::Executed(0x2000)));
        assert!(host.guest.is_some());
    }

    #[test]
    fn test_may_idle_sees_pending_work() {
        let sys = sys(2);
        let mut cpu = sys.processor(1).unwrap();
        enabled(&mut cpu);
        let shared = Arc::clone(cpu.shared());
        sys.start_all();

        {
            let guard = sys.acquire(Some(1));
            // the start request itself asks for a scan
            assert!(!may_idle(&sys, &shared, &cpu));
            shared.ints.off(&guard, IC_INTERRUPT);
            assert!(may_idle(&sys, &shared, &cpu));
        }

        // a stop request arriving between the unlocked check and the lock
        sys.stop_all();
        {
            let guard = sys.acquire(Some(1));
            assert!(!may_idle(&sys, &shared, &cpu));
            shared.ints.off(&guard, IC_INTERRUPT);
            shared.set_state(&guard, CpuState::Started);
            assert!(may_idle(&sys, &shared, &cpu));
        }

        // a host signal while a guest runs
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ..Default::default() };
        let mut guest = cpu.new_guest(Arch::ZArch, sie);
        enabled(&mut guest);
        cpu.enter_sie(guest);
        sys.acquire(Some(0)).signal_external_call(0, 1).unwrap();
        {
            let _guard = sys.acquire(Some(1));
            assert!(cpu.context_mut().ints().open() == 0);
            assert!(!may_idle(&sys, &shared, cpu.context_mut()));
        }
    }

    #[test]
    fn test_stop_request_parks_thread() {
        let sys = sys(1);
        let handle = spawn_cpu(Arc::clone(&sys), 0, |_: &System, _: &mut Processor| std::hint::spin_loop()).unwrap();
        sys.start_all();

        let start = Instant::now();
        while !sys.acquire(None).started_mask().contains(0) {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(sys.stop_all(), 1);
        while !sys.all_stopped() {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(sys.acquire(None).started_mask().is_empty());

        sys.shutdown();
        handle.join().unwrap();
    }
}
