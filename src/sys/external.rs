//! External interrupt scanning and delivery.
//!
//! A processor thread periodically checks its open (pending and enabled) interrupt bits.
//! When any are open, it takes the interrupt lock and calls [`scan_and_dispatch`], which
//! delivers the highest-priority external condition, if any:
//!
//! 1. interrupt key (not in SIE),
//! 2. malfunction alert (lowest-numbered originator first),
//! 3. emergency signal (lowest-numbered originator first),
//! 4. external call,
//! 5. clock comparator,
//! 6. CPU timer,
//! 7. interval timer, then the ECPS:VM virtual interval timer,
//! 8. service signal or block I/O.
//!
//! At most one interrupt is delivered per call.
//!
//! Delivery ([`external_interrupt`]) stores the interruption parameters and swaps the
//! current PSW with the external new PSW, then releases the lock. Its [`Transfer`] result tells
//! the processor's dispatch loop how to continue.

use std::sync::atomic::{AtomicBool, Ordering};

use super::cpu::{AbortReason, Processor};
use super::cpu::{IC_CLKC, IC_ECPSVTIMER, IC_EMERSIG, IC_EXTCALL, IC_INTKEY, IC_ITIMER, IC_MALFALT, IC_PTIMER, IC_SERVSIG};
use super::lock::IntGuard;
use super::psa::SIE_IP_PSA_OFFSET;
use super::psw::Psw;
use super::signal::{ServiceRequest, SERVSIG_ADDR};
use super::storage::Storage;
use super::{ProgramCheck, System};

/// External interruption codes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u16)]
pub enum ExtCode {
    /// Interrupt key.
    InterruptKey = 0x0040,
    /// Interval timer (also used by the ECPS:VM virtual interval timer).
    IntervalTimer = 0x0080,
    /// Clock comparator.
    ClockComparator = 0x1004,
    /// CPU timer.
    CpuTimer = 0x1005,
    /// Malfunction alert.
    MalfunctionAlert = 0x1200,
    /// Emergency signal.
    EmergencySignal = 0x1201,
    /// External call.
    ExternalCall = 0x1202,
    /// Service signal.
    ServiceSignal = 0x2401,
    /// VM block I/O.
    BlockIo = 0x2603,
}
impl ExtCode {
    /// The interruption code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this interruption stores a value in the external CPU-address field.
    ///
    /// For all other interruptions, the field is zeroed.
    pub fn carries_cpu_addr(self) -> bool {
        matches!(self,
            ExtCode::MalfunctionAlert
            | ExtCode::EmergencySignal
            | ExtCode::ExternalCall
            | ExtCode::BlockIo
        )
    }
}

/// How the dispatch loop continues after an interrupt attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Transfer {
    /// The interrupt was delivered. Resume dispatching at the new PSW.
    Resume,
    /// The interrupt must be intercepted and re-driven by the SIE host.
    Intercept(ExtCode),
    /// Delivery failed and a program interruption must be delivered instead.
    Program(ProgramCheck),
}

/// Result of [`scan_and_dispatch`].
#[derive(Debug)]
pub enum Scan<'s> {
    /// An interrupt was delivered and the lock was released.
    Delivered(Transfer),
    /// No interrupt was delivered. The lock is still held.
    Idle(IntGuard<'s>),
}

/// Interruption parameters stored alongside the interruption code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ExtParams {
    /// External CPU-address field (only stored for interruptions that carry it).
    pub cpu_addr: Option<u16>,
    /// 32-bit external interruption parameter.
    pub parm: Option<u32>,
    /// 64-bit block-I/O parameter.
    pub parm64: Option<u64>,
}

/// Delivers the highest-priority open external interrupt on `cpu`, if any.
///
/// `cpu` is the context taking the interrupt (a SIE guest context if the processor is interpreting one).
pub fn scan_and_dispatch<'s>(cpu: &mut Processor, guard: IntGuard<'s>) -> Scan<'s> {
    let sys = guard.system();
    let cpuad = cpu.cpuad;

    if cpu.ints().is_open(IC_INTKEY) && !cpu.sie_mode() {
        log::debug!("CPU{cpuad:04X}: interrupt key");
        guard.clear_interrupt_key();
        return deliver(cpu, guard, ExtCode::InterruptKey, ExtParams::default());
    }

    if cpu.ints().is_open(IC_MALFALT) {
        let shared = cpu.shared();
        match take_originator(shared.malfcpu()) {
            Some(from) => {
                if !shared.malfcpu().iter().any(|f| f.load(Ordering::Acquire)) {
                    cpu.ints().off(&guard, IC_MALFALT);
                }
                log::debug!("CPU{cpuad:04X}: malfunction alert from CPU{from:04X}");
                let params = ExtParams { cpu_addr: Some(from), ..Default::default() };
                return deliver(cpu, guard, ExtCode::MalfunctionAlert, params);
            },
            None => cpu.ints().off(&guard, IC_MALFALT),
        }
    }

    if cpu.ints().is_open(IC_EMERSIG) {
        let shared = cpu.shared();
        match take_originator(shared.emercpu()) {
            Some(from) => {
                if !shared.emercpu().iter().any(|f| f.load(Ordering::Acquire)) {
                    cpu.ints().off(&guard, IC_EMERSIG);
                }
                log::debug!("CPU{cpuad:04X}: emergency signal from CPU{from:04X}");
                let params = ExtParams { cpu_addr: Some(from), ..Default::default() };
                return deliver(cpu, guard, ExtCode::EmergencySignal, params);
            },
            None => cpu.ints().off(&guard, IC_EMERSIG),
        }
    }

    if cpu.ints().is_open(IC_EXTCALL) {
        let from = cpu.shared().extccpu();
        cpu.ints().off(&guard, IC_EXTCALL);
        log::debug!("CPU{cpuad:04X}: external call from CPU{from:04X}");
        let params = ExtParams { cpu_addr: Some(from), ..Default::default() };
        return deliver(cpu, guard, ExtCode::ExternalCall, params);
    }

    let now = sys.tod().now();
    if cpu.ints().is_open(IC_CLKC) && now > cpu.shared().clkc() {
        log::debug!("CPU{cpuad:04X}: clock comparator");
        return deliver(cpu, guard, ExtCode::ClockComparator, ExtParams::default());
    }

    if cpu.ints().is_open(IC_PTIMER) && cpu.shared().cpu_timer(now) < 0 {
        log::debug!("CPU{cpuad:04X}: CPU timer");
        return deliver(cpu, guard, ExtCode::CpuTimer, ExtParams::default());
    }

    let itimer_off = cpu.sie.is_some_and(|sie| sie.itimer_off);
    if cpu.ints().is_open(IC_ITIMER) && !itimer_off {
        cpu.ints().off(&guard, IC_ITIMER);
        log::debug!("CPU{cpuad:04X}: interval timer");
        return deliver(cpu, guard, ExtCode::IntervalTimer, ExtParams::default());
    }
    if sys.config().ecps_vtimer && cpu.ints().is_open(IC_ECPSVTIMER) {
        cpu.ints().off(&guard, IC_ECPSVTIMER);
        log::debug!("CPU{cpuad:04X}: ECPS:VM virtual interval timer");
        return deliver(cpu, guard, ExtCode::IntervalTimer, ExtParams::default());
    }

    if cpu.ints().is_open(IC_SERVSIG) {
        let mut guard = guard;
        match guard.take_service() {
            Some(ServiceRequest::ServiceSignal { parm }) => {
                let parm = match parm & SERVSIG_ADDR != 0 {
                    true  => cpu.arch.layout().apply_prefixing(u64::from(parm), cpu.px) as u32,
                    false => parm,
                };
                log::debug!("CPU{cpuad:04X}: service signal {parm:08X}");
                let params = ExtParams { parm: Some(parm), ..Default::default() };
                return deliver(cpu, guard, ExtCode::ServiceSignal, params);
            },
            Some(ServiceRequest::BlockIo { subcode, status, parm }) => {
                log::debug!("CPU{cpuad:04X}: block I/O subcode {subcode:02X} status {status:02X} parm {parm:016X}");
                let params = ExtParams {
                    cpu_addr: Some(u16::from(subcode) << 8 | u16::from(status)),
                    parm: (subcode != 0x03).then_some(parm as u32),
                    parm64: (subcode == 0x03).then_some(parm),
                };
                return deliver(cpu, guard, ExtCode::BlockIo, params);
            },
            None => return Scan::Idle(guard),
        }
    }

    Scan::Idle(guard)
}

fn take_originator(flags: &[AtomicBool]) -> Option<u16> {
    let i = flags.iter().position(|f| f.load(Ordering::Acquire))?;
    flags[i].store(false, Ordering::Release);
    u16::try_from(i).ok()
}

fn deliver<'s>(cpu: &mut Processor, guard: IntGuard<'s>, code: ExtCode, params: ExtParams) -> Scan<'s> {
    Scan::Delivered(external_interrupt(cpu, guard, code, params))
}

/// Delivers an external interrupt to `cpu`, releasing the lock.
///
/// The interruption code and parameters are stored in the context's prefixed storage area
/// (or, for a SIE guest without an assist, in the state descriptor's copy of it),
/// then the current PSW is stored as the external old PSW and the external new PSW is loaded.
///
/// An in-flight transaction is aborted before the old PSW is stored.
/// If the new PSW is invalid or storage cannot be accessed, this returns [`Transfer::Program`]
/// and the external interrupt is not completed.
pub fn external_interrupt(cpu: &mut Processor, guard: IntGuard<'_>, code: ExtCode, params: ExtParams) -> Transfer {
    let sys = guard.system();
    let result = exchange(sys, cpu, code, &params);
    guard.release();

    match result {
        Ok(transfer) => transfer,
        Err(pc) => {
            log::debug!("CPU{:04X}: external interrupt {:04X} became {pc}", cpu.cpuad, code.code());
            Transfer::Program(pc)
        }
    }
}

fn exchange(sys: &System, cpu: &mut Processor, code: ExtCode, params: &ExtParams) -> Result<Transfer, ProgramCheck> {
    let config = sys.config();
    let storage = sys.storage();
    let layout = cpu.arch.layout();

    let intercept = match cpu.sie {
        Some(sie) => {
            let expedited = config.expedited_sie_subset && sie.exp_timer;
            let assisted = config.external_interrupt_assist && sie.ext_assist;
            !expedited && !assisted
        },
        None => false,
    };

    let psa = match cpu.sie {
        Some(sie) if intercept => sie.state_desc + SIE_IP_PSA_OFFSET,
        _ => context_prefix(storage, cpu)?,
    };
    storage.mark_referenced_and_changed(psa);

    cpu.psw.intcode = code.code();

    let cpu_addr = match code.carries_cpu_addr() {
        true  => params.cpu_addr.unwrap_or(0),
        false => 0,
    };
    storage.store_hw(psa + layout.ext_cpu_addr, cpu_addr)?;
    if let Some(parm) = params.parm {
        storage.store_fw(psa + layout.ext_parm, parm)?;
    }
    if let Some(parm) = params.parm64 {
        match layout.bio_parm {
            Some(off) => storage.store_dw(psa + off, parm)?,
            None => storage.store_fw(psa + layout.ext_parm, parm as u32)?,
        }
    }

    // BC mode carries the code in the old PSW itself
    if cpu.psw.is_ec(cpu.arch) {
        storage.store_hw(psa + layout.ext_int_code, code.code())?;
    }

    if !intercept {
        if let Some(tx) = cpu.tx.take() {
            log::debug!("CPU{:04X}: aborting transaction for external interrupt", cpu.cpuad);
            tx.abort(cpu, AbortReason::ExternalInterrupt);
            cpu.psw.intcode = code.code();
        }

        let old = cpu.psw.to_bytes(cpu.arch);
        storage.store(psa + layout.ext_old, &old[..layout.psw_len])?;

        let mut new = [0; 16];
        storage.fetch(psa + layout.ext_new, &mut new[..layout.psw_len])?;
        // an invalid new PSW is still loaded; the exception is recognized after the swap
        let loaded = Psw::from_bytes(cpu.arch, &new);
        cpu.psw = Psw::decode(cpu.arch, &new[..layout.psw_len]);
        cpu.set_ic_mask();
        loaded?;
    }

    if config.has_interval_timer() {
        if let Some(off) = layout.int_timer {
            let pfx = context_prefix(storage, cpu)?;
            storage.store_fw(pfx + off, cpu.shared().itimer() as u32)?;
        }
    }

    match intercept {
        true => {
            log::debug!("CPU{:04X}: external interrupt {:04X} intercepted", cpu.cpuad, code.code());
            Ok(Transfer::Intercept(code))
        },
        false => Ok(Transfer::Resume),
    }
}

/// Absolute address of the context's prefixed storage area.
fn context_prefix(storage: &dyn Storage, cpu: &Processor) -> Result<u64, ProgramCheck> {
    match &cpu.sie {
        Some(sie) => storage.translate_guest(cpu.px, sie),
        None => Ok(cpu.px),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::sys::config::SysConfig;
    use crate::sys::cpu::{SavedTransaction, SieGuest, IC_EXTPENDING, IC_EXT_SCM};
    use crate::sys::psa::Arch;
    use crate::sys::psw::{PSW_EXT_MASK, PSW_WAIT};
    use crate::sys::storage::MainStorage;
    use crate::sys::timer::TodClock;

    use super::*;

    const NEW_IA: u64 = 0x8000;

    fn setup(config: SysConfig) -> (Arc<System>, Vec<Processor>) {
        let storage = Arc::new(MainStorage::new(config.main_storage));
        let sys = System::with_clock(config, storage, TodClock::manual(1000)).unwrap();
        let cpus = (0..sys.num_cpus() as u16)
            .map(|i| {
                let mut cpu = sys.processor(i).unwrap();
                enable(&mut cpu);
                write_new_psw(&sys, &cpu, Psw { ia: NEW_IA, amode31: true, amode64: cpu.arch.is_64bit(), ..Default::default() });
                cpu
            })
            .collect();
        (sys, cpus)
    }

    fn config(arch: Arch, n: usize) -> SysConfig {
        SysConfig { arch, num_cpus: n, main_storage: 1 << 20, ..Default::default() }
    }

    fn enable(cpu: &mut Processor) {
        cpu.psw.sysmask = PSW_EXT_MASK;
        cpu.psw.amode31 = true;
        cpu.psw.amode64 = cpu.arch.is_64bit();
        cpu.psw.ecmode = true;
        cpu.psw.ia = 0x1000;
        cpu.cr[0] = u64::from(IC_EXT_SCM);
        cpu.set_ic_mask();
    }

    fn write_new_psw(sys: &System, cpu: &Processor, psw: Psw) {
        let l = cpu.arch.layout();
        let bytes = psw.to_bytes(cpu.arch);
        sys.storage().store(cpu.px + l.ext_new, &bytes[..l.psw_len]).unwrap();
    }

    fn delivered(scan: Scan<'_>) -> Transfer {
        match scan {
            Scan::Delivered(t) => t,
            Scan::Idle(_) => panic!("nothing was delivered"),
        }
    }

    fn int_code(sys: &System, cpu: &Processor) -> u16 {
        sys.storage().fetch_hw(cpu.px + cpu.arch.layout().ext_int_code).unwrap()
    }

    #[test]
    fn test_disabled_is_idle() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 3));
        cpus[1].psw.sysmask = 0;
        cpus[1].set_ic_mask();

        let guard = sys.acquire(Some(2));
        guard.signal_external_call(2, 1).unwrap();
        assert!(matches!(scan_and_dispatch(&mut cpus[1], guard), Scan::Idle(_)));
        assert!(cpus[1].shared().ints.is_on(IC_EXTCALL));
    }

    #[test]
    fn test_external_call_exchange() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 3));
        let before = cpus[1].psw;

        let guard = sys.acquire(Some(2));
        guard.signal_external_call(2, 1).unwrap();
        drop(guard);

        let guard = sys.acquire(Some(1));
        assert_eq!(delivered(scan_and_dispatch(&mut cpus[1], guard)), Transfer::Resume);
        assert!(!sys.is_held_by(Some(1)));

        let l = Arch::ZArch.layout();
        let px = cpus[1].px;
        let mut old = [0; 16];
        sys.storage().fetch(px + l.ext_old, &mut old).unwrap();
        let old = Psw::from_bytes(Arch::ZArch, &old).unwrap();
        assert_eq!(old, Psw { intcode: 0, ..before });

        assert_eq!(cpus[1].psw.ia, NEW_IA);
        assert_eq!(cpus[1].psw.intcode, 0x1202);
        assert_eq!(sys.storage().fetch_hw(px + l.ext_cpu_addr).unwrap(), 2);
        assert_eq!(int_code(&sys, &cpus[1]), 0x1202);
        assert!(!cpus[1].shared().ints.is_on(IC_EXTCALL));

        // the new PSW is disabled
        assert!(!cpus[1].psw.ext_enabled());
        assert_eq!(cpus[1].ints().mask() & IC_EXT_SCM, 0);
    }

    #[test]
    fn test_priority_order() {
        let (sys, mut cpus) = setup(config(Arch::Esa390, 4));
        let guard = sys.acquire(None);
        guard.signal_external_call(3, 0).unwrap();
        guard.signal_malfunction_alert(2, 0).unwrap();
        guard.press_interrupt_key();
        drop(guard);

        let mut order = vec![];
        let mut remaining = vec![];
        for _ in 0..3 {
            enable(&mut cpus[0]);
            let guard = sys.acquire(Some(0));
            assert_eq!(delivered(scan_and_dispatch(&mut cpus[0], guard)), Transfer::Resume);
            order.push(int_code(&sys, &cpus[0]));
            remaining.push(cpus[0].shared().ints.state() & IC_EXTPENDING);
        }
        assert_eq!(order, [0x0040, 0x1200, 0x1202]);
        // each scan takes one class and leaves the lower ones pending
        assert_eq!(remaining, [IC_MALFALT | IC_EXTCALL, IC_EXTCALL, 0]);

        enable(&mut cpus[0]);
        let guard = sys.acquire(Some(0));
        assert!(matches!(scan_and_dispatch(&mut cpus[0], guard), Scan::Idle(_)));
    }

    #[test]
    fn test_malfunction_alert_aggregation() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 6));
        let guard = sys.acquire(None);
        guard.signal_malfunction_alert(5, 0).unwrap();
        guard.signal_malfunction_alert(2, 0).unwrap();
        drop(guard);

        let l = Arch::ZArch.layout();
        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(sys.storage().fetch_hw(l.ext_cpu_addr).unwrap(), 2);
        assert!(cpus[0].shared().ints.is_on(IC_MALFALT));

        enable(&mut cpus[0]);
        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(sys.storage().fetch_hw(l.ext_cpu_addr).unwrap(), 5);
        assert!(!cpus[0].shared().ints.is_on(IC_MALFALT));
    }

    #[test]
    fn test_emergency_signal_stores_originator() {
        let (sys, mut cpus) = setup(config(Arch::Esa390, 4));
        let guard = sys.acquire(Some(3));
        guard.signal_emergency(3, 1).unwrap();
        drop(guard);

        let guard = sys.acquire(Some(1));
        delivered(scan_and_dispatch(&mut cpus[1], guard));
        let px = cpus[1].px;
        assert_eq!(sys.storage().fetch_hw(px + 0x84).unwrap(), 3);
        assert_eq!(sys.storage().fetch_hw(px + 0x86).unwrap(), 0x1201);
    }

    #[test]
    fn test_clock_comparator_is_not_cleared() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 1));
        cpus[0].set_clkc(500);
        sys.update_cpu_timers(0);

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(int_code(&sys, &cpus[0]), 0x1004);
        assert!(cpus[0].shared().ints.is_on(IC_CLKC));
    }

    #[test]
    fn test_cpu_timer() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 1));
        cpus[0].set_cpu_timer(1000, -1);
        sys.update_cpu_timers(0);

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(int_code(&sys, &cpus[0]), 0x1005);
    }

    #[test]
    fn test_interval_timer_shadow() {
        let (sys, mut cpus) = setup(config(Arch::S370, 1));
        cpus[0].set_itimer(2);
        sys.update_cpu_timers(7);

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(int_code(&sys, &cpus[0]), 0x0080);
        assert_eq!(sys.storage().fetch_fw(0x50).unwrap() as i32, -5);
        assert!(!cpus[0].shared().ints.is_on(IC_ITIMER));
    }

    #[test]
    fn test_s370_bc_mode_code_in_psw() {
        let (sys, mut cpus) = setup(config(Arch::S370, 1));
        cpus[0].psw.ecmode = false;
        sys.storage().store_hw(0x86, 0xFFFF).unwrap();

        let guard = sys.acquire(None);
        guard.press_interrupt_key();
        drop(guard);

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(sys.storage().fetch_hw(0x86).unwrap(), 0xFFFF);

        let mut old = [0; 8];
        sys.storage().fetch(0x18, &mut old).unwrap();
        assert_eq!(u16::from_be_bytes([old[2], old[3]]), 0x0040);
    }

    #[test]
    fn test_service_signal_prefixes_address() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 2));
        let mut guard = sys.acquire(None);
        guard.post_service_signal(0x0000_0100).unwrap();
        drop(guard);

        let guard = sys.acquire(Some(1));
        delivered(scan_and_dispatch(&mut cpus[1], guard));
        let px = cpus[1].px;
        assert_eq!(sys.storage().fetch_fw(px + 0x80).unwrap(), 0x2100);
        assert_eq!(int_code(&sys, &cpus[1]), 0x2401);
        assert!(!cpus[0].shared().ints.is_on(IC_SERVSIG));
        assert!(sys.acquire(None).pending_service().is_none());
    }

    #[test]
    fn test_service_signal_plain_parameter() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 2));
        sys.acquire(None).post_service_signal(0x0000_0003).unwrap();

        let guard = sys.acquire(Some(1));
        delivered(scan_and_dispatch(&mut cpus[1], guard));
        assert_eq!(sys.storage().fetch_fw(cpus[1].px + 0x80).unwrap(), 3);
    }

    #[test]
    fn test_block_io_subcodes() {
        let config = SysConfig { block_io: true, ..config(Arch::ZArch, 1) };
        let (sys, mut cpus) = setup(config);

        sys.acquire(None).post_block_io(0x03, 0x0C, 0x1234_5678_9ABC).unwrap();
        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(sys.storage().fetch_dw(0x11B8).unwrap(), 0x1234_5678_9ABC);
        assert_eq!(sys.storage().fetch_hw(0x84).unwrap(), 0x030C);
        assert_eq!(int_code(&sys, &cpus[0]), 0x2603);

        enable(&mut cpus[0]);
        sys.acquire(None).post_block_io(0x02, 0x00, 0xFFFF_0000_CAFE).unwrap();
        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(sys.storage().fetch_fw(0x80).unwrap(), 0x0000_CAFE);
        assert_eq!(sys.storage().fetch_hw(0x84).unwrap(), 0x0200);
    }

    #[test]
    fn test_invalid_new_psw() {
        let (sys, mut cpus) = setup(config(Arch::Esa390, 1));
        // missing EC bit
        sys.storage().store(0x58, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00]).unwrap();
        sys.acquire(None).press_interrupt_key();

        let guard = sys.acquire(Some(0));
        let t = delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert_eq!(t, Transfer::Program(ProgramCheck::SPECIFICATION));
        assert!(!sys.is_held_by(Some(0)));
        assert!(sys.try_acquire(None).is_some());

        // the invalid PSW was loaded and the old one stored
        assert_eq!(cpus[0].psw.ia, 0x1000);
        assert!(!cpus[0].psw.ext_enabled());
        assert_eq!(cpus[0].ints().mask() & IC_EXT_SCM, 0);
        let mut old = [0; 8];
        sys.storage().fetch(0x18, &mut old).unwrap();
        assert!(Psw::from_bytes(Arch::Esa390, &old).unwrap().ext_enabled());
    }

    #[test]
    fn test_transaction_aborted_first() {
        let config = SysConfig { transactional_execution: true, ..config(Arch::ZArch, 1) };
        let (sys, mut cpus) = setup(config);
        let abort_psw = Psw { ia: 0x6000, ..cpus[0].psw };
        cpus[0].tx = Some(Box::new(SavedTransaction { abort_psw }));
        sys.acquire(None).press_interrupt_key();

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        assert!(cpus[0].tx.is_none());
        assert_eq!(cpus[0].tx_abort, Some(AbortReason::ExternalInterrupt));

        let mut old = [0; 16];
        sys.storage().fetch(0x130, &mut old).unwrap();
        let old = Psw::from_bytes(Arch::ZArch, &old).unwrap();
        assert_eq!(old.ia, 0x6000);
        assert_eq!(old.cc, 2);
    }

    fn guest_of(sys: &System, host: &Processor, sie: SieGuest) -> Processor {
        let mut guest = host.new_guest(Arch::ZArch, sie);
        guest.px = 0x2000;
        enable(&mut guest);
        let bytes = Psw { ia: 0x9000, amode31: true, amode64: true, ..Default::default() }.to_bytes(Arch::ZArch);
        sys.storage().store(sie.mso + 0x2000 + 0x1B0, &bytes).unwrap();
        guest
    }

    #[test]
    fn test_sie_guest_intercepts() {
        let (sys, cpus) = setup(config(Arch::ZArch, 1));
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ..Default::default() };
        let mut guest = guest_of(&sys, &cpus[0], sie);
        let before = guest.psw;

        let guard = sys.acquire(Some(0));
        cpus[0].shared().guest_ints.on(&guard, IC_EXTCALL);
        let t = delivered(scan_and_dispatch(&mut guest, guard));

        assert_eq!(t, Transfer::Intercept(ExtCode::ExternalCall));
        assert_eq!(sys.storage().fetch_hw(0x40000 + 0x40 + 0x86).unwrap(), 0x1202);
        // no exchange in the guest
        assert_eq!(guest.psw.ia, before.ia);
        assert_eq!(sys.storage().fetch_dw(0x80000 + 0x2000 + 0x130 + 8).unwrap(), 0);
    }

    #[test]
    fn test_sie_guest_with_assist_delivers() {
        let config = SysConfig { external_interrupt_assist: true, ..config(Arch::ZArch, 1) };
        let (sys, cpus) = setup(config);
        let sie = SieGuest { state_desc: 0x40000, mso: 0x80000, ext_assist: true, ..Default::default() };
        let mut guest = guest_of(&sys, &cpus[0], sie);

        let guard = sys.acquire(Some(0));
        cpus[0].shared().guest_ints.on(&guard, IC_EXTCALL);
        let t = delivered(scan_and_dispatch(&mut guest, guard));

        assert_eq!(t, Transfer::Resume);
        assert_eq!(guest.psw.ia, 0x9000);
        assert_eq!(sys.storage().fetch_hw(0x80000 + 0x2000 + 0x86).unwrap(), 0x1202);
        assert_eq!(sys.storage().fetch_dw(0x80000 + 0x2000 + 0x130 + 8).unwrap(), 0x1000);
    }

    #[test]
    fn test_guest_ignores_interrupt_key() {
        let (sys, cpus) = setup(config(Arch::ZArch, 1));
        let mut guest = guest_of(&sys, &cpus[0], SieGuest { mso: 0x80000, ..Default::default() });

        let guard = sys.acquire(Some(0));
        cpus[0].shared().guest_ints.on(&guard, IC_INTKEY);
        assert!(matches!(scan_and_dispatch(&mut guest, guard), Scan::Idle(_)));
    }

    #[test]
    fn test_wait_psw_is_stored() {
        let (sys, mut cpus) = setup(config(Arch::ZArch, 1));
        cpus[0].psw.states |= PSW_WAIT;
        sys.acquire(None).press_interrupt_key();

        let guard = sys.acquire(Some(0));
        delivered(scan_and_dispatch(&mut cpus[0], guard));
        let mut old = [0; 16];
        sys.storage().fetch(0x130, &mut old).unwrap();
        assert!(Psw::from_bytes(Arch::ZArch, &old).unwrap().wait());
        assert!(!cpus[0].psw.wait());
    }
}
