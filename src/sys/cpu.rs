//! Processor contexts.
//!
//! A processor's state is split in two:
//! - [`Processor`]: registers and status owned and mutated by the processor's own thread.
//! - [`CpuShared`]: state other threads touch: pending-interrupt bits, originator flags,
//!     run state, timers, and the condition the processor idles on.
//!
//! Pending bits ([`IntFlags`]) can be tested by the owning thread without the interrupt lock,
//! but are only ever set or cleared with the lock held (the mutators take an [`IntGuard`] as proof).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Condvar;

use super::lock::IntGuard;
use super::psa::Arch;
use super::psw::Psw;

/// Interrupt check. Always enabled; forces the processor back into its interrupt scan.
pub const IC_INTERRUPT:  u32 = 0x8000_0000;
/// ECPS:VM virtual interval timer pending.
pub const IC_ECPSVTIMER: u32 = 0x0000_0100;

/// Malfunction alert pending.
pub const IC_MALFALT:    u32 = 0x0000_8000;
/// Emergency signal pending.
pub const IC_EMERSIG:    u32 = 0x0000_4000;
/// External call pending.
pub const IC_EXTCALL:    u32 = 0x0000_2000;
/// Clock comparator exceeded.
pub const IC_CLKC:       u32 = 0x0000_0800;
/// CPU timer negative.
pub const IC_PTIMER:     u32 = 0x0000_0400;
/// Service signal (or block I/O) pending.
pub const IC_SERVSIG:    u32 = 0x0000_0200;
/// Interval timer pending.
pub const IC_ITIMER:     u32 = 0x0000_0080;
/// Interrupt key pending.
pub const IC_INTKEY:     u32 = 0x0000_0040;

/// The external subclass mask bits of CR0.
///
/// Each `IC_*` bit for an external class is at the same position as its CR0 subclass mask.
pub const IC_EXT_SCM: u32 = IC_MALFALT | IC_EMERSIG | IC_EXTCALL | IC_CLKC
    | IC_PTIMER | IC_SERVSIG | IC_ITIMER | IC_INTKEY;

/// All external interrupt conditions.
pub const IC_EXTPENDING: u32 = IC_EXT_SCM | IC_ECPSVTIMER;

/// Pending-interrupt state for one processor context.
///
/// An interrupt class is *open* if it is both pending and enabled.
#[derive(Debug, Default)]
pub struct IntFlags {
    state: AtomicU32,
    mask: AtomicU32,
}
impl IntFlags {
    /// The pending bits.
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
    /// The enabled bits.
    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire)
    }
    /// The pending and enabled bits.
    pub fn open(&self) -> u32 {
        self.state() & self.mask()
    }
    /// Whether any of `bits` is pending.
    pub fn is_on(&self, bits: u32) -> bool {
        self.state() & bits != 0
    }
    /// Whether any of `bits` is pending and enabled.
    pub fn is_open(&self, bits: u32) -> bool {
        self.open() & bits != 0
    }

    /// Sets pending bits.
    pub fn on(&self, _guard: &IntGuard<'_>, bits: u32) {
        self.state.fetch_or(bits, Ordering::AcqRel);
    }
    /// Clears pending bits.
    pub fn off(&self, _guard: &IntGuard<'_>, bits: u32) {
        self.state.fetch_and(!bits, Ordering::AcqRel);
    }

    fn set_mask(&self, mask: u32) {
        self.mask.store(mask, Ordering::Release);
    }
}

/// Run state of a processor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum CpuState {
    /// Executing instructions (or idling in the wait state).
    Started = 0,
    /// Asked to stop; will stop at its next interrupt scan.
    Stopping = 1,
    /// Stopped.
    Stopped = 2,
    /// Waiting for an initial program load to complete.
    Load = 3,
}
impl CpuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CpuState::Started,
            1 => CpuState::Stopping,
            3 => CpuState::Load,
            _ => CpuState::Stopped,
        }
    }
}

/// The part of a processor context other threads may access.
#[derive(Debug)]
pub struct CpuShared {
    cpuad: u16,

    /// Pending bits of the processor itself.
    pub ints: IntFlags,
    /// Pending bits of the SIE guest this processor is interpreting.
    pub guest_ints: IntFlags,
    sie_active: AtomicBool,

    intwait: AtomicBool,
    state: AtomicU8,
    opinterv: AtomicBool,

    malfcpu: Box<[AtomicBool]>,
    emercpu: Box<[AtomicBool]>,
    extccpu: AtomicU16,

    clkc: AtomicU64,
    ptimer: AtomicU64,
    itimer: AtomicI32,
    vtimer: AtomicI32,
    vtimer_armed: AtomicBool,

    /// Condition the processor idles on while stopped or in the wait state.
    ///
    /// This is always waited on with the interrupt lock.
    pub(crate) intcond: Condvar,
}

impl CpuShared {
    pub(crate) fn new(cpuad: u16, num_cpus: usize) -> Self {
        let flags = |n: usize| (0..n).map(|_| AtomicBool::new(false)).collect();
        Self {
            cpuad,
            ints: IntFlags::default(),
            guest_ints: IntFlags::default(),
            sie_active: AtomicBool::new(false),
            intwait: AtomicBool::new(false),
            state: AtomicU8::new(CpuState::Stopped as u8),
            opinterv: AtomicBool::new(false),
            malfcpu: flags(num_cpus),
            emercpu: flags(num_cpus),
            extccpu: AtomicU16::new(0),
            clkc: AtomicU64::new(u64::MAX),
            ptimer: AtomicU64::new(u64::MAX >> 1),
            itimer: AtomicI32::new(0),
            vtimer: AtomicI32::new(0),
            vtimer_armed: AtomicBool::new(false),
            intcond: Condvar::new(),
        }
    }

    /// The processor address.
    pub fn cpuad(&self) -> u16 {
        self.cpuad
    }
    /// Whether the processor is blocked acquiring the interrupt lock (its syncpoint).
    pub fn intwait(&self) -> bool {
        self.intwait.load(Ordering::Acquire)
    }
    pub(crate) fn set_intwait(&self, value: bool) {
        self.intwait.store(value, Ordering::Release);
    }

    /// Whether the processor is currently interpreting a SIE guest.
    pub fn sie_active(&self) -> bool {
        self.sie_active.load(Ordering::Acquire)
    }

    /// Current run state.
    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }
    /// Sets the run state.
    pub fn set_state(&self, _guard: &IntGuard<'_>, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }
    /// Whether the last state change was requested by the operator.
    pub fn opinterv(&self) -> bool {
        self.opinterv.load(Ordering::Acquire)
    }
    pub(crate) fn set_opinterv(&self, _guard: &IntGuard<'_>, value: bool) {
        self.opinterv.store(value, Ordering::Release);
    }

    /// Malfunction-alert originator flags, indexed by originating processor address.
    pub fn malfcpu(&self) -> &[AtomicBool] {
        &self.malfcpu
    }
    /// Emergency-signal originator flags, indexed by originating processor address.
    pub fn emercpu(&self) -> &[AtomicBool] {
        &self.emercpu
    }
    /// Originator of the pending external call.
    pub fn extccpu(&self) -> u16 {
        self.extccpu.load(Ordering::Acquire)
    }
    pub(crate) fn set_extccpu(&self, _guard: &IntGuard<'_>, cpuad: u16) {
        self.extccpu.store(cpuad, Ordering::Release);
    }

    /// Clock comparator.
    pub fn clkc(&self) -> u64 {
        self.clkc.load(Ordering::Acquire)
    }
    /// The TOD value at which the CPU timer goes negative.
    pub fn ptimer_deadline(&self) -> u64 {
        self.ptimer.load(Ordering::Acquire)
    }
    /// CPU timer value at the given TOD clock value.
    pub fn cpu_timer(&self, tod: u64) -> i64 {
        self.ptimer_deadline().wrapping_sub(tod) as i64
    }
    /// Interval timer value.
    pub fn itimer(&self) -> i32 {
        self.itimer.load(Ordering::Acquire)
    }

    /// Decrements the interval timer, returning whether it went from non-negative to negative.
    pub(crate) fn decrement_itimer(&self, units: i32) -> bool {
        let old = self.itimer.fetch_sub(units, Ordering::AcqRel);
        old >= 0 && old.wrapping_sub(units) < 0
    }
    /// Decrements the ECPS:VM virtual interval timer if armed, returning whether it expired.
    pub(crate) fn decrement_vtimer(&self, units: i32) -> bool {
        if !self.vtimer_armed.load(Ordering::Acquire) { return false };

        let old = self.vtimer.fetch_sub(units, Ordering::AcqRel);
        let expired = old >= 0 && old.wrapping_sub(units) < 0;
        if expired {
            self.vtimer_armed.store(false, Ordering::Release);
        }
        expired
    }
}

/// SIE state of a guest processor context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SieGuest {
    /// Host absolute address of the SIE state descriptor.
    pub state_desc: u64,
    /// Main storage origin of the guest within host storage.
    pub mso: u64,
    /// State descriptor requests expedited timer handling.
    pub exp_timer: bool,
    /// State descriptor enables the external-interruption assist.
    pub ext_assist: bool,
    /// State descriptor suppresses guest interval-timer interrupts.
    pub itimer_off: bool,
}

/// Reason a transaction was aborted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[non_exhaustive]
pub enum AbortReason {
    /// An external interruption was delivered.
    ExternalInterrupt,
}
impl AbortReason {
    /// The transaction abort code.
    pub fn code(self) -> u16 {
        match self {
            AbortReason::ExternalInterrupt => 2,
        }
    }
}

/// An in-flight transaction on a processor.
pub trait Transaction: Send + 'static {
    /// Aborts the transaction, restoring the processor to its transaction-abort state.
    fn abort(self: Box<Self>, cpu: &mut Processor, reason: AbortReason);
}

/// A transaction that restores a saved abort PSW.
#[derive(Clone, Copy, Debug)]
pub struct SavedTransaction {
    /// PSW to resume at when the transaction aborts.
    pub abort_psw: Psw,
}
impl Transaction for SavedTransaction {
    fn abort(self: Box<Self>, cpu: &mut Processor, reason: AbortReason) {
        // transient abort: condition code 2
        cpu.psw = Psw { cc: 2, ..self.abort_psw };
        cpu.tx_abort = Some(reason);
    }
}

/// Registers and status owned by a processor's own thread.
pub struct Processor {
    /// Processor address.
    pub cpuad: u16,
    /// Architecture generation.
    pub arch: Arch,

    /// Current program status word.
    pub psw: Psw,
    /// General registers.
    pub gr: [u64; 16],
    /// Access registers.
    pub ar: [u32; 16],
    /// Floating point registers.
    pub fpr: [u64; 16],
    /// Floating point control register.
    pub fpc: u32,
    /// Control registers.
    pub cr: [u64; 16],
    /// Prefix register.
    pub px: u64,

    /// If this context is a SIE guest, its SIE state.
    pub sie: Option<SieGuest>,
    /// The guest context being interpreted by this (host) context.
    pub guest: Option<Box<Processor>>,

    /// In-flight transaction, if any.
    pub tx: Option<Box<dyn Transaction>>,
    /// Reason the last transaction aborted.
    pub tx_abort: Option<AbortReason>,

    shared: Arc<CpuShared>,
}

impl Processor {
    /// CR0 value after initial CPU reset (interval timer, interrupt key, and external signal subclasses).
    pub const CR0_RESET: u64 = 0xE0;

    pub(crate) fn new(shared: Arc<CpuShared>, arch: Arch) -> Self {
        let mut cpu = Self {
            cpuad: shared.cpuad(),
            arch,
            psw: Psw::default(),
            gr: [0; 16],
            ar: [0; 16],
            fpr: [0; 16],
            fpc: 0,
            cr: [0; 16],
            px: 0,
            sie: None,
            guest: None,
            tx: None,
            tx_abort: None,
            shared,
        };
        cpu.cr[0] = Self::CR0_RESET;
        cpu.set_ic_mask();
        cpu
    }

    /// Creates a guest context to be interpreted by this processor.
    pub fn new_guest(&self, arch: Arch, sie: SieGuest) -> Self {
        let mut guest = Self::new(Arc::clone(&self.shared), arch);
        guest.sie = Some(sie);
        guest.set_ic_mask();
        guest
    }

    /// Begins interpreting `guest`.
    pub fn enter_sie(&mut self, guest: Processor) {
        self.guest = Some(Box::new(guest));
        self.shared.sie_active.store(true, Ordering::Release);
    }
    /// Stops interpreting the current guest, returning it.
    pub fn exit_sie(&mut self) -> Option<Processor> {
        self.shared.sie_active.store(false, Ordering::Release);
        self.guest.take().map(|g| *g)
    }

    /// The context instructions currently run in: the guest if one is being interpreted, otherwise this one.
    pub fn context_mut(&mut self) -> &mut Processor {
        match self.guest {
            Some(ref mut guest) => &mut **guest,
            None => self,
        }
    }

    /// The shared half of this processor.
    pub fn shared(&self) -> &Arc<CpuShared> {
        &self.shared
    }
    /// Whether this context is a SIE guest.
    pub fn sie_mode(&self) -> bool {
        self.sie.is_some()
    }
    /// Pending-interrupt flags for this context.
    pub fn ints(&self) -> &IntFlags {
        match self.sie_mode() {
            true  => &self.shared.guest_ints,
            false => &self.shared.ints,
        }
    }

    /// Recomputes the enabled-interrupt mask from the PSW and CR0.
    ///
    /// This must be called after either the PSW or CR0 changes.
    pub fn set_ic_mask(&mut self) {
        let mut mask = IC_INTERRUPT;
        if self.psw.ext_enabled() {
            let cr0 = self.cr[0] as u32;
            mask |= cr0 & IC_EXT_SCM;
            if cr0 & IC_ITIMER != 0 {
                mask |= IC_ECPSVTIMER;
            }
        }
        self.ints().set_mask(mask);
    }

    /// Sets the clock comparator.
    pub fn set_clkc(&mut self, value: u64) {
        self.shared.clkc.store(value, Ordering::Release);
    }
    /// Sets the CPU timer as of TOD clock value `tod`.
    pub fn set_cpu_timer(&mut self, tod: u64, value: i64) {
        self.shared.ptimer.store(tod.wrapping_add(value as u64), Ordering::Release);
    }
    /// Sets the interval timer.
    pub fn set_itimer(&mut self, value: i32) {
        self.shared.itimer.store(value, Ordering::Release);
    }
    /// Arms the ECPS:VM virtual interval timer.
    pub fn arm_ecps_vtimer(&mut self, value: i32) {
        self.shared.vtimer.store(value, Ordering::Release);
        self.shared.vtimer_armed.store(true, Ordering::Release);
    }
}
impl Processor where Processor: Send {}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("cpuad", &self.cpuad)
            .field("arch", &self.arch)
            .field("psw", &self.psw)
            .field("px", &format_args!("{:X}", self.px))
            .field("sie", &self.sie)
            .field("guest", &self.guest.is_some())
            .finish_non_exhaustive()
    }
}
