//! The shared system object and its interrupt machinery.
//!
//! A [`System`] holds everything processor threads share:
//! - the interrupt lock and the state it guards (CPU bitmaps, barrier state, the service mailbox),
//! - the cross-thread half of every processor ([`cpu::CpuShared`]),
//! - main storage and the TOD clock.
//!
//! Each processor thread owns a [`cpu::Processor`] (its registers), obtained from [`System::processor`].
//!
//! This module's submodules are:
//! - [`lock`]: The interrupt lock. Every mutation of pending-interrupt state happens under it.
//! - [`sync`]: The stop-the-world barrier.
//! - [`wake`]: Waking idle processors and bulk start/stop.
//! - [`external`]: Scanning for and delivering external interrupts.
//! - [`signal`]: Raising cross-processor signals and posting service requests.
//! - [`timer`], [`status`], [`device`], [`console`], [`run`]: Collaborators around the core.
//!
//! ```
//! use std::sync::Arc;
//! use zarch_irq::sys::{System, config::SysConfig, storage::MainStorage};
//!
//! let config = SysConfig { num_cpus: 2, ..Default::default() };
//! let storage = Arc::new(MainStorage::new(config.main_storage));
//! let sys = System::new(config, storage).unwrap();
//!
//! let cpu1 = sys.processor(1).unwrap();
//! assert_eq!(cpu1.cpuad, 1);
//! assert!(sys.processor(2).is_err());
//! ```

pub mod config;
pub mod console;
pub mod cpu;
pub mod device;
pub mod external;
pub mod lock;
pub mod psa;
pub mod psw;
pub mod run;
pub mod signal;
pub mod status;
pub mod storage;
pub mod sync;
pub mod timer;
pub mod wake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use self::config::SysConfig;
use self::cpu::{CpuShared, Processor};
use self::lock::IntLock;
use self::storage::Storage;
use self::timer::TodClock;

/// A program-interruption code.
///
/// These are architectural conditions reported to the guest, not host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("program check {0:#06X}")]
pub struct ProgramCheck(pub u16);
impl ProgramCheck {
    /// Protection exception.
    pub const PROTECTION: Self = Self(0x0004);
    /// Addressing exception.
    pub const ADDRESSING: Self = Self(0x0005);
    /// Specification exception.
    pub const SPECIFICATION: Self = Self(0x0006);
}

/// Host-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SysErr {
    /// The configuration describes a system that cannot be built.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configuration could not be read or parsed.
    #[error("could not parse configuration: {0}")]
    ConfigParse(String),
    /// A processor address outside the configuration.
    #[error("CPU{0:04X} is not configured")]
    InvalidCpu(u16),
    /// The service mailbox already holds an undelivered request.
    #[error("service mailbox is occupied")]
    MailboxBusy,
    /// The target already has an external call pending.
    #[error("CPU{0:04X} already has an external call pending")]
    ExternalCallPending(u16),
    /// The request needs a feature this configuration does not install.
    #[error("{0} is not installed")]
    FeatureNotInstalled(&'static str),
    /// A host thread could not be started.
    #[error("could not start thread: {0}")]
    ThreadSpawn(String),
}

/// A set of processors, one bit per processor address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(pub u64);
impl CpuMask {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// The set of processors `0..n`.
    pub fn first(n: usize) -> Self {
        match n {
            0 => Self::EMPTY,
            n if n >= 64 => Self(u64::MAX),
            n => Self((1 << n) - 1),
        }
    }
    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    /// Whether `cpuad` is in the set.
    pub fn contains(self, cpuad: u16) -> bool {
        cpuad < 64 && self.0 & (1 << cpuad) != 0
    }
    /// Adds `cpuad` to the set.
    pub fn insert(&mut self, cpuad: u16) {
        if cpuad < 64 { self.0 |= 1 << cpuad; }
    }
    /// Removes `cpuad` from the set.
    pub fn remove(&mut self, cpuad: u16) {
        if cpuad < 64 { self.0 &= !(1 << cpuad); }
    }
    /// Processors in both sets.
    pub fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
    /// Processors in this set but not `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
    /// Number of processors in the set.
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }
    /// Iterates over the processor addresses in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u16> {
        (0..64u16).filter(move |&i| self.contains(i))
    }
}
impl std::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuMask({:016X})", self.0)
    }
}

/// The system shared by every processor thread.
pub struct System {
    config: SysConfig,
    pub(crate) intlock: IntLock,
    cpus: Box<[Arc<CpuShared>]>,
    storage: Arc<dyn Storage>,
    tod: TodClock,
    shutdown: AtomicBool,
}
impl System where System: Send + Sync {}

impl System {
    /// Creates a system with a host-backed TOD clock.
    pub fn new(config: SysConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>, SysErr> {
        Self::with_clock(config, storage, TodClock::host())
    }

    /// Creates a system with the given TOD clock.
    pub fn with_clock(config: SysConfig, storage: Arc<dyn Storage>, tod: TodClock) -> Result<Arc<Self>, SysErr> {
        config.validate()?;

        let n = config.num_cpus;
        let cpus = (0..n)
            .map(|i| Arc::new(CpuShared::new(i as u16, n)))
            .collect();

        log::info!("Configured {n} {} processor(s)", config.arch);
        Ok(Arc::new(Self {
            intlock: IntLock::new(CpuMask::first(n), n),
            config,
            cpus,
            storage,
            tod,
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Creates the thread-owned half of processor `cpuad`.
    ///
    /// The processor starts stopped, with a distinct prefix per processor address.
    pub fn processor(&self, cpuad: u16) -> Result<Processor, SysErr> {
        let shared = self.cpu(cpuad)?;
        let mut cpu = Processor::new(Arc::clone(shared), self.config.arch);
        cpu.px = u64::from(cpuad) * self.config.arch.layout().prefix_size;
        Ok(cpu)
    }

    /// The configuration this system was built with.
    pub fn config(&self) -> &SysConfig {
        &self.config
    }
    /// The number of configured processors.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }
    /// The shared half of processor `cpuad`.
    pub fn cpu(&self, cpuad: u16) -> Result<&Arc<CpuShared>, SysErr> {
        self.cpus.get(usize::from(cpuad))
            .ok_or(SysErr::InvalidCpu(cpuad))
    }
    /// The shared halves of every configured processor.
    pub fn cpus(&self) -> &[Arc<CpuShared>] {
        &self.cpus
    }
    /// Main storage.
    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }
    /// The TOD clock.
    pub fn tod(&self) -> &TodClock {
        &self.tod
    }

    /// Asks every thread attached to this system to exit.
    pub fn shutdown(&self) {
        let guard = self.acquire(None);
        self.shutdown.store(true, Ordering::Release);
        for cpu in self.cpus() {
            cpu.ints.on(&guard, cpu::IC_INTERRUPT);
            self.wake(cpu);
        }
        log::info!("System shutdown requested");
    }
    /// Whether [`System::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("config", &self.config)
            .field("intlock", &self.intlock)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::storage::MainStorage;

    #[test]
    fn test_cpumask() {
        let mut m = CpuMask::first(4);
        assert_eq!(m, CpuMask(0b1111));
        m.remove(2);
        assert!(!m.contains(2));
        assert_eq!(m.iter().collect::<Vec<_>>(), [0, 1, 3]);
        assert_eq!(m.without(CpuMask(0b0001)).len(), 2);
        assert_eq!(CpuMask::first(64), CpuMask(u64::MAX));

        m.insert(70);
        assert!(!m.contains(70));
    }

    #[test]
    fn test_distinct_prefixes() {
        let config = SysConfig { num_cpus: 3, ..Default::default() };
        let sys = System::new(config, Arc::new(MainStorage::new(16 << 20))).unwrap();
        let pxs: Vec<_> = (0..3).map(|i| sys.processor(i).unwrap().px).collect();
        assert_eq!(pxs, [0, 0x2000, 0x4000]);
        assert_eq!(sys.processor(3).unwrap_err(), SysErr::InvalidCpu(3));
    }

    #[test]
    fn test_invalid_config() {
        let config = SysConfig { num_cpus: 0, ..Default::default() };
        assert!(System::new(config, Arc::new(MainStorage::new(0x1000))).is_err());
    }
}
