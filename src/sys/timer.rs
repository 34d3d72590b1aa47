//! The TOD clock and processor timers.
//!
//! Timer-driven external interrupts are raised by a periodic pass ([`System::update_cpu_timers`])
//! run from a dedicated thread ([`TimerThread`]):
//! - the clock-comparator condition is set while the TOD clock exceeds the comparator, and cleared otherwise,
//! - the CPU-timer condition is set while the CPU timer is negative, and cleared otherwise,
//! - interval timers are decremented and raise their condition when they go negative.
//!
//! TOD values use the architected format, where bit 51 is one microsecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::cpu::{IC_CLKC, IC_ECPSVTIMER, IC_ITIMER, IC_PTIMER};
use super::{CpuMask, System};

/// Shift converting microseconds to TOD clock units.
pub const TOD_US_SHIFT: u32 = 12;

/// Interval-timer units per second (bit 23 of the timer is decremented 300 times a second).
pub const ITIMER_UNITS_PER_SEC: u64 = 300 * 256;

#[derive(Debug)]
enum TodSource {
    Host(Instant),
    Manual,
}

/// The time-of-day clock.
///
/// A host clock advances with real time. A manual clock only changes when set, which makes it
/// useful for deterministic tests.
#[derive(Debug)]
pub struct TodClock {
    source: TodSource,
    offset: AtomicU64,
}
impl TodClock {
    /// A clock that advances with the host's monotonic clock, starting from zero.
    pub fn host() -> Self {
        Self { source: TodSource::Host(Instant::now()), offset: AtomicU64::new(0) }
    }
    /// A clock that stays at `tod` until set.
    pub fn manual(tod: u64) -> Self {
        Self { source: TodSource::Manual, offset: AtomicU64::new(tod) }
    }

    /// The current TOD clock value.
    pub fn now(&self) -> u64 {
        let offset = self.offset.load(Ordering::Acquire);
        match &self.source {
            TodSource::Host(epoch) => {
                let us = epoch.elapsed().as_micros() as u64;
                offset.wrapping_add(us << TOD_US_SHIFT)
            },
            TodSource::Manual => offset,
        }
    }

    /// Sets the clock so that it currently reads `tod`.
    pub fn set(&self, tod: u64) {
        let base = match &self.source {
            TodSource::Host(epoch) => (epoch.elapsed().as_micros() as u64) << TOD_US_SHIFT,
            TodSource::Manual => 0,
        };
        self.offset.store(tod.wrapping_sub(base), Ordering::Release);
    }
}

impl System {
    /// Runs one timer pass.
    ///
    /// `itimer_units` is the number of interval-timer units that elapsed since the last pass.
    /// Processors that gained a pending timer condition are woken.
    pub fn update_cpu_timers(&self, itimer_units: i32) {
        let guard = self.acquire(None);
        let now = self.tod.now();
        let itimer = self.config().has_interval_timer();
        let vtimer = self.config().ecps_vtimer;

        let mut woken = CpuMask::EMPTY;
        for cpu in self.cpus() {
            let mut raise = 0;
            let mut clear = 0;

            match now > cpu.clkc() {
                true  => raise |= IC_CLKC,
                false => clear |= IC_CLKC,
            }
            match cpu.cpu_timer(now) < 0 {
                true  => raise |= IC_PTIMER,
                false => clear |= IC_PTIMER,
            }
            if itimer && cpu.decrement_itimer(itimer_units) {
                raise |= IC_ITIMER;
            }
            if vtimer && cpu.decrement_vtimer(itimer_units) {
                raise |= IC_ECPSVTIMER;
            }

            let guest = cpu.sie_active().then_some(&cpu.guest_ints);
            for ints in std::iter::once(&cpu.ints).chain(guest) {
                ints.off(&guard, clear);
                if raise & !ints.state() != 0 {
                    ints.on(&guard, raise);
                    woken.insert(cpu.cpuad());
                }
            }
        }

        if !woken.is_empty() {
            log::trace!("Timer conditions raised on {woken:?}");
            guard.wake_all(woken);
        }
    }
}

/// A thread periodically running [`System::update_cpu_timers`].
///
/// The thread exits once the system shuts down.
#[derive(Debug)]
pub struct TimerThread {
    handle: JoinHandle<()>,
}
impl TimerThread {
    /// Spawns the timer thread.
    pub fn spawn(sys: Arc<System>) -> std::io::Result<Self> {
        let period = Duration::from_micros(sys.config().timer_interval_us);
        let handle = std::thread::Builder::new()
            .name(String::from("timer"))
            .spawn(move || {
                log::debug!("Timer thread started, period {period:?}");
                let start = Instant::now();
                let mut ticks = 0u64;

                while !sys.is_shutdown() {
                    std::thread::sleep(period);

                    // derive from total elapsed time so rounding does not drift
                    let total = itimer_units(start.elapsed());
                    let units = i32::try_from(total - ticks).unwrap_or(i32::MAX);
                    ticks = total;

                    sys.update_cpu_timers(units);
                }
                log::debug!("Timer thread exiting");
            })?;

        Ok(Self { handle })
    }

    /// Waits for the thread to exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            log::warn!("Timer thread panicked");
        }
    }
}

/// Whole interval-timer units in `elapsed`.
fn itimer_units(elapsed: Duration) -> u64 {
    let units = elapsed.as_micros() * u128::from(ITIMER_UNITS_PER_SEC) / 1_000_000;
    u64::try_from(units).unwrap_or(u64::MAX)
}
