//! The service processor.
//!
//! [`ServiceProcessor`] accepts service calls and completes each one after a number of polls
//! drawn from a configurable (optionally seeded) range. A completed call is reported by posting a
//! service signal carrying the call's parameter. If the service mailbox is occupied, posting is
//! retried on the next poll.
//!
//! The device can be polled directly, or moved onto its own thread with [`ServiceProcessor::spawn`].

use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as cbc;
use rand::Rng;

use super::{SysErr, System};

#[derive(Clone, Copy)]
struct SampleRange {
    start: u32,
    end: u32,
    end_incl: bool
}
impl SampleRange {
    fn new(r: impl RangeBounds<u32>) -> Self {
        let start = match r.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded    => 0,
        };
        let (end, end_incl) = match r.end_bound() {
            Bound::Included(&s) => (s, true),
            Bound::Excluded(&s) => (s, false),
            Bound::Unbounded => (u32::MAX, true),
        };

        // an empty range samples as its start
        match (end_incl, start < end, start == end) {
            (true, _, true) | (_, true, _) => Self { start, end, end_incl },
            _ => Self { start, end: start, end_incl: true },
        }
    }
}
impl std::fmt::Debug for SampleRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleRange { start, end, end_incl: true } => (start..=end).fmt(f),
            SampleRange { start, end, end_incl: false } => (start..end).fmt(f),
        }
    }
}
impl RangeBounds<u32> for SampleRange {
    fn start_bound(&self) -> Bound<&u32> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u32> {
        match self.end_incl {
            true => Bound::Included(&self.end),
            false => Bound::Excluded(&self.end),
        }
    }
}

/// A device that completes service calls and reports them with service signals.
#[derive(Debug)]
pub struct ServiceProcessor {
    generator: Box<rand::rngs::StdRng>,
    range: SampleRange,

    queue: VecDeque<u32>,
    in_flight: Option<(u32, u32)>,
    completed: Option<u32>,
}
impl ServiceProcessor {
    /// Creates a new service processor.
    /// - `seed`: Sets the seed for the completion-delay RNG. This can be `None`
    ///     if the delays do not need to be deterministic or if the range is exactly one value.
    /// - `range`: Sets the range of possible number of polls before a call completes.
    pub fn new(seed: Option<u64>, range: impl RangeBounds<u32>) -> Self {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let generator = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            generator: Box::new(generator),
            range: SampleRange::new(range),
            queue: VecDeque::new(),
            in_flight: None,
            completed: None,
        }
    }

    /// Gets the range of possible number of polls before a call completes.
    pub fn get_range(&self) -> impl RangeBounds<u32> {
        self.range
    }
    /// Sets the number of polls before a call completes to a range of values.
    pub fn set_range(&mut self, r: impl RangeBounds<u32>) -> &mut Self {
        self.range = SampleRange::new(r);
        self
    }
    /// Sets the number of polls before a call completes to an exact number.
    pub fn set_exact(&mut self, n: u32) -> &mut Self {
        self.set_range(n..=n)
    }

    /// Queues a service call with the given parameter.
    pub fn submit(&mut self, parm: u32) {
        self.queue.push_back(parm);
        if self.in_flight.is_none() {
            self.start_next();
        }
    }
    /// Gets the number of polls remaining until the current call completes.
    pub fn get_remaining(&self) -> Option<u32> {
        self.in_flight.map(|(_, n)| n)
    }
    /// Whether there is no work in progress or waiting to be reported.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none() && self.completed.is_none()
    }

    /// Advances the device by one poll.
    ///
    /// Returns the parameter of the service signal posted during this poll, if any.
    pub fn poll(&mut self, sys: &System) -> Option<u32> {
        if self.completed.is_none() {
            match self.in_flight {
                Some((parm, 0 | 1)) => {
                    self.completed = Some(parm);
                    self.in_flight = None;
                    self.start_next();
                },
                Some((parm, n)) => self.in_flight = Some((parm, n - 1)),
                None => {},
            }
        }

        let parm = self.completed?;
        match sys.acquire(None).post_service_signal(parm) {
            Ok(()) => {
                self.completed = None;
                Some(parm)
            },
            Err(SysErr::MailboxBusy) => None,
            Err(e) => {
                log::warn!("Service processor dropped completion {parm:08X}: {e}");
                self.completed = None;
                None
            }
        }
    }

    fn start_next(&mut self) {
        self.in_flight = self.queue.pop_front()
            .map(|parm| (parm, self.generate_delay()));
    }
    fn generate_delay(&mut self) -> u32 {
        match self.range {
            SampleRange { start, end, end_incl: true } => self.generator.gen_range(start..=end),
            SampleRange { start, end, end_incl: false } => self.generator.gen_range(start..end),
        }
    }

    /// Moves the device onto its own thread, polling once per `period`.
    ///
    /// Service calls are submitted through the returned sender.
    /// The thread exits when the system shuts down or the sender is dropped.
    pub fn spawn(mut self, sys: Arc<System>, period: Duration) -> std::io::Result<(cbc::Sender<u32>, JoinHandle<()>)> {
        let (tx, rx) = cbc::unbounded::<u32>();
        let handle = std::thread::Builder::new()
            .name(String::from("servproc"))
            .spawn(move || {
                while !sys.is_shutdown() {
                    match rx.recv_timeout(period) {
                        Ok(parm) => self.submit(parm),
                        Err(cbc::RecvTimeoutError::Timeout) => {
                            self.poll(&sys);
                        },
                        Err(cbc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Service processor thread exiting");
            })?;

        Ok((tx, handle))
    }
}
impl Default for ServiceProcessor {
    /// Creates a service processor with default parameters.
    ///
    /// The default parameters here are:
    /// - non-deterministic RNG
    /// - calls complete after 1 to 4 polls
    fn default() -> Self {
        Self::new(None, 1..=4)
    }
}
