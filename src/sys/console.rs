//! The operator console.
//!
//! The console runs on its own thread and receives [`ConsoleCmd`]s over a channel,
//! so operator requests never run on a processor thread.
//!
//! ```
//! use std::sync::Arc;
//! use zarch_irq::sys::{System, config::SysConfig, storage::MainStorage};
//! use zarch_irq::sys::console::{Console, ConsoleCmd};
//!
//! let config = SysConfig { num_cpus: 2, ..Default::default() };
//! let sys = System::new(config.clone(), Arc::new(MainStorage::new(config.main_storage))).unwrap();
//!
//! let console = Console::spawn(Arc::clone(&sys)).unwrap();
//! console.send(ConsoleCmd::StartAll).unwrap();
//! assert!(console.status().unwrap().any_started);
//! console.close();
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cbc;

use super::cpu::CpuState;
use super::{CpuMask, System};

/// A request to the operator console.
#[derive(Debug)]
pub enum ConsoleCmd {
    /// Start every processor.
    StartAll,
    /// Stop every processor.
    StopAll,
    /// Press the interrupt key.
    InterruptKey,
    /// Report the system's status on the given channel.
    Status(cbc::Sender<ConsoleStatus>),
}
impl ConsoleCmd {
    /// Parses an operator command line.
    ///
    /// This recognizes `startall`, `stopall`, and `ext`.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "startall" => Some(ConsoleCmd::StartAll),
            "stopall"  => Some(ConsoleCmd::StopAll),
            "ext"      => Some(ConsoleCmd::InterruptKey),
            _ => None,
        }
    }
}

/// A snapshot of the system's run state.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConsoleStatus {
    /// Whether any processor is started.
    pub any_started: bool,
    /// Whether every processor is stopped.
    pub all_stopped: bool,
    /// Processors that are started.
    pub started: CpuMask,
    /// Processors idling in the wait state.
    pub waiting: CpuMask,
    /// Run state of each processor.
    pub states: Vec<CpuState>,
}

/// Handle to the operator console thread.
#[derive(Debug)]
pub struct Console {
    commands: cbc::Sender<ConsoleCmd>,
    handle: JoinHandle<()>,
}
impl Console {
    /// Spawns the console thread.
    pub fn spawn(sys: Arc<System>) -> std::io::Result<Self> {
        let (tx, rx) = cbc::unbounded::<ConsoleCmd>();
        let handle = std::thread::Builder::new()
            .name(String::from("console"))
            .spawn(move || {
                for cmd in rx {
                    execute(&sys, cmd);
                }
            })?;

        Ok(Self { commands: tx, handle })
    }

    /// Sends a command to the console.
    ///
    /// This returns the command back if the console thread has exited.
    pub fn send(&self, cmd: ConsoleCmd) -> Result<(), ConsoleCmd> {
        self.commands.send(cmd).map_err(|e| e.into_inner())
    }

    /// Asks the console for the system's status, waiting for the reply.
    pub fn status(&self) -> Option<ConsoleStatus> {
        let (tx, rx) = cbc::bounded(1);
        self.send(ConsoleCmd::Status(tx)).ok()?;
        rx.recv().ok()
    }

    /// Closes the console and waits for its thread to exit.
    pub fn close(self) {
        let Self { commands, handle } = self;
        std::mem::drop(commands);
        if handle.join().is_err() {
            log::warn!("Console thread panicked");
        }
    }
}

fn execute(sys: &System, cmd: ConsoleCmd) {
    log::info!("Console: {cmd:?}");
    match cmd {
        ConsoleCmd::StartAll => { sys.start_all(); },
        ConsoleCmd::StopAll => { sys.stop_all(); },
        ConsoleCmd::InterruptKey => sys.acquire(None).press_interrupt_key(),
        ConsoleCmd::Status(reply) => {
            let status = {
                let guard = sys.acquire(None);
                ConsoleStatus {
                    any_started: sys.cpus().iter().any(|c| c.state() == CpuState::Started),
                    all_stopped: sys.cpus().iter().all(|c| c.state() == CpuState::Stopped),
                    started: guard.started_mask(),
                    waiting: guard.waiting_mask(),
                    states: sys.cpus().iter().map(|c| c.state()).collect(),
                }
            };
            // the requester may have given up
            let _ = reply.send(status);
        },
    }
}
