//! Interrupt delivery and multiprocessor synchronization for a System/370, ESA/390,
//! and z/Architecture emulator.
//!
//! Each emulated processor runs on its own OS thread. This crate provides the machinery those
//! threads share: the interrupt lock, a stop-the-world barrier, idle/wake coordination,
//! and the scan and delivery of external interrupts (including the PSW exchange).
//!
//! # Usage
//!
//! A [`System`] is built from a configuration and main storage,
//! and each processor thread takes its own [`Processor`]:
//! ```
//! use std::sync::Arc;
//! use zarch_irq::sys::{System, config::SysConfig, storage::MainStorage};
//! use zarch_irq::sys::external::{scan_and_dispatch, Scan, Transfer};
//! use zarch_irq::sys::psw::{Psw, PSW_EXT_MASK};
//! use zarch_irq::sys::storage::Storage;
//!
//! let config = SysConfig { num_cpus: 3, ..Default::default() };
//! let sys = System::new(config.clone(), Arc::new(MainStorage::new(config.main_storage))).unwrap();
//!
//! // CPU 1 is enabled for external calls:
//! let mut cpu1 = sys.processor(1).unwrap();
//! cpu1.psw = Psw { sysmask: PSW_EXT_MASK, amode64: true, amode31: true, ia: 0x1000, ..Default::default() };
//! cpu1.cr[0] = 0x2000;
//! cpu1.set_ic_mask();
//!
//! // ...and its external new PSW points at 0x8000:
//! let new_psw = Psw { amode64: true, amode31: true, ia: 0x8000, ..Default::default() };
//! sys.storage().store(cpu1.px + 0x1B0, &new_psw.to_bytes(config.arch)).unwrap();
//!
//! // CPU 2 signals CPU 1:
//! sys.acquire(Some(2)).signal_external_call(2, 1).unwrap();
//!
//! // CPU 1 takes the interrupt, and its PSA names the signaling processor:
//! let guard = sys.acquire(Some(1));
//! assert!(matches!(scan_and_dispatch(&mut cpu1, guard), Scan::Delivered(Transfer::Resume)));
//! assert_eq!(cpu1.psw.ia, 0x8000);
//! assert_eq!(sys.storage().fetch_hw(cpu1.px + 0x84).unwrap(), 2);
//! ```
//!
//! For running processors on threads, see [`sys::run`].
//!
//! [`System`]: sys::System
//! [`Processor`]: sys::cpu::Processor
#![warn(missing_docs)]

pub mod sys;
