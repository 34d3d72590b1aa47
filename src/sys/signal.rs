//! Raising external interrupt conditions on other processors.
//!
//! Every function here is called with the interrupt lock held, sets the
//! target's pending state, and wakes the target so an idle processor notices.
//!
//! Interrupt-key and service-signal conditions are system-wide: they are raised on every configured
//! processor and cleared from all of them when one processor takes the interrupt.
//!
//! Service signals and block-I/O interrupts share a single mailbox in the system.
//! Only one request may be outstanding at a time.

use std::sync::atomic::Ordering;

use super::cpu::{IC_EMERSIG, IC_EXTCALL, IC_INTKEY, IC_MALFALT, IC_SERVSIG};
use super::lock::IntGuard;
use super::SysErr;

/// An undelivered request in the service mailbox.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ServiceRequest {
    /// Service-call attention.
    ServiceSignal {
        /// The service-signal external parameter.
        parm: u32,
    },
    /// VM block-I/O completion.
    BlockIo {
        /// Sub-code, stored in the high byte of the CPU-address field.
        subcode: u8,
        /// Completion status, stored in the low byte of the CPU-address field.
        status: u8,
        /// Interruption parameter.
        parm: u64,
    },
}

/// The service-signal parameter holds a storage address if any of these bits are set.
pub const SERVSIG_ADDR: u32 = 0xFFFF_FFF8;

impl IntGuard<'_> {
    /// Raises a malfunction alert on `to`, originating from `from`.
    pub fn signal_malfunction_alert(&self, from: u16, to: u16) -> Result<(), SysErr> {
        let sys = self.system();
        let target = sys.cpu(to)?;
        let flag = target.malfcpu().get(usize::from(from)).ok_or(SysErr::InvalidCpu(from))?;

        flag.store(true, Ordering::Release);
        target.ints.on(self, IC_MALFALT);
        sys.wake(target);
        log::debug!("CPU{from:04X}: malfunction alert raised on CPU{to:04X}");
        Ok(())
    }

    /// Raises an emergency signal on `to`, originating from `from`.
    pub fn signal_emergency(&self, from: u16, to: u16) -> Result<(), SysErr> {
        let sys = self.system();
        let target = sys.cpu(to)?;
        let flag = target.emercpu().get(usize::from(from)).ok_or(SysErr::InvalidCpu(from))?;

        flag.store(true, Ordering::Release);
        target.ints.on(self, IC_EMERSIG);
        sys.wake(target);
        log::debug!("CPU{from:04X}: emergency signal raised on CPU{to:04X}");
        Ok(())
    }

    /// Raises an external call on `to`, originating from `from`.
    ///
    /// Only one external call can be pending on a processor.
    /// If one already is, this fails with [`SysErr::ExternalCallPending`].
    pub fn signal_external_call(&self, from: u16, to: u16) -> Result<(), SysErr> {
        let sys = self.system();
        let target = sys.cpu(to)?;
        sys.cpu(from)?;
        if target.ints.is_on(IC_EXTCALL) {
            return Err(SysErr::ExternalCallPending(to));
        }

        target.set_extccpu(self, from);
        target.ints.on(self, IC_EXTCALL);
        sys.wake(target);
        log::debug!("CPU{from:04X}: external call raised on CPU{to:04X}");
        Ok(())
    }

    /// Raises the interrupt-key condition on every configured processor.
    pub fn press_interrupt_key(&self) {
        let sys = self.system();
        for cpu in sys.cpus() {
            cpu.ints.on(self, IC_INTKEY);
        }
        self.wake_all(self.config_mask());
        log::info!("Interrupt key pressed");
    }

    /// Posts a service signal with external parameter `parm`.
    ///
    /// This fails with [`SysErr::MailboxBusy`] if the mailbox holds an undelivered request.
    pub fn post_service_signal(&mut self, parm: u32) -> Result<(), SysErr> {
        self.post_service(ServiceRequest::ServiceSignal { parm })
    }

    /// Posts a VM block-I/O interrupt.
    ///
    /// This fails with [`SysErr::FeatureNotInstalled`] if block I/O is not configured,
    /// or with [`SysErr::MailboxBusy`] if the mailbox holds an undelivered request.
    pub fn post_block_io(&mut self, subcode: u8, status: u8, parm: u64) -> Result<(), SysErr> {
        if !self.system().config().block_io {
            return Err(SysErr::FeatureNotInstalled("block I/O"));
        }
        self.post_service(ServiceRequest::BlockIo { subcode, status, parm })
    }

    /// The undelivered service request, if any.
    pub fn pending_service(&self) -> Option<ServiceRequest> {
        self.state.service
    }

    fn post_service(&mut self, req: ServiceRequest) -> Result<(), SysErr> {
        if let Some(old) = self.state.service {
            log::warn!("Service request {req:?} rejected, mailbox holds {old:?}");
            return Err(SysErr::MailboxBusy);
        }
        self.state.service = Some(req);

        let sys = self.system();
        for cpu in sys.cpus() {
            cpu.ints.on(self, IC_SERVSIG);
        }

        // Give the work to one idle processor that can take it.
        // Running processors see the pending bit on their own.
        let mut enabled = self.waiting_mask();
        for cpuad in enabled.iter() {
            if !sys.cpu(cpuad).is_ok_and(|c| c.ints.is_open(IC_SERVSIG)) {
                enabled.remove(cpuad);
            }
        }
        self.wake_one_of(enabled);
        log::debug!("Posted {req:?}");
        Ok(())
    }

    /// Takes the undelivered service request out of the mailbox,
    /// clearing the service-signal condition on every processor.
    pub(crate) fn take_service(&mut self) -> Option<ServiceRequest> {
        let req = self.state.service.take();
        let sys = self.system();
        for cpu in sys.cpus() {
            cpu.ints.off(self, IC_SERVSIG);
        }
        req
    }

    /// Clears the interrupt-key condition on every processor.
    pub(crate) fn clear_interrupt_key(&self) {
        for cpu in self.system().cpus() {
            cpu.ints.off(self, IC_INTKEY);
        }
    }
}
