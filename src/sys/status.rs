//! Store status and load status.
//!
//! Store status saves a processor's architected registers into a save area
//! (laid out per [`StatusLayout`]). Load status is the inverse, used to restore a processor
//! from a saved snapshot.
//!
//! S/370 and ESA/390 store four floating point registers (0, 2, 4, 6) and 32-bit register files.
//! z/Architecture stores all sixteen floating point registers, the floating point control register,
//! and 64-bit register files.
//!
//! [`StatusLayout`]: super::psa::StatusLayout

use super::cpu::Processor;
use super::psw::Psw;
use super::{ProgramCheck, System};

/// Architectural-mode identification stored by z/Architecture.
const ARCH_ID_Z: u8 = 0x01;

impl System {
    /// Stores the status of `cpu` into the save area at absolute address `base`.
    pub fn store_status(&self, cpu: &Processor, base: u64) -> Result<(), ProgramCheck> {
        let storage = self.storage();
        let layout = cpu.arch.layout();
        let s = &layout.status;
        let end = base + s.cr + 16 * s.reg_width as u64;
        storage.validate_operand(base, (end - base) as usize)?;

        storage.mark_referenced_and_changed(base);
        if (end - 1) >> 12 != base >> 12 {
            storage.mark_referenced_and_changed(end - 1);
        }

        if let Some(off) = layout.arch_id {
            let id = match cpu.arch.is_64bit() {
                true  => ARCH_ID_Z,
                false => 0,
            };
            storage.store(base + off, &[id])?;
        }

        storage.store_dw(base + s.cpu_timer, cpu.shared().cpu_timer(self.tod().now()) as u64)?;
        storage.store_dw(base + s.clkc, cpu.shared().clkc())?;
        storage.store(base + s.psw, &cpu.psw.to_bytes(cpu.arch)[..layout.psw_len])?;
        storage.store_fw(base + s.prefix, cpu.px as u32)?;
        if let Some(off) = s.fpc {
            storage.store_fw(base + off, cpu.fpc)?;
        }

        for (i, r) in fpr_indices(s.fpr_count).enumerate() {
            storage.store_dw(base + s.fpr + 8 * i as u64, cpu.fpr[r])?;
        }
        for i in 0..16 {
            let w = s.reg_width as u64;
            store_reg(self, base + s.gr + w * i as u64, s.reg_width, cpu.gr[i])?;
            store_reg(self, base + s.cr + w * i as u64, s.reg_width, cpu.cr[i])?;
        }
        if let Some(off) = s.ar {
            for (i, &ar) in cpu.ar.iter().enumerate() {
                storage.store_fw(base + off + 4 * i as u64, ar)?;
            }
        }

        log::debug!("CPU{:04X}: status stored at {base:X}", cpu.cpuad);
        Ok(())
    }

    /// Restores the status of `cpu` from the save area at absolute address `base`.
    ///
    /// The CPU timer is restored relative to the current TOD clock.
    /// If the saved PSW is invalid, this fails with a specification exception and `cpu` is unchanged.
    pub fn load_status(&self, cpu: &mut Processor, base: u64) -> Result<(), ProgramCheck> {
        let storage = self.storage();
        let layout = cpu.arch.layout();
        let s = &layout.status;

        let mut psw = [0; 16];
        storage.fetch(base + s.psw, &mut psw[..layout.psw_len])?;
        let psw = Psw::from_bytes(cpu.arch, &psw)?;

        let timer = storage.fetch_dw(base + s.cpu_timer)? as i64;
        let clkc = storage.fetch_dw(base + s.clkc)?;
        let px = storage.fetch_fw(base + s.prefix)?;
        let fpc = match s.fpc {
            Some(off) => Some(storage.fetch_fw(base + off)?),
            None => None,
        };

        let mut fpr = cpu.fpr;
        for (i, r) in fpr_indices(s.fpr_count).enumerate() {
            fpr[r] = storage.fetch_dw(base + s.fpr + 8 * i as u64)?;
        }
        let mut gr = cpu.gr;
        let mut cr = cpu.cr;
        for i in 0..16 {
            let w = s.reg_width as u64;
            gr[i] = load_reg(self, base + s.gr + w * i as u64, s.reg_width, gr[i])?;
            cr[i] = load_reg(self, base + s.cr + w * i as u64, s.reg_width, cr[i])?;
        }
        let mut ar = cpu.ar;
        if let Some(off) = s.ar {
            for (i, a) in ar.iter_mut().enumerate() {
                *a = storage.fetch_fw(base + off + 4 * i as u64)?;
            }
        }

        cpu.psw = psw;
        cpu.set_cpu_timer(self.tod().now(), timer);
        cpu.set_clkc(clkc);
        cpu.px = u64::from(px);
        if let Some(fpc) = fpc {
            cpu.fpc = fpc;
        }
        cpu.fpr = fpr;
        cpu.gr = gr;
        cpu.cr = cr;
        cpu.ar = ar;
        cpu.set_ic_mask();

        log::debug!("CPU{:04X}: status loaded from {base:X}", cpu.cpuad);
        Ok(())
    }
}

fn fpr_indices(count: usize) -> impl Iterator<Item = usize> {
    let step = match count {
        4 => 2,
        _ => 1,
    };
    (0..16).step_by(step).take(count)
}

fn store_reg(sys: &System, addr: u64, width: usize, value: u64) -> Result<(), ProgramCheck> {
    match width {
        8 => sys.storage().store_dw(addr, value),
        _ => sys.storage().store_fw(addr, value as u32),
    }
}

/// Narrow registers only replace the low half.
fn load_reg(sys: &System, addr: u64, width: usize, old: u64) -> Result<u64, ProgramCheck> {
    match width {
        8 => sys.storage().fetch_dw(addr),
        _ => Ok(old & !0xFFFF_FFFF | u64::from(sys.storage().fetch_fw(addr)?)),
    }
}
