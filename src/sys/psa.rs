//! Prefixed storage area layouts.
//!
//! Each processor owns a prefixed storage area (PSA) in main storage, located by its prefix register.
//! Interrupt delivery and store status read and write this area at fixed, architected offsets.
//!
//! This module consists of:
//! - [`Arch`]: The architecture generation being emulated.
//! - [`PsaLayout`]: The offset table for one architecture generation.
//! - [`StatusLayout`]: The offset table for the store-status save area.
//!
//! The layouts here are the guest-visible contract, so they must match the published offsets exactly:
//! ```
//! use zarch_irq::sys::psa::Arch;
//!
//! let z = Arch::ZArch.layout();
//! assert_eq!(z.ext_old, 0x130);
//! assert_eq!(z.ext_new, 0x1B0);
//! assert_eq!(z.psw_len, 16);
//!
//! let esa = Arch::Esa390.layout();
//! assert_eq!(esa.ext_old, 0x18);
//! assert_eq!(esa.ext_new, 0x58);
//! assert_eq!(esa.ext_cpu_addr, 0x84);
//! ```

use serde::{Deserialize, Serialize};

/// An architecture generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// System/370.
    S370,
    /// ESA/390.
    Esa390,
    /// z/Architecture.
    #[default]
    #[serde(rename = "z")]
    ZArch,
}
impl Arch {
    /// Gets the PSA layout for this generation.
    pub fn layout(self) -> &'static PsaLayout {
        match self {
            Arch::S370   => &S370_LAYOUT,
            Arch::Esa390 => &ESA390_LAYOUT,
            Arch::ZArch  => &Z_LAYOUT,
        }
    }

    /// Whether general and control registers are 64 bits wide.
    pub fn is_64bit(self) -> bool {
        matches!(self, Arch::ZArch)
    }
}
impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::S370   => f.write_str("S/370"),
            Arch::Esa390 => f.write_str("ESA/390"),
            Arch::ZArch  => f.write_str("z/Arch"),
        }
    }
}

/// Offsets (relative to the start of the PSA) used by external interrupt delivery.
#[derive(Debug, PartialEq, Eq)]
pub struct PsaLayout {
    /// Size of the prefixed area (4K or 8K).
    pub prefix_size: u64,
    /// Length of a stored PSW (8 or 16 bytes).
    pub psw_len: usize,
    /// External old PSW.
    pub ext_old: u64,
    /// External new PSW.
    pub ext_new: u64,
    /// External interruption parameter (fullword).
    pub ext_parm: u64,
    /// External-interruption CPU address (halfword).
    pub ext_cpu_addr: u64,
    /// External-interruption code (halfword).
    pub ext_int_code: u64,
    /// 64-bit block-I/O parameter, if the generation has one.
    pub bio_parm: Option<u64>,
    /// Interval timer, if the generation has one.
    pub int_timer: Option<u64>,
    /// Architecture-mode identification byte, if the generation stores one.
    pub arch_id: Option<u64>,
    /// Store-status save area.
    pub status: StatusLayout,
}

/// Offsets (relative to the store-status address) of the store-status save area.
#[derive(Debug, PartialEq, Eq)]
pub struct StatusLayout {
    /// CPU timer (doubleword).
    pub cpu_timer: u64,
    /// Clock comparator (doubleword).
    pub clkc: u64,
    /// Current PSW.
    pub psw: u64,
    /// Prefix register (fullword).
    pub prefix: u64,
    /// Floating point control register, if stored (fullword).
    pub fpc: Option<u64>,
    /// Floating point registers.
    pub fpr: u64,
    /// Number of floating point registers stored (4 or 16).
    pub fpr_count: usize,
    /// General registers.
    pub gr: u64,
    /// Access registers, if stored.
    pub ar: Option<u64>,
    /// Control registers.
    pub cr: u64,
    /// Width of a general or control register (4 or 8 bytes).
    pub reg_width: usize,
}

/// System/370.
pub static S370_LAYOUT: PsaLayout = PsaLayout {
    prefix_size: 0x1000,
    psw_len: 8,
    ext_old: 0x18,
    ext_new: 0x58,
    ext_parm: 0x80,
    ext_cpu_addr: 0x84,
    ext_int_code: 0x86,
    bio_parm: None,
    int_timer: Some(0x50),
    arch_id: None,
    status: StatusLayout {
        cpu_timer: 0xD8,
        clkc: 0xE0,
        psw: 0x100,
        prefix: 0x108,
        fpc: None,
        fpr: 0x160,
        fpr_count: 4,
        gr: 0x180,
        ar: None,
        cr: 0x1C0,
        reg_width: 4,
    },
};

/// ESA/390.
pub static ESA390_LAYOUT: PsaLayout = PsaLayout {
    prefix_size: 0x1000,
    psw_len: 8,
    ext_old: 0x18,
    ext_new: 0x58,
    ext_parm: 0x80,
    ext_cpu_addr: 0x84,
    ext_int_code: 0x86,
    bio_parm: None,
    int_timer: Some(0x50),
    arch_id: Some(0xA3),
    status: StatusLayout {
        cpu_timer: 0xD8,
        clkc: 0xE0,
        psw: 0x100,
        prefix: 0x108,
        fpc: None,
        fpr: 0x160,
        fpr_count: 4,
        gr: 0x180,
        ar: Some(0x120),
        cr: 0x1C0,
        reg_width: 4,
    },
};

/// z/Architecture.
pub static Z_LAYOUT: PsaLayout = PsaLayout {
    prefix_size: 0x2000,
    psw_len: 16,
    ext_old: 0x130,
    ext_new: 0x1B0,
    ext_parm: 0x80,
    ext_cpu_addr: 0x84,
    ext_int_code: 0x86,
    bio_parm: Some(0x11B8),
    int_timer: None,
    arch_id: Some(0xA3),
    status: StatusLayout {
        cpu_timer: 0x1328,
        clkc: 0x1330,
        psw: 0x1300,
        prefix: 0x1318,
        fpc: Some(0x131C),
        fpr: 0x1200,
        fpr_count: 16,
        gr: 0x1280,
        ar: Some(0x1340),
        cr: 0x1380,
        reg_width: 8,
    },
};

/// Offset of the interruption-parameter copy of the PSA inside a SIE state descriptor.
///
/// Intercepted external interrupts store their parameters relative to
/// `state descriptor + SIE_IP_PSA_OFFSET`, using the ordinary PSA offsets.
pub const SIE_IP_PSA_OFFSET: u64 = 0x40;

impl PsaLayout {
    /// Applies prefixing to a real address, producing an absolute address.
    ///
    /// Real addresses in the first `prefix_size` bytes map to the prefix area,
    /// and addresses in the prefix area map to the first `prefix_size` bytes.
    ///
    /// ```
    /// use zarch_irq::sys::psa::Arch;
    ///
    /// let esa = Arch::Esa390.layout();
    /// assert_eq!(esa.apply_prefixing(0x0080, 0x5000), 0x5080);
    /// assert_eq!(esa.apply_prefixing(0x5080, 0x5000), 0x0080);
    /// assert_eq!(esa.apply_prefixing(0x9000, 0x5000), 0x9000);
    /// ```
    pub fn apply_prefixing(&self, addr: u64, prefix: u64) -> u64 {
        let page = addr & !(self.prefix_size - 1);
        if page == 0 {
            addr + prefix
        } else if page == prefix {
            addr - prefix
        } else {
            addr
        }
    }
}
