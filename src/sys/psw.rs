//! The program status word.
//!
//! [`Psw`] holds the decoded status word. It is converted to and from its
//! stored form with [`Psw::to_bytes`] and [`Psw::from_bytes`], whose formats depend on the [`Arch`]:
//!
//! ```text
//! S/370 BC mode (8 bytes)
//!   | sysmask | key|0MWP | interruption code | ILC CC PM | instruction address (24) |
//! S/370 EC mode, ESA/390 (8 bytes)
//!   | 0R000TIE | key|1MWP | AS CC PM | 00 | A | instruction address (31) |
//! z/Architecture (16 bytes)
//!   | 0R000TIE | key|0MWP | AS CC PM | 0000000E | B | 0 ... 0 | instruction address (64) |
//! ```
//!
//! Loading a status word validates it. An invalid format is reported as a specification exception,
//! and [`Psw::decode`] gives the fields a processor holds after loading it anyway:
//! ```
//! use zarch_irq::sys::psa::Arch;
//! use zarch_irq::sys::psw::Psw;
//! use zarch_irq::sys::ProgramCheck;
//!
//! // ESA/390 requires the EC bit:
//! let bytes = [0x04, 0x00, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00];
//! assert_eq!(Psw::from_bytes(Arch::Esa390, &bytes), Err(ProgramCheck::SPECIFICATION));
//! assert_eq!(Psw::decode(Arch::Esa390, &bytes).ia, 0x1000);
//!
//! let bytes = [0x04, 0x08, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00];
//! let psw = Psw::from_bytes(Arch::Esa390, &bytes).unwrap();
//! assert!(psw.amode31);
//! assert_eq!(psw.ia, 0x1000);
//! ```

use super::psa::Arch;
use super::ProgramCheck;

/// System mask bit: PER.
pub const PSW_PER: u8 = 0x40;
/// System mask bit: dynamic address translation.
pub const PSW_DAT: u8 = 0x04;
/// System mask bit: I/O interrupts enabled.
pub const PSW_IO_MASK: u8 = 0x02;
/// System mask bit: external interrupts enabled.
pub const PSW_EXT_MASK: u8 = 0x01;

/// State bit: machine checks enabled.
pub const PSW_MACH: u8 = 0x04;
/// State bit: wait state.
pub const PSW_WAIT: u8 = 0x02;
/// State bit: problem state.
pub const PSW_PROB: u8 = 0x01;

const PSW_EC: u8 = 0x08;
const SYSMASK_RESERVED: u8 = 0xB8;

/// A decoded program status word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Psw {
    /// System mask (byte 0).
    pub sysmask: u8,
    /// PSW key (0-15).
    pub pkey: u8,
    /// Machine check, wait, and problem state bits.
    pub states: u8,
    /// Whether an S/370 PSW is in extended-control mode.
    ///
    /// ESA/390 status words are always EC mode and this is ignored for z/Architecture.
    pub ecmode: bool,
    /// Address-space control.
    pub asc: u8,
    /// Condition code.
    pub cc: u8,
    /// Program mask.
    pub progmask: u8,
    /// Extended (64-bit) addressing mode.
    pub amode64: bool,
    /// Basic (31-bit) addressing mode.
    pub amode31: bool,
    /// Instruction length code (S/370 BC mode only).
    pub ilc: u8,
    /// Interruption code.
    ///
    /// Only stored as part of the PSW in S/370 BC mode.
    pub intcode: u16,
    /// Instruction address.
    pub ia: u64,
}

impl Psw {
    /// Whether the processor is enabled for external interrupts.
    pub fn ext_enabled(&self) -> bool {
        self.sysmask & PSW_EXT_MASK != 0
    }
    /// Whether the processor is in the wait state.
    pub fn wait(&self) -> bool {
        self.states & PSW_WAIT != 0
    }
    /// Whether the processor is in the problem state.
    pub fn problem_state(&self) -> bool {
        self.states & PSW_PROB != 0
    }
    /// Whether the PSW is stored in extended-control format for the given generation.
    pub fn is_ec(&self, arch: Arch) -> bool {
        match arch {
            Arch::S370 => self.ecmode,
            Arch::Esa390 | Arch::ZArch => true,
        }
    }

    /// Encodes the status word.
    ///
    /// Only the first [`PsaLayout::psw_len`] bytes are meaningful.
    ///
    /// [`PsaLayout::psw_len`]: super::psa::PsaLayout::psw_len
    pub fn to_bytes(&self, arch: Arch) -> [u8; 16] {
        let mut out = [0; 16];
        let key_states = (self.pkey & 0xF) << 4 | (self.states & 0x07);
        let ccpm = (self.cc & 0b11) << 4 | (self.progmask & 0xF);

        out[0] = self.sysmask;
        match arch {
            Arch::S370 if !self.ecmode => {
                out[1] = key_states;
                out[2..4].copy_from_slice(&self.intcode.to_be_bytes());
                out[4] = (self.ilc & 0b11) << 6 | ccpm;
                out[5..8].copy_from_slice(&(self.ia as u32).to_be_bytes()[1..]);
            },
            Arch::S370 => {
                out[1] = key_states | PSW_EC;
                out[2] = (self.asc & 0b11) << 6 | ccpm;
                out[5..8].copy_from_slice(&(self.ia as u32).to_be_bytes()[1..]);
            },
            Arch::Esa390 => {
                out[1] = key_states | PSW_EC;
                out[2] = (self.asc & 0b11) << 6 | ccpm;
                let word = (self.ia as u32 & 0x7FFF_FFFF) | u32::from(self.amode31) << 31;
                out[4..8].copy_from_slice(&word.to_be_bytes());
            },
            Arch::ZArch => {
                out[1] = key_states;
                out[2] = (self.asc & 0b11) << 6 | ccpm;
                out[3] = u8::from(self.amode64);
                out[4] = u8::from(self.amode31) << 7;
                out[8..16].copy_from_slice(&self.ia.to_be_bytes());
            },
        }

        out
    }

    /// Decodes and validates a stored status word.
    ///
    /// `bytes` must hold at least [`PsaLayout::psw_len`] bytes for the generation.
    ///
    /// [`PsaLayout::psw_len`]: super::psa::PsaLayout::psw_len
    pub fn from_bytes(arch: Arch, bytes: &[u8]) -> Result<Psw, ProgramCheck> {
        let len = arch.layout().psw_len;
        let Some(b) = bytes.get(..len) else { return Err(ProgramCheck::SPECIFICATION) };
        Psw::check(arch, b)?;
        Ok(Psw::decode(arch, b))
    }

    /// Decodes a stored status word without validating it.
    ///
    /// This is what a processor holds after loading an invalid status word,
    /// before the resulting specification exception is recognized.
    /// Missing trailing bytes read as zero.
    pub fn decode(arch: Arch, bytes: &[u8]) -> Psw {
        let mut b = [0; 16];
        let n = bytes.len().min(16);
        b[..n].copy_from_slice(&bytes[..n]);

        let ec = b[1] & PSW_EC != 0;
        let mut psw = Psw {
            sysmask: b[0],
            pkey: b[1] >> 4,
            states: b[1] & 0x07,
            ecmode: ec,
            ..Default::default()
        };

        match arch {
            Arch::S370 if !ec => {
                psw.intcode = u16::from_be_bytes([b[2], b[3]]);
                psw.ilc = b[4] >> 6;
                psw.cc = (b[4] >> 4) & 0b11;
                psw.progmask = b[4] & 0xF;
                psw.ia = u64::from(u32::from_be_bytes([0, b[5], b[6], b[7]]));
            },
            Arch::S370 => {
                psw.decode_byte2(b[2]);
                psw.ia = u64::from(u32::from_be_bytes([0, b[5], b[6], b[7]]));
            },
            Arch::Esa390 => {
                psw.decode_byte2(b[2]);
                let word = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
                psw.amode31 = word & 0x8000_0000 != 0;
                psw.ia = u64::from(word & 0x7FFF_FFFF);
            },
            Arch::ZArch => {
                psw.ecmode = true;
                psw.decode_byte2(b[2]);
                psw.amode64 = b[3] & 0x01 != 0;
                psw.amode31 = b[4] & 0x80 != 0;
                let mut ia = [0; 8];
                ia.copy_from_slice(&b[8..16]);
                psw.ia = u64::from_be_bytes(ia);
            },
        }

        psw
    }

    /// Checks the format of a stored status word of exactly `psw_len` bytes.
    fn check(arch: Arch, b: &[u8]) -> Result<(), ProgramCheck> {
        let ec = b[1] & PSW_EC != 0;
        let valid = match arch {
            Arch::S370 if !ec => true,
            Arch::S370 => b[0] & SYSMASK_RESERVED == 0 && b[3] == 0 && b[4] == 0,
            Arch::Esa390 => {
                let word = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
                let amode31 = word & 0x8000_0000 != 0;
                ec && b[0] & SYSMASK_RESERVED == 0 && b[3] == 0
                    && (amode31 || word & 0x7FFF_FFFF <= 0x00FF_FFFF)
            },
            Arch::ZArch => {
                let amode64 = b[3] & 0x01 != 0;
                let word = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
                let amode31 = word & 0x8000_0000 != 0;
                let mut ia = [0; 8];
                ia.copy_from_slice(&b[8..16]);
                let limit = match (amode64, amode31) {
                    (true, _)      => u64::MAX,
                    (false, true)  => 0x7FFF_FFFF,
                    (false, false) => 0x00FF_FFFF,
                };
                !ec && b[0] & SYSMASK_RESERVED == 0 && b[3] & 0xFE == 0
                    && word & 0x7FFF_FFFF == 0
                    && !(amode64 && !amode31)
                    && u64::from_be_bytes(ia) <= limit
            },
        };
        match valid {
            true  => Ok(()),
            false => Err(ProgramCheck::SPECIFICATION),
        }
    }

    fn decode_byte2(&mut self, byte: u8) {
        self.asc = byte >> 6;
        self.cc = (byte >> 4) & 0b11;
        self.progmask = byte & 0xF;
    }
}
impl std::fmt::Debug for Psw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Psw")
            .field("sysmask", &format_args!("{:02X}", self.sysmask))
            .field("key", &self.pkey)
            .field("states", &format_args!("{:03b}", self.states))
            .field("cc", &self.cc)
            .field("progmask", &format_args!("{:X}", self.progmask))
            .field("amode", &match (self.amode64, self.amode31) {
                (true, _) => 64,
                (false, true) => 31,
                (false, false) => 24,
            })
            .field("ia", &format_args!("{:016X}", self.ia))
            .finish_non_exhaustive()
    }
}
