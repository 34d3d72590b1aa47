//! Main storage as seen by interrupt delivery.
//!
//! Interrupt delivery only needs a narrow view of storage, captured by the [`Storage`] trait:
//! - marking a frame referenced and changed,
//! - fetching and storing bytes at absolute addresses,
//! - checking that an operand exists,
//! - translating a SIE guest address to a host absolute address.
//!
//! [`MainStorage`] is a straightforward implementation backed by a byte array
//! and one storage key per 4K frame.
//!
//! ```
//! use zarch_irq::sys::storage::{MainStorage, Storage, STORKEY_REF, STORKEY_CHANGE};
//!
//! let mem = MainStorage::new(0x10000);
//! mem.store_fw(0x1080, 0xDEADBEEF).unwrap();
//! assert_eq!(mem.fetch_fw(0x1080).unwrap(), 0xDEADBEEF);
//!
//! mem.mark_referenced_and_changed(0x1080);
//! assert_eq!(mem.storage_key(0x1000), STORKEY_REF | STORKEY_CHANGE);
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

use super::cpu::SieGuest;
use super::ProgramCheck;

/// Storage key bit: frame referenced.
pub const STORKEY_REF: u8 = 0x04;
/// Storage key bit: frame changed.
pub const STORKEY_CHANGE: u8 = 0x02;

const FRAME_SHIFT: u32 = 12;

/// Storage operations consumed by interrupt delivery.
///
/// All addresses are absolute unless stated otherwise. Multi-byte values are big-endian.
pub trait Storage: Send + Sync + 'static {
    /// Sets the reference and change bits of the frame containing `addr`.
    fn mark_referenced_and_changed(&self, addr: u64);

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    fn fetch(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck>;

    /// Copies `data` into storage starting at `addr`.
    fn store(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck>;

    /// Checks that `len` bytes starting at `addr` exist.
    fn validate_operand(&self, addr: u64, len: usize) -> Result<(), ProgramCheck>;

    /// Translates a guest absolute address into a host absolute address.
    ///
    /// The default implementation relocates by the guest's main storage origin.
    fn translate_guest(&self, addr: u64, sie: &SieGuest) -> Result<u64, ProgramCheck> {
        let host = addr.checked_add(sie.mso).ok_or(ProgramCheck::ADDRESSING)?;
        self.validate_operand(host, 1)?;
        Ok(host)
    }

    /// Fetches a halfword.
    fn fetch_hw(&self, addr: u64) -> Result<u16, ProgramCheck> {
        let mut b = [0; 2];
        self.fetch(addr, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }
    /// Fetches a fullword.
    fn fetch_fw(&self, addr: u64) -> Result<u32, ProgramCheck> {
        let mut b = [0; 4];
        self.fetch(addr, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }
    /// Fetches a doubleword.
    fn fetch_dw(&self, addr: u64) -> Result<u64, ProgramCheck> {
        let mut b = [0; 8];
        self.fetch(addr, &mut b)?;
        Ok(u64::from_be_bytes(b))
    }
    /// Stores a halfword.
    fn store_hw(&self, addr: u64, value: u16) -> Result<(), ProgramCheck> {
        self.store(addr, &value.to_be_bytes())
    }
    /// Stores a fullword.
    fn store_fw(&self, addr: u64, value: u32) -> Result<(), ProgramCheck> {
        self.store(addr, &value.to_be_bytes())
    }
    /// Stores a doubleword.
    fn store_dw(&self, addr: u64, value: u64) -> Result<(), ProgramCheck> {
        self.store(addr, &value.to_be_bytes())
    }
}
impl dyn Storage {} // assert Storage is dyn safe

/// Byte-addressed main storage with per-frame storage keys.
pub struct MainStorage {
    bytes: RwLock<Box<[u8]>>,
    keys: Box<[AtomicU8]>,
}
impl MainStorage {
    /// Creates zeroed storage of `size` bytes (rounded up to a whole frame).
    pub fn new(size: usize) -> Self {
        let frames = (size + (1 << FRAME_SHIFT) - 1) >> FRAME_SHIFT;
        Self {
            bytes: RwLock::new(vec![0; frames << FRAME_SHIFT].into_boxed_slice()),
            keys: (0..frames).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Size of storage in bytes.
    pub fn len(&self) -> usize {
        self.keys.len() << FRAME_SHIFT
    }
    /// Whether storage has no frames.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Reads the storage key of the frame containing `addr`.
    ///
    /// Addresses outside storage read as key zero.
    pub fn storage_key(&self, addr: u64) -> u8 {
        self.frame(addr)
            .map_or(0, |k| k.load(Ordering::Relaxed))
    }
    /// Sets the storage key of the frame containing `addr`.
    pub fn set_storage_key(&self, addr: u64, key: u8) {
        if let Some(k) = self.frame(addr) {
            k.store(key, Ordering::Relaxed);
        }
    }

    fn frame(&self, addr: u64) -> Option<&AtomicU8> {
        self.keys.get(usize::try_from(addr >> FRAME_SHIFT).ok()?)
    }
    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, ProgramCheck> {
        let start = usize::try_from(addr).map_err(|_| ProgramCheck::ADDRESSING)?;
        let end = start.checked_add(len).ok_or(ProgramCheck::ADDRESSING)?;
        match end <= self.len() {
            true  => Ok(start..end),
            false => Err(ProgramCheck::ADDRESSING),
        }
    }
}
impl Storage for MainStorage {
    fn mark_referenced_and_changed(&self, addr: u64) {
        if let Some(k) = self.frame(addr) {
            k.fetch_or(STORKEY_REF | STORKEY_CHANGE, Ordering::Relaxed);
        }
    }

    fn fetch(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes.read()[range]);
        Ok(())
    }

    fn store(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck> {
        let range = self.range(addr, data.len())?;
        self.bytes.write()[range].copy_from_slice(data);
        Ok(())
    }

    fn validate_operand(&self, addr: u64, len: usize) -> Result<(), ProgramCheck> {
        self.range(addr, len).map(|_| ())
    }
}
impl std::fmt::Debug for MainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainStorage")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
