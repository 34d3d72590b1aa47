//! Configuration for the emulated system.
//!
//! [`SysConfig`] can be built directly (it implements [`Default`]) or loaded from TOML:
//!
//! ```toml
//! num_cpus = 4
//! arch = "esa390"
//! main_storage = 16777216
//! interval_timer = true
//! ```
//!
//! ```
//! use zarch_irq::sys::config::SysConfig;
//! use zarch_irq::sys::psa::Arch;
//!
//! let config = SysConfig::from_toml_str("num_cpus = 4\narch = \"esa390\"").unwrap();
//! assert_eq!(config.num_cpus, 4);
//! assert_eq!(config.arch, Arch::Esa390);
//! assert!(!config.block_io);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::psa::Arch;
use super::SysErr;

/// The largest number of processors a system can be configured with.
pub const MAX_CPU: usize = 64;

/// Configuration for [`System`].
///
/// These are fixed once the system is created.
///
/// [`System`]: super::System
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SysConfig {
    /// Number of configured processors.
    ///
    /// By default, this is `1`.
    pub num_cpus: usize,

    /// Architecture generation.
    ///
    /// By default, this is [`Arch::ZArch`].
    pub arch: Arch,

    /// Size of main storage in bytes.
    ///
    /// This must be large enough to hold a prefix area for every processor.
    /// By default, this is 16 MiB.
    pub main_storage: usize,

    /// Whether the interval timer at PSA+X'50' is installed.
    ///
    /// Ignored for z/Architecture, which has no interval timer.
    /// By default, this is `true`.
    pub interval_timer: bool,

    /// Whether the ECPS:VM virtual interval timer is installed.
    ///
    /// By default, this is `false`.
    pub ecps_vtimer: bool,

    /// Whether the model offers the expedited SIE subset.
    ///
    /// If offered, a guest whose state descriptor requests expedited timer handling has
    /// its external interrupts delivered directly rather than intercepted.
    /// By default, this is `false`.
    pub expedited_sie_subset: bool,

    /// Whether the model offers the SIE external-interruption assist.
    ///
    /// By default, this is `false`.
    pub external_interrupt_assist: bool,

    /// Whether transactional execution is installed (z/Architecture only).
    ///
    /// By default, this is `false`.
    pub transactional_execution: bool,

    /// Whether VM block-I/O external interrupts are supported.
    ///
    /// By default, this is `false`.
    pub block_io: bool,

    /// Period of the timer thread in microseconds.
    ///
    /// By default, this is `1000`.
    pub timer_interval_us: u64,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            arch: Arch::ZArch,
            main_storage: 16 << 20,
            interval_timer: true,
            ecps_vtimer: false,
            expedited_sie_subset: false,
            external_interrupt_assist: false,
            transactional_execution: false,
            block_io: false,
            timer_interval_us: 1000,
        }
    }
}

impl SysConfig {
    /// Parses a configuration from TOML. Missing fields take their default values.
    pub fn from_toml_str(s: &str) -> Result<Self, SysErr> {
        let config: SysConfig = toml::from_str(s)
            .map_err(|e| SysErr::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, SysErr> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SysErr::ConfigParse(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        log::info!("Loaded system configuration from {}", path.display());
        Ok(config)
    }

    /// Checks that this configuration describes a system that can be built.
    pub fn validate(&self) -> Result<(), SysErr> {
        if self.num_cpus == 0 || self.num_cpus > MAX_CPU {
            return Err(SysErr::Config(format!("num_cpus must be within 1..={MAX_CPU}, got {}", self.num_cpus)));
        }
        let needed = self.num_cpus as u64 * self.arch.layout().prefix_size;
        if (self.main_storage as u64) < needed {
            return Err(SysErr::Config(format!("main_storage must hold {needed} bytes of prefix areas")));
        }
        if self.transactional_execution && self.arch != Arch::ZArch {
            return Err(SysErr::Config(format!("transactional execution is not available on {}", self.arch)));
        }
        if self.timer_interval_us == 0 {
            return Err(SysErr::Config("timer_interval_us must be nonzero".to_string()));
        }
        Ok(())
    }

    /// Whether interval timer interrupts can occur on this configuration.
    pub fn has_interval_timer(&self) -> bool {
        self.interval_timer && self.arch != Arch::ZArch
    }
}
