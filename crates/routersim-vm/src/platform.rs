//! Supported appliance models and their hardware defaults.

use std::fmt;
use std::str::FromStr;

use crate::codec::{C3600Codec, C7200Codec, ConfigCodec};
use crate::error::VmError;

/// Physical address width of the emulated MIPS64 CPUs.
pub const PHYS_ADDR_BITS: u32 = 36;

/// Interrupt line driven by the periodic timer.
pub const TIMER_IRQ: u32 = 7;

/// Default number of executed ticks between timer interrupt checks.
pub const TIMER_IRQ_CHECK_ITV: u32 = 1000;

/// Name of the object every machine must have attached before it starts.
pub const NVRAM_OBJECT: &str = "nvram";

/// Supported appliance models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType {
    /// 7200-series router (NPE based).
    C7200,
    /// 3600-series modular router.
    C3600,
}

/// Hardware defaults applied at instance creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineDefaults {
    /// RAM size in MiB.
    pub ram_size: u32,
    /// ROM size in MiB.
    pub rom_size: u32,
    /// NVRAM size in KiB.
    pub nvram_size: u32,
    /// I/O memory size in MiB.
    pub iomem_size: u32,
    /// Configuration register.
    pub conf_reg: u32,
    /// Clock divisor.
    pub clock_divisor: u32,
    /// ELF machine id expected in images.
    pub elf_machine_id: u32,
    /// Bytes at the start of NVRAM owned by the ROM monitor.
    pub nvram_rom_space: u32,
}

impl MachineType {
    /// All supported models.
    pub const ALL: [MachineType; 2] = [MachineType::C7200, MachineType::C3600];

    /// Short name used in file names and saved configurations.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::C7200 => "c7200",
            Self::C3600 => "c3600",
        }
    }

    /// Tag used in log lines.
    #[must_use]
    pub const fn log_name(&self) -> &'static str {
        match self {
            Self::C7200 => "C7200",
            Self::C3600 => "C3600",
        }
    }

    /// Hardware defaults for this model.
    #[must_use]
    pub const fn defaults(&self) -> MachineDefaults {
        match self {
            Self::C7200 => MachineDefaults {
                ram_size: 256,
                rom_size: 4,
                nvram_size: 128,
                iomem_size: 0,
                conf_reg: 0x2102,
                clock_divisor: 4,
                elf_machine_id: 0x19,
                nvram_rom_space: 2048,
            },
            Self::C3600 => MachineDefaults {
                ram_size: 128,
                rom_size: 2,
                nvram_size: 128,
                iomem_size: 5,
                conf_reg: 0x2102,
                clock_divisor: 4,
                elf_machine_id: 0x1e,
                nvram_rom_space: 2048,
            },
        }
    }

    /// Objects that must be attached before the instance may start.
    #[must_use]
    pub const fn mandatory_objects(&self) -> &'static [&'static str] {
        &[NVRAM_OBJECT]
    }

    /// Exclusive upper bound of the physical address space.
    #[must_use]
    pub const fn phys_addr_limit(&self) -> u64 {
        1u64 << PHYS_ADDR_BITS
    }

    /// Builds the NVRAM configuration codec for this model.
    #[must_use]
    pub fn codec(&self) -> Box<dyn ConfigCodec> {
        match self {
            Self::C7200 => Box::new(C7200Codec),
            Self::C3600 => Box::new(C3600Codec),
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineType {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| VmError::UnsupportedMachine(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_machine_type() {
        assert_eq!("c7200".parse::<MachineType>().unwrap(), MachineType::C7200);
        assert_eq!("C3600".parse::<MachineType>().unwrap(), MachineType::C3600);
        assert!(matches!(
            "c2691".parse::<MachineType>(),
            Err(VmError::UnsupportedMachine(_))
        ));
    }

    #[test]
    fn test_codecs_differ_by_machine() {
        assert_eq!(MachineType::C7200.codec().name(), "c7200");
        assert_eq!(MachineType::C3600.codec().name(), "c3600");
    }

    #[test]
    fn test_addr_limit() {
        assert_eq!(MachineType::C7200.phys_addr_limit(), 0x10_0000_0000);
    }
}
