//! Saved instance configuration.
//!
//! An instance is saved as a list of `vm ...` directives, one per creation or
//! boot parameter. Replaying them through
//! [`Registry::replay`](crate::registry::Registry::replay) recreates an
//! equivalent instance.
//!
//! ```text
//! vm create R1 1 c7200
//! vm set_ios R1 /images/c7200-adventerprisek9-mz.124-24.T5.bin
//! vm set_ram R1 256
//! vm set_conf_reg R1 0x2102
//! ```

use std::io::Write;
use std::path::PathBuf;

use crate::error::{Result, VmError};
use crate::instance::{ConsoleLine, ConsolePort, Instance};

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `vm create <name> <id> <machine>`
    Create {
        name: String,
        id: u32,
        machine: String,
    },
    /// `vm set_<param> <name> <value>`
    Set { name: String, param: Param },
}

/// Parameter carried by a `set_*` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Ios(PathBuf),
    Config(PathBuf),
    Rom(PathBuf),
    SymFile(PathBuf),
    Ram(u32),
    Nvram(u32),
    Iomem(u32),
    Disk0(u32),
    Disk1(u32),
    ExecArea(u32),
    NvramRomSpace(u32),
    RestartIos(bool),
    RamMmap(bool),
    ClockDivisor(u32),
    ConfReg(u32),
    IdlePc(u64),
    TimerItv(u32),
    ConTcpPort(u16),
    AuxTcpPort(u16),
    ConTerminal,
    AuxTerminal,
}

impl Param {
    /// Applies the parameter to a halted instance.
    pub fn apply(&self, vm: &mut Instance) -> Result<()> {
        match self {
            Self::Ios(p) => vm.set_ios_image(p.clone()),
            Self::Config(p) => vm.set_ios_config(p.clone()),
            Self::Rom(p) => vm.set_rom_image(p.clone()),
            Self::SymFile(p) => vm.set_symbol_file(p.clone()),
            Self::Ram(v) => vm.set_ram_size(*v),
            Self::Nvram(v) => vm.set_nvram_size(*v),
            Self::Iomem(v) => vm.set_iomem_size(*v),
            Self::Disk0(v) => vm.set_disk_size(0, *v),
            Self::Disk1(v) => vm.set_disk_size(1, *v),
            Self::ExecArea(v) => vm.set_exec_area_size(*v),
            Self::NvramRomSpace(v) => vm.set_nvram_rom_space(*v),
            Self::RestartIos(v) => {
                vm.set_restart_ios(*v);
                Ok(())
            }
            Self::RamMmap(v) => vm.set_ram_mmap(*v),
            Self::ClockDivisor(v) => vm.set_clock_divisor(*v),
            Self::ConfReg(v) => vm.set_conf_reg(*v),
            Self::IdlePc(v) => {
                vm.set_idle_pc(*v);
                Ok(())
            }
            Self::TimerItv(v) => vm.set_timer_irq_check_itv(*v),
            Self::ConTcpPort(p) => vm.set_line(ConsolePort::Con, ConsoleLine::Tcp(*p)),
            Self::AuxTcpPort(p) => vm.set_line(ConsolePort::Aux, ConsoleLine::Tcp(*p)),
            Self::ConTerminal => vm.set_line(ConsolePort::Con, ConsoleLine::Terminal),
            Self::AuxTerminal => vm.set_line(ConsolePort::Aux, ConsoleLine::Terminal),
        }
    }
}

/// Writes the directives describing `vm`.
pub fn save_config<W: Write>(vm: &Instance, out: &mut W) -> Result<()> {
    let name = vm.name();
    writeln!(out, "vm create {} {} {}", name, vm.id(), vm.machine())?;

    if let Some(image) = vm.ios_image() {
        writeln!(out, "vm set_ios {} {}", name, image.display())?;
    }
    if let Some(config) = vm.ios_config() {
        writeln!(out, "vm set_config {} {}", name, config.display())?;
    }
    if let Some(rom) = vm.rom_image() {
        writeln!(out, "vm set_rom {} {}", name, rom.display())?;
    }
    if let Some(sym) = vm.symbol_file() {
        writeln!(out, "vm set_sym_file {} {}", name, sym.display())?;
    }

    writeln!(out, "vm set_ram {} {}", name, vm.ram_size())?;
    writeln!(out, "vm set_nvram {} {}", name, vm.nvram_size())?;
    writeln!(out, "vm set_nvram_rom_space {} {}", name, vm.nvram_rom_space())?;
    writeln!(out, "vm set_iomem {} {}", name, vm.iomem_size())?;
    writeln!(out, "vm set_disk0 {} {}", name, vm.disk_size(0).unwrap_or(0))?;
    writeln!(out, "vm set_disk1 {} {}", name, vm.disk_size(1).unwrap_or(0))?;
    writeln!(out, "vm set_exec_area {} {}", name, vm.exec_area_size())?;
    writeln!(out, "vm set_restart_ios {} {}", name, u8::from(vm.restart_ios()))?;
    writeln!(out, "vm set_ram_mmap {} {}", name, u8::from(vm.ram_mmap()))?;
    writeln!(out, "vm set_clock_divisor {} {}", name, vm.clock_divisor())?;
    writeln!(out, "vm set_conf_reg {} 0x{:04x}", name, vm.conf_reg_setup())?;
    if vm.idle_pc() != 0 {
        writeln!(out, "vm set_idle_pc {} 0x{:x}", name, vm.idle_pc())?;
    }
    writeln!(out, "vm set_timer_itv {} {}", name, vm.timer_irq_check_itv())?;

    for (port, label) in [(ConsolePort::Con, "con"), (ConsolePort::Aux, "aux")] {
        match vm.line(port) {
            ConsoleLine::None => {}
            ConsoleLine::Terminal => writeln!(out, "vm set_{}_terminal {} 1", label, name)?,
            ConsoleLine::Tcp(tcp) => writeln!(out, "vm set_{}_tcp_port {} {}", label, name, tcp)?,
        }
    }
    writeln!(out)?;
    Ok(())
}

impl Instance {
    /// Saved-configuration directives for this instance.
    pub fn save_config_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        save_config(self, &mut buf)?;
        String::from_utf8(buf).map_err(|e| VmError::Config(e.to_string()))
    }
}

fn parse_err(line: usize, message: impl Into<String>) -> VmError {
    VmError::Parse {
        line,
        message: message.into(),
    }
}

fn parse_num<T: std::str::FromStr>(line: usize, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| parse_err(line, format!("invalid number '{}'", value)))
}

fn parse_hex_u64(line: usize, value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"));
    match digits {
        Some(d) => u64::from_str_radix(d, 16),
        None => value.parse::<u64>(),
    }
    .map_err(|_| parse_err(line, format!("invalid number '{}'", value)))
}

fn require<'a>(line: usize, verb: &str, rest: &'a str, what: &str) -> Result<&'a str> {
    if rest.is_empty() {
        Err(parse_err(line, format!("{} requires {}", verb, what)))
    } else {
        Ok(rest)
    }
}

/// Parses saved directives. Blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns `Parse` with the 1-based line number on the first bad line.
pub fn parse_directives(text: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let lineno = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(4, char::is_whitespace).filter(|s| !s.is_empty());
        let (Some("vm"), Some(verb), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(parse_err(lineno, format!("malformed directive '{}'", line)));
        };
        let rest = parts.next().map(str::trim).unwrap_or("");
        let name = name.to_string();

        let directive = match verb {
            "create" => {
                let mut args = require(lineno, verb, rest, "an id and a machine type")?.split_whitespace();
                let (Some(id), Some(machine), None) = (args.next(), args.next(), args.next())
                else {
                    return Err(parse_err(lineno, "create takes <name> <id> <machine>"));
                };
                Directive::Create {
                    name,
                    id: parse_num(lineno, id)?,
                    machine: machine.to_string(),
                }
            }
            _ => {
                let value = require(lineno, verb, rest, "a value")?;
                let param = match verb {
                    "set_ios" => Param::Ios(PathBuf::from(value)),
                    "set_config" => Param::Config(PathBuf::from(value)),
                    "set_rom" => Param::Rom(PathBuf::from(value)),
                    "set_sym_file" => Param::SymFile(PathBuf::from(value)),
                    "set_ram" => Param::Ram(parse_num(lineno, value)?),
                    "set_nvram" => Param::Nvram(parse_num(lineno, value)?),
                    "set_nvram_rom_space" => Param::NvramRomSpace(parse_num(lineno, value)?),
                    "set_iomem" => Param::Iomem(parse_num(lineno, value)?),
                    "set_disk0" => Param::Disk0(parse_num(lineno, value)?),
                    "set_disk1" => Param::Disk1(parse_num(lineno, value)?),
                    "set_exec_area" => Param::ExecArea(parse_num(lineno, value)?),
                    "set_restart_ios" => Param::RestartIos(parse_num::<u8>(lineno, value)? != 0),
                    "set_ram_mmap" => Param::RamMmap(parse_num::<u8>(lineno, value)? != 0),
                    "set_clock_divisor" => Param::ClockDivisor(parse_num(lineno, value)?),
                    "set_conf_reg" => {
                        let v = parse_hex_u64(lineno, value)?;
                        Param::ConfReg(u32::try_from(v).map_err(|_| {
                            parse_err(lineno, format!("configuration register {} too large", value))
                        })?)
                    }
                    "set_idle_pc" => Param::IdlePc(parse_hex_u64(lineno, value)?),
                    "set_timer_itv" => Param::TimerItv(parse_num(lineno, value)?),
                    "set_con_tcp_port" => Param::ConTcpPort(parse_num(lineno, value)?),
                    "set_aux_tcp_port" => Param::AuxTcpPort(parse_num(lineno, value)?),
                    "set_con_terminal" | "set_aux_terminal" => {
                        if parse_num::<u8>(lineno, value)? == 0 {
                            continue;
                        }
                        if verb == "set_con_terminal" {
                            Param::ConTerminal
                        } else {
                            Param::AuxTerminal
                        }
                    }
                    other => {
                        return Err(parse_err(lineno, format!("unknown directive '{}'", other)))
                    }
                };
                Directive::Set { name, param }
            }
        };
        directives.push(directive);
    }

    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MachineType;
    use crate::settings::SimSettings;
    use std::sync::Arc;

    #[test]
    fn test_save_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = Instance::new(
            "R1",
            1,
            MachineType::C7200,
            Arc::new(SimSettings::in_dir(dir.path())),
        )
        .unwrap();
        vm.set_ios_image("/images/c7200.bin").unwrap();
        vm.set_line(ConsolePort::Con, ConsoleLine::Tcp(2001)).unwrap();
        vm.set_idle_pc(0x6080_2D30);

        let text = vm.save_config_string().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "vm create R1 1 c7200");
        assert_eq!(lines[1], "vm set_ios R1 /images/c7200.bin");
        assert!(lines.contains(&"vm set_ram R1 256"));
        assert!(lines.contains(&"vm set_conf_reg R1 0x2102"));
        assert!(lines.contains(&"vm set_idle_pc R1 0x60802d30"));
        assert!(lines.contains(&"vm set_con_tcp_port R1 2001"));
        assert!(lines.contains(&"vm set_disk0 R1 0"));
        assert!(lines.contains(&"vm set_restart_ios R1 0"));
        assert!(!text.contains("set_aux_tcp_port"));
        assert!(!text.contains("set_rom "));
    }

    #[test]
    fn test_hardware_params_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SimSettings::in_dir(dir.path()));
        let mut vm = Instance::new("R1", 1, MachineType::C3600, Arc::clone(&settings)).unwrap();
        vm.set_rom_image("/images/rom with space.bin").unwrap();
        vm.set_symbol_file("/images/c3600.sym").unwrap();
        vm.set_iomem_size(10).unwrap();
        vm.set_disk_size(0, 64).unwrap();
        vm.set_disk_size(1, 8).unwrap();
        vm.set_exec_area_size(32).unwrap();
        vm.set_nvram_rom_space(4096).unwrap();
        vm.set_restart_ios(true);
        vm.set_line(ConsolePort::Con, ConsoleLine::Terminal).unwrap();
        vm.set_line(ConsolePort::Aux, ConsoleLine::Tcp(2100)).unwrap();

        let text = vm.save_config_string().unwrap();
        assert!(text.contains("vm set_con_terminal R1 1\n"));
        assert!(text.contains("vm set_disk1 R1 8\n"));

        let mut copy = Instance::new("R1", 1, MachineType::C3600, settings).unwrap();
        for directive in parse_directives(&text).unwrap() {
            if let Directive::Set { param, .. } = directive {
                param.apply(&mut copy).unwrap();
            }
        }
        assert_eq!(copy.rom_image(), Some(std::path::Path::new("/images/rom with space.bin")));
        assert_eq!(copy.iomem_size(), 10);
        assert_eq!(copy.disk_size(0), Some(64));
        assert_eq!(copy.exec_area_size(), 32);
        assert_eq!(copy.nvram_rom_space(), 4096);
        assert!(copy.restart_ios());
        assert_eq!(copy.line(ConsolePort::Con), ConsoleLine::Terminal);
        assert_eq!(copy.save_config_string().unwrap(), text);
    }

    #[test]
    fn test_parse_directives() {
        let text = "\
# saved lab
vm create R1 1 c7200
vm set_ios R1 /images/with space/c7200.bin

vm set_conf_reg R1 0x2142
vm set_ram_mmap R1 0
vm set_idle_pc R1 0x60802d30
";
        let directives = parse_directives(text).unwrap();
        assert_eq!(directives.len(), 5);
        assert_eq!(
            directives[0],
            Directive::Create {
                name: "R1".to_string(),
                id: 1,
                machine: "c7200".to_string(),
            }
        );
        assert_eq!(
            directives[1],
            Directive::Set {
                name: "R1".to_string(),
                param: Param::Ios(PathBuf::from("/images/with space/c7200.bin")),
            }
        );
        assert!(matches!(
            directives[2],
            Directive::Set { param: Param::ConfReg(0x2142), .. }
        ));
        assert!(matches!(
            directives[3],
            Directive::Set { param: Param::RamMmap(false), .. }
        ));
        assert!(matches!(
            directives[4],
            Directive::Set { param: Param::IdlePc(0x6080_2d30), .. }
        ));
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse_directives("vm create R1 1 c7200\nvm set_warp R1 9\n").unwrap_err();
        assert!(matches!(err, VmError::Parse { line: 2, .. }));

        let err = parse_directives("vm set_ram R1 lots\n").unwrap_err();
        assert!(matches!(err, VmError::Parse { line: 1, .. }));

        let err = parse_directives("router create R1\n").unwrap_err();
        assert!(matches!(err, VmError::Parse { line: 1, .. }));

        assert!(parse_directives("vm create R1 1\n").is_err());
        assert!(parse_directives("vm set_ram R1\n").is_err());
    }
}
