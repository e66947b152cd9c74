//! Simulated appliance instance.
//!
//! An [`Instance`] owns everything bound to one simulated router: its
//! hardware parameters, object registry, device table, interrupt controller,
//! CPU group, lock and log. Lifecycle transitions live in
//! [`lifecycle`](crate::lifecycle); device and object management in their own
//! modules extend `Instance` with further `impl` blocks.

use std::any::Any;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::codec::ConfigCodec;
use crate::cpu::CpuGroup;
use crate::device::{AddressSpace, DeviceTable};
use crate::error::{Result, VmError};
use crate::irq::IrqController;
use crate::lock::InstanceLock;
use crate::log::InstanceLog;
use crate::monitor::{MonitorHandle, MonitorSnapshot, MonitorStats};
use crate::object::ObjectRegistry;
use crate::platform::{MachineType, TIMER_IRQ_CHECK_ITV};
use crate::settings::{FileNaming, SimSettings};

/// Number of entries in the secondary PCI bus pool.
pub const PCI_POOL_SIZE: usize = 32;

/// Instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VmStatus {
    /// Created or stopped. Topology may change.
    Halted = 0,
    /// CPUs executing.
    Running = 1,
    /// CPUs paused at a block boundary.
    Suspended = 2,
    /// Tearing down hardware.
    Shutdown = 3,
}

impl VmStatus {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Shutdown,
            _ => Self::Halted,
        }
    }
}

/// Status readable without taking the instance mutex.
///
/// The monitor and CPU-facing code poll this; only lifecycle transitions on
/// the owning instance write it.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub(crate) fn new(status: VmStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    /// Current status.
    #[must_use]
    pub fn get(&self) -> VmStatus {
        VmStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, status: VmStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Polls until the status equals `want` or `timeout` expires.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the status did not change in time.
    pub fn wait_for(&self, want: VmStatus, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.get() == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmError::Timeout(format!(
                    "status {:?} not reached (still {:?})",
                    want,
                    self.get()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Console line configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleLine {
    /// Line not connected.
    #[default]
    None,
    /// Attached to the controlling terminal.
    Terminal,
    /// Served on a TCP port.
    Tcp(u16),
}

/// Which serial line of the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolePort {
    /// Console port.
    Con,
    /// Auxiliary port.
    Aux,
}

/// Opaque handle to a console line owned by an external line driver.
pub type ConsoleHandle = Box<dyn Any + Send>;

/// Endpoint opened at start for a configured line that has no driver handle.
#[derive(Debug)]
pub enum LineEndpoint {
    /// Controlling terminal.
    Terminal,
    /// Non-blocking listener on the configured port.
    Tcp(TcpListener),
}

impl LineEndpoint {
    fn open(line: ConsoleLine) -> Result<Option<Self>> {
        match line {
            ConsoleLine::None => Ok(None),
            ConsoleLine::Terminal => Ok(Some(Self::Terminal)),
            ConsoleLine::Tcp(port) => {
                let listener = TcpListener::bind(("0.0.0.0", port))?;
                listener.set_nonblocking(true)?;
                Ok(Some(Self::Tcp(listener)))
            }
        }
    }
}

/// Reference to a PCI bus created by the PCI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciBusHandle {
    /// Bus name.
    pub name: String,
    /// Bus number.
    pub bus: u8,
}

/// One simulated appliance.
pub struct Instance {
    pub(crate) name: String,
    pub(crate) id: u32,
    pub(crate) machine: MachineType,
    pub(crate) settings: Arc<SimSettings>,
    pub(crate) status: StatusCell,

    // Sizing.
    pub(crate) ram_size: u32,
    pub(crate) rom_size: u32,
    pub(crate) nvram_size: u32,
    pub(crate) iomem_size: u32,
    pub(crate) pcmcia_disk_size: [u32; 2],

    // Boot parameters.
    pub(crate) conf_reg: u32,
    pub(crate) conf_reg_setup: u32,
    pub(crate) clock_divisor: u32,
    pub(crate) ram_mmap: bool,
    pub(crate) elf_machine_id: u32,
    pub(crate) restart_ios: bool,
    pub(crate) exec_area_size: u32,
    pub(crate) ios_entry_point: u64,
    pub(crate) idle_pc: u64,
    pub(crate) timer_irq_check_itv: u32,
    pub(crate) nvram_rom_space: u32,

    // Paths.
    pub(crate) lock_file: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) ios_image: Option<PathBuf>,
    pub(crate) ios_config: Option<PathBuf>,
    pub(crate) rom_image: Option<PathBuf>,
    pub(crate) sym_file: Option<PathBuf>,

    pub(crate) lock: Option<InstanceLock>,
    pub(crate) log: InstanceLog,

    pub(crate) objects: ObjectRegistry,
    pub(crate) devices: DeviceTable,
    pub(crate) address_space: Arc<RwLock<AddressSpace>>,
    pub(crate) irq: Arc<IrqController>,
    pub(crate) cpu_group: Option<Box<dyn CpuGroup>>,

    pub(crate) pci_bus: [Option<PciBusHandle>; 2],
    pub(crate) pci_bus_pool: Vec<Option<PciBusHandle>>,
    pub(crate) pci_io_space: Option<PciBusHandle>,

    pub(crate) con_line: ConsoleLine,
    pub(crate) aux_line: ConsoleLine,
    pub(crate) vtty_con: Option<ConsoleHandle>,
    pub(crate) vtty_aux: Option<ConsoleHandle>,

    pub(crate) codec: Box<dyn ConfigCodec>,
    pub(crate) monitor: Option<MonitorHandle>,
    pub(crate) monitor_stats: Arc<MonitorStats>,
    pub(crate) self_ref: Weak<Mutex<Instance>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("machine", &self.machine)
            .field("status", &self.status.get())
            .field("objects", &self.objects.len())
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Creates a halted instance with the machine's defaults and opens its
    /// log file (truncating any previous one).
    ///
    /// # Errors
    ///
    /// Returns `Io` if the log file cannot be created.
    pub fn new(
        name: impl Into<String>,
        id: u32,
        machine: MachineType,
        settings: Arc<SimSettings>,
    ) -> Result<Self> {
        let name = name.into();
        let defaults = machine.defaults();

        let lock_file = file_path(&settings, machine, &name, id, "lock");
        let log_file = file_path(&settings, machine, &name, id, "log.txt");
        let log = InstanceLog::new(&name, &log_file, settings.log_enabled);
        log.create()?;

        let vm = Self {
            name,
            id,
            machine,
            settings,
            status: StatusCell::new(VmStatus::Halted),
            ram_size: defaults.ram_size,
            rom_size: defaults.rom_size,
            nvram_size: defaults.nvram_size,
            iomem_size: defaults.iomem_size,
            pcmcia_disk_size: [0, 0],
            conf_reg: defaults.conf_reg,
            conf_reg_setup: defaults.conf_reg,
            clock_divisor: defaults.clock_divisor,
            ram_mmap: true,
            elf_machine_id: defaults.elf_machine_id,
            restart_ios: false,
            exec_area_size: 0,
            ios_entry_point: 0,
            idle_pc: 0,
            timer_irq_check_itv: TIMER_IRQ_CHECK_ITV,
            nvram_rom_space: defaults.nvram_rom_space,
            lock_file,
            log_file,
            ios_image: None,
            ios_config: None,
            rom_image: None,
            sym_file: None,
            lock: None,
            log,
            objects: ObjectRegistry::default(),
            devices: DeviceTable::default(),
            address_space: Arc::new(RwLock::new(AddressSpace::new(machine.phys_addr_limit()))),
            irq: Arc::new(IrqController::new()),
            cpu_group: None,
            pci_bus: [None, None],
            pci_bus_pool: vec![None; PCI_POOL_SIZE],
            pci_io_space: None,
            con_line: ConsoleLine::None,
            aux_line: ConsoleLine::None,
            vtty_con: None,
            vtty_aux: None,
            codec: machine.codec(),
            monitor: None,
            monitor_stats: Arc::new(MonitorStats::default()),
            self_ref: Weak::new(),
        };

        vm.log(
            "VM",
            &format!(
                "instance {} (id {}) created, machine {}",
                vm.name, vm.id, vm.machine
            ),
        );
        tracing::debug!("Created instance {} ({})", vm.name, vm.machine);
        Ok(vm)
    }

    /// Wraps the instance for sharing with its monitor task.
    ///
    /// Instances that are started from a shared handle can stop themselves
    /// when the monitor detects an unrecoverable health failure.
    #[must_use]
    pub fn into_shared(mut self) -> Arc<Mutex<Instance>> {
        Arc::new_cyclic(|weak| {
            self.self_ref = weak.clone();
            Mutex::new(self)
        })
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn machine(&self) -> MachineType {
        self.machine
    }

    #[must_use]
    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> VmStatus {
        self.status.get()
    }

    /// Status handle that can be polled without the instance mutex.
    #[must_use]
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Interrupt controller shared with devices and CPUs.
    #[must_use]
    pub fn irq(&self) -> Arc<IrqController> {
        Arc::clone(&self.irq)
    }

    /// Asserts an interrupt line.
    pub fn set_irq(&self, line: u32) -> Result<()> {
        self.irq.set_irq(line)
    }

    /// Deasserts an interrupt line.
    pub fn clear_irq(&self, line: u32) -> Result<()> {
        self.irq.clear_irq(line)
    }

    /// Counters published by the monitor task.
    #[must_use]
    pub fn monitor_stats(&self) -> MonitorSnapshot {
        self.monitor_stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Path of a per-instance file of the given kind.
    ///
    /// The name embeds the machine type and either the instance name or its
    /// id, so concurrently running instances sharing a working directory never
    /// collide.
    #[must_use]
    pub fn build_filename(&self, kind: &str) -> PathBuf {
        file_path(&self.settings, self.machine, &self.name, self.id, kind)
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_file
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_file
    }

    /// Acquires the instance lock file.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if a live process holds it, or
    /// `InvalidState` if this instance already holds it.
    pub fn get_lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Err(VmError::invalid_state(format!(
                "instance {} already holds its lock",
                self.name
            )));
        }
        let lock = InstanceLock::acquire(&self.lock_file)?;
        self.log("VM", &format!("lock acquired ({})", self.lock_file.display()));
        self.lock = Some(lock);
        Ok(())
    }

    /// Releases the instance lock. The file is deleted only if `erase`.
    ///
    /// Releasing a lock that is not held is a no-op.
    pub fn release_lock(&mut self, erase: bool) -> Result<()> {
        match self.lock.take() {
            Some(lock) => {
                lock.release(erase)?;
                self.log("VM", "lock released");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Returns true while the lock file is held.
    #[must_use]
    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    /// Appends a line to the instance log.
    pub fn log(&self, module: &str, message: &str) {
        self.log.log(module, message);
    }

    /// Reports an instance-level error on the error path and in the log.
    pub fn error(&self, message: &str) {
        self.log.error(message);
    }

    /// Handle to the instance log.
    #[must_use]
    pub fn instance_log(&self) -> InstanceLog {
        self.log.clone()
    }

    /// Recreates the log file, discarding previous contents.
    pub fn create_log(&self) -> Result<()> {
        self.log.create()
    }

    /// Reopens the log file for appending.
    pub fn reopen_log(&self) -> Result<()> {
        self.log.reopen()
    }

    pub fn close_log(&self) {
        self.log.close();
    }

    // ------------------------------------------------------------------
    // Hardware parameters
    // ------------------------------------------------------------------

    pub(crate) fn ensure_halted(&self, what: &str) -> Result<()> {
        let status = self.status();
        if status == VmStatus::Halted {
            Ok(())
        } else {
            Err(VmError::invalid_state(format!(
                "cannot {} while {:?}",
                what, status
            )))
        }
    }

    pub(crate) fn ensure_topology_mutable(&self, what: &str) -> Result<()> {
        match self.status() {
            VmStatus::Halted | VmStatus::Shutdown => Ok(()),
            status => Err(VmError::invalid_state(format!(
                "cannot {} while {:?}",
                what, status
            ))),
        }
    }

    #[must_use]
    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// Sets the RAM size in MiB.
    pub fn set_ram_size(&mut self, mb: u32) -> Result<()> {
        self.ensure_halted("set RAM size")?;
        self.ram_size = mb;
        Ok(())
    }

    #[must_use]
    pub fn rom_size(&self) -> u32 {
        self.rom_size
    }

    #[must_use]
    pub fn nvram_size(&self) -> u32 {
        self.nvram_size
    }

    /// Sets the NVRAM size in KiB.
    pub fn set_nvram_size(&mut self, kb: u32) -> Result<()> {
        self.ensure_halted("set NVRAM size")?;
        self.nvram_size = kb;
        Ok(())
    }

    #[must_use]
    pub fn iomem_size(&self) -> u32 {
        self.iomem_size
    }

    pub fn set_iomem_size(&mut self, mb: u32) -> Result<()> {
        self.ensure_halted("set I/O memory size")?;
        self.iomem_size = mb;
        Ok(())
    }

    #[must_use]
    pub fn disk_size(&self, index: usize) -> Option<u32> {
        self.pcmcia_disk_size.get(index).copied()
    }

    /// Sets the size in MiB of PCMCIA disk 0 or 1.
    pub fn set_disk_size(&mut self, index: usize, mb: u32) -> Result<()> {
        self.ensure_halted("set disk size")?;
        let slot = self
            .pcmcia_disk_size
            .get_mut(index)
            .ok_or_else(|| VmError::OutOfRange(format!("PCMCIA disk {}", index)))?;
        *slot = mb;
        Ok(())
    }

    /// Effective configuration register (loaded from the setup value at start).
    #[must_use]
    pub fn conf_reg(&self) -> u32 {
        self.conf_reg
    }

    #[must_use]
    pub fn conf_reg_setup(&self) -> u32 {
        self.conf_reg_setup
    }

    /// Sets the configuration register. A halted instance has no running
    /// value of its own, so the effective register follows the setup value.
    pub fn set_conf_reg(&mut self, value: u32) -> Result<()> {
        self.ensure_halted("set configuration register")?;
        self.conf_reg_setup = value;
        self.conf_reg = value;
        Ok(())
    }

    #[must_use]
    pub fn clock_divisor(&self) -> u32 {
        self.clock_divisor
    }

    pub fn set_clock_divisor(&mut self, divisor: u32) -> Result<()> {
        self.ensure_halted("set clock divisor")?;
        if divisor == 0 {
            return Err(VmError::OutOfRange("clock divisor 0".to_string()));
        }
        self.clock_divisor = divisor;
        Ok(())
    }

    #[must_use]
    pub fn ram_mmap(&self) -> bool {
        self.ram_mmap
    }

    pub fn set_ram_mmap(&mut self, enabled: bool) -> Result<()> {
        self.ensure_halted("set RAM mmap")?;
        self.ram_mmap = enabled;
        Ok(())
    }

    #[must_use]
    pub fn elf_machine_id(&self) -> u32 {
        self.elf_machine_id
    }

    #[must_use]
    pub fn restart_ios(&self) -> bool {
        self.restart_ios
    }

    pub fn set_restart_ios(&mut self, enabled: bool) {
        self.restart_ios = enabled;
    }

    #[must_use]
    pub fn exec_area_size(&self) -> u32 {
        self.exec_area_size
    }

    pub fn set_exec_area_size(&mut self, mb: u32) -> Result<()> {
        self.ensure_halted("set exec area size")?;
        self.exec_area_size = mb;
        Ok(())
    }

    #[must_use]
    pub fn ios_entry_point(&self) -> u64 {
        self.ios_entry_point
    }

    pub fn set_ios_entry_point(&mut self, addr: u64) {
        self.ios_entry_point = addr;
    }

    #[must_use]
    pub fn idle_pc(&self) -> u64 {
        self.idle_pc
    }

    /// Sets the idle PC handed to the CPU group at start.
    pub fn set_idle_pc(&mut self, pc: u64) {
        self.idle_pc = pc;
    }

    #[must_use]
    pub fn timer_irq_check_itv(&self) -> u32 {
        self.timer_irq_check_itv
    }

    /// Sets the number of executed ticks between timer interrupt checks.
    pub fn set_timer_irq_check_itv(&mut self, ticks: u32) -> Result<()> {
        self.ensure_halted("set timer check interval")?;
        if ticks == 0 {
            return Err(VmError::OutOfRange(
                "timer check interval must be > 0".to_string(),
            ));
        }
        self.timer_irq_check_itv = ticks;
        Ok(())
    }

    /// Bytes at the start of NVRAM reserved for the ROM monitor.
    #[must_use]
    pub fn nvram_rom_space(&self) -> u32 {
        self.nvram_rom_space
    }

    pub fn set_nvram_rom_space(&mut self, bytes: u32) -> Result<()> {
        self.ensure_halted("set NVRAM ROM space")?;
        self.nvram_rom_space = bytes;
        Ok(())
    }

    #[must_use]
    pub fn ios_image(&self) -> Option<&Path> {
        self.ios_image.as_deref()
    }

    #[must_use]
    pub fn ios_config(&self) -> Option<&Path> {
        self.ios_config.as_deref()
    }

    #[must_use]
    pub fn rom_image(&self) -> Option<&Path> {
        self.rom_image.as_deref()
    }

    pub fn set_rom_image(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_halted("set ROM image")?;
        self.rom_image = Some(path.into());
        Ok(())
    }

    #[must_use]
    pub fn symbol_file(&self) -> Option<&Path> {
        self.sym_file.as_deref()
    }

    pub fn set_symbol_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_halted("set symbol file")?;
        self.sym_file = Some(path.into());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collaborator handles
    // ------------------------------------------------------------------

    /// Installs the CPU execution group.
    pub fn set_cpu_group(&mut self, group: Box<dyn CpuGroup>) -> Result<()> {
        self.ensure_halted("replace CPU group")?;
        self.cpu_group = Some(group);
        Ok(())
    }

    #[must_use]
    pub fn cpu_group(&self) -> Option<&dyn CpuGroup> {
        self.cpu_group.as_deref()
    }

    /// Idle-loop tracking value published by the boot CPU.
    #[must_use]
    pub fn boot_cpu_pc(&self) -> Option<u64> {
        self.cpu_group.as_ref().map(|g| g.boot_pc())
    }

    #[must_use]
    pub fn pci_bus(&self, index: usize) -> Option<&PciBusHandle> {
        self.pci_bus.get(index).and_then(Option::as_ref)
    }

    /// Sets primary PCI bus 0 or 1.
    pub fn set_pci_bus(&mut self, index: usize, bus: PciBusHandle) -> Result<()> {
        self.ensure_topology_mutable("set PCI bus")?;
        let slot = self
            .pci_bus
            .get_mut(index)
            .ok_or_else(|| VmError::OutOfRange(format!("primary PCI bus {}", index)))?;
        *slot = Some(bus);
        Ok(())
    }

    /// Adds a bus to the secondary pool and returns its pool index.
    pub fn add_pool_bus(&mut self, bus: PciBusHandle) -> Result<usize> {
        self.ensure_topology_mutable("add PCI bus")?;
        let index = self
            .pci_bus_pool
            .iter()
            .position(Option::is_none)
            .ok_or(VmError::SlotExhausted(PCI_POOL_SIZE))?;
        self.pci_bus_pool[index] = Some(bus);
        Ok(index)
    }

    #[must_use]
    pub fn pool_bus(&self, index: usize) -> Option<&PciBusHandle> {
        self.pci_bus_pool.get(index).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn pci_io_space(&self) -> Option<&PciBusHandle> {
        self.pci_io_space.as_ref()
    }

    pub fn set_pci_io_space(&mut self, space: PciBusHandle) -> Result<()> {
        self.ensure_topology_mutable("set PCI I/O space")?;
        self.pci_io_space = Some(space);
        Ok(())
    }

    #[must_use]
    pub fn line(&self, port: ConsolePort) -> ConsoleLine {
        match port {
            ConsolePort::Con => self.con_line,
            ConsolePort::Aux => self.aux_line,
        }
    }

    /// Configures a console line.
    pub fn set_line(&mut self, port: ConsolePort, line: ConsoleLine) -> Result<()> {
        self.ensure_halted("configure console line")?;
        match port {
            ConsolePort::Con => self.con_line = line,
            ConsolePort::Aux => self.aux_line = line,
        }
        Ok(())
    }

    /// Stores the handle of a line created by the line driver.
    pub fn attach_line_handle(&mut self, port: ConsolePort, handle: ConsoleHandle) {
        match port {
            ConsolePort::Con => self.vtty_con = Some(handle),
            ConsolePort::Aux => self.vtty_aux = Some(handle),
        }
    }

    #[must_use]
    pub fn has_line_handle(&self, port: ConsolePort) -> bool {
        match port {
            ConsolePort::Con => self.vtty_con.is_some(),
            ConsolePort::Aux => self.vtty_aux.is_some(),
        }
    }

    /// Line handle, if one is attached.
    #[must_use]
    pub fn line_handle(&self, port: ConsolePort) -> Option<&ConsoleHandle> {
        match port {
            ConsolePort::Con => self.vtty_con.as_ref(),
            ConsolePort::Aux => self.vtty_aux.as_ref(),
        }
    }

    /// Opens an endpoint for every configured line that has no handle yet.
    /// Handles attached by a line driver are left alone.
    pub fn init_lines(&mut self) -> Result<()> {
        for port in [ConsolePort::Con, ConsolePort::Aux] {
            if self.has_line_handle(port) {
                continue;
            }
            let line = self.line(port);
            if let Some(endpoint) = LineEndpoint::open(line)? {
                tracing::debug!("{}: opened {:?} line {:?}", self.name, port, line);
                self.attach_line_handle(port, Box::new(endpoint));
            }
        }
        Ok(())
    }

    /// Drops both line handles, closing any listener.
    pub fn delete_lines(&mut self) {
        let con = self.vtty_con.take();
        let aux = self.vtty_aux.take();
        if con.is_some() || aux.is_some() {
            tracing::debug!("{}: console lines closed", self.name);
        }
    }

    /// Name of the configuration codec bound to this machine.
    #[must_use]
    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }
}

fn file_path(
    settings: &SimSettings,
    machine: MachineType,
    name: &str,
    id: u32,
    kind: &str,
) -> PathBuf {
    let file = match settings.file_naming {
        FileNaming::Name => format!("{}_{}_{}", machine.as_str(), name, kind),
        FileNaming::InstanceId => format!("{}_i{}_{}", machine.as_str(), id, kind),
    };
    settings.working_dir.join(file)
}
