//! # routersim-vm
//!
//! Instance lifecycle and hardware-binding core of the router simulator.
//!
//! This crate owns everything between "a named router exists" and "its CPUs
//! are executing":
//!
//! - [`Registry`]: Named, reference-counted instances
//! - [`Instance`]: Hardware parameters, objects, devices and lifecycle
//! - [`IrqController`]: Interrupt lines shared by devices and CPUs
//! - [`CpuGroup`]: Contract with the CPU emulator, plus [`ThreadedCpuGroup`]
//! - [`ConfigCodec`]: Startup configuration stored in NVRAM
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Registry                        │
//! │            name ──▶ Arc<Mutex<Instance>>             │
//! └──────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                      Instance                        │
//! │  ┌──────────┐ ┌──────────────┐ ┌──────────────────┐  │
//! │  │ Objects  │ │ DeviceTable  │ │   AddressSpace   │  │
//! │  └──────────┘ └──────────────┘ └──────────────────┘  │
//! │  ┌──────────┐ ┌──────────────┐ ┌──────────────────┐  │
//! │  │Lock / Log│ │ IrqController│ │  Monitor thread  │  │
//! │  └──────────┘ └──────────────┘ └──────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//!          │                 ▲                  │
//!          ▼                 │ deliverable()    ▼
//!   ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//!   │ ConfigCodec │   │   CpuGroup   │   │   MmioBus   │
//!   │   (NVRAM)   │   │ (CPU threads)│──▶│  (devices)  │
//!   └─────────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use routersim_vm::{device_ref, MemoryDevice, Registry, SimSettings, ThreadedCpuGroup};
//!
//! let registry = Registry::new(SimSettings::in_dir("/var/lib/routersim"));
//! let r1 = registry.create("R1", 1, "c7200")?;
//! {
//!     let mut vm = r1.lock();
//!     vm.attach_device(device_ref(MemoryDevice::new("nvram", 128 * 1024)), 0x1E00_0000)?;
//!     vm.set_cpu_group(Box::new(ThreadedCpuGroup::new(cores)))?;
//!     vm.start()?;
//! }
//! // ...
//! r1.lock().stop()?;
//! registry.release(r1)?;
//! ```

pub mod codec;
pub mod cpu;
pub mod device;
pub mod devices;
pub mod error;
pub mod instance;
pub mod interchange;
pub mod irq;
pub mod lifecycle;
pub mod lock;
pub mod log;
pub mod monitor;
pub mod object;
pub mod persist;
pub mod platform;
pub mod registry;
pub mod settings;

pub use codec::{C3600Codec, C7200Codec, ConfigCodec};
pub use cpu::{BlockExit, CpuContext, CpuCore, CpuGroup, StopOutcome, ThreadedCpuGroup};
pub use device::{device_ref, AddressSpace, Device, DeviceId, DeviceRef, MmioBus, DEVICE_MAX};
pub use devices::MemoryDevice;
pub use error::{Result, VmError};
pub use instance::{
    ConsoleLine, ConsolePort, Instance, LineEndpoint, PciBusHandle, StatusCell, VmStatus,
};
pub use irq::IrqController;
pub use lock::InstanceLock;
pub use log::InstanceLog;
pub use monitor::MonitorSnapshot;
pub use object::{ObjectSummary, VmObject};
pub use persist::{Directive, Param};
pub use platform::{MachineType, NVRAM_OBJECT, TIMER_IRQ};
pub use registry::{Registry, VmHandle};
pub use settings::{FileNaming, SimSettings};
