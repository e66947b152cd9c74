//! Device binding and physical address-space mapping.
//!
//! Devices occupy one of [`DEVICE_MAX`] slots of their instance and may be
//! mapped at a base address. Mapped ranges are kept in an ordered map keyed
//! by base so the CPU dispatch path finds the owning device with a single
//! bounded lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Result, VmError};
use crate::instance::Instance;
use crate::object::VmObject;

/// Number of device slots per instance.
pub const DEVICE_MAX: usize = 64;

/// A memory-mapped peripheral.
pub trait Device: Send {
    /// Unique name within the instance.
    fn name(&self) -> &str;

    /// Size of the MMIO window in bytes.
    fn size(&self) -> u64;

    /// Handles a read at `offset` of `size` bytes.
    fn mmio_read(&mut self, offset: u64, size: usize) -> u64;

    /// Handles a write at `offset` of `size` bytes.
    fn mmio_write(&mut self, offset: u64, size: usize, value: u64);

    /// Backing bytes for devices that expose them directly (RAM, NVRAM).
    fn raw_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// Mutable backing bytes.
    fn raw_bytes_mut(&mut self) -> Option<&mut [u8]> {
        None
    }

    /// Flushes device state to persistent storage, if any.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a bound device.
pub type DeviceRef = Arc<Mutex<dyn Device>>;

/// Wraps a device into a shareable handle.
pub fn device_ref<D: Device + 'static>(device: D) -> DeviceRef {
    Arc::new(Mutex::new(device))
}

/// Slot index of a bound device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

impl DeviceId {
    /// Returns the raw slot index.
    #[must_use]
    pub const fn raw(&self) -> usize {
        self.0
    }
}

struct BoundDevice {
    name: String,
    device: DeviceRef,
    base: Option<u64>,
}

/// Fixed-capacity device slots plus a name index.
pub struct DeviceTable {
    slots: Vec<Option<BoundDevice>>,
    by_name: HashMap<String, DeviceId>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self {
            slots: (0..DEVICE_MAX).map(|_| None).collect(),
            by_name: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.by_name.iter().map(|(k, v)| (k, v.0)))
            .finish()
    }
}

impl DeviceTable {
    /// Number of bound devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn bind(&mut self, device: DeviceRef) -> Result<DeviceId> {
        let name = lock_device(&device).name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(VmError::DuplicateName(format!("device {}", name)));
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(VmError::SlotExhausted(DEVICE_MAX))?;
        self.slots[index] = Some(BoundDevice {
            name: name.clone(),
            device,
            base: None,
        });
        self.by_name.insert(name, DeviceId(index));
        Ok(DeviceId(index))
    }

    fn get(&self, id: DeviceId) -> Option<&BoundDevice> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: DeviceId) -> Option<&mut BoundDevice> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn unbind(&mut self, id: DeviceId) -> Option<BoundDevice> {
        let bound = self.slots.get_mut(id.0).and_then(Option::take)?;
        self.by_name.remove(&bound.name);
        Some(bound)
    }

    fn ids(&self) -> Vec<DeviceId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| DeviceId(i))
            .collect()
    }
}

/// One mapped range.
#[derive(Clone)]
pub struct Mapping {
    /// First byte of the range.
    pub base: u64,
    /// Exclusive end of the range.
    pub end: u64,
    /// Slot of the device.
    pub id: DeviceId,
    /// Device name.
    pub name: String,
    device: DeviceRef,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &format_args!("{:#x}", self.base))
            .field("end", &format_args!("{:#x}", self.end))
            .field("name", &self.name)
            .finish()
    }
}

/// Physical address space of an instance.
#[derive(Debug)]
pub struct AddressSpace {
    limit: u64,
    ranges: BTreeMap<u64, Mapping>,
}

impl AddressSpace {
    /// Creates an empty space covering `[0, limit)`.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            ranges: BTreeMap::new(),
        }
    }

    /// Exclusive upper bound of addressable memory.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Finds the mapping containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<&Mapping> {
        self.ranges
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| addr < m.end)
    }

    /// Mapped ranges in address order.
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.ranges.values()
    }

    fn insert(&mut self, mapping: Mapping) -> Result<()> {
        let (base, end) = (mapping.base, mapping.end);
        if end > self.limit {
            return Err(VmError::OutOfRange(format!(
                "[{:#x}, {:#x}) exceeds physical space limit {:#x}",
                base, end, self.limit
            )));
        }
        // Ranges never overlap, so only the last range starting below `end`
        // can intersect the new one.
        if let Some((_, other)) = self.ranges.range(..end).next_back() {
            if other.end > base {
                return Err(VmError::AddressConflict {
                    base,
                    end,
                    other: other.name.clone(),
                });
            }
        }
        self.ranges.insert(base, mapping);
        Ok(())
    }

    fn remove(&mut self, base: u64) -> Option<Mapping> {
        self.ranges.remove(&base)
    }
}

/// MMIO dispatch handle handed to the CPU group.
#[derive(Clone)]
pub struct MmioBus {
    space: Arc<RwLock<AddressSpace>>,
}

impl std::fmt::Debug for MmioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioBus").finish_non_exhaustive()
    }
}

impl MmioBus {
    pub(crate) fn new(space: Arc<RwLock<AddressSpace>>) -> Self {
        Self { space }
    }

    fn target(&self, addr: u64) -> Option<(u64, DeviceRef)> {
        let space = self.space.read().unwrap_or_else(|e| e.into_inner());
        space
            .lookup(addr)
            .map(|m| (addr - m.base, Arc::clone(&m.device)))
    }

    /// Reads from the device mapped at `addr`. Unmapped addresses read 0.
    pub fn read(&self, addr: u64, size: usize) -> u64 {
        match self.target(addr) {
            Some((offset, dev)) => lock_device(&dev).mmio_read(offset, size),
            None => {
                tracing::trace!("MMIO read from unmapped {:#x} (size {})", addr, size);
                0
            }
        }
    }

    /// Writes to the device mapped at `addr`. Unmapped writes are dropped.
    pub fn write(&self, addr: u64, size: usize, value: u64) {
        match self.target(addr) {
            Some((offset, dev)) => lock_device(&dev).mmio_write(offset, size, value),
            None => {
                tracing::trace!(
                    "MMIO write to unmapped {:#x} (size {}, value {:#x})",
                    addr,
                    size,
                    value
                );
            }
        }
    }

    /// Name of the device mapped at `addr`.
    #[must_use]
    pub fn device_at(&self, addr: u64) -> Option<String> {
        let space = self.space.read().unwrap_or_else(|e| e.into_inner());
        space.lookup(addr).map(|m| m.name.clone())
    }
}

pub(crate) fn lock_device(dev: &DeviceRef) -> std::sync::MutexGuard<'_, dyn Device + 'static> {
    dev.lock().unwrap_or_else(|e| e.into_inner())
}

impl Instance {
    /// Binds a device to the first free slot.
    ///
    /// # Errors
    ///
    /// Returns `SlotExhausted` when every slot is taken, `DuplicateName` if a
    /// device with the same name is bound, or `InvalidState` unless halted.
    pub fn bind_device(&mut self, device: DeviceRef) -> Result<DeviceId> {
        self.ensure_topology_mutable("bind device")?;
        let id = self.devices.bind(device)?;
        tracing::debug!("{}: bound device in slot {}", self.name, id.0);
        Ok(id)
    }

    /// Unbinds a device, removing its mapping if present.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the slot is empty.
    pub fn unbind_device(&mut self, id: DeviceId) -> Result<DeviceRef> {
        self.ensure_topology_mutable("unbind device")?;
        let bound = self
            .devices
            .unbind(id)
            .ok_or_else(|| VmError::not_found(format!("device slot {}", id.0)))?;
        if let Some(base) = bound.base {
            self.address_space
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(base);
        }
        tracing::debug!("{}: unbound device {}", self.name, bound.name);
        Ok(bound.device)
    }

    /// Maps a bound device at `base`. A device that is already mapped moves.
    ///
    /// # Errors
    ///
    /// Returns `AddressConflict` if the range overlaps another device,
    /// `OutOfRange` if it is empty or leaves the physical address space, or
    /// `InvalidState` unless the instance is halted.
    pub fn map_device(&mut self, id: DeviceId, base: u64) -> Result<()> {
        self.ensure_halted("map device")?;
        let bound = self
            .devices
            .get(id)
            .ok_or_else(|| VmError::not_found(format!("device slot {}", id.0)))?;
        let size = lock_device(&bound.device).size();
        if size == 0 {
            return Err(VmError::OutOfRange(format!(
                "device {} has zero size",
                bound.name
            )));
        }
        let end = base.checked_add(size).ok_or_else(|| {
            VmError::OutOfRange(format!("{:#x} + {:#x} overflows", base, size))
        })?;

        let mapping = Mapping {
            base,
            end,
            id,
            name: bound.name.clone(),
            device: Arc::clone(&bound.device),
        };
        let previous = bound.base;

        {
            let mut space = self.address_space.write().unwrap_or_else(|e| e.into_inner());
            let old = previous.and_then(|b| space.remove(b));
            if let Err(e) = space.insert(mapping) {
                if let Some(old) = old {
                    space.ranges.insert(old.base, old);
                }
                return Err(e);
            }
        }

        if let Some(b) = self.devices.get_mut(id) {
            b.base = Some(base);
        }
        if let Some(group) = self.cpu_group.as_ref() {
            if let Some(old) = previous {
                group.invalidate(old, size);
            }
            group.invalidate(base, size);
        }
        tracing::debug!(
            "{}: mapped device slot {} at [{:#x}, {:#x})",
            self.name,
            id.0,
            base,
            end
        );
        Ok(())
    }

    /// Binds and maps a device and registers an object that unbinds it on
    /// teardown. The object is named after the device.
    pub fn attach_device(&mut self, device: DeviceRef, base: u64) -> Result<DeviceId> {
        let id = self.bind_device(Arc::clone(&device))?;
        let name = lock_device(&device).name().to_string();

        if let Err(e) = self.map_device(id, base) {
            self.rollback_bind(id);
            return Err(e);
        }

        let obj = VmObject::with_shutdown(name, device, move |vm, device: DeviceRef| {
            if let Err(e) = lock_device(&device).sync() {
                vm.error(&format!("device sync failed: {}", e));
            }
            if let Err(e) = vm.unbind_device(id) {
                tracing::debug!("{}: device slot {} already unbound: {}", vm.name, id.0, e);
            }
        });
        if let Err(e) = self.add_object(obj) {
            self.rollback_bind(id);
            return Err(e);
        }
        Ok(id)
    }

    fn rollback_bind(&mut self, id: DeviceId) {
        if let Err(e) = self.unbind_device(id) {
            tracing::warn!("{}: failed to roll back device slot {}: {}", self.name, id.0, e);
        }
    }

    /// Looks up a bound device by name.
    #[must_use]
    pub fn find_device(&self, name: &str) -> Option<DeviceRef> {
        let id = self.devices.by_name.get(name)?;
        self.devices.get(*id).map(|b| Arc::clone(&b.device))
    }

    /// Slot of a bound device.
    #[must_use]
    pub fn device_id(&self, name: &str) -> Option<DeviceId> {
        self.devices.by_name.get(name).copied()
    }

    /// Base address of a mapped device.
    #[must_use]
    pub fn device_base(&self, id: DeviceId) -> Option<u64> {
        self.devices.get(id).and_then(|b| b.base)
    }

    /// Number of bound devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Dispatch handle over this instance's address space.
    #[must_use]
    pub fn mmio_bus(&self) -> MmioBus {
        MmioBus::new(Arc::clone(&self.address_space))
    }

    /// Unbinds every device still present after object teardown.
    pub(crate) fn unbind_all_devices(&mut self) {
        for id in self.devices.ids() {
            if let Err(e) = self.unbind_device(id) {
                tracing::warn!("{}: failed to unbind slot {}: {}", self.name, id.0, e);
            }
        }
    }
}
