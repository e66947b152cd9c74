//! Process-wide instance registry.
//!
//! Instances are registered by name with a reference count. `create` hands
//! out the first reference; every `acquire` must be matched by a `release`.
//! The release that brings the count to zero tears the instance down and
//! removes it.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, VmError};
use crate::instance::{Instance, StatusCell, VmStatus};
use crate::persist::{self, Directive};
use crate::platform::MachineType;
use crate::settings::SimSettings;

/// Reference to a registered instance.
///
/// Cloning a handle does not take a reference; only [`Registry::create`] and
/// [`Registry::acquire`] do.
#[derive(Clone)]
pub struct VmHandle {
    name: String,
    instance: Arc<Mutex<Instance>>,
    status: StatusCell,
}

impl VmHandle {
    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status, read without locking the instance.
    #[must_use]
    pub fn status(&self) -> VmStatus {
        self.status.get()
    }

    /// Locks the instance.
    ///
    /// Do not hold the guard across a call to [`Registry::release`] for the
    /// same instance.
    pub fn lock(&self) -> MutexGuard<'_, Instance> {
        self.instance.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shared instance, as needed by code that outlives the handle.
    #[must_use]
    pub fn shared(&self) -> Arc<Mutex<Instance>> {
        Arc::clone(&self.instance)
    }

    /// Blocks until the instance is halted again.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> Result<()> {
        self.status.wait_for(VmStatus::Halted, timeout)
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("name", &self.name)
            .field("status", &self.status.get())
            .finish()
    }
}

struct Entry {
    instance: Arc<Mutex<Instance>>,
    status: StatusCell,
    refcount: usize,
}

impl Entry {
    fn handle(&self, name: &str) -> VmHandle {
        VmHandle {
            name: name.to_string(),
            instance: Arc::clone(&self.instance),
            status: self.status.clone(),
        }
    }
}

/// Registry of live instances.
pub struct Registry {
    settings: Arc<SimSettings>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    /// Creates an empty registry. Every instance shares `settings`.
    #[must_use]
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Process settings.
    #[must_use]
    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates and registers a halted instance with reference count 1.
    ///
    /// # Errors
    ///
    /// `UnsupportedMachine` for an unknown machine type, `DuplicateName` if
    /// the name is taken, or `Io` if the instance log cannot be created.
    pub fn create(&self, name: &str, id: u32, machine: &str) -> Result<VmHandle> {
        let machine: MachineType = machine.parse()?;

        let mut entries = self.entries();
        if entries.contains_key(name) {
            return Err(VmError::DuplicateName(name.to_string()));
        }

        let vm = Instance::new(name, id, machine, Arc::clone(&self.settings))?;
        let entry = Entry {
            status: vm.status_cell(),
            instance: vm.into_shared(),
            refcount: 1,
        };
        let handle = entry.handle(name);
        entries.insert(name.to_string(), entry);

        tracing::info!("Registered instance {} (id {}, {})", name, id, machine);
        Ok(handle)
    }

    /// Takes another reference to `name`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such instance is registered.
    pub fn acquire(&self, name: &str) -> Result<VmHandle> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| VmError::not_found(format!("instance {}", name)))?;
        entry.refcount += 1;
        Ok(entry.handle(name))
    }

    /// Drops a reference. The last one stops the instance if needed, runs
    /// hardware teardown, erases the lock file, closes the log and removes
    /// the entry.
    ///
    /// # Errors
    ///
    /// `FatalInvariantViolation` if the handle's instance is no longer
    /// registered.
    pub fn release(&self, handle: VmHandle) -> Result<()> {
        let mut entries = self.entries();

        let registered = entries
            .get(&handle.name)
            .is_some_and(|e| Arc::ptr_eq(&e.instance, &handle.instance) && e.refcount > 0);
        if !registered {
            tracing::error!(
                "Release of instance {} with no outstanding reference",
                handle.name
            );
            return Err(VmError::FatalInvariantViolation(format!(
                "instance {} released more times than acquired",
                handle.name
            )));
        }

        let Some(entry) = entries.get_mut(&handle.name) else {
            return Err(VmError::not_found(format!("instance {}", handle.name)));
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            tracing::trace!("Instance {} refcount {}", handle.name, entry.refcount);
            return Ok(());
        }

        let entry = entries.remove(&handle.name);
        // Stopping can block for the stop timeout; other names stay usable.
        drop(entries);
        if let Some(entry) = entry {
            free_instance(&entry.instance);
        }
        Ok(())
    }

    /// Current reference count of `name`.
    #[must_use]
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.entries().get(name).map(|e| e.refcount)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Stops and frees every instance regardless of its reference count.
    pub fn shutdown_all(&self) {
        let drained: Vec<(String, Entry)> = self.entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} instance(s)", drained.len());
        for (_, entry) in drained {
            free_instance(&entry.instance);
        }
    }

    /// Writes the saved configuration of every instance, in name order.
    pub fn save_all<W: Write>(&self, out: &mut W) -> Result<()> {
        let instances: Vec<Arc<Mutex<Instance>>> = {
            let entries = self.entries();
            let mut names: Vec<&String> = entries.keys().collect();
            names.sort();
            names
                .into_iter()
                .filter_map(|n| entries.get(n).map(|e| Arc::clone(&e.instance)))
                .collect()
        };
        for instance in instances {
            let vm = instance.lock().unwrap_or_else(|e| e.into_inner());
            persist::save_config(&vm, out)?;
        }
        Ok(())
    }

    /// Recreates instances from saved directives.
    ///
    /// Returns one handle per `vm create`. If any directive fails, the
    /// instances created so far are released and the error is returned.
    pub fn replay(&self, text: &str) -> Result<Vec<VmHandle>> {
        let directives = persist::parse_directives(text)?;
        let mut created: Vec<VmHandle> = Vec::new();

        for directive in directives {
            if let Err(e) = self.apply_directive(&directive, &mut created) {
                for handle in created {
                    if let Err(err) = self.release(handle) {
                        tracing::error!("Failed to roll back replay: {}", err);
                    }
                }
                return Err(e);
            }
        }

        tracing::info!("Replayed {} instance(s)", created.len());
        Ok(created)
    }

    fn apply_directive(&self, directive: &Directive, created: &mut Vec<VmHandle>) -> Result<()> {
        match directive {
            Directive::Create { name, id, machine } => {
                created.push(self.create(name, *id, machine)?);
            }
            Directive::Set { name, param } => {
                let instance = match created.iter().find(|h| h.name == *name) {
                    Some(h) => h.shared(),
                    None => self
                        .entries()
                        .get(name)
                        .map(|e| Arc::clone(&e.instance))
                        .ok_or_else(|| VmError::not_found(format!("instance {}", name)))?,
                };
                let mut vm = instance.lock().unwrap_or_else(|e| e.into_inner());
                param.apply(&mut vm)?;
            }
        }
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn free_instance(instance: &Arc<Mutex<Instance>>) {
    let mut vm = instance.lock().unwrap_or_else(|e| e.into_inner());
    let name = vm.name().to_string();
    vm.log("VM", "freeing instance");

    match vm.status() {
        VmStatus::Running | VmStatus::Suspended => {
            if let Err(e) = vm.stop() {
                tracing::warn!("{}: stop during release failed: {}", name, e);
                vm.shutdown_hardware();
            }
        }
        VmStatus::Halted | VmStatus::Shutdown => vm.shutdown_hardware(),
    }

    if let Err(e) = vm.release_lock(true) {
        tracing::warn!("{}: failed to release lock: {}", name, e);
    }
    vm.log.close();
    tracing::info!("Instance {} freed", name);
}
