//! Object registry.
//!
//! Every hardware resource bound to an instance (memory regions, busses,
//! device glue) is recorded as a named [`VmObject`] carrying its own teardown
//! hook. A full instance shutdown runs each hook exactly once, newest first.

use std::any::{type_name, Any};
use std::fmt;

use crate::error::{Result, VmError};
use crate::instance::Instance;

/// Teardown callback receiving the instance and the object's payload.
pub type ShutdownHook = Box<dyn FnOnce(&mut Instance, Box<dyn Any + Send>) + Send>;

/// Named hardware resource owned by an instance.
pub struct VmObject {
    name: String,
    tag: &'static str,
    payload: Box<dyn Any + Send>,
    shutdown: Option<ShutdownHook>,
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("has_shutdown", &self.shutdown.is_some())
            .finish()
    }
}

impl VmObject {
    /// Creates an object without a teardown hook.
    pub fn new<T: Any + Send>(name: impl Into<String>, payload: T) -> Self {
        Self {
            name: name.into(),
            tag: type_name::<T>(),
            payload: Box::new(payload),
            shutdown: None,
        }
    }

    /// Creates an object whose hook receives the typed payload back.
    pub fn with_shutdown<T, F>(name: impl Into<String>, payload: T, hook: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(&mut Instance, T) + Send + 'static,
    {
        let name = name.into();
        let hook_name = name.clone();
        let erased: ShutdownHook = Box::new(move |vm, payload| match payload.downcast::<T>() {
            Ok(payload) => hook(vm, *payload),
            Err(_) => tracing::error!(
                "object {}: payload is not a {}, teardown skipped",
                hook_name,
                type_name::<T>()
            ),
        });
        Self {
            name,
            tag: type_name::<T>(),
            payload: Box::new(payload),
            shutdown: Some(erased),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the payload.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Borrows the payload if it is a `T`.
    #[must_use]
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Runs the teardown hook, consuming the object.
    pub fn shutdown(self, vm: &mut Instance) {
        tracing::debug!("Shutting down object {} ({})", self.name, self.tag);
        if let Some(hook) = self.shutdown {
            hook(vm, self.payload);
        }
    }
}

/// Name and payload type of a registered object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub name: String,
    pub tag: &'static str,
}

/// Objects of one instance, in registration order.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Vec<VmObject>,
}

impl ObjectRegistry {
    /// Number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.objects.iter().position(|o| o.name == name)
    }

    fn add(&mut self, obj: VmObject) -> Result<()> {
        if self.position(&obj.name).is_some() {
            return Err(VmError::DuplicateName(format!("object {}", obj.name)));
        }
        self.objects.push(obj);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<VmObject> {
        let index = self
            .position(name)
            .ok_or_else(|| VmError::not_found(format!("object {}", name)))?;
        Ok(self.objects.remove(index))
    }

    fn find(&self, name: &str) -> Option<&VmObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    fn summaries(&self) -> Vec<ObjectSummary> {
        self.objects
            .iter()
            .map(|o| ObjectSummary {
                name: o.name.clone(),
                tag: o.tag,
            })
            .collect()
    }

    fn take_all(&mut self) -> Vec<VmObject> {
        std::mem::take(&mut self.objects)
    }
}

impl Instance {
    /// Registers an object.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if an object with the same name exists, or
    /// `InvalidState` unless the instance is halted.
    pub fn add_object(&mut self, obj: VmObject) -> Result<()> {
        self.ensure_topology_mutable("add object")?;
        tracing::debug!("{}: adding object {} ({})", self.name, obj.name, obj.tag);
        self.objects.add(obj)
    }

    /// Unlinks an object without running its teardown hook.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no object has that name.
    pub fn remove_object(&mut self, name: &str) -> Result<VmObject> {
        self.ensure_topology_mutable("remove object")?;
        self.objects.remove(name)
    }

    /// Looks up an object by name.
    #[must_use]
    pub fn find_object(&self, name: &str) -> Option<&VmObject> {
        self.objects.find(name)
    }

    /// Asserts that a mandatory object is attached.
    ///
    /// # Errors
    ///
    /// Returns `MissingObject` if it is not.
    pub fn check_object(&self, name: &str) -> Result<()> {
        match self.objects.find(name) {
            Some(_) => Ok(()),
            None => {
                self.error(&format!("required object {} is missing", name));
                Err(VmError::MissingObject(name.to_string()))
            }
        }
    }

    /// Lists registered objects and records them in the instance log.
    pub fn dump_objects(&self) -> Vec<ObjectSummary> {
        let summaries = self.objects.summaries();
        for s in &summaries {
            self.log("OBJ", &format!("  - {:<20} ({})", s.name, s.tag));
        }
        summaries
    }

    /// Runs every teardown hook once, newest first, and empties the registry.
    pub(crate) fn shutdown_objects(&mut self) {
        let objects = self.objects.take_all();
        if !objects.is_empty() {
            tracing::debug!("{}: shutting down {} objects", self.name, objects.len());
        }
        for obj in objects.into_iter().rev() {
            obj.shutdown(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MachineType;
    use crate::settings::SimSettings;
    use std::sync::{Arc, Mutex};

    fn instance(dir: &std::path::Path) -> Instance {
        Instance::new(
            "R1",
            1,
            MachineType::C7200,
            Arc::new(SimSettings::in_dir(dir)),
        )
        .unwrap()
    }

    #[test]
    fn test_add_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path());

        vm.add_object(VmObject::new("ram", 256u32)).unwrap();
        let obj = vm.find_object("ram").unwrap();
        assert_eq!(obj.payload::<u32>(), Some(&256));
        assert_eq!(obj.tag(), "u32");

        let removed = vm.remove_object("ram").unwrap();
        assert_eq!(removed.name(), "ram");
        assert!(vm.find_object("ram").is_none());
        assert!(matches!(
            vm.remove_object("ram"),
            Err(VmError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path());

        vm.add_object(VmObject::new("nvram", ())).unwrap();
        let err = vm.add_object(VmObject::new("nvram", 1u8)).unwrap_err();
        assert!(matches!(err, VmError::DuplicateName(_)));
        assert_eq!(vm.find_object("nvram").unwrap().tag(), "()");
    }

    #[test]
    fn test_check_missing() {
        let dir = tempfile::tempdir().unwrap();
        let vm = instance(dir.path());
        assert!(matches!(
            vm.check_object("nvram"),
            Err(VmError::MissingObject(_))
        ));
    }

    #[test]
    fn test_remove_does_not_run_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path());
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        vm.add_object(VmObject::with_shutdown("bus", (), move |_, ()| {
            *flag.lock().unwrap() = true;
        }))
        .unwrap();

        let obj = vm.remove_object("bus").unwrap();
        assert!(!*ran.lock().unwrap());

        obj.shutdown(&mut vm);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_shutdown_reverse_order_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["pci0", "pci1", "nvram"] {
            let order = Arc::clone(&order);
            vm.add_object(VmObject::with_shutdown(name, name, move |_, n: &str| {
                order.lock().unwrap().push(n);
            }))
            .unwrap();
        }
        assert_eq!(vm.dump_objects().len(), 3);

        vm.shutdown_objects();
        vm.shutdown_objects();

        assert_eq!(*order.lock().unwrap(), vec!["nvram", "pci1", "pci0"]);
        assert!(vm.dump_objects().is_empty());
    }
}
