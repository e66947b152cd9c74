//! Instance lifecycle state machine.
//!
//! ```text
//!            start()              suspend()
//!  HALTED ───────────▶ RUNNING ───────────▶ SUSPENDED
//!    ▲                  │   ▲                  │
//!    │                  │   └──── resume() ────┘
//!    │    stop()        ▼                      │
//!    └──────────── SHUTDOWN ◀──── stop() ──────┘
//! ```
//!
//! A failed transition leaves the status unchanged. `stop()` always reaches
//! HALTED: a CPU group that does not terminate in time is detached.

use std::time::Duration;

use crate::cpu::{CpuContext, StopOutcome};
use crate::error::{Result, VmError};
use crate::instance::{Instance, VmStatus};
use crate::lock::InstanceLock;
use crate::monitor::{MonitorConfig, MonitorHandle};

impl Instance {
    /// Starts the instance (HALTED → RUNNING).
    ///
    /// Acquires the lock file unless already held, verifies mandatory objects,
    /// pushes the configured IOS config into NVRAM, starts the CPU group and
    /// the monitor. On failure everything done here is undone.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless halted, `AlreadyRunning` if the lock is held by a
    /// live process, `MissingObject` if a mandatory object or the CPU group is
    /// absent, plus any error from config replay or the CPU group.
    pub fn start(&mut self) -> Result<()> {
        let status = self.status();
        if status != VmStatus::Halted {
            return Err(VmError::invalid_state(format!(
                "cannot start from state {:?}",
                status
            )));
        }

        if !self.log.is_open() {
            self.log.reopen()?;
        }

        let acquired_here = if self.lock.is_none() {
            self.lock = Some(InstanceLock::acquire(&self.lock_file)?);
            true
        } else {
            false
        };

        if let Err(e) = self.start_hardware() {
            self.error(&format!("unable to start: {}", e));
            self.delete_lines();
            if acquired_here {
                if let Some(lock) = self.lock.take() {
                    if let Err(e) = lock.release(true) {
                        tracing::warn!("{}: failed to release lock: {}", self.name, e);
                    }
                }
            }
            self.status.set(VmStatus::Halted);
            return Err(e);
        }

        self.log("VM", "instance started");
        tracing::info!("Instance {} started", self.name);
        Ok(())
    }

    fn start_hardware(&mut self) -> Result<()> {
        for name in self.machine.mandatory_objects() {
            self.check_object(name)?;
        }
        if self.cpu_group.is_none() {
            return Err(VmError::MissingObject("cpu_group".to_string()));
        }

        if let Some(config) = self.ios_config.clone() {
            self.push_config(&config)?;
        }
        self.init_lines()?;

        self.conf_reg = self.conf_reg_setup;
        self.irq.reset();

        let ctx = CpuContext {
            irq: self.irq(),
            bus: self.mmio_bus(),
            timer_irq_check_itv: self.timer_irq_check_itv,
            idle_pc: self.idle_pc,
        };
        let stop_timeout = self.settings.stop_timeout();
        let group = self
            .cpu_group
            .as_mut()
            .ok_or_else(|| VmError::MissingObject("cpu_group".to_string()))?;
        group.start(ctx)?;
        let ticks = group.tick_counter();

        self.status.set(VmStatus::Running);

        let config = MonitorConfig {
            name: self.name.clone(),
            status: self.status.clone(),
            irq: self.irq(),
            ticks,
            check_itv: self.timer_irq_check_itv,
            poll: self.settings.monitor_poll(),
            lock_path: Some(self.lock_file.clone()),
            log: self.log.clone(),
            stats: std::sync::Arc::clone(&self.monitor_stats),
            instance: self.self_ref.clone(),
        };
        match MonitorHandle::spawn(config) {
            Ok(monitor) => {
                self.monitor = Some(monitor);
                Ok(())
            }
            Err(e) => {
                if let Some(group) = self.cpu_group.as_mut() {
                    group.stop(stop_timeout);
                }
                Err(e)
            }
        }
    }

    /// Pauses the CPUs (RUNNING → SUSPENDED).
    ///
    /// # Errors
    ///
    /// `InvalidState` unless running; `Timeout` if the CPUs did not
    /// acknowledge in time, in which case they keep running.
    pub fn suspend(&mut self) -> Result<()> {
        let status = self.status();
        if status != VmStatus::Running {
            return Err(VmError::invalid_state(format!(
                "cannot suspend from state {:?}",
                status
            )));
        }
        let timeout = self.settings.suspend_timeout();
        if let Some(group) = self.cpu_group.as_mut() {
            group.suspend(timeout)?;
        }
        self.status.set(VmStatus::Suspended);
        self.log("VM", "instance suspended");
        tracing::info!("Instance {} suspended", self.name);
        Ok(())
    }

    /// Continues after [`Instance::suspend`] (SUSPENDED → RUNNING).
    pub fn resume(&mut self) -> Result<()> {
        let status = self.status();
        if status != VmStatus::Suspended {
            return Err(VmError::invalid_state(format!(
                "cannot resume from state {:?}",
                status
            )));
        }
        if let Some(group) = self.cpu_group.as_mut() {
            group.resume()?;
        }
        self.status.set(VmStatus::Running);
        self.log("VM", "instance resumed");
        tracing::info!("Instance {} resumed", self.name);
        Ok(())
    }

    /// Stops the instance (RUNNING/SUSPENDED → SHUTDOWN → HALTED).
    ///
    /// The CPU group gets the configured stop timeout; teardown proceeds
    /// whether or not it terminated.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless running or suspended.
    pub fn stop(&mut self) -> Result<()> {
        let status = self.status();
        if !matches!(status, VmStatus::Running | VmStatus::Suspended) {
            return Err(VmError::invalid_state(format!(
                "cannot stop from state {:?}",
                status
            )));
        }

        self.status.set(VmStatus::Shutdown);
        self.log("VM", "stopping instance");
        tracing::info!("Stopping instance {}", self.name);

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }

        self.stop_cpus(self.settings.stop_timeout());
        self.shutdown_hardware();

        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release(true) {
                tracing::warn!("{}: failed to release lock: {}", self.name, e);
            }
        }

        self.log("VM", "instance stopped");
        self.log.close();
        self.status.set(VmStatus::Halted);
        tracing::info!("Instance {} stopped", self.name);
        Ok(())
    }

    fn stop_cpus(&mut self, timeout: Duration) {
        let Some(group) = self.cpu_group.as_mut() else {
            return;
        };
        match group.stop(timeout) {
            StopOutcome::Clean => {}
            StopOutcome::Detached(n) => {
                tracing::warn!(
                    "{}: {} CPU(s) did not stop within {:?}, detached",
                    self.name,
                    n,
                    timeout
                );
                self.log(
                    "VM",
                    &format!("{} CPU(s) did not terminate, proceeding", n),
                );
            }
        }
    }

    /// Tears down bound hardware: object hooks newest first, then any device
    /// still bound, PCI busses and console lines. Safe to call repeatedly.
    pub(crate) fn shutdown_hardware(&mut self) {
        self.shutdown_objects();
        self.unbind_all_devices();

        self.pci_bus = [None, None];
        self.pci_bus_pool.iter_mut().for_each(|b| *b = None);
        self.pci_io_space = None;
        self.delete_lines();
        self.irq.reset();
    }

    /// Waits for the instance to return to HALTED, e.g. after the monitor
    /// stopped it.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> Result<()> {
        self.status.wait_for(VmStatus::Halted, timeout)
    }
}
