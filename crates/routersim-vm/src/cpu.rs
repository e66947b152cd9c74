//! CPU execution group.
//!
//! The instruction-set emulator is an external collaborator. The core talks
//! to it through [`CpuGroup`]: start with a [`CpuContext`], pause and resume
//! at block boundaries, stop with a bounded wait. [`ThreadedCpuGroup`] runs
//! one thread per [`CpuCore`] and is what instances normally use.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::device::MmioBus;
use crate::error::{Result, VmError};
use crate::irq::IrqController;

/// Everything a CPU group needs from its instance.
#[derive(Debug, Clone)]
pub struct CpuContext {
    /// Pending interrupt word to poll.
    pub irq: Arc<IrqController>,
    /// MMIO dispatch over the instance address space.
    pub bus: MmioBus,
    /// Executed ticks between interrupt polls.
    pub timer_irq_check_itv: u32,
    /// Idle PC hint for the boot CPU.
    pub idle_pc: u64,
}

/// Result of a bounded stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every CPU terminated in time.
    Clean,
    /// This many CPUs missed the deadline and were abandoned.
    Detached(usize),
}

/// How a block of execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// The block retired this many ticks.
    Retired(u64),
    /// The CPU halted and will not execute further.
    Halted,
}

/// A single emulated CPU driven by [`ThreadedCpuGroup`].
pub trait CpuCore: Send + 'static {
    /// CPU number within the group.
    fn id(&self) -> u32;

    /// Executes one block of instructions.
    fn execute_block(&mut self, bus: &MmioBus) -> Result<BlockExit>;

    /// Delivers the deliverable interrupt lines.
    fn take_interrupt(&mut self, pending: u32, irq: &IrqController);

    /// Current program counter.
    fn pc(&self) -> u64;

    /// Installs the idle-loop PC hint.
    fn set_idle_pc(&mut self, _pc: u64) {}
}

/// Execution group controlled by the lifecycle state machine.
pub trait CpuGroup: Send {
    /// Starts executing.
    fn start(&mut self, ctx: CpuContext) -> Result<()>;

    /// Pauses every CPU at its next block boundary and waits for all of them
    /// to acknowledge.
    fn suspend(&mut self, timeout: Duration) -> Result<()>;

    /// Continues execution after [`CpuGroup::suspend`].
    fn resume(&mut self) -> Result<()>;

    /// Requests termination and waits up to `timeout`.
    fn stop(&mut self, timeout: Duration) -> StopOutcome;

    /// Drops cached translations for `[base, base + len)`.
    fn invalidate(&self, base: u64, len: u64);

    /// Shared counter of executed ticks.
    fn tick_counter(&self) -> Arc<AtomicU64>;

    /// Executed ticks so far.
    fn ticks(&self) -> u64 {
        self.tick_counter().load(Ordering::SeqCst)
    }

    /// Last program counter published by the boot CPU.
    fn boot_pc(&self) -> u64;

    /// False once a CPU failed.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Command sent to CPU threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuCommand {
    Run,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum CoreState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl CoreState {
    fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::SeqCst) {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

struct CoreHandle {
    id: u32,
    cmd_tx: mpsc::UnboundedSender<CpuCommand>,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<Box<dyn CpuCore>>>,
}

/// Counters shared by every core thread of a group.
#[derive(Clone)]
struct Shared {
    ticks: Arc<AtomicU64>,
    boot_pc: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
}

/// Thread-per-CPU execution group.
///
/// Cores are moved into their threads at start and handed back when the
/// threads exit, so a stopped group can be started again.
pub struct ThreadedCpuGroup {
    parked: Vec<Box<dyn CpuCore>>,
    handles: Vec<CoreHandle>,
    shared: Shared,
    invalidations: AtomicU64,
}

impl ThreadedCpuGroup {
    /// Creates a group from its cores. The first core is the boot CPU.
    #[must_use]
    pub fn new(cores: Vec<Box<dyn CpuCore>>) -> Self {
        Self {
            parked: cores,
            handles: Vec::new(),
            shared: Shared {
                ticks: Arc::new(AtomicU64::new(0)),
                boot_pc: Arc::new(AtomicU64::new(0)),
                failed: Arc::new(AtomicBool::new(false)),
            },
            invalidations: AtomicU64::new(0),
        }
    }

    /// Number of cores owned by the group, running or parked.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.parked.len() + self.handles.len()
    }

    /// Returns whether CPU threads are alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Number of translation invalidations received.
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    fn broadcast(&self, cmd: CpuCommand) -> Result<()> {
        for handle in &self.handles {
            if CoreState::load(&handle.state) == CoreState::Stopped {
                continue;
            }
            handle
                .cmd_tx
                .send(cmd)
                .map_err(|e| VmError::Cpu(format!("CPU {}: failed to send {:?}: {}", handle.id, cmd, e)))?;
        }
        Ok(())
    }

    fn core_thread(
        mut core: Box<dyn CpuCore>,
        mut cmd_rx: mpsc::UnboundedReceiver<CpuCommand>,
        state: Arc<AtomicU8>,
        shared: Shared,
        ctx: CpuContext,
        is_boot: bool,
    ) -> Box<dyn CpuCore> {
        let id = core.id();
        let check_itv = u64::from(ctx.timer_irq_check_itv.max(1));
        let mut since_check = 0u64;
        let mut paused = true;

        tracing::debug!("CPU {} thread started", id);

        loop {
            let cmd = if paused {
                match cmd_rx.blocking_recv() {
                    Some(cmd) => Some(cmd),
                    None => break,
                }
            } else {
                match cmd_rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            };

            match cmd {
                Some(CpuCommand::Run | CpuCommand::Resume) => {
                    paused = false;
                    state.store(CoreState::Running as u8, Ordering::SeqCst);
                }
                Some(CpuCommand::Pause) => {
                    paused = true;
                    state.store(CoreState::Paused as u8, Ordering::SeqCst);
                    tracing::trace!("CPU {} paused at pc {:#x}", id, core.pc());
                    continue;
                }
                Some(CpuCommand::Stop) => break,
                None => {}
            }

            if paused {
                continue;
            }

            match core.execute_block(&ctx.bus) {
                Ok(BlockExit::Retired(n)) => {
                    shared.ticks.fetch_add(n, Ordering::SeqCst);
                    if is_boot {
                        shared.boot_pc.store(core.pc(), Ordering::SeqCst);
                    }
                    since_check += n;
                    if since_check >= check_itv {
                        since_check = 0;
                        let pending = ctx.irq.deliverable();
                        if pending != 0 {
                            core.take_interrupt(pending, &ctx.irq);
                        }
                    }
                }
                Ok(BlockExit::Halted) => {
                    tracing::info!("CPU {} halted", id);
                    break;
                }
                Err(e) => {
                    tracing::error!("CPU {} error: {}", id, e);
                    shared.failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        state.store(CoreState::Stopped as u8, Ordering::SeqCst);
        tracing::debug!("CPU {} thread exited", id);
        core
    }
}

impl CpuGroup for ThreadedCpuGroup {
    fn start(&mut self, ctx: CpuContext) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(VmError::invalid_state("CPU group already started"));
        }
        if self.parked.is_empty() {
            return Err(VmError::Cpu("CPU group has no cores".to_string()));
        }
        self.shared.failed.store(false, Ordering::SeqCst);

        let cores = std::mem::take(&mut self.parked);
        for (index, mut core) in cores.into_iter().enumerate() {
            let id = core.id();
            let is_boot = index == 0;
            if is_boot {
                core.set_idle_pc(ctx.idle_pc);
            }
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let state = Arc::new(AtomicU8::new(CoreState::Idle as u8));
            let thread_state = Arc::clone(&state);
            let shared = self.shared.clone();
            let thread_ctx = ctx.clone();

            let thread = thread::Builder::new()
                .name(format!("cpu-{}", id))
                .spawn(move || {
                    Self::core_thread(core, cmd_rx, thread_state, shared, thread_ctx, is_boot)
                })
                .map_err(|e| VmError::Cpu(format!("failed to spawn CPU thread: {}", e)));

            match thread {
                Ok(thread) => self.handles.push(CoreHandle {
                    id,
                    cmd_tx,
                    state,
                    thread: Some(thread),
                }),
                Err(e) => {
                    self.stop(Duration::from_millis(100));
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.broadcast(CpuCommand::Run) {
            self.stop(Duration::from_millis(100));
            return Err(e);
        }
        tracing::info!("Started {} CPUs", self.handles.len());
        Ok(())
    }

    fn suspend(&mut self, timeout: Duration) -> Result<()> {
        self.broadcast(CpuCommand::Pause)?;

        let deadline = Instant::now() + timeout;
        loop {
            let acked = self.handles.iter().all(|h| {
                matches!(
                    CoreState::load(&h.state),
                    CoreState::Paused | CoreState::Stopped
                )
            });
            if acked {
                tracing::info!("Paused {} CPUs", self.handles.len());
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.broadcast(CpuCommand::Resume)?;
                return Err(VmError::Timeout(format!(
                    "CPUs did not pause within {:?}",
                    timeout
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn resume(&mut self) -> Result<()> {
        self.broadcast(CpuCommand::Resume)?;
        tracing::info!("Resumed {} CPUs", self.handles.len());
        Ok(())
    }

    fn stop(&mut self, timeout: Duration) -> StopOutcome {
        for handle in &self.handles {
            let _ = handle.cmd_tx.send(CpuCommand::Stop);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline
            && !self
                .handles
                .iter()
                .all(|h| h.thread.as_ref().map_or(true, JoinHandle::is_finished))
        {
            thread::sleep(Duration::from_millis(1));
        }

        let mut detached = 0;
        for mut handle in self.handles.drain(..) {
            let Some(thread) = handle.thread.take() else {
                continue;
            };
            if thread.is_finished() {
                match thread.join() {
                    Ok(core) => self.parked.push(core),
                    Err(_) => tracing::error!("CPU {} thread panicked", handle.id),
                }
            } else {
                tracing::warn!("CPU {} did not stop within {:?}, detaching", handle.id, timeout);
                detached += 1;
            }
        }
        self.parked.sort_by_key(|c| c.id());

        tracing::info!("Stopped CPUs ({} detached)", detached);
        if detached == 0 {
            StopOutcome::Clean
        } else {
            StopOutcome::Detached(detached)
        }
    }

    fn invalidate(&self, base: u64, len: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Invalidate translations [{:#x}, {:#x})", base, base.saturating_add(len));
    }

    fn tick_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.ticks)
    }

    fn boot_pc(&self) -> u64 {
        self.shared.boot_pc.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        !self.shared.failed.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadedCpuGroup {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop(Duration::from_millis(500));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AddressSpace;
    use std::sync::atomic::AtomicU32;
    use std::sync::RwLock;

    struct TestCore {
        id: u32,
        pc: u64,
        block_delay: Duration,
        interrupts: Arc<AtomicU32>,
    }

    impl TestCore {
        fn boxed(id: u32, block_delay: Duration, interrupts: Arc<AtomicU32>) -> Box<dyn CpuCore> {
            Box::new(Self {
                id,
                pc: 0xBFC0_0000,
                block_delay,
                interrupts,
            })
        }
    }

    impl CpuCore for TestCore {
        fn id(&self) -> u32 {
            self.id
        }

        fn execute_block(&mut self, _bus: &MmioBus) -> Result<BlockExit> {
            thread::sleep(self.block_delay);
            self.pc += 40;
            Ok(BlockExit::Retired(10))
        }

        fn take_interrupt(&mut self, pending: u32, irq: &IrqController) {
            self.interrupts.fetch_or(pending, Ordering::SeqCst);
            for line in 0..32 {
                if pending & (1 << line) != 0 {
                    let _ = irq.clear_irq(line);
                }
            }
        }

        fn pc(&self) -> u64 {
            self.pc
        }
    }

    fn context(irq: Arc<IrqController>) -> CpuContext {
        CpuContext {
            irq,
            bus: MmioBus::new(Arc::new(RwLock::new(AddressSpace::new(1 << 36)))),
            timer_irq_check_itv: 20,
            idle_pc: 0,
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_start_stop_restart() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut group = ThreadedCpuGroup::new(vec![
            TestCore::boxed(0, Duration::from_micros(100), Arc::clone(&seen)),
            TestCore::boxed(1, Duration::from_micros(100), Arc::clone(&seen)),
        ]);
        let irq = Arc::new(IrqController::new());

        group.start(context(Arc::clone(&irq))).unwrap();
        assert!(group.is_running());
        assert!(wait_until(Duration::from_secs(2), || group.ticks() > 100));
        assert!(group.start(context(Arc::clone(&irq))).is_err());

        assert_eq!(group.stop(Duration::from_secs(2)), StopOutcome::Clean);
        assert!(!group.is_running());
        assert_eq!(group.core_count(), 2);

        group.start(context(irq)).unwrap();
        assert_eq!(group.stop(Duration::from_secs(2)), StopOutcome::Clean);
    }

    #[test]
    fn test_suspend_freezes_ticks() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut group = ThreadedCpuGroup::new(vec![TestCore::boxed(
            0,
            Duration::from_micros(100),
            seen,
        )]);
        group.start(context(Arc::new(IrqController::new()))).unwrap();
        assert!(wait_until(Duration::from_secs(2), || group.ticks() > 0));

        group.suspend(Duration::from_secs(1)).unwrap();
        let frozen = group.ticks();
        let frozen_pc = group.boot_pc();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(group.ticks(), frozen);
        assert_eq!(group.boot_pc(), frozen_pc);

        group.resume().unwrap();
        assert!(wait_until(Duration::from_secs(2), || group.ticks() > frozen));
        group.stop(Duration::from_secs(2));
    }

    #[test]
    fn test_interrupts_polled_at_interval() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut group = ThreadedCpuGroup::new(vec![TestCore::boxed(
            0,
            Duration::from_micros(100),
            Arc::clone(&seen),
        )]);
        let irq = Arc::new(IrqController::new());
        group.start(context(Arc::clone(&irq))).unwrap();

        irq.set_irq(5).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.load(Ordering::SeqCst) & (1 << 5) != 0
        }));
        assert!(wait_until(Duration::from_secs(2), || !irq.is_pending(5)));
        group.stop(Duration::from_secs(2));
    }

    #[test]
    fn test_wedged_core_detached() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut group = ThreadedCpuGroup::new(vec![TestCore::boxed(
            0,
            Duration::from_millis(300),
            seen,
        )]);
        group.start(context(Arc::new(IrqController::new()))).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert_eq!(group.stop(Duration::from_millis(50)), StopOutcome::Detached(1));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!group.is_running());
    }

    #[test]
    fn test_start_without_cores() {
        let mut group = ThreadedCpuGroup::new(Vec::new());
        assert!(matches!(
            group.start(context(Arc::new(IrqController::new()))),
            Err(VmError::Cpu(_))
        ));
    }
}
