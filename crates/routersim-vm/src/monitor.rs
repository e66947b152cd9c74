//! Instance monitor task.
//!
//! One thread per running instance. While the instance is running it paces
//! the periodic timer interrupt off the CPU group's tick counter and checks
//! instance health. A lost lock file is unrecoverable and stops the
//! instance; an unwritable log is reported once and otherwise ignored.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, VmError};
use crate::instance::{Instance, StatusCell, VmStatus};
use crate::irq::IrqController;
use crate::lock;
use crate::log::InstanceLog;
use crate::platform::TIMER_IRQ;

/// Consecutive failed lock checks tolerated before stopping the instance.
const LOCK_FAILURE_LIMIT: u32 = 3;

// =============================================================================
// Statistics
// =============================================================================

/// Counters updated by the monitor, kept across restarts.
#[derive(Debug, Default)]
pub struct MonitorStats {
    polls: AtomicU64,
    timer_assertions: AtomicU64,
    last_pending: AtomicU32,
    soft_failures: AtomicU64,
    escalations: AtomicU64,
}

/// Point-in-time copy of [`MonitorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorSnapshot {
    /// Polls performed while running.
    pub polls: u64,
    /// Timer interrupt assertions.
    pub timer_assertions: u64,
    /// Pending interrupt word at the last poll.
    pub last_pending: u32,
    /// Soft health failures reported.
    pub soft_failures: u64,
    /// Times the monitor stopped the instance.
    pub escalations: u64,
}

impl MonitorStats {
    #[must_use]
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            polls: self.polls.load(Ordering::SeqCst),
            timer_assertions: self.timer_assertions.load(Ordering::SeqCst),
            last_pending: self.last_pending.load(Ordering::SeqCst),
            soft_failures: self.soft_failures.load(Ordering::SeqCst),
            escalations: self.escalations.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// What the monitor thread watches.
pub(crate) struct MonitorConfig {
    pub name: String,
    pub status: StatusCell,
    pub irq: Arc<IrqController>,
    pub ticks: Arc<AtomicU64>,
    pub check_itv: u32,
    pub poll: Duration,
    pub lock_path: Option<PathBuf>,
    pub log: InstanceLog,
    pub stats: Arc<MonitorStats>,
    pub instance: Weak<Mutex<Instance>>,
}

/// Handle to a running monitor thread.
#[derive(Debug)]
pub(crate) struct MonitorHandle {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl MonitorHandle {
    pub fn spawn(config: MonitorConfig) -> Result<Self> {
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let name = format!("monitor-{}", config.name);

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(config, thread_token))
            .map_err(|e| VmError::Cpu(format!("failed to spawn monitor thread: {}", e)))?;
        let thread_id = thread.thread().id();

        Ok(Self {
            token,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Cancels the monitor and waits for it to exit.
    ///
    /// When called from the monitor thread itself the join is skipped and the
    /// thread exits on its own once the caller returns.
    pub fn stop(mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("monitor thread panicked");
            }
        }
    }
}

fn run(cfg: MonitorConfig, token: CancellationToken) {
    tracing::debug!("{}: monitor started", cfg.name);

    let mut last_tick = cfg.ticks.load(Ordering::SeqCst);
    let mut lock_failures = 0u32;
    let mut log_failure_reported = false;
    let check_itv = u64::from(cfg.check_itv.max(1));

    while !token.is_cancelled() {
        thread::sleep(cfg.poll);
        if token.is_cancelled() {
            break;
        }
        if cfg.status.get() != VmStatus::Running {
            continue;
        }
        cfg.stats.polls.fetch_add(1, Ordering::SeqCst);

        // Timer interrupt, paced in executed ticks.
        let now = cfg.ticks.load(Ordering::SeqCst);
        if now.wrapping_sub(last_tick) >= check_itv {
            last_tick = now;
            if let Err(e) = cfg.irq.set_irq(TIMER_IRQ) {
                tracing::error!("{}: timer interrupt: {}", cfg.name, e);
            } else {
                cfg.stats.timer_assertions.fetch_add(1, Ordering::SeqCst);
            }
        }
        cfg.stats
            .last_pending
            .store(cfg.irq.pending(), Ordering::SeqCst);

        // Health.
        if let Some(path) = cfg.lock_path.as_deref() {
            if lock::is_owned_by_us(path) {
                lock_failures = 0;
            } else {
                lock_failures += 1;
                tracing::warn!(
                    "{}: lock file {} no longer owned ({}/{})",
                    cfg.name,
                    path.display(),
                    lock_failures,
                    LOCK_FAILURE_LIMIT
                );
                if lock_failures >= LOCK_FAILURE_LIMIT {
                    cfg.log.error("lock file lost, stopping instance");
                    escalate(&cfg, &token);
                    break;
                }
            }
        }

        if cfg.log.is_writable() {
            log_failure_reported = false;
        } else if !log_failure_reported {
            log_failure_reported = true;
            cfg.stats.soft_failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                "{}: log file {} is not writable",
                cfg.name,
                cfg.log.path().display()
            );
        }
    }

    tracing::debug!("{}: monitor exited", cfg.name);
}

/// Stops the instance from the monitor thread.
///
/// Uses `try_lock` so that a concurrent `stop()` holding the instance and
/// waiting for this thread never deadlocks: that caller cancels the token
/// first, which ends the loop here.
fn escalate(cfg: &MonitorConfig, token: &CancellationToken) {
    let Some(instance) = cfg.instance.upgrade() else {
        tracing::warn!("{}: instance not shared, cannot stop it", cfg.name);
        return;
    };

    loop {
        if token.is_cancelled() {
            return;
        }
        let mut vm = match instance.try_lock() {
            Ok(vm) => vm,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                thread::sleep(cfg.poll);
                continue;
            }
        };
        cfg.stats.escalations.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = vm.stop() {
            tracing::error!("{}: monitor-initiated stop failed: {}", cfg.name, e);
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, ticks: Arc<AtomicU64>, irq: Arc<IrqController>) -> MonitorConfig {
        let status = StatusCell::new(VmStatus::Running);
        MonitorConfig {
            name: "R1".to_string(),
            status,
            irq,
            ticks,
            check_itv: 100,
            poll: Duration::from_millis(2),
            lock_path: None,
            log: InstanceLog::new("R1", &dir.join("log.txt"), false),
            stats: Arc::new(MonitorStats::default()),
            instance: Weak::new(),
        }
    }

    #[test]
    fn test_timer_paced_by_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let ticks = Arc::new(AtomicU64::new(0));
        let irq = Arc::new(IrqController::new());
        let cfg = config(dir.path(), Arc::clone(&ticks), Arc::clone(&irq));
        let stats = Arc::clone(&cfg.stats);

        let monitor = MonitorHandle::spawn(cfg).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!irq.is_pending(TIMER_IRQ));
        assert_eq!(stats.snapshot().timer_assertions, 0);

        ticks.store(150, Ordering::SeqCst);
        let mut asserted = false;
        for _ in 0..500 {
            if irq.is_pending(TIMER_IRQ) {
                asserted = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        monitor.stop();

        assert!(asserted);
        assert_eq!(stats.snapshot().timer_assertions, 1);
        assert!(stats.snapshot().polls > 0);
    }

    #[test]
    fn test_observes_pending_word() {
        let dir = tempfile::tempdir().unwrap();
        let irq = Arc::new(IrqController::new());
        let cfg = config(dir.path(), Arc::new(AtomicU64::new(0)), Arc::clone(&irq));
        let stats = Arc::clone(&cfg.stats);

        let monitor = MonitorHandle::spawn(cfg).unwrap();
        irq.set_irq(3).unwrap();
        let mut seen = false;
        for _ in 0..500 {
            if stats.snapshot().last_pending & (1 << 3) != 0 {
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        monitor.stop();
        assert!(seen);
    }

    #[test]
    fn test_unwritable_log_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(
            dir.path(),
            Arc::new(AtomicU64::new(0)),
            Arc::new(IrqController::new()),
        );
        // Enabled but never opened.
        cfg.log = InstanceLog::new("R1", &dir.path().join("log.txt"), true);
        let stats = Arc::clone(&cfg.stats);

        let monitor = MonitorHandle::spawn(cfg).unwrap();
        thread::sleep(Duration::from_millis(40));
        monitor.stop();

        let snap = stats.snapshot();
        assert_eq!(snap.soft_failures, 1);
        assert!(snap.polls > 1);
    }
}
