//! Virtual interrupt lines.
//!
//! Devices raise and lower lines from their own execution contexts while the
//! CPU collaborator polls the pending word at block boundaries. All updates
//! are single atomic read-modify-write operations so that two lines raised
//! concurrently by unrelated sources are never lost.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, VmError};

/// Interrupt line number.
pub type IrqLine = u32;

/// Number of lines held in the pending word.
pub const MAX_IRQ_LINES: u32 = 32;

/// Statistics for interrupt delivery.
#[derive(Debug, Default)]
pub struct IrqStats {
    /// Raise requests that set a previously clear line.
    pub raised: AtomicU64,
    /// Raise requests on a line that was already pending.
    pub coalesced: AtomicU64,
}

/// Interrupt controller shared by devices, the CPU group and the monitor.
#[derive(Debug, Default)]
pub struct IrqController {
    /// Pending lines (bit set = asserted).
    pending: AtomicU32,
    /// IRQ mask (bit set = masked).
    mask: AtomicU32,
    stats: IrqStats,
}

impl IrqController {
    /// Creates a controller with every line clear and unmasked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bit(line: IrqLine) -> Result<u32> {
        if line >= MAX_IRQ_LINES {
            return Err(VmError::OutOfRange(format!(
                "IRQ line {} (max {})",
                line,
                MAX_IRQ_LINES - 1
            )));
        }
        Ok(1u32 << line)
    }

    /// Asserts a line.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the line does not exist.
    pub fn set_irq(&self, line: IrqLine) -> Result<()> {
        let bit = Self::bit(line)?;
        let old = self.pending.fetch_or(bit, Ordering::SeqCst);
        if old & bit != 0 {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("IRQ {} coalesced (already pending)", line);
        } else {
            self.stats.raised.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("IRQ {} raised", line);
        }
        Ok(())
    }

    /// Deasserts a line.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the line does not exist.
    pub fn clear_irq(&self, line: IrqLine) -> Result<()> {
        let bit = Self::bit(line)?;
        self.pending.fetch_and(!bit, Ordering::SeqCst);
        tracing::trace!("IRQ {} cleared", line);
        Ok(())
    }

    /// Raw pending word.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Pending lines that are not masked. This is what the CPU polls.
    #[must_use]
    pub fn deliverable(&self) -> u32 {
        self.pending() & !self.mask.load(Ordering::SeqCst)
    }

    /// Checks if a line is pending.
    #[must_use]
    pub fn is_pending(&self, line: IrqLine) -> bool {
        Self::bit(line).map_or(false, |bit| self.pending() & bit != 0)
    }

    /// Masks a line.
    pub fn mask_irq(&self, line: IrqLine) -> Result<()> {
        let bit = Self::bit(line)?;
        let old = self.mask.fetch_or(bit, Ordering::SeqCst);
        tracing::trace!("Masked IRQ {}, old mask: {:#x}", line, old);
        Ok(())
    }

    /// Unmasks a line.
    pub fn unmask_irq(&self, line: IrqLine) -> Result<()> {
        let bit = Self::bit(line)?;
        let old = self.mask.fetch_and(!bit, Ordering::SeqCst);
        tracing::trace!("Unmasked IRQ {}, old mask: {:#x}", line, old);
        Ok(())
    }

    /// Checks if a line is masked.
    #[must_use]
    pub fn is_masked(&self, line: IrqLine) -> bool {
        Self::bit(line).map_or(false, |bit| self.mask.load(Ordering::SeqCst) & bit != 0)
    }

    /// Returns `(raised, coalesced)` counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.raised.load(Ordering::Relaxed),
            self.stats.coalesced.load(Ordering::Relaxed),
        )
    }

    /// Clears every line, the mask and the statistics.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::SeqCst);
        self.mask.store(0, Ordering::SeqCst);
        self.stats.raised.store(0, Ordering::Relaxed);
        self.stats.coalesced.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_clear() {
        let irq = IrqController::new();
        irq.set_irq(3).unwrap();
        assert_eq!(irq.pending(), 1 << 3);
        assert!(irq.is_pending(3));

        irq.clear_irq(3).unwrap();
        assert_eq!(irq.pending(), 0);
    }

    #[test]
    fn test_out_of_range_line() {
        let irq = IrqController::new();
        assert!(matches!(irq.set_irq(32), Err(VmError::OutOfRange(_))));
        assert!(irq.clear_irq(40).is_err());
        assert!(!irq.is_pending(99));
    }

    #[test]
    fn test_coalescing_stats() {
        let irq = IrqController::new();
        irq.set_irq(5).unwrap();
        irq.set_irq(5).unwrap();
        irq.set_irq(6).unwrap();
        assert_eq!(irq.stats(), (2, 1));

        irq.reset();
        assert_eq!(irq.stats(), (0, 0));
        assert_eq!(irq.pending(), 0);
    }

    #[test]
    fn test_masked_line_not_deliverable() {
        let irq = IrqController::new();
        irq.mask_irq(2).unwrap();
        irq.set_irq(2).unwrap();
        irq.set_irq(4).unwrap();

        assert!(irq.is_masked(2));
        assert_eq!(irq.deliverable(), 1 << 4);

        irq.unmask_irq(2).unwrap();
        assert_eq!(irq.deliverable(), (1 << 2) | (1 << 4));
    }

    #[test]
    fn test_concurrent_raise_never_loses_edges() {
        let irq = Arc::new(IrqController::new());

        for _ in 0..200 {
            irq.reset();
            let handles: Vec<_> = (0..8)
                .map(|line| {
                    let irq = Arc::clone(&irq);
                    thread::spawn(move || irq.set_irq(line).unwrap())
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(irq.pending(), 0xFF);
        }
    }
}
