//! Byte-backed memory devices (RAM, boot ROM, NVRAM).

use std::fs;
use std::path::{Path, PathBuf};

use crate::device::Device;
use crate::error::Result;

/// Memory region with big-endian MMIO accessors and optional file backing.
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    data: Vec<u8>,
    read_only: bool,
    backing: Option<PathBuf>,
}

impl MemoryDevice {
    /// Creates a zero-filled region of `size` bytes.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            data: vec![0; size],
            read_only: false,
            backing: None,
        }
    }

    /// Creates a read-only region holding `contents`.
    pub fn rom(name: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: contents,
            read_only: true,
            backing: None,
        }
    }

    /// Creates a region backed by `path`.
    ///
    /// Existing file contents are loaded (truncated or zero-padded to
    /// `size`); [`Device::sync`] writes the region back.
    pub fn with_backing(name: impl Into<String>, size: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        data.resize(size, 0);
        let name = name.into();
        tracing::debug!("Memory device {} backed by {}", name, path.display());
        Ok(Self {
            name,
            data,
            read_only: false,
            backing: Some(path),
        })
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn backing_file(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    fn span(&self, offset: u64, size: usize) -> Option<std::ops::Range<usize>> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return None;
        }
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(size)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl Device for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mmio_read(&mut self, offset: u64, size: usize) -> u64 {
        match self.span(offset, size) {
            Some(range) => self.data[range]
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            None => {
                tracing::trace!("{}: bad read at {:#x} (size {})", self.name, offset, size);
                0
            }
        }
    }

    fn mmio_write(&mut self, offset: u64, size: usize, value: u64) {
        if self.read_only {
            tracing::trace!("{}: write to ROM at {:#x} ignored", self.name, offset);
            return;
        }
        match self.span(offset, size) {
            Some(range) => {
                let bytes = value.to_be_bytes();
                self.data[range].copy_from_slice(&bytes[8 - size..]);
            }
            None => {
                tracing::trace!("{}: bad write at {:#x} (size {})", self.name, offset, size);
            }
        }
    }

    fn raw_bytes(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn raw_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.read_only {
            None
        } else {
            Some(&mut self.data)
        }
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(path) = &self.backing {
            fs::write(path, &self.data)?;
            tracing::debug!("Synced {} to {}", self.name, path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_access() {
        let mut dev = MemoryDevice::new("ram", 32);
        dev.mmio_write(0, 4, 0x1122_3344);
        assert_eq!(&dev.raw_bytes().unwrap()[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(dev.mmio_read(0, 2), 0x1122);
        assert_eq!(dev.mmio_read(3, 1), 0x44);

        dev.mmio_write(8, 8, 0x0102_0304_0506_0708);
        assert_eq!(dev.mmio_read(8, 8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_out_of_bounds_ignored() {
        let mut dev = MemoryDevice::new("ram", 4);
        dev.mmio_write(2, 4, u64::MAX);
        assert_eq!(dev.raw_bytes().unwrap(), &[0, 0, 0, 0]);
        assert_eq!(dev.mmio_read(1, 4), 0);
        assert_eq!(dev.mmio_read(0, 3), 0);
    }

    #[test]
    fn test_rom_is_read_only() {
        let mut dev = MemoryDevice::rom("rom", vec![0xAA; 8]);
        dev.mmio_write(0, 1, 0);
        assert_eq!(dev.mmio_read(0, 1), 0xAA);
        assert!(dev.raw_bytes_mut().is_none());
    }

    #[test]
    fn test_backing_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvram");

        let mut dev = MemoryDevice::with_backing("nvram", 64, &path).unwrap();
        dev.mmio_write(4, 2, 0xBEEF);
        dev.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);

        let mut reloaded = MemoryDevice::with_backing("nvram", 64, &path).unwrap();
        assert_eq!(reloaded.mmio_read(4, 2), 0xBEEF);
    }
}
