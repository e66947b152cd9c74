//! NVRAM configuration codecs.
//!
//! The region behind the ROM monitor's reserved space holds a small
//! machine-specific header followed by the startup configuration text. Each
//! machine type gets its own [`ConfigCodec`], chosen when the instance is
//! created.

mod c3600;
mod c7200;
pub mod checksum;

pub use c3600::C3600Codec;
pub use c7200::C7200Codec;

use crate::error::{Result, VmError};

/// Magic words opening every configuration header.
pub const CONFIG_MAGIC: [u16; 2] = [0xF0A5, 0xABCD];

/// Header format for uncompressed configuration text.
pub const FORMAT_RAW: u16 = 1;

/// Encodes and decodes the configuration stored in NVRAM.
pub trait ConfigCodec: Send + Sync {
    /// Short machine name.
    fn name(&self) -> &'static str;

    /// Decodes configuration text from the NVRAM region that follows the
    /// reserved header.
    ///
    /// # Errors
    ///
    /// Returns `NoConfigData` if the region is blank, has a bad header or
    /// fails its checksum.
    fn extract(&self, region: &[u8]) -> Result<String>;

    /// Encodes `text` into the bytes to write at the start of the region.
    ///
    /// Bytes of the region past the returned buffer are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `NoConfigData` if the encoded config is larger than
    /// `region_len`.
    fn push(&self, text: &str, region_len: usize) -> Result<Vec<u8>>;
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Checks the magic words and returns a `NoConfigData` error naming the
/// codec if they do not match.
pub(crate) fn check_magic(codec: &str, region: &[u8], header_len: usize) -> Result<()> {
    if region.len() < header_len {
        return Err(VmError::NoConfigData(format!(
            "{}: region of {} bytes cannot hold a header",
            codec,
            region.len()
        )));
    }
    if read_u16(region, 0) != CONFIG_MAGIC[0] || read_u16(region, 2) != CONFIG_MAGIC[1] {
        return Err(VmError::NoConfigData(format!(
            "{}: no configuration header",
            codec
        )));
    }
    Ok(())
}

/// Verifies the checksum stored at `cksum_offset`, computed over the header
/// with that field zeroed plus the payload.
pub(crate) fn verify_checksum(
    codec: &str,
    header: &[u8],
    cksum_offset: usize,
    data: &[u8],
) -> Result<()> {
    let stored = read_u16(header, cksum_offset);
    let computed = compute_checksum(header, cksum_offset, data);
    if stored != computed {
        return Err(VmError::NoConfigData(format!(
            "{}: checksum mismatch (stored {:#06x}, computed {:#06x})",
            codec, stored, computed
        )));
    }
    Ok(())
}

pub(crate) fn compute_checksum(header: &[u8], cksum_offset: usize, data: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(header.len() + data.len());
    buf.extend_from_slice(header);
    write_u16(&mut buf, cksum_offset, 0);
    buf.extend_from_slice(data);
    checksum::ones_complement(&buf)
}

pub(crate) fn decode_text(codec: &str, data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|_| VmError::NoConfigData(format!("{}: configuration is not text", codec)))
}

pub(crate) fn check_fits(codec: &str, needed: usize, region_len: usize) -> Result<()> {
    if needed > region_len {
        return Err(VmError::NoConfigData(format!(
            "{}: configuration needs {} bytes, NVRAM region has {}",
            codec, needed, region_len
        )));
    }
    Ok(())
}
