//! 3600-series NVRAM configuration layout.
//!
//! The header carries no explicit length; the text spans `[start, end)`.
//!
//! ```text
//! 0x00  u16 magic1 (0xF0A5)     0x02  u16 magic2 (0xABCD)
//! 0x04  u16 format              0x06  u16 checksum
//! 0x08  u16 version (0x0B00)    0x0A  u16 unused
//! 0x0C  u32 start               0x10  u32 end
//! 0x14  configuration text
//! ```

use super::{
    check_fits, check_magic, compute_checksum, decode_text, read_u16, read_u32, verify_checksum,
    write_u16, write_u32, ConfigCodec, CONFIG_MAGIC, FORMAT_RAW,
};
use crate::error::{Result, VmError};

const HEADER_LEN: usize = 0x14;
const VERSION: u16 = 0x0B00;
const CKSUM_OFFSET: usize = 0x06;
const CONFIG_ADDR: u32 = 0x1400_0800 + HEADER_LEN as u32;

/// NVRAM codec for the 3600 series.
#[derive(Debug, Clone, Copy, Default)]
pub struct C3600Codec;

impl ConfigCodec for C3600Codec {
    fn name(&self) -> &'static str {
        "c3600"
    }

    fn extract(&self, region: &[u8]) -> Result<String> {
        check_magic(self.name(), region, HEADER_LEN)?;
        let header = &region[..HEADER_LEN];

        let format = read_u16(header, 0x04);
        let version = read_u16(header, 0x08);
        if format != FORMAT_RAW || version != VERSION {
            return Err(VmError::NoConfigData(format!(
                "c3600: unsupported header (format {}, version {:#06x})",
                format, version
            )));
        }

        let start = read_u32(header, 0x0C);
        let end = read_u32(header, 0x10);
        let len = end.checked_sub(start).map(|l| l as usize);
        let len = match len {
            Some(len) if HEADER_LEN + len <= region.len() => len,
            _ => {
                return Err(VmError::NoConfigData(format!(
                    "c3600: inconsistent header (start {:#x}, end {:#x})",
                    start, end
                )))
            }
        };

        let data = &region[HEADER_LEN..HEADER_LEN + len];
        verify_checksum(self.name(), header, CKSUM_OFFSET, data)?;
        decode_text(self.name(), data)
    }

    fn push(&self, text: &str, region_len: usize) -> Result<Vec<u8>> {
        let data = text.as_bytes();
        check_fits(self.name(), HEADER_LEN + data.len(), region_len)?;
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| CONFIG_ADDR.checked_add(len))
            .ok_or_else(|| VmError::NoConfigData("c3600: configuration too large".to_string()))?;

        let mut header = [0u8; HEADER_LEN];
        write_u16(&mut header, 0x00, CONFIG_MAGIC[0]);
        write_u16(&mut header, 0x02, CONFIG_MAGIC[1]);
        write_u16(&mut header, 0x04, FORMAT_RAW);
        write_u16(&mut header, 0x08, VERSION);
        write_u32(&mut header, 0x0C, CONFIG_ADDR);
        write_u32(&mut header, 0x10, end);
        let cksum = compute_checksum(&header, CKSUM_OFFSET, data);
        write_u16(&mut header, CKSUM_OFFSET, cksum);

        let mut out = header.to_vec();
        out.extend_from_slice(data);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_has_no_length_field() {
        let bytes = C3600Codec.push("hostname R2\nend\n", 256).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 16);
        assert_eq!(read_u16(&bytes, 0x08), VERSION);
        assert_eq!(read_u32(&bytes, 0x10) - read_u32(&bytes, 0x0C), 16);
    }

    #[test]
    fn test_end_before_start() {
        let mut bytes = C3600Codec.push("end\n", 256).unwrap();
        write_u32(&mut bytes, 0x10, 0);
        assert!(C3600Codec.extract(&bytes).is_err());
    }

    #[test]
    fn test_empty_config() {
        let bytes = C3600Codec.push("", 64).unwrap();
        assert_eq!(C3600Codec.extract(&bytes).unwrap(), "");
    }
}
