//! 7200-series NVRAM configuration layout.
//!
//! ```text
//! 0x00  u16 magic1 (0xF0A5)     0x02  u16 magic2 (0xABCD)
//! 0x04  u16 format              0x06  u16 checksum
//! 0x08  u16 version (0x0C04)    0x0A  u16 reserved
//! 0x0C  u32 start               0x10  u32 end
//! 0x14  u32 length              0x18  configuration text
//! ```

use super::{
    check_fits, check_magic, compute_checksum, decode_text, read_u16, read_u32, verify_checksum,
    write_u16, write_u32, ConfigCodec, CONFIG_MAGIC, FORMAT_RAW,
};
use crate::error::{Result, VmError};

const HEADER_LEN: usize = 0x18;
const VERSION: u16 = 0x0C04;
const CKSUM_OFFSET: usize = 0x06;
/// Address the configuration text is recorded at in the header.
const CONFIG_ADDR: u32 = 0x1E00_0800 + HEADER_LEN as u32;

/// NVRAM codec for the 7200 series.
#[derive(Debug, Clone, Copy, Default)]
pub struct C7200Codec;

impl ConfigCodec for C7200Codec {
    fn name(&self) -> &'static str {
        "c7200"
    }

    fn extract(&self, region: &[u8]) -> Result<String> {
        check_magic(self.name(), region, HEADER_LEN)?;
        let header = &region[..HEADER_LEN];

        let format = read_u16(header, 0x04);
        let version = read_u16(header, 0x08);
        if format != FORMAT_RAW || version != VERSION {
            return Err(VmError::NoConfigData(format!(
                "c7200: unsupported header (format {}, version {:#06x})",
                format, version
            )));
        }

        let start = read_u32(header, 0x0C);
        let end = read_u32(header, 0x10);
        let len = read_u32(header, 0x14) as usize;
        if end.wrapping_sub(start) as usize != len || HEADER_LEN + len > region.len() {
            return Err(VmError::NoConfigData(format!(
                "c7200: inconsistent header (start {:#x}, end {:#x}, length {})",
                start, end, len
            )));
        }

        let data = &region[HEADER_LEN..HEADER_LEN + len];
        verify_checksum(self.name(), header, CKSUM_OFFSET, data)?;
        decode_text(self.name(), data)
    }

    fn push(&self, text: &str, region_len: usize) -> Result<Vec<u8>> {
        let data = text.as_bytes();
        check_fits(self.name(), HEADER_LEN + data.len(), region_len)?;
        let len = u32::try_from(data.len())
            .map_err(|_| VmError::NoConfigData("c7200: configuration too large".to_string()))?;

        let mut header = [0u8; HEADER_LEN];
        write_u16(&mut header, 0x00, CONFIG_MAGIC[0]);
        write_u16(&mut header, 0x02, CONFIG_MAGIC[1]);
        write_u16(&mut header, 0x04, FORMAT_RAW);
        write_u16(&mut header, 0x08, VERSION);
        write_u32(&mut header, 0x0C, CONFIG_ADDR);
        write_u32(&mut header, 0x10, CONFIG_ADDR.wrapping_add(len));
        write_u32(&mut header, 0x14, len);
        let cksum = compute_checksum(&header, CKSUM_OFFSET, data);
        write_u16(&mut header, CKSUM_OFFSET, cksum);

        let mut out = Vec::with_capacity(HEADER_LEN + data.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = C7200Codec.push("end\n", 256).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(&bytes[..4], &[0xF0, 0xA5, 0xAB, 0xCD]);
        assert_eq!(read_u16(&bytes, 0x08), 0x0C04);
        assert_eq!(read_u32(&bytes, 0x14), 4);
        assert_eq!(read_u32(&bytes, 0x10) - read_u32(&bytes, 0x0C), 4);
        assert_eq!(&bytes[HEADER_LEN..], b"end\n");
    }

    #[test]
    fn test_length_beyond_region() {
        let mut bytes = C7200Codec.push("end\n", 256).unwrap();
        write_u32(&mut bytes, 0x14, 1000);
        assert!(matches!(
            C7200Codec.extract(&bytes),
            Err(VmError::NoConfigData(_))
        ));
    }
}
