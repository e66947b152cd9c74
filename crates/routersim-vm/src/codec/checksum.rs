//! 16-bit one's-complement checksum used by NVRAM configuration headers.

/// Computes the checksum of `data` as big-endian 16-bit words.
///
/// An odd trailing byte is treated as the high byte of a final word. The
/// checksum field itself must be zero in `data` when computing.
#[must_use]
pub fn ones_complement(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
