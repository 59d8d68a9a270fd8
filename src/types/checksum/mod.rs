#![forbid(unsafe_code)]

/// CRC32 over the parts of a page other than its checksum field.
///
/// The page offset is folded in first so that a correct page written to the
/// wrong location still fails verification.
pub fn page_crc32(off: u64, parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&off.to_be_bytes());
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
