/// Magic bytes opening (and closing) every snapshot file.
pub const MAGIC: [u8; 4] = *b"LPsn";

/// Current snapshot format version.
pub const VERSION: u64 = 1;

/// Oldest format version the reader still understands.
pub const OLDEST_SUPPORTED_VERSION: u64 = 1;

pub fn is_supported(version: u64) -> bool {
    (OLDEST_SUPPORTED_VERSION..=VERSION).contains(&version)
}

/// Header: magic + raw u64 version.
pub const HEADER_LEN: u64 = MAGIC.len() as u64 + 8;

/// Number of section offsets stored in the trailer.
pub const OFFSET_COUNT: usize = 11;

/// Trailer: offsets marker + raw u64 offsets + magic.
pub const TRAILER_LEN: u64 = 1 + (OFFSET_COUNT as u64) * 8 + MAGIC.len() as u64;
