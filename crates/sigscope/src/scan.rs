//! This module allows one to scan memory for specific data

mod backends;
mod pattern;

use std::{
    fmt::{self, Display},
    slice,
};

use tracing::trace;

pub use pattern::{Pattern, PatternError, Segment};

/// The result of a raw-memory scan
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Scan {
    /// the address of a found match
    pub addr: *const u8,
    /// offset of the match from the start of the scanned range
    pub offset: usize,
}

impl Display for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scan {{ addr: {:?}, offset: {:#X} }}", self.addr, self.offset)
    }
}

/// Single result IDA-style pattern scanner
///
/// Find the first occurence of the pattern in the binary
///
/// # Params
///
/// * `addr` - pointer to the first element of the binary to search the pattern in
///
/// * `size` - binary size
///
/// # Safety
///
/// * `addr` - is a valid pointer, readable for `size` bytes
///
/// # Example
///
/// ```rust
/// # use sigscope::scan::sig_scan;
/// let binary = [0xab, 0xec, 0x48, 0x89, 0x5c, 0x24, 0xee, 0x48, 0x89, 0x6c];
///
/// let result = unsafe { sig_scan("48 89 5c 24 ?? 48 89 6c", binary.as_ptr(), binary.len()) };
///
/// assert_eq!(result.unwrap().offset, 2);
/// ```
pub unsafe fn sig_scan(pattern: &str, addr: *const u8, size: usize) -> Option<Scan> {
    let pattern = pattern.try_into().ok()?;
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { raw_find(&pattern, addr, size) }
}

/// Scan address for data.
///
/// Find the first occurence of `data` in the binary
///
/// # Safety
///
/// * `addr` - is a valid pointer, readable for `size` bytes
pub unsafe fn data_scan(data: &[u8], addr: *const u8, size: usize) -> Option<Scan> {
    let pattern = data.try_into().ok()?;
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { raw_find(&pattern, addr, size) }
}

/// Scan address for data with a mask
///
/// * `mask` - the mask to apply to the data. use `x` for known byte, `?` for unknown byte
///
/// # Safety
///
/// * `addr` - is a valid pointer, readable for `size` bytes
pub unsafe fn pattern_scan(data: &[u8], mask: &str, addr: *const u8, size: usize) -> Option<Scan> {
    let pattern = Pattern::from_data_with_mask(data, mask).ok()?;
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { raw_find(&pattern, addr, size) }
}

/// # Safety
/// address must be valid for up to size reads
unsafe fn raw_find(pattern: &Pattern, addr: *const u8, size: usize) -> Option<Scan> {
    if addr.is_null() {
        return None;
    }

    // SAFETY: caller guarantees addr..addr+size is readable
    let haystack = unsafe { slice::from_raw_parts(addr, size) };

    ScanContext::new(haystack).find(pattern)
}

/// The default target that pattern scans run against
///
/// Built once by the caller (usually over the main module of the process) and passed to
/// every scan, instead of living in a global.
#[derive(Debug, Copy, Clone)]
pub struct ScanContext<'a> {
    region: &'a [u8],
}

impl<'a> ScanContext<'a> {
    /// A context over an already borrowed region
    pub fn new(region: &'a [u8]) -> Self {
        Self { region }
    }

    /// A context over raw memory, e.g. a loaded module's image
    ///
    /// # Safety
    ///
    /// * `base` - non-null, readable for `size` bytes for the whole lifetime `'a`
    pub unsafe fn from_raw(base: *const u8, size: usize) -> Self {
        debug_assert!(!base.is_null(), "base must not be null");

        // SAFETY: upheld by the caller
        let region = unsafe { slice::from_raw_parts(base, size) };
        Self { region }
    }

    /// Start address of the region
    pub fn base(&self) -> *const u8 {
        self.region.as_ptr()
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// The scanned bytes
    pub fn region(&self) -> &'a [u8] {
        self.region
    }

    /// Offset of the first match from the base of the region
    pub fn find_offset(&self, pattern: &Pattern) -> Option<usize> {
        let offset = pattern.find(self.region);
        trace!(%pattern, ?offset, size = self.region.len(), "scanned region");
        offset
    }

    /// First match with its absolute address
    pub fn find(&self, pattern: &Pattern) -> Option<Scan> {
        self.find_offset(pattern).map(|offset| Scan {
            addr: self.region[offset..].as_ptr(),
            offset,
        })
    }

    /// Bytes at `offset`, bounded by the region
    pub fn bytes_at(&self, offset: usize) -> Option<&'a [u8]> {
        self.region.get(offset..)
    }
}
