// vim: tw=80
//! Common utility functions used throughout dmmp

use crate::types::*;

/// Sectors are always 512 bytes, regardless of the device's logical block size
pub const BYTES_PER_SECTOR: usize = 512;

/// Size of one buffer in a `PagePool`
pub const PAGE_SIZE: usize = 4096;

/// How many sectors fit in one page
pub const SECTORS_PER_PAGE: SectorT = (PAGE_SIZE / BYTES_PER_SECTOR) as SectorT;

/// Divide, rounding up
pub fn div_roundup(dividend: SectorT, divisor: SectorT) -> SectorT {
    dividend.div_ceil(divisor)
}

/// Number of pages needed to buffer `sectors` worth of data
pub fn pages_for(sectors: SectorT) -> usize {
    div_roundup(sectors, SECTORS_PER_PAGE) as usize
}

/// Pop the next token off of an argument list, or fail with `err`.
pub(crate) fn shift<'a, E>(args: &mut std::slice::Iter<'a, String>, err: E)
    -> std::result::Result<&'a str, E>
{
    args.next().map(String::as_str).ok_or(err)
}

// LCOV_EXCL_STOP
