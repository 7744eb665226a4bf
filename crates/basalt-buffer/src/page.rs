//! Thin page header utilities.
//!
//! The buffer pool does not interpret page contents, but the flush and
//! read paths need three things from the page format: the LSN stamp, the
//! checksum field, and enough header sanity to detect a torn or garbage
//! page. Everything else about page layout belongs to higher layers.
//!
//! # Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   lsn (latest WAL record affecting this page)
//!   8       4   checksum (CRC32C, excluding this field; 0 = none)
//!  12       2   flags
//!  14       2   lower (end of the occupied header/slot area)
//!  16       2   upper (start of the occupied data area)
//!  18       6   reserved
//! ```

use basalt_common::constants::BLCKSZ;
use basalt_common::types::Lsn;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Offset of the checksum field in the header.
const CHECKSUM_OFFSET: usize = 8;

/// Returns the page's LSN stamp.
#[inline]
#[must_use]
pub fn page_lsn(page: &[u8]) -> Lsn {
    let bytes: [u8; 8] = page[0..8].try_into().unwrap();
    Lsn::from_le_bytes(bytes)
}

/// Stamps the page's LSN.
#[inline]
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[0..8].copy_from_slice(&lsn.to_le_bytes());
}

/// Initializes an empty page: zeroed payload with lower/upper bracketing
/// the free space.
pub fn init_page(page: &mut [u8]) {
    page.fill(0);
    page[14..16].copy_from_slice(&(PAGE_HEADER_SIZE as u16).to_le_bytes());
    let len = page.len() as u16;
    page[16..18].copy_from_slice(&len.to_le_bytes());
}

/// Returns true if the page has never been initialized.
///
/// A just-extended block is all zeroes; `upper == 0` is the tell.
#[inline]
#[must_use]
pub fn page_is_new(page: &[u8]) -> bool {
    u16::from_le_bytes([page[16], page[17]]) == 0
}

/// Computes the page checksum, skipping the checksum field itself.
#[must_use]
pub fn compute_page_checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Stores the checksum of `page` into its checksum field.
pub fn set_page_checksum(page: &mut [u8]) {
    let checksum = compute_page_checksum(page);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// Returns the stored checksum field.
#[inline]
#[must_use]
pub fn page_checksum(page: &[u8]) -> u32 {
    u32::from_le_bytes(page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap())
}

/// Copies `page` into `scratch` and stamps the copy's checksum.
///
/// Used on the write path: the shared page may still be receiving
/// hint-bit updates, so the checksum is computed over a private copy.
pub fn checksum_page_copy(page: &[u8], scratch: &mut [u8]) {
    scratch.copy_from_slice(page);
    set_page_checksum(scratch);
}

/// Verifies a page read from disk.
///
/// A never-initialized (all-zero) page is valid. Otherwise the header
/// pointers must be sane and, when `verify_checksum` is set and the page
/// carries one, the checksum must match.
#[must_use]
pub fn verify_page(page: &[u8], verify_checksum: bool) -> bool {
    if page.iter().all(|&b| b == 0) {
        return true;
    }

    let lower = u16::from_le_bytes([page[14], page[15]]) as usize;
    let upper = u16::from_le_bytes([page[16], page[17]]) as usize;
    if lower < PAGE_HEADER_SIZE || lower > upper || upper > BLCKSZ {
        return false;
    }

    if verify_checksum {
        let stored = page_checksum(page);
        if stored != 0 && stored != compute_page_checksum(page) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ];
        init_page(&mut page);
        page
    }

    #[test]
    fn test_lsn_roundtrip() {
        let mut page = fresh_page();
        assert_eq!(page_lsn(&page), Lsn::INVALID);

        set_page_lsn(&mut page, Lsn::new(0xDEAD_BEEF));
        assert_eq!(page_lsn(&page), Lsn::new(0xDEAD_BEEF));
    }

    #[test]
    fn test_new_page_detection() {
        let zero = vec![0u8; BLCKSZ];
        assert!(page_is_new(&zero));

        let page = fresh_page();
        assert!(!page_is_new(&page));
    }

    #[test]
    fn test_verify_zero_page() {
        let zero = vec![0u8; BLCKSZ];
        assert!(verify_page(&zero, true));
    }

    #[test]
    fn test_verify_checksummed_page() {
        let mut page = fresh_page();
        page[100] = 0x42;
        set_page_checksum(&mut page);
        assert!(verify_page(&page, true));

        // Corrupt a payload byte; the checksum no longer matches.
        page[101] = 0x43;
        assert!(!verify_page(&page, true));
        // With verification off the header still looks sane.
        assert!(verify_page(&page, false));
    }

    #[test]
    fn test_verify_garbage_header() {
        let mut page = vec![0xFFu8; BLCKSZ];
        assert!(!verify_page(&page, false));
        // lower > upper
        page[14..16].copy_from_slice(&100u16.to_le_bytes());
        page[16..18].copy_from_slice(&50u16.to_le_bytes());
        assert!(!verify_page(&page, false));
    }

    #[test]
    fn test_checksum_copy_leaves_original_untouched() {
        let mut page = fresh_page();
        page[200] = 7;
        let before = page.clone();

        let mut scratch = vec![0u8; BLCKSZ];
        checksum_page_copy(&page, &mut scratch);

        assert_eq!(page, before);
        assert_ne!(page_checksum(&scratch), 0);
        assert!(verify_page(&scratch, true));
    }
}
