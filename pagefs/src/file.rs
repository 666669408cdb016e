use std::cmp::Ordering;
use std::convert::TryInto;

use crate::fs::FsError;
use crate::node::Inode;
use crate::pages::{PageNr, Pages, PAGE_SIZE};

/// Entries in the indirect pointer page.
pub const INDIRECT_SPAN: usize = PAGE_SIZE / 4;
/// Largest file the three-tier block map can address, in pages: two
/// direct pages plus one data page per indirect entry.
pub const MAX_FILE_PAGES: u64 = 2 + INDIRECT_SPAN as u64;

const PAGE: u64 = PAGE_SIZE as u64;

/// Pages needed to span `bytes` of content (a `stat`-style block count).
pub fn pages_spanned(bytes: u64) -> u64 {
    (bytes + PAGE - 1) / PAGE
}

fn indirect_entry(page: &[u8], k: usize) -> Option<PageNr> {
    let v = u32::from_le_bytes(page[k * 4..k * 4 + 4].try_into().unwrap());
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

fn set_indirect_entry(page: &mut [u8], k: usize, v: Option<PageNr>) {
    page[k * 4..k * 4 + 4].copy_from_slice(&v.unwrap_or(0).to_le_bytes());
}

/// The data page backing file page `fpn`, if one has been allocated.
/// File pages 0 and 1 sit behind the direct pointers; everything above
/// goes through the indirect page.
fn block_at(pages: &Pages, node: &Inode, fpn: u64) -> Option<PageNr> {
    match fpn {
        0 | 1 => node.direct(fpn as usize),
        _ => {
            let k = (fpn - 2) as usize;
            if k >= INDIRECT_SPAN {
                return None;
            }
            let ip = node.indirect()?;
            indirect_entry(pages.page(ip), k)
        }
    }
}

/// Like [`block_at`] but allocates the page (and, in the indirect tier,
/// the pointer page itself) on first touch.
fn ensure_block(pages: &mut Pages, node: &mut Inode, fpn: u64) -> Result<PageNr, FsError> {
    if fpn >= MAX_FILE_PAGES {
        return Err(FsError::FileTooLarge);
    }
    if let Some(pg) = block_at(pages, node, fpn) {
        return Ok(pg);
    }
    if fpn < 2 {
        let pg = pages.alloc_page()?;
        node.set_direct(fpn as usize, Some(pg));
        return Ok(pg);
    }
    let ip = match node.indirect() {
        Some(ip) => ip,
        None => {
            let ip = pages.alloc_page()?;
            node.set_indirect(Some(ip));
            ip
        }
    };
    let pg = pages.alloc_page()?;
    set_indirect_entry(pages.page_mut(ip), (fpn - 2) as usize, Some(pg));
    Ok(pg)
}

/// Copies bytes out of the block map into `buf`, walking direct page 0,
/// direct page 1, then the indirect entries in order. Pages that were
/// never written read back as zeroes. Callers clamp the request to the
/// file size; this layer does not know about end-of-file. Returns the
/// count of bytes copied.
pub fn read(pages: &Pages, node: &Inode, buf: &mut [u8], offset: u64) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let pos = offset + copied as u64;
        let fpn = pos / PAGE;
        if fpn >= MAX_FILE_PAGES {
            break;
        }
        let within = (pos % PAGE) as usize;
        let n = (buf.len() - copied).min(PAGE_SIZE - within);
        let dst = &mut buf[copied..copied + n];
        match block_at(pages, node, fpn) {
            Some(pg) => dst.copy_from_slice(&pages.page(pg)[within..within + n]),
            None => {
                for b in dst {
                    *b = 0;
                }
            }
        }
        copied += n;
    }
    copied
}

/// Mirrors [`read`], allocating any page the write reaches. Does not
/// update `node.size`; the caller extends it when the write lands past
/// the current end.
pub fn write(
    pages: &mut Pages,
    node: &mut Inode,
    buf: &[u8],
    offset: u64,
) -> Result<usize, FsError> {
    if offset + buf.len() as u64 > MAX_FILE_PAGES * PAGE {
        return Err(FsError::FileTooLarge);
    }
    let mut copied = 0;
    while copied < buf.len() {
        let pos = offset + copied as u64;
        let fpn = pos / PAGE;
        let within = (pos % PAGE) as usize;
        let n = (buf.len() - copied).min(PAGE_SIZE - within);
        let pg = ensure_block(pages, node, fpn)?;
        pages.page_mut(pg)[within..within + n].copy_from_slice(&buf[copied..copied + n]);
        copied += n;
    }
    Ok(copied)
}

/// Extends the file to `target` bytes, allocating pages as the size
/// crosses into them and zero-filling exactly the newly exposed range.
pub fn grow(pages: &mut Pages, node: &mut Inode, target: u64) -> Result<(), FsError> {
    if target > MAX_FILE_PAGES * PAGE {
        return Err(FsError::FileTooLarge);
    }
    while node.size() < target {
        let size = node.size();
        let fpn = size / PAGE;
        let within = (size % PAGE) as usize;
        let n = ((target - size) as usize).min(PAGE_SIZE - within);
        let pg = ensure_block(pages, node, fpn)?;
        for b in &mut pages.page_mut(pg)[within..within + n] {
            *b = 0;
        }
        node.set_size(size + n as u64);
    }
    Ok(())
}

/// Shrinks the file to `target` bytes, zeroing the discarded tail of the
/// highest page and releasing every page the size retreats out of. The
/// indirect pointer page is released along with its last entry.
pub fn shrink(pages: &mut Pages, node: &mut Inode, target: u64) -> Result<(), FsError> {
    while node.size() > target {
        let size = node.size();
        let fpn = (size - 1) / PAGE;
        let page_start = fpn * PAGE;
        let new_low = target.max(page_start);
        if let Some(pg) = block_at(pages, node, fpn) {
            let lo = (new_low - page_start) as usize;
            let hi = (size - page_start) as usize;
            for b in &mut pages.page_mut(pg)[lo..hi] {
                *b = 0;
            }
        }
        if new_low == page_start {
            release_block(pages, node, fpn);
        }
        node.set_size(new_low);
    }
    Ok(())
}

fn release_block(pages: &mut Pages, node: &mut Inode, fpn: u64) {
    match fpn {
        0 | 1 => {
            if let Some(pg) = node.direct(fpn as usize) {
                pages.free_page(pg);
                node.set_direct(fpn as usize, None);
            }
        }
        _ => {
            let k = (fpn - 2) as usize;
            if let Some(ip) = node.indirect() {
                if let Some(pg) = indirect_entry(pages.page(ip), k) {
                    pages.free_page(pg);
                    set_indirect_entry(pages.page_mut(ip), k, None);
                }
                if k == 0 {
                    // The lowest entry is gone, so nothing above it remains.
                    pages.free_page(ip);
                    node.set_indirect(None);
                }
            }
        }
    }
}

/// Grows or shrinks to `target`; equal sizes are a no-op.
pub fn truncate(pages: &mut Pages, node: &mut Inode, target: u64) -> Result<(), FsError> {
    match target.cmp(&node.size()) {
        Ordering::Greater => grow(pages, node, target),
        Ordering::Less => shrink(pages, node, target),
        Ordering::Equal => Ok(()),
    }
}
