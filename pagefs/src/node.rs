use std::fmt;

use byteorder::LittleEndian;
use log::{debug, warn};
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::alloc::{self, State};
use crate::fs::FsError;
use crate::pages::{PageNr, Pages, PAGE_SIZE};

pub type Inum = u32;

/// Inode 0 is the filesystem root. It is created once at store
/// initialization and can never be freed.
pub const ROOT_INUM: Inum = 0;

/// File-type bits stored in the high bits of `mode`.
pub const MODE_DIR: u32 = 0o040_000;
pub const MODE_FILE: u32 = 0o100_000;
pub const MODE_SYMLINK: u32 = 0o120_000;
pub const MODE_TYPE_MASK: u32 = 0o170_000;
pub const MODE_PERM_MASK: u32 = 0o007_777;

/// On-disk size of one inode record.
pub const INODE_SIZE: usize = 48;
/// The table occupies two reserved pages.
pub const INODE_COUNT: usize = (2 * PAGE_SIZE) / INODE_SIZE;

const INODE_START_PAGE: PageNr = 1;
const INODES_PER_PAGE: usize = PAGE_SIZE / INODE_SIZE;

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// This structure __must not exceed 48 bytes.__ A page pointer value of 0
/// means "not allocated yet"; the accessors surface that as `None` so the
/// block-map walkers never compare against the raw sentinel.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
pub struct Inode {
    /// The number of directory entries naming this inode.
    refs: Le32,
    /// Type and permission bits (e.g. 040755 for the root directory).
    mode: Le32,
    /// The total size of the file in bytes.
    size: Le32,
    /// Direct data page pointers, covering the first two pages of content.
    direct: [Le32; 2],
    /// Pointer to a page of further data page pointers.
    indirect: Le32,
    /// Creation time in seconds since the epoch.
    ctime: Le64,
    /// Last content change in seconds since the epoch.
    mtime: Le64,
    /// Last access in seconds since the epoch.
    atime: Le64,
}

fn nonzero(v: u32) -> Option<PageNr> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

impl Inode {
    pub fn new(mode: u32, now: u64) -> Self {
        Self {
            refs: Le32::new(1),
            mode: Le32::new(mode),
            size: Le32::new(0),
            direct: [Le32::new(0); 2],
            indirect: Le32::new(0),
            ctime: Le64::new(now),
            mtime: Le64::new(now),
            atime: Le64::new(now),
        }
    }

    pub fn refs(&self) -> u32 {
        self.refs.get()
    }

    pub fn set_refs(&mut self, refs: u32) {
        self.refs.set(refs);
    }

    pub fn mode(&self) -> u32 {
        self.mode.get()
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode.set(mode);
    }

    pub fn size(&self) -> u64 {
        u64::from(self.size.get())
    }

    pub fn set_size(&mut self, size: u64) {
        debug_assert!(size <= u64::from(u32::max_value()));
        self.size.set(size as u32);
    }

    pub fn direct(&self, slot: usize) -> Option<PageNr> {
        nonzero(self.direct[slot].get())
    }

    pub fn set_direct(&mut self, slot: usize, page: Option<PageNr>) {
        self.direct[slot].set(page.unwrap_or(0));
    }

    pub fn indirect(&self) -> Option<PageNr> {
        nonzero(self.indirect.get())
    }

    pub fn set_indirect(&mut self, page: Option<PageNr>) {
        self.indirect.set(page.unwrap_or(0));
    }

    pub fn is_dir(&self) -> bool {
        self.mode() & MODE_TYPE_MASK == MODE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & MODE_TYPE_MASK == MODE_SYMLINK
    }

    pub fn ctime(&self) -> u64 {
        self.ctime.get()
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.get()
    }

    pub fn atime(&self) -> u64 {
        self.atime.get()
    }

    pub fn set_mtime(&mut self, t: u64) {
        self.mtime.set(t);
    }

    pub fn set_atime(&mut self, t: u64) {
        self.atime.set(t);
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "refs: {}, mode: {:o}, size: {}, direct: [{}, {}], indirect: {}",
            self.refs.get(),
            self.mode.get(),
            self.size.get(),
            self.direct[0].get(),
            self.direct[1].get(),
            self.indirect.get(),
        )
    }
}

fn location(inum: Inum) -> (PageNr, usize) {
    let i = inum as usize;
    let page = INODE_START_PAGE + (i / INODES_PER_PAGE) as PageNr;
    (page, (i % INODES_PER_PAGE) * INODE_SIZE)
}

fn check_range(inum: Inum) -> Result<(), FsError> {
    if inum as usize >= INODE_COUNT {
        return Err(FsError::InvalidArgument(format!(
            "inode {} out of range",
            inum
        )));
    }
    Ok(())
}

/// Copies the record out of the table. Mutations are written back with
/// [`put`]; the table never hands out references into the page arena.
pub fn get(pages: &Pages, inum: Inum) -> Result<Inode, FsError> {
    check_range(inum)?;
    let (page, off) = location(inum);
    let bytes = &pages.page(page)[off..off + INODE_SIZE];
    let record =
        LayoutVerified::<_, Inode>::new_unaligned(bytes).expect("inode record size mismatch");
    Ok(*record)
}

pub fn put(pages: &mut Pages, inum: Inum, node: &Inode) -> Result<(), FsError> {
    check_range(inum)?;
    let (page, off) = location(inum);
    pages.page_mut(page)[off..off + INODE_SIZE].copy_from_slice(node.as_bytes());
    Ok(())
}

/// Grants the first free inode number and initializes its record: one
/// reference, the given mode, no content, all timestamps set to `now`.
pub fn alloc(pages: &mut Pages, mode: u32, now: u64) -> Result<Inum, FsError> {
    let inum =
        alloc::first_free(pages.inode_bitmap(), INODE_COUNT).ok_or(FsError::NoSpace)? as Inum;
    alloc::put(pages.inode_bitmap_mut(), inum as usize, State::Used);
    let node = Inode::new(mode, now);
    put(pages, inum, &node)?;
    debug!("alloc inode {} ({})", inum, node);
    Ok(inum)
}

pub fn free(pages: &mut Pages, inum: Inum) {
    if inum == ROOT_INUM {
        warn!("refusing to free the root inode");
        return;
    }
    if inum as usize >= INODE_COUNT {
        warn!("refusing to free inode {} (out of range)", inum);
        return;
    }
    alloc::put(pages.inode_bitmap_mut(), inum as usize, State::Free);
    debug!("free inode {}", inum);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pages() -> (tempfile::TempPath, Pages) {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let pages = Pages::open_or_create(&path).unwrap();
        (path, pages)
    }

    #[test]
    fn record_is_exactly_48_bytes() {
        assert_eq!(std::mem::size_of::<Inode>(), INODE_SIZE);
        assert_eq!(INODE_COUNT, 170);
    }

    #[test]
    fn new_records_start_with_one_reference_and_no_pages() {
        let node = Inode::new(MODE_FILE | 0o644, 7);
        assert_eq!(node.refs(), 1);
        assert_eq!(node.size(), 0);
        assert_eq!(node.direct(0), None);
        assert_eq!(node.direct(1), None);
        assert_eq!(node.indirect(), None);
        assert_eq!(node.ctime(), 7);
        assert!(!node.is_dir());
    }

    #[test]
    fn mode_type_checks() {
        assert!(Inode::new(MODE_DIR | 0o755, 0).is_dir());
        assert!(Inode::new(MODE_SYMLINK | 0o777, 0).is_symlink());
        assert!(!Inode::new(MODE_FILE | 0o644, 0).is_dir());
    }

    #[test]
    fn records_round_trip_through_the_table() {
        let (_path, mut pages) = temp_pages();
        let inum = alloc(&mut pages, MODE_FILE | 0o644, 42).unwrap();

        let mut node = get(&pages, inum).unwrap();
        node.set_size(1234);
        node.set_direct(0, Some(9));
        put(&mut pages, inum, &node).unwrap();

        let read = get(&pages, inum).unwrap();
        assert_eq!(read.size(), 1234);
        assert_eq!(read.direct(0), Some(9));
        assert_eq!(read.mtime(), 42);
    }

    #[test]
    fn alloc_hands_out_sequential_numbers_and_reuses_freed_ones() {
        let (_path, mut pages) = temp_pages();
        // Reserve the root number the way store initialization does.
        alloc::put(pages.inode_bitmap_mut(), ROOT_INUM as usize, State::Used);
        let a = alloc(&mut pages, MODE_FILE, 0).unwrap();
        let b = alloc(&mut pages, MODE_FILE, 0).unwrap();
        assert_eq!(b, a + 1);

        free(&mut pages, a);
        assert_eq!(alloc(&mut pages, MODE_FILE, 0).unwrap(), a);
    }

    #[test]
    fn root_inode_cannot_be_freed() {
        let (_path, mut pages) = temp_pages();
        alloc::put(pages.inode_bitmap_mut(), ROOT_INUM as usize, State::Used);

        free(&mut pages, ROOT_INUM);
        assert_eq!(alloc::get(pages.inode_bitmap(), ROOT_INUM as usize), State::Used);
    }

    #[test]
    fn out_of_range_numbers_are_rejected() {
        let (_path, pages) = temp_pages();
        match get(&pages, INODE_COUNT as Inum) {
            Err(FsError::InvalidArgument(_)) => (),
            other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
        }
    }
}
