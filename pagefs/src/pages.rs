use std::fs::OpenOptions;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;

use log::{debug, info, warn};

use crate::alloc::{self, State};
use crate::fs::FsError;

/// The page number to access, ranging from 0 (the first page) to
/// `PAGE_COUNT - 1` (the last page).
pub type PageNr = u32;

/// 4k is a common page size for file systems. Disks commonly are composed
/// of 512 byte sectors, mapping each page to 8 hard disk sectors.
pub const PAGE_SIZE: usize = 4096;

/// Fixed store geometry: 256 pages backed by a 1MiB file.
pub const PAGE_COUNT: usize = 256;

/// First page available to the allocator. Page 0 holds the allocation
/// bitmaps, pages 1 and 2 hold the inode table.
pub const DATA_START: PageNr = 3;

/// Page 0 layout: the two allocation bitmaps share the page, 64 bytes
/// (512 bits) apiece.
const INODE_BITMAP: Range<usize> = 0..64;
const PAGE_BITMAP: Range<usize> = 64..128;

const STORE_BYTES: usize = PAGE_COUNT * PAGE_SIZE;

/// A fixed-size array of pages loaded from a backing file. Pages are
/// handed out as slices into one arena, so a page's address is an index,
/// never a pointer; `sync` writes the whole arena back to the file.
pub struct Pages {
    file: std::fs::File,
    buf: Vec<u8>,
}

impl Pages {
    /// Opens the backing file at `path`, creating and zero-filling it if
    /// it does not exist yet. The metadata pages are marked allocated so
    /// the first-fit scan never hands them out.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut buf = Vec::with_capacity(STORE_BYTES);
        file.read_to_end(&mut buf)?;
        match buf.len() {
            0 => {
                info!("formatting fresh page store ({} pages)", PAGE_COUNT);
                buf.resize(STORE_BYTES, 0);
            }
            STORE_BYTES => (),
            n => {
                warn!("backing file is {} bytes, want {}", n, STORE_BYTES);
                return Err(FsError::Corrupt("backing file has the wrong size"));
            }
        }

        let mut pages = Pages { file, buf };
        for nr in 0..DATA_START {
            alloc::put(pages.page_bitmap_mut(), nr as usize, State::Used);
        }
        Ok(pages)
    }

    pub fn page(&self, nr: PageNr) -> &[u8] {
        let nr = nr as usize;
        assert!(nr < PAGE_COUNT, "page {} out of range", nr);
        &self.buf[nr * PAGE_SIZE..(nr + 1) * PAGE_SIZE]
    }

    pub fn page_mut(&mut self, nr: PageNr) -> &mut [u8] {
        let nr = nr as usize;
        assert!(nr < PAGE_COUNT, "page {} out of range", nr);
        &mut self.buf[nr * PAGE_SIZE..(nr + 1) * PAGE_SIZE]
    }

    /// Grants the first free page, zero-filled. The bitmap scan is
    /// first-fit from the front of the store.
    pub fn alloc_page(&mut self) -> Result<PageNr, FsError> {
        let nr = alloc::first_free(self.page_bitmap(), PAGE_COUNT).ok_or(FsError::NoSpace)?;
        alloc::put(self.page_bitmap_mut(), nr, State::Used);
        let nr = nr as PageNr;
        for b in self.page_mut(nr) {
            *b = 0;
        }
        debug!("alloc_page -> {}", nr);
        Ok(nr)
    }

    pub fn free_page(&mut self, nr: PageNr) {
        if nr < DATA_START {
            warn!("refusing to free reserved page {}", nr);
            return;
        }
        alloc::put(self.page_bitmap_mut(), nr as usize, State::Free);
        debug!("free_page({})", nr);
    }

    pub fn inode_bitmap(&self) -> &[u8] {
        &self.buf[INODE_BITMAP]
    }

    pub fn inode_bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.buf[INODE_BITMAP]
    }

    pub fn page_bitmap(&self) -> &[u8] {
        &self.buf[PAGE_BITMAP]
    }

    pub fn page_bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_BITMAP]
    }

    /// Writes the arena back to the backing file and flushes it to disk.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.buf)?;
        self.file.sync_all()?;
        Ok(())
    }
}
