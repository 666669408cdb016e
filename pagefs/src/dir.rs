use std::convert::TryInto;

use log::debug;

use crate::fs::FsError;
use crate::node::{Inode, Inum};
use crate::pages::{PageNr, Pages, PAGE_SIZE};

/// Capacity of a dirent's name field, NUL terminator included.
pub const DIR_NAME: usize = 48;
/// On-disk size of one directory entry: the name, a signed 32-bit inode
/// number (-1 marks an empty slot), and reserved padding.
const DIRENT_SIZE: usize = 64;
const INUM_OFF: usize = DIR_NAME;
const EMPTY: i32 = -1;

/// 64 entries fit one page. A directory spans at most two pages, so its
/// capacity is exactly `2 * ENTRIES_PER_PAGE` names; combined entry
/// indices place the second page at `ENTRIES_PER_PAGE..`.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE / DIRENT_SIZE;

fn slot_inum(page: &[u8], idx: usize) -> Option<Inum> {
    let off = idx * DIRENT_SIZE + INUM_OFF;
    let v = i32::from_le_bytes(page[off..off + 4].try_into().unwrap());
    if v < 0 {
        None
    } else {
        Some(v as Inum)
    }
}

/// The stored name, up to its terminator.
fn slot_name(page: &[u8], idx: usize) -> &[u8] {
    let name = &page[idx * DIRENT_SIZE..idx * DIRENT_SIZE + DIR_NAME];
    let end = name.iter().position(|&b| b == 0).unwrap_or(DIR_NAME);
    &name[..end]
}

fn write_slot(page: &mut [u8], idx: usize, name: &str, inum: Inum) {
    let slot = &mut page[idx * DIRENT_SIZE..(idx + 1) * DIRENT_SIZE];
    for b in slot.iter_mut() {
        *b = 0;
    }
    slot[..name.len()].copy_from_slice(name.as_bytes());
    slot[INUM_OFF..INUM_OFF + 4].copy_from_slice(&(inum as i32).to_le_bytes());
}

fn clear_slot(page: &mut [u8], idx: usize) {
    let off = idx * DIRENT_SIZE + INUM_OFF;
    page[off..off + 4].copy_from_slice(&EMPTY.to_le_bytes());
}

/// Scans one page for a live entry with this name.
fn find(page: &[u8], name: &[u8]) -> Option<(usize, Inum)> {
    (0..ENTRIES_PER_PAGE)
        .filter_map(|i| slot_inum(page, i).map(|inum| (i, inum)))
        .find(|&(i, _)| slot_name(page, i) == name)
}

fn free_slot(page: &[u8]) -> Option<usize> {
    (0..ENTRIES_PER_PAGE).find(|&i| slot_inum(page, i).is_none())
}

fn first_page(dir: &Inode) -> Result<PageNr, FsError> {
    dir.direct(0).ok_or(FsError::Corrupt("directory has no first page"))
}

/// The overflow page, when the directory has grown onto it.
fn second_page(dir: &Inode) -> Option<PageNr> {
    if dir.size() >= (2 * PAGE_SIZE) as u64 {
        dir.direct(1)
    } else {
        None
    }
}

/// Marks every slot of a fresh directory page empty.
pub fn clear_page(pages: &mut Pages, nr: PageNr) {
    let page = pages.page_mut(nr);
    for idx in 0..ENTRIES_PER_PAGE {
        clear_slot(page, idx);
    }
}

fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name.contains('/') {
        return Err(FsError::InvalidArgument(format!(
            "bad entry name {:?}",
            name
        )));
    }
    if name.len() >= DIR_NAME {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Combined entry index of `name`, if present.
pub fn lookup(pages: &Pages, dir: &Inode, name: &str) -> Result<Option<usize>, FsError> {
    let pg0 = first_page(dir)?;
    if let Some((idx, _)) = find(pages.page(pg0), name.as_bytes()) {
        return Ok(Some(idx));
    }
    if let Some(pg1) = second_page(dir) {
        if let Some((idx, _)) = find(pages.page(pg1), name.as_bytes()) {
            return Ok(Some(ENTRIES_PER_PAGE + idx));
        }
    }
    Ok(None)
}

/// The inode number stored under `name`, if present.
pub fn lookup_inum(pages: &Pages, dir: &Inode, name: &str) -> Result<Option<Inum>, FsError> {
    let pg0 = first_page(dir)?;
    if let Some((_, inum)) = find(pages.page(pg0), name.as_bytes()) {
        return Ok(Some(inum));
    }
    if let Some(pg1) = second_page(dir) {
        if let Some((_, inum)) = find(pages.page(pg1), name.as_bytes()) {
            return Ok(Some(inum));
        }
    }
    Ok(None)
}

/// Binds `name` to `inum` in the first empty slot, bringing the overflow
/// page online when the first page fills. Duplicate names are rejected
/// outright rather than shadowed. Mutates the directory inode (size,
/// overflow pointer); the caller writes it back.
pub fn put(pages: &mut Pages, dir: &mut Inode, name: &str, inum: Inum) -> Result<usize, FsError> {
    check_name(name)?;
    if lookup(pages, dir, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }

    let pg0 = first_page(dir)?;
    if let Some(idx) = free_slot(pages.page(pg0)) {
        write_slot(pages.page_mut(pg0), idx, name, inum);
        return Ok(idx);
    }

    if dir.size() < (2 * PAGE_SIZE) as u64 {
        let pg1 = pages.alloc_page()?;
        clear_page(pages, pg1);
        dir.set_direct(1, Some(pg1));
        dir.set_size((2 * PAGE_SIZE) as u64);
        debug!("directory grew onto overflow page {}", pg1);
    }
    let pg1 = dir
        .direct(1)
        .ok_or(FsError::Corrupt("directory overflow page missing"))?;
    if let Some(idx) = free_slot(pages.page(pg1)) {
        write_slot(pages.page_mut(pg1), idx, name, inum);
        return Ok(ENTRIES_PER_PAGE + idx);
    }
    Err(FsError::NoSpace)
}

/// Empties the slot holding `name` in place and hands back the inode
/// number it held. Later entries keep their positions; the gap is reused
/// by the next `put`.
pub fn delete(pages: &mut Pages, dir: &Inode, name: &str) -> Result<Inum, FsError> {
    let pg0 = first_page(dir)?;
    if let Some((idx, inum)) = find(pages.page(pg0), name.as_bytes()) {
        clear_slot(pages.page_mut(pg0), idx);
        return Ok(inum);
    }
    if let Some(pg1) = second_page(dir) {
        if let Some((idx, inum)) = find(pages.page(pg1), name.as_bytes()) {
            clear_slot(pages.page_mut(pg1), idx);
            return Ok(inum);
        }
    }
    Err(FsError::NotFound)
}

/// All live names, first page then overflow page, in slot order.
pub fn list(pages: &Pages, dir: &Inode) -> Result<Vec<String>, FsError> {
    let mut names = list_page(pages.page(first_page(dir)?));
    if let Some(pg1) = second_page(dir) {
        names.extend(list_page(pages.page(pg1)));
    }
    Ok(names)
}

fn list_page(page: &[u8]) -> Vec<String> {
    (0..ENTRIES_PER_PAGE)
        .filter(|&i| slot_inum(page, i).is_some())
        .map(|i| String::from_utf8_lossy(slot_name(page, i)).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MODE_DIR;

    fn temp_dir() -> (tempfile::TempPath, Pages, Inode) {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let mut pages = Pages::open_or_create(&path).unwrap();
        let pg = pages.alloc_page().unwrap();
        clear_page(&mut pages, pg);
        let mut dir = Inode::new(MODE_DIR | 0o755, 0);
        dir.set_direct(0, Some(pg));
        dir.set_size(PAGE_SIZE as u64);
        (path, pages, dir)
    }

    #[test]
    fn put_then_lookup_returns_the_inserted_inode() {
        let (_path, mut pages, mut dir) = temp_dir();

        put(&mut pages, &mut dir, "hello.txt", 7).unwrap();

        assert_eq!(lookup_inum(&pages, &dir, "hello.txt").unwrap(), Some(7));
        assert_eq!(lookup(&pages, &dir, "hello.txt").unwrap(), Some(0));
        assert_eq!(lookup_inum(&pages, &dir, "other").unwrap(), None);
    }

    #[test]
    fn deleted_names_stop_resolving() {
        let (_path, mut pages, mut dir) = temp_dir();
        put(&mut pages, &mut dir, "a", 1).unwrap();
        put(&mut pages, &mut dir, "b", 2).unwrap();

        assert_eq!(delete(&mut pages, &dir, "a").unwrap(), 1);

        assert_eq!(lookup_inum(&pages, &dir, "a").unwrap(), None);
        assert_eq!(lookup_inum(&pages, &dir, "b").unwrap(), Some(2));
        match delete(&mut pages, &dir, "a") {
            Err(FsError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn deletion_leaves_a_gap_that_put_reuses() {
        let (_path, mut pages, mut dir) = temp_dir();
        let a = put(&mut pages, &mut dir, "a", 1).unwrap();
        put(&mut pages, &mut dir, "b", 2).unwrap();

        delete(&mut pages, &dir, "a").unwrap();
        let c = put(&mut pages, &mut dir, "c", 3).unwrap();

        // The freed slot is the first tombstone the scan finds.
        assert_eq!(c, a);
        assert_eq!(list(&pages, &dir).unwrap(), vec!["c", "b"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (_path, mut pages, mut dir) = temp_dir();
        put(&mut pages, &mut dir, "a", 1).unwrap();

        match put(&mut pages, &mut dir, "a", 2) {
            Err(FsError::AlreadyExists) => (),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        assert_eq!(lookup_inum(&pages, &dir, "a").unwrap(), Some(1));
    }

    #[test]
    fn filling_the_first_page_brings_the_overflow_page_online() {
        let (_path, mut pages, mut dir) = temp_dir();
        for i in 0..ENTRIES_PER_PAGE {
            put(&mut pages, &mut dir, &format!("f{}", i), i as Inum).unwrap();
        }
        assert_eq!(dir.size(), PAGE_SIZE as u64);

        let idx = put(&mut pages, &mut dir, "overflow", 999).unwrap();

        assert_eq!(idx, ENTRIES_PER_PAGE);
        assert_eq!(dir.size(), (2 * PAGE_SIZE) as u64);
        assert!(dir.direct(1).is_some());
        assert_eq!(lookup_inum(&pages, &dir, "overflow").unwrap(), Some(999));
        assert_eq!(lookup(&pages, &dir, "overflow").unwrap(), Some(ENTRIES_PER_PAGE));
    }

    #[test]
    fn entries_on_the_overflow_page_can_be_deleted_and_listed() {
        let (_path, mut pages, mut dir) = temp_dir();
        for i in 0..ENTRIES_PER_PAGE + 2 {
            put(&mut pages, &mut dir, &format!("f{}", i), i as Inum).unwrap();
        }

        let names = list(&pages, &dir).unwrap();
        assert_eq!(names.len(), ENTRIES_PER_PAGE + 2);
        assert_eq!(names[ENTRIES_PER_PAGE], format!("f{}", ENTRIES_PER_PAGE));

        let last = format!("f{}", ENTRIES_PER_PAGE + 1);
        assert_eq!(
            delete(&mut pages, &dir, &last).unwrap(),
            (ENTRIES_PER_PAGE + 1) as Inum
        );
        assert_eq!(lookup_inum(&pages, &dir, &last).unwrap(), None);
    }

    #[test]
    fn a_directory_holds_at_most_two_pages_of_entries() {
        let (_path, mut pages, mut dir) = temp_dir();
        for i in 0..2 * ENTRIES_PER_PAGE {
            put(&mut pages, &mut dir, &format!("f{}", i), i as Inum).unwrap();
        }

        match put(&mut pages, &mut dir, "one-too-many", 0) {
            Err(FsError::NoSpace) => (),
            other => panic!("expected NoSpace, got {:?}", other),
        }
    }

    #[test]
    fn names_at_the_capacity_limit_are_rejected() {
        let (_path, mut pages, mut dir) = temp_dir();
        let longest = "n".repeat(DIR_NAME - 1);
        put(&mut pages, &mut dir, &longest, 1).unwrap();
        assert_eq!(lookup_inum(&pages, &dir, &longest).unwrap(), Some(1));

        match put(&mut pages, &mut dir, &"n".repeat(DIR_NAME), 2) {
            Err(FsError::NameTooLong) => (),
            other => panic!("expected NameTooLong, got {:?}", other),
        }
        match put(&mut pages, &mut dir, "", 3) {
            Err(FsError::InvalidArgument(_)) => (),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}
