use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use thiserror::Error;

use crate::alloc::{self, State};
use crate::dir;
use crate::file;
use crate::node::{self, Inode, Inum, MODE_DIR, MODE_PERM_MASK, MODE_SYMLINK, MODE_TYPE_MASK, ROOT_INUM};
use crate::pages::{Pages, PAGE_SIZE};
use crate::path;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("no space left in the store")]
    NoSpace,
    #[error("not a directory")]
    NotDirectory,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("name is too long for a directory entry")]
    NameTooLong,
    #[error("file exceeds the block map's reach")]
    FileTooLarge,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("backing store I/O failed")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno a syscall dispatch layer should reply with.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => 2,                    // ENOENT
            FsError::AlreadyExists => 17,              // EEXIST
            FsError::NoSpace => 28,                    // ENOSPC
            FsError::NotDirectory => 20,               // ENOTDIR
            FsError::NotEmpty => 39,                   // ENOTEMPTY
            FsError::NameTooLong => 36,                // ENAMETOOLONG
            FsError::FileTooLarge => 27,               // EFBIG
            FsError::InvalidArgument(_) => 22,         // EINVAL
            FsError::Corrupt(_) | FsError::Io(_) => 5, // EIO
        }
    }
}

/// Attribute record shaped for a `stat`-style reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
}

fn now_secs() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}

/// A hierarchical namespace over one page store. Every operation takes a
/// slash-delimited path, resolves it against the directory tree, and acts
/// through the inode's block map.
///
/// There is no internal locking: `&mut self` on every mutating call is
/// the whole concurrency story, so a dispatch layer driving this from
/// several threads must serialize on the handle.
pub struct PageFs {
    pages: Pages,
}

impl PageFs {
    /// Opens the backing store at `path`, creating and formatting it on
    /// first use. Reopening an initialized store leaves it untouched.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let pages = Pages::open_or_create(path)?;
        let mut fs = PageFs { pages };
        fs.init_root()?;
        Ok(fs)
    }

    /// The root directory is created exactly once per store; a live root
    /// is recognized by its nonzero reference count.
    fn init_root(&mut self) -> Result<(), FsError> {
        if node::get(&self.pages, ROOT_INUM)?.refs() > 0 {
            return Ok(());
        }
        alloc::put(self.pages.inode_bitmap_mut(), ROOT_INUM as usize, State::Used);
        let mut root = Inode::new(MODE_DIR | 0o755, now_secs());
        let page = self.pages.alloc_page()?;
        dir::clear_page(&mut self.pages, page);
        root.set_direct(0, Some(page));
        root.set_size(PAGE_SIZE as u64);
        node::put(&mut self.pages, ROOT_INUM, &root)?;
        info!("initialized root directory on page {}", page);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pages(&self) -> &Pages {
        &self.pages
    }

    fn node_at(&self, path: &str) -> Result<(Inum, Inode), FsError> {
        let inum = path::resolve(&self.pages, path)?;
        Ok((inum, node::get(&self.pages, inum)?))
    }

    fn parent_dir(&self, path: &str) -> Result<(Inum, Inode), FsError> {
        let inum = path::resolve_parent(&self.pages, path)?;
        let node = node::get(&self.pages, inum)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok((inum, node))
    }

    /// Existence check; the access mask itself is not enforced.
    pub fn access(&self, path: &str) -> Result<(), FsError> {
        path::resolve(&self.pages, path).map(|_| ())
    }

    pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        let (_, node) = self.node_at(path)?;
        let attr = Attr {
            mode: node.mode(),
            nlink: node.refs(),
            size: node.size(),
            blksize: PAGE_SIZE as u32,
            blocks: file::pages_spanned(node.size()),
            ctime: node.ctime(),
            mtime: node.mtime(),
            atime: node.atime(),
        };
        debug!("getattr({}) -> mode {:o}, size {}", path, attr.mode, attr.size);
        Ok(attr)
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<String>, FsError> {
        let (inum, mut node) = self.node_at(path)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let names = dir::list(&self.pages, &node)?;
        node.set_atime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("readdir({}) -> {} entries", path, names.len());
        Ok(names)
    }

    /// Creates a file system object: allocates an inode, then binds the
    /// path's final component to it. The inode is released again if the
    /// directory insert fails.
    pub fn mknod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let (parent_inum, mut parent) = self.parent_dir(path)?;
        let name = path::basename(path);
        let now = now_secs();
        let inum = node::alloc(&mut self.pages, mode, now)?;
        if let Err(e) = dir::put(&mut self.pages, &mut parent, name, inum) {
            node::free(&mut self.pages, inum);
            return Err(e);
        }
        parent.set_mtime(now);
        node::put(&mut self.pages, parent_inum, &parent)?;
        debug!("mknod({}, {:o}) -> inode {}", path, mode, inum);
        Ok(())
    }

    /// Creates a directory: an inode with the directory mode bit plus a
    /// tombstone-initialized first entry page.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let (parent_inum, mut parent) = self.parent_dir(path)?;
        let name = path::basename(path);
        let now = now_secs();
        let inum = node::alloc(&mut self.pages, mode | MODE_DIR, now)?;
        let page = match self.pages.alloc_page() {
            Ok(page) => page,
            Err(e) => {
                node::free(&mut self.pages, inum);
                return Err(e);
            }
        };
        dir::clear_page(&mut self.pages, page);
        let mut node = node::get(&self.pages, inum)?;
        node.set_direct(0, Some(page));
        node.set_size(PAGE_SIZE as u64);
        node::put(&mut self.pages, inum, &node)?;
        if let Err(e) = dir::put(&mut self.pages, &mut parent, name, inum) {
            self.pages.free_page(page);
            node::free(&mut self.pages, inum);
            return Err(e);
        }
        parent.set_mtime(now);
        node::put(&mut self.pages, parent_inum, &parent)?;
        debug!("mkdir({}) -> inode {}", path, inum);
        Ok(())
    }

    /// Hard link: a second directory entry for an existing inode.
    pub fn link(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let inum = path::resolve(&self.pages, from)?;
        let (to_parent_inum, mut to_parent) = self.parent_dir(to)?;
        dir::put(&mut self.pages, &mut to_parent, path::basename(to), inum)?;
        let now = now_secs();
        to_parent.set_mtime(now);
        node::put(&mut self.pages, to_parent_inum, &to_parent)?;

        let mut node = node::get(&self.pages, inum)?;
        node.set_refs(node.refs() + 1);
        node.set_mtime(now);
        node::put(&mut self.pages, inum, &node)?;
        debug!("link({} => {}) -> inode {}", from, to, inum);
        Ok(())
    }

    /// Removes the entry; the inode and its pages are released once the
    /// last name is gone.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let (parent_inum, mut parent) = self.parent_dir(path)?;
        let name = path::basename(path);
        let inum = dir::delete(&mut self.pages, &parent, name)?;
        let now = now_secs();
        parent.set_mtime(now);
        node::put(&mut self.pages, parent_inum, &parent)?;

        let mut node = node::get(&self.pages, inum)?;
        let refs = node.refs().saturating_sub(1);
        node.set_refs(refs);
        node.set_mtime(now);
        if refs == 0 {
            file::shrink(&mut self.pages, &mut node, 0)?;
            node::put(&mut self.pages, inum, &node)?;
            node::free(&mut self.pages, inum);
        } else {
            node::put(&mut self.pages, inum, &node)?;
        }
        debug!("unlink({}) -> inode {}", path, inum);
        Ok(())
    }

    /// Removes a directory, refusing while it still has entries.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let (inum, node) = self.node_at(path)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if inum == ROOT_INUM {
            return Err(FsError::InvalidArgument(
                "cannot remove the root directory".to_string(),
            ));
        }
        if !dir::list(&self.pages, &node)?.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.unlink(path)?;
        debug!("rmdir({})", path);
        Ok(())
    }

    /// Moves an entry: delete from the old directory, insert into the
    /// new one. Refuses when the destination name already exists.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let from_parent = path::resolve_parent(&self.pages, from)?;
        let to_parent = path::resolve_parent(&self.pages, to)?;
        let from_name = path::basename(from);
        let to_name = path::basename(to);
        let now = now_secs();

        if from_parent == to_parent {
            let mut here = node::get(&self.pages, from_parent)?;
            if !here.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if dir::lookup_inum(&self.pages, &here, to_name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            let inum = dir::delete(&mut self.pages, &here, from_name)?;
            if let Err(e) = dir::put(&mut self.pages, &mut here, to_name, inum) {
                // The freed slot is still there; put the old name back.
                if dir::put(&mut self.pages, &mut here, from_name, inum).is_err() {
                    warn!("lost entry {} while renaming to {}", from, to);
                }
                node::put(&mut self.pages, from_parent, &here)?;
                return Err(e);
            }
            here.set_mtime(now);
            node::put(&mut self.pages, from_parent, &here)?;
        } else {
            let mut from_dir = node::get(&self.pages, from_parent)?;
            let mut to_dir = node::get(&self.pages, to_parent)?;
            if !from_dir.is_dir() || !to_dir.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if dir::lookup_inum(&self.pages, &to_dir, to_name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            let inum = dir::delete(&mut self.pages, &from_dir, from_name)?;
            if let Err(e) = dir::put(&mut self.pages, &mut to_dir, to_name, inum) {
                if dir::put(&mut self.pages, &mut from_dir, from_name, inum).is_err() {
                    warn!("lost entry {} while renaming to {}", from, to);
                }
                node::put(&mut self.pages, from_parent, &from_dir)?;
                return Err(e);
            }
            from_dir.set_mtime(now);
            to_dir.set_mtime(now);
            node::put(&mut self.pages, from_parent, &from_dir)?;
            node::put(&mut self.pages, to_parent, &to_dir)?;
        }
        debug!("rename({} => {})", from, to);
        Ok(())
    }

    /// Stores new permission bits; the file-type bits are kept.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let (inum, mut node) = self.node_at(path)?;
        node.set_mode((node.mode() & MODE_TYPE_MASK) | (mode & MODE_PERM_MASK));
        node.set_mtime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("chmod({}, {:o})", path, mode);
        Ok(())
    }

    pub fn truncate(&mut self, path: &str, size: u64) -> Result<(), FsError> {
        let (inum, mut node) = self.node_at(path)?;
        file::truncate(&mut self.pages, &mut node, size)?;
        node.set_mtime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("truncate({}, {})", path, size);
        Ok(())
    }

    /// Open is a timestamp touch; no descriptor state is kept here.
    pub fn open(&mut self, path: &str) -> Result<(), FsError> {
        let (inum, mut node) = self.node_at(path)?;
        node.set_atime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("open({})", path);
        Ok(())
    }

    /// Reads into `buf` starting at `offset`, clamped to the file size.
    /// An offset at or past the end reads zero bytes.
    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let (inum, mut node) = self.node_at(path)?;
        if offset >= node.size() {
            debug!("read({}, {} bytes, @{}) -> 0 (past end)", path, buf.len(), offset);
            return Ok(0);
        }
        let want = (buf.len() as u64).min(node.size() - offset) as usize;
        let got = file::read(&self.pages, &node, &mut buf[..want], offset);
        node.set_atime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("read({}, {} bytes, @{}) -> {}", path, buf.len(), offset, got);
        Ok(got)
    }

    /// Writes `data` at `offset`, extending the file when the write lands
    /// past the current end.
    pub fn write(&mut self, path: &str, data: &[u8], offset: u64) -> Result<usize, FsError> {
        let (inum, mut node) = self.node_at(path)?;
        let written = file::write(&mut self.pages, &mut node, data, offset)?;
        if offset + written as u64 > node.size() {
            node.set_size(offset + written as u64);
        }
        node.set_mtime(now_secs());
        node::put(&mut self.pages, inum, &node)?;
        debug!("write({}, {} bytes, @{}) -> {}", path, data.len(), offset, written);
        Ok(written)
    }

    pub fn utimens(&mut self, path: &str, atime: u64, mtime: u64) -> Result<(), FsError> {
        let (inum, mut node) = self.node_at(path)?;
        node.set_atime(atime);
        node.set_mtime(mtime);
        node::put(&mut self.pages, inum, &node)?;
        debug!("utimens({}, [{}, {}])", path, atime, mtime);
        Ok(())
    }

    /// A symlink is a node with the symlink mode whose content is the
    /// target path.
    pub fn symlink(&mut self, target: &str, linkpath: &str) -> Result<(), FsError> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument("empty symlink target".to_string()));
        }
        self.mknod(linkpath, MODE_SYMLINK | 0o777)?;
        if let Err(e) = self.write(linkpath, target.as_bytes(), 0) {
            let _ = self.unlink(linkpath);
            return Err(e);
        }
        debug!("symlink({} -> {})", linkpath, target);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String, FsError> {
        let (_, node) = self.node_at(path)?;
        if !node.is_symlink() {
            return Err(FsError::InvalidArgument("not a symlink".to_string()));
        }
        let mut buf = vec![0; node.size() as usize];
        file::read(&self.pages, &node, &mut buf, 0);
        String::from_utf8(buf).map_err(|_| FsError::Corrupt("symlink target is not utf-8"))
    }

    /// Flushes the page arena to the backing file.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.pages.sync()
    }
}

impl Drop for PageFs {
    fn drop(&mut self) {
        if let Err(e) = self.pages.sync() {
            warn!("failed to flush page store on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MODE_FILE;

    fn temp_fs() -> (tempfile::TempPath, PageFs) {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let fs = PageFs::open_or_create(&path).unwrap();
        (path, fs)
    }

    #[test]
    fn a_fresh_store_has_an_empty_root_directory() {
        let (_path, mut fs) = temp_fs();
        fs.access("/").unwrap();

        let attr = fs.getattr("/").unwrap();
        assert_eq!(attr.mode, MODE_DIR | 0o755);
        assert_eq!(attr.size, PAGE_SIZE as u64);
        assert_eq!(attr.blocks, 1);

        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn root_initialization_happens_once() {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        {
            let mut fs = PageFs::open_or_create(&path).unwrap();
            fs.mknod("/keep", MODE_FILE | 0o644).unwrap();
        }

        let mut fs = PageFs::open_or_create(&path).unwrap();
        assert_eq!(fs.readdir("/").unwrap(), vec!["keep"]);
    }

    #[test]
    fn missing_entries_report_not_found() {
        let (_path, fs) = temp_fs();
        match fs.access("/nope") {
            Err(FsError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn creating_the_same_name_twice_is_rejected() {
        let (_path, mut fs) = temp_fs();
        fs.mknod("/twice", MODE_FILE | 0o644).unwrap();
        match fs.mknod("/twice", MODE_FILE | 0o644) {
            Err(FsError::AlreadyExists) => (),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[test]
    fn chmod_keeps_the_file_type() {
        let (_path, mut fs) = temp_fs();
        fs.mkdir("/d", 0o755).unwrap();

        fs.chmod("/d", 0o700).unwrap();

        let attr = fs.getattr("/d").unwrap();
        assert_eq!(attr.mode, MODE_DIR | 0o700);
    }

    #[test]
    fn utimens_stores_both_timestamps() {
        let (_path, mut fs) = temp_fs();
        fs.mknod("/t", MODE_FILE | 0o644).unwrap();

        fs.utimens("/t", 1111, 2222).unwrap();

        let attr = fs.getattr("/t").unwrap();
        assert_eq!(attr.atime, 1111);
        assert_eq!(attr.mtime, 2222);
    }

    #[test]
    fn errno_mapping_matches_the_syscall_contract() {
        assert_eq!(FsError::NotFound.errno(), 2);
        assert_eq!(FsError::AlreadyExists.errno(), 17);
        assert_eq!(FsError::NoSpace.errno(), 28);
        assert_eq!(FsError::NotDirectory.errno(), 20);
        assert_eq!(FsError::NotEmpty.errno(), 39);
        assert_eq!(FsError::Corrupt("x").errno(), 5);
    }
}
