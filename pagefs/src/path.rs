use crate::dir;
use crate::fs::FsError;
use crate::node::{self, Inum, ROOT_INUM};
use crate::pages::Pages;

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// The text after the last slash; the root path yields an empty name.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn walk<'a, I>(pages: &Pages, segs: I) -> Result<Inum, FsError>
where
    I: Iterator<Item = &'a str>,
{
    let mut cur = ROOT_INUM;
    for seg in segs {
        let here = node::get(pages, cur)?;
        if !here.is_dir() {
            return Err(FsError::NotDirectory);
        }
        cur = dir::lookup_inum(pages, &here, seg)?.ok_or(FsError::NotFound)?;
    }
    Ok(cur)
}

/// Resolves a slash-delimited path to the inode number of its final
/// component, one directory lookup per segment starting from the root.
/// `"/"` is the root itself, with no lookups at all.
pub fn resolve(pages: &Pages, path: &str) -> Result<Inum, FsError> {
    walk(pages, segments(path))
}

/// Resolves a path to the directory that holds its final component; the
/// parent of `"/"` is the root.
pub fn resolve_parent(pages: &Pages, path: &str) -> Result<Inum, FsError> {
    let segs: Vec<&str> = segments(path).collect();
    let parents = segs.len().saturating_sub(1);
    walk(pages, segs.into_iter().take(parents))
}
