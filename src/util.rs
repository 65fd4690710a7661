use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{io_err, PatchError, Result};
use crate::interrupt::{self, Interrupter, COPY_BUFFER_SIZE};
use crate::patch_format::FileRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Walk a directory tree into a `relative path -> entry` map.
/// Hidden entries (and everything below a hidden directory) are skipped.
/// Paths use forward slashes for cross-platform consistency in the patch format.
pub fn walk_directory(root: &Path) -> Result<BTreeMap<String, DirEntry>> {
    let root = root.canonicalize().map_err(|e| io_err(root, e))?;

    let mut entries = BTreeMap::new();

    let walker = WalkDir::new(&root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_hidden(e));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            io_err(path, source)
        })?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .map_err(|_| PatchError::format(format!("{} escapes root", full_path.display())))?;
        let relative_str = path_to_str(relative)?.replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let size = if kind == EntryKind::File {
            entry
                .metadata()
                .map_err(|e| {
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                    io_err(&full_path, source)
                })?
                .len()
        } else {
            0
        };

        entries.insert(
            relative_str,
            DirEntry {
                kind,
                full_path,
                size,
            },
        );
    }

    Ok(entries)
}

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| PatchError::NonUtf8Path(path.to_path_buf()))
}

/// Read-only view of a whole file. Zero-length files are not mapped.
pub enum FileView {
    Empty,
    Mapped(Mmap),
}

impl Deref for FileView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileView::Empty => &[],
            FileView::Mapped(map) => map,
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the view is live.
pub fn map_file(path: &Path) -> Result<FileView> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let len = file.metadata().map_err(|e| io_err(path, e))?.len();
    if len == 0 {
        return Ok(FileView::Empty);
    }
    // SAFETY: We only read from this mapping; the target tree is exclusively
    // owned by one session.
    unsafe { Mmap::map(&file) }
        .map(FileView::Mapped)
        .map_err(|e| io_err(path, e))
}

pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Stream-hash a file with BLAKE3, checking the interrupter per buffer.
pub fn hash_file(path: &Path, interrupter: &Interrupter) -> Result<FileRef> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();
    let length = interrupt::copy_to_end(&mut reader, &mut hasher, interrupter, path, path)?;
    Ok(FileRef {
        checksum: hasher.finalize().to_hex().to_string(),
        length,
    })
}

/// Whether the file at `path` is exactly `expected`. A length mismatch is
/// decided without reading content.
pub fn file_matches(path: &Path, expected: &FileRef, interrupter: &Interrupter) -> Result<bool> {
    let len = std::fs::metadata(path).map_err(|e| io_err(path, e))?.len();
    if len != expected.length {
        return Ok(false);
    }
    Ok(hash_file(path, interrupter)?.checksum == expected.checksum)
}

/// Byte-for-byte comparison of two files.
pub fn same_content(a: &DirEntry, b: &DirEntry) -> Result<bool> {
    if a.size != b.size {
        return Ok(false);
    }
    let a_view = map_file(&a.full_path)?;
    let b_view = map_file(&b.full_path)?;
    Ok(*a_view == *b_view)
}

/// Directory exists and has no entries.
pub fn dir_is_empty(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| io_err(path, e))?;
    Ok(entries.next().is_none())
}

pub fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}
