use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use crate::binary_diff;
use crate::container::{self, Compression, ContainerCipher};
use crate::error::{io_err, Result};
use crate::interrupt::{self, Interrupter};
use crate::patch_format::{
    EncryptionDescriptor, FileRef, FileType, Operation, OperationKind, PatchKind, PatchManifest,
    PayloadRange, ValidationFile, VersionRange,
};
use crate::util::{self, DirEntry, EntryKind};

/// Metadata stamped into a built manifest.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub id: String,
    pub versions: VersionRange,
    pub encryption: Option<EncryptionDescriptor>,
}

/// Where an operation's payload bytes come from.
enum PayloadSource<'a> {
    None,
    File(&'a Path),
    Bytes(Vec<u8>),
}

struct PlannedOp<'a> {
    kind: OperationKind,
    file_type: FileType,
    path: String,
    old_ref: Option<FileRef>,
    new_ref: Option<FileRef>,
    payload: PayloadSource<'a>,
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::File,
        EntryKind::Dir => FileType::Directory,
    }
}

/// Hash every file entry in parallel.
fn hash_files<'a, I>(entries: I, interrupter: &Interrupter) -> Result<HashMap<String, FileRef>>
where
    I: IntoIterator<Item = (&'a String, &'a DirEntry)>,
{
    let files: Vec<(&String, &DirEntry)> = entries
        .into_iter()
        .filter(|(_, e)| e.kind == EntryKind::File)
        .collect();
    files
        .par_iter()
        .map(|(path, entry)| Ok(((*path).clone(), util::hash_file(&entry.full_path, interrupter)?)))
        .collect()
}

/// Diff result for a file present in both trees with different content.
struct Changed {
    path: String,
    /// `None` when the delta would not be smaller than the new file.
    delta: Option<Vec<u8>>,
}

fn diff_changed_files(
    pairs: &[(&String, &DirEntry, &DirEntry)],
    interrupter: &Interrupter,
) -> Result<Vec<Changed>> {
    pairs
        .par_iter()
        .map(|(path, old, new)| -> Result<Option<Changed>> {
            interrupter.checkpoint()?;
            if util::same_content(old, new)? {
                return Ok(None);
            }
            let delta = {
                let old_data = util::map_file(&old.full_path)?;
                let new_data = util::map_file(&new.full_path)?;
                binary_diff::encode_delta(&binary_diff::compute_diff(&old_data, &new_data))?
            };
            let smaller = (delta.len() as u64) < new.size;
            Ok(Some(Changed {
                path: (*path).clone(),
                delta: smaller.then_some(delta),
            }))
        })
        .collect::<Result<Vec<_>>>()
        .map(|v| v.into_iter().flatten().collect())
}

/// Diff `old` against `new` (or describe `new` alone for a full patch),
/// writing operation payloads to `payload` in operation order.
pub fn build_manifest(
    old: Option<&Path>,
    new: &Path,
    options: &BuildOptions,
    payload: &mut dyn Write,
    interrupter: &Interrupter,
) -> Result<PatchManifest> {
    let new_entries = util::walk_directory(new)?;
    let new_refs = hash_files(&new_entries, interrupter)?;

    let (kind, planned) = match old {
        None => (PatchKind::Full, plan_full(&new_entries, &new_refs)),
        Some(old) => {
            let old_entries = util::walk_directory(old)?;
            let planned = plan_incremental(&old_entries, &new_entries, &new_refs, interrupter)?;
            (PatchKind::Incremental, planned)
        }
    };

    let mut operations = Vec::with_capacity(planned.len());
    let mut offset = 0u64;
    for (index, op) in planned.into_iter().enumerate() {
        let range = match op.payload {
            PayloadSource::None => None,
            PayloadSource::File(path) => {
                let length = op.new_ref.as_ref().map_or(0, |r| r.length);
                let mut reader = BufReader::new(File::open(path).map_err(|e| io_err(path, e))?);
                interrupt::copy_exact(&mut reader, payload, length, interrupter, path, Path::new("<payload>"))?;
                Some(PayloadRange { offset, length })
            }
            PayloadSource::Bytes(bytes) => {
                payload
                    .write_all(&bytes)
                    .map_err(|e| io_err("<payload>", e))?;
                Some(PayloadRange {
                    offset,
                    length: bytes.len() as u64,
                })
            }
        };
        if let Some(range) = range {
            offset = range.end();
        }
        operations.push(Operation {
            id: index as u32 + 1,
            kind: op.kind,
            file_type: op.file_type,
            dest_path: op.path,
            payload: range,
            old_ref: op.old_ref,
            new_ref: op.new_ref,
        });
    }

    let validations = new_entries
        .iter()
        .map(|(path, entry)| match entry.kind {
            EntryKind::Dir => ValidationFile::directory(path.clone()),
            EntryKind::File => ValidationFile::file(path.clone(), &new_refs[path]),
        })
        .collect();

    let manifest = PatchManifest {
        id: options.id.clone(),
        kind,
        versions: options.versions.clone(),
        operations,
        validations,
        encryption: options.encryption.clone(),
    };
    manifest.check()?;

    tracing::info!(
        id = %manifest.id,
        kind = ?manifest.kind,
        operations = manifest.operations.len(),
        payload_bytes = offset,
        "built manifest"
    );
    Ok(manifest)
}

fn plan_full<'a>(
    new_entries: &'a BTreeMap<String, DirEntry>,
    new_refs: &HashMap<String, FileRef>,
) -> Vec<PlannedOp<'a>> {
    new_entries
        .iter()
        .map(|(path, entry)| PlannedOp {
            kind: OperationKind::Force,
            file_type: file_type(entry.kind),
            path: path.clone(),
            old_ref: None,
            new_ref: new_refs.get(path).cloned(),
            payload: match entry.kind {
                EntryKind::File => PayloadSource::File(&entry.full_path),
                EntryKind::Dir => PayloadSource::None,
            },
        })
        .collect()
}

/// Only `new_entries` is borrowed by the plan; removals carry no payload.
fn plan_incremental<'a>(
    old_entries: &BTreeMap<String, DirEntry>,
    new_entries: &'a BTreeMap<String, DirEntry>,
    new_refs: &HashMap<String, FileRef>,
    interrupter: &Interrupter,
) -> Result<Vec<PlannedOp<'a>>> {
    let mut removed: Vec<(&String, &DirEntry)> = Vec::new();
    let mut added: Vec<(&String, &DirEntry)> = Vec::new();
    let mut maybe_changed: Vec<(&String, &DirEntry, &DirEntry)> = Vec::new();

    for (path, old) in old_entries {
        match new_entries.get(path) {
            None => removed.push((path, old)),
            Some(new) if new.kind != old.kind => {
                removed.push((path, old));
                added.push((path, new));
            }
            Some(new) if new.kind == EntryKind::File => maybe_changed.push((path, old, new)),
            Some(_) => {}
        }
    }
    for (path, new) in new_entries {
        if !old_entries.contains_key(path) {
            added.push((path, new));
        }
    }

    let old_refs = hash_files(
        removed
            .iter()
            .copied()
            .chain(maybe_changed.iter().map(|(p, o, _)| (*p, *o))),
        interrupter,
    )?;
    let changed = diff_changed_files(&maybe_changed, interrupter)?;

    // Removes first, deepest path first; then content changes; then additions,
    // parents first. A file<->directory swap thus removes before it creates.
    removed.sort_by(|a, b| b.0.cmp(a.0));
    added.sort_by(|a, b| a.0.cmp(b.0));

    let mut planned = Vec::with_capacity(removed.len() + changed.len() + added.len());
    for (path, old) in removed {
        planned.push(PlannedOp {
            kind: OperationKind::Remove,
            file_type: file_type(old.kind),
            path: path.clone(),
            old_ref: old_refs.get(path).cloned(),
            new_ref: None,
            payload: PayloadSource::None,
        });
    }
    for change in changed {
        let new = &new_entries[&change.path];
        let (kind, payload) = match change.delta {
            Some(delta) => (OperationKind::Patch, PayloadSource::Bytes(delta)),
            None => (OperationKind::Replace, PayloadSource::File(&new.full_path)),
        };
        planned.push(PlannedOp {
            kind,
            file_type: FileType::File,
            old_ref: old_refs.get(&change.path).cloned(),
            new_ref: new_refs.get(&change.path).cloned(),
            path: change.path,
            payload,
        });
    }
    for (path, new) in added {
        planned.push(PlannedOp {
            kind: OperationKind::New,
            file_type: file_type(new.kind),
            path: path.clone(),
            old_ref: None,
            new_ref: new_refs.get(path).cloned(),
            payload: match new.kind {
                EntryKind::File => PayloadSource::File(&new.full_path),
                EntryKind::Dir => PayloadSource::None,
            },
        });
    }
    Ok(planned)
}

/// Build a patch from `old` (or a full patch when `old` is `None`) to `new`
/// and write it as a container at `output`.
pub fn create_patch(
    old: Option<&Path>,
    new: &Path,
    output: &Path,
    options: &BuildOptions,
    compression: Compression,
    cipher: Option<&dyn ContainerCipher>,
    interrupter: &Interrupter,
) -> Result<PatchManifest> {
    // Payload is spooled so the manifest, which must precede it, is complete.
    let mut spool = tempfile::tempfile().map_err(|e| io_err(output, e))?;
    let manifest = {
        let mut writer = std::io::BufWriter::new(&mut spool);
        let manifest = build_manifest(old, new, options, &mut writer, interrupter)?;
        writer.flush().map_err(|e| io_err("<payload spool>", e))?;
        manifest
    };
    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| io_err("<payload spool>", e))?;
    let mut reader = BufReader::new(spool);
    container::write_container(output, &manifest, &mut reader, compression, cipher, interrupter)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::VersionFrom;

    fn options() -> BuildOptions {
        BuildOptions {
            id: "t".into(),
            versions: VersionRange {
                from: VersionFrom::Exact("1.0".parse().unwrap()),
                to: "1.1".parse().unwrap(),
            },
            encryption: None,
        }
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let full = root.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    fn kinds(m: &PatchManifest) -> Vec<(OperationKind, &str)> {
        m.operations
            .iter()
            .map(|o| (o.kind, o.dest_path.as_str()))
            .collect()
    }

    #[test]
    fn test_ordering_removes_then_changes_then_additions() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        write(old.path(), "gone/a.txt", b"a");
        write(old.path(), "keep.txt", b"old keep");
        write(new.path(), "keep.txt", b"new keep!");
        write(new.path(), "fresh/b.txt", b"b");

        let mut payload = Vec::new();
        let m = build_manifest(Some(old.path()), new.path(), &options(), &mut payload, &Interrupter::new())
            .unwrap();
        assert_eq!(
            kinds(&m),
            vec![
                (OperationKind::Remove, "gone/a.txt"),
                (OperationKind::Remove, "gone"),
                (OperationKind::Replace, "keep.txt"),
                (OperationKind::New, "fresh"),
                (OperationKind::New, "fresh/b.txt"),
            ]
        );
        assert_eq!(m.payload_length(), payload.len() as u64);
        assert_eq!(m.validations.len(), 3);
    }

    #[test]
    fn test_identical_trees_produce_no_operations() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        for root in [old.path(), new.path()] {
            write(root, "a/b.txt", b"same");
        }
        let mut payload = Vec::new();
        let m = build_manifest(Some(old.path()), new.path(), &options(), &mut payload, &Interrupter::new())
            .unwrap();
        assert!(m.operations.is_empty());
        assert!(payload.is_empty());
        assert_eq!(m.validations.len(), 2);
    }

    #[test]
    fn test_small_change_in_large_file_is_patch() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 253) as u8).collect();
        let mut changed = data.clone();
        changed[100] ^= 0xFF;
        write(old.path(), "big.bin", &data);
        write(new.path(), "big.bin", &changed);

        let mut payload = Vec::new();
        let m = build_manifest(Some(old.path()), new.path(), &options(), &mut payload, &Interrupter::new())
            .unwrap();
        let op = &m.operations[0];
        assert_eq!(op.kind, OperationKind::Patch);
        assert!(op.payload_length() < changed.len() as u64);
        assert_eq!(op.old_ref.as_ref().unwrap().length, data.len() as u64);
    }

    #[test]
    fn test_full_patch_is_force_only() {
        let new = tempfile::tempdir().unwrap();
        write(new.path(), "d/f.txt", b"content");
        let mut payload = Vec::new();
        let m = build_manifest(None, new.path(), &options(), &mut payload, &Interrupter::new()).unwrap();
        assert_eq!(m.kind, PatchKind::Full);
        assert_eq!(
            kinds(&m),
            vec![(OperationKind::Force, "d"), (OperationKind::Force, "d/f.txt")]
        );
        assert_eq!(payload, b"content");
    }
}
