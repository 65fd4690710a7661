use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};
use crate::version::Version;

/// Container magic. Followed by one compression-method byte.
pub const MAGIC: &[u8; 5] = b"PATCH";

/// The manifest length prefix is 3 bytes big-endian.
pub const MAX_MANIFEST_LEN: usize = 0xFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    Full,
    Incremental,
}

/// Which installed versions a manifest applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionFrom {
    Exact(Version),
    /// Any version at or above the bound (and below `to`).
    Subsequent(Version),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub from: VersionFrom,
    pub to: Version,
}

impl VersionRange {
    pub fn accepts(&self, installed: &Version) -> bool {
        match &self.from {
            VersionFrom::Exact(v) => v == installed,
            VersionFrom::Subsequent(v) => v <= installed && installed < &self.to,
        }
    }
}

/// Describes the outer encryption layer the container was published with.
/// Key material is never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionDescriptor {
    pub algorithm: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifest {
    pub id: String,
    pub kind: PatchKind,
    pub versions: VersionRange,
    pub operations: Vec<Operation>,
    pub validations: Vec<ValidationFile>,
    pub encryption: Option<EncryptionDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    New,
    Remove,
    Patch,
    Replace,
    Force,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::New => "new",
            OperationKind::Remove => "remove",
            OperationKind::Patch => "patch",
            OperationKind::Replace => "replace",
            OperationKind::Force => "force",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
}

/// Expected identity of a file: BLAKE3 hex digest plus length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub checksum: String,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRange {
    pub offset: u64,
    pub length: u64,
}

impl PayloadRange {
    /// Saturates; [`PatchManifest::check`] rejects ranges that overflow.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// 1-based; equals apply order and payload order.
    pub id: u32,
    pub kind: OperationKind,
    pub file_type: FileType,
    /// Relative to the target root, `/`-separated.
    pub dest_path: String,
    pub payload: Option<PayloadRange>,
    pub old_ref: Option<FileRef>,
    pub new_ref: Option<FileRef>,
}

impl Operation {
    pub fn payload_length(&self) -> u64 {
        self.payload.map_or(0, |p| p.length)
    }

    fn requires_payload(&self) -> bool {
        self.file_type == FileType::File
            && matches!(
                self.kind,
                OperationKind::New
                    | OperationKind::Patch
                    | OperationKind::Replace
                    | OperationKind::Force
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFile {
    pub path: String,
    /// Empty for directories.
    pub checksum: String,
    /// -1 for directories.
    pub length: i64,
}

impl ValidationFile {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            checksum: String::new(),
            length: -1,
        }
    }

    pub fn file(path: impl Into<String>, file_ref: &FileRef) -> Self {
        Self {
            path: path.into(),
            checksum: file_ref.checksum.clone(),
            length: file_ref.length as i64,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.length < 0
    }
}

/// Per-kind operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_patched: usize,
    pub files_replaced: usize,
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub files_forced: usize,
    /// Operations whose destination already had the expected state.
    pub unchanged: usize,
}

impl ApplySummary {
    /// What a manifest would do to a tree in its expected starting state.
    pub fn planned(manifest: &PatchManifest) -> Self {
        let mut summary = Self::default();
        for op in &manifest.operations {
            match (op.kind, op.file_type) {
                (OperationKind::New, FileType::Directory) => summary.dirs_created += 1,
                (OperationKind::New, FileType::File) => summary.files_added += 1,
                (OperationKind::Patch, _) => summary.files_patched += 1,
                (OperationKind::Replace, _) => summary.files_replaced += 1,
                (OperationKind::Remove, FileType::File) => summary.files_removed += 1,
                (OperationKind::Remove, FileType::Directory) => summary.dirs_removed += 1,
                (OperationKind::Force, FileType::Directory) => summary.dirs_created += 1,
                (OperationKind::Force, FileType::File) => summary.files_forced += 1,
            }
        }
        summary
    }
}

impl PatchManifest {
    /// Structural checks performed before anything touches the target tree.
    pub fn check(&self) -> Result<()> {
        let mut cursor = 0u64;
        for (index, op) in self.operations.iter().enumerate() {
            let expected = index as u32 + 1;
            if op.id != expected {
                return Err(PatchError::format(format!(
                    "operation ids must run 1..N in order: found {} at position {expected}",
                    op.id
                )));
            }
            if op.dest_path.is_empty()
                || op.dest_path.starts_with('/')
                || op.dest_path.split('/').any(|c| c.is_empty() || c == "." || c == "..")
            {
                return Err(PatchError::format(format!(
                    "operation {} has an unsafe destination path {:?}",
                    op.id, op.dest_path
                )));
            }
            if let Some(range) = op.payload {
                if range.offset != cursor {
                    return Err(PatchError::format(format!(
                        "operation {} payload starts at {} but previous payload ended at {cursor}",
                        op.id, range.offset
                    )));
                }
                cursor = range.offset.checked_add(range.length).ok_or_else(|| {
                    PatchError::format(format!(
                        "operation {} payload length {} overflows the stream",
                        op.id, range.length
                    ))
                })?;
            }
            if op.requires_payload() && op.payload.is_none() {
                return Err(PatchError::format(format!(
                    "operation {} ({}) carries no payload",
                    op.id, op.kind
                )));
            }
            let needs_new = op.file_type == FileType::File && op.kind != OperationKind::Remove;
            if needs_new && op.new_ref.is_none() {
                return Err(PatchError::format(format!(
                    "operation {} ({}) carries no new file reference",
                    op.id, op.kind
                )));
            }
            match op.kind {
                OperationKind::Patch | OperationKind::Replace => {
                    if op.file_type == FileType::Directory {
                        return Err(PatchError::format(format!(
                            "operation {} ({}) cannot target a directory",
                            op.id, op.kind
                        )));
                    }
                    if op.old_ref.is_none() {
                        return Err(PatchError::format(format!(
                            "operation {} ({}) carries no old file reference",
                            op.id, op.kind
                        )));
                    }
                }
                OperationKind::Force if self.kind == PatchKind::Incremental => {
                    return Err(PatchError::format(format!(
                        "operation {} is a force operation in an incremental patch",
                        op.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn payload_length(&self) -> u64 {
        self.operations
            .iter()
            .filter_map(|op| op.payload)
            .map(|p| p.end())
            .max()
            .unwrap_or(0)
    }
}

/// One instruction of a COPY/INSERT delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}
