//! Write-ahead journal for apply sessions.
//!
//! One `\n`-terminated text record per line:
//!
//! ```text
//! 0 fresh|resume "<patch id>"                      session start
//! 1                                                session end
//! 2 <id> <sub-case> <0|1> "<backup>" "<staging>" "<dest>"   operation start
//! 3 <id>                                           operation finished
//! 4 <id>                                           operation failed
//! 5 <id>                                           operation reverted
//! ```
//!
//! The `0|1` flag records whether the destination existed when the operation
//! started. Paths are absolute and quoted; `"` and `\` are escaped with `\`,
//! and `""` means no path. A session start names the patch it applies; the
//! field may be absent in journals that predate it. Readers skip any line
//! that does not parse, including an unterminated last line left by a crash
//! mid-write. Extra trailing fields are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{io_err, Result};
use crate::patch_format::{FileType, OperationKind};
use crate::util::path_to_str;

macro_rules! sub_cases {
    ($($variant:ident => ($kind:ident, $file_type:ident)),+ $(,)?) => {
        /// The decision-table branch taken for one operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SubCase {
            $($variant),+
        }

        impl SubCase {
            pub fn name(self) -> &'static str {
                match self {
                    $(SubCase::$variant => stringify!($variant)),+
                }
            }

            pub fn operation_kind(self) -> OperationKind {
                match self {
                    $(SubCase::$variant => OperationKind::$kind),+
                }
            }

            pub fn file_type(self) -> FileType {
                match self {
                    $(SubCase::$variant => FileType::$file_type),+
                }
            }
        }

        impl FromStr for SubCase {
            type Err = ();

            fn from_str(s: &str) -> std::result::Result<Self, ()> {
                match s {
                    $(stringify!($variant) => Ok(SubCase::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

sub_cases! {
    RemoveDirEmpty => (Remove, Directory),
    RemoveDirNotEmpty => (Remove, Directory),
    RemoveDirIsFile => (Remove, Directory),
    RemoveDirAbsent => (Remove, Directory),
    RemoveFile => (Remove, File),
    RemoveFileAlreadyRemoved => (Remove, File),
    RemoveFileMissing => (Remove, File),
    NewDirExists => (New, Directory),
    NewDirIsFile => (New, Directory),
    NewDirCreate => (New, Directory),
    NewFileMatches => (New, File),
    NewFileMismatch => (New, File),
    NewFileCreate => (New, File),
    ForceDirExists => (Force, Directory),
    ForceDirIsFile => (Force, Directory),
    ForceDirCreate => (Force, Directory),
    ForceFileUnreadable => (Force, File),
    ForceFileMatches => (Force, File),
    ForceFileBackupConflict => (Force, File),
    ForceFileReplace => (Force, File),
    ForceFileCreate => (Force, File),
    PatchAlreadyInstalled => (Patch, File),
    PatchApply => (Patch, File),
    PatchOldMismatch => (Patch, File),
    PatchResumeInstall => (Patch, File),
    PatchDestMissing => (Patch, File),
}

impl SubCase {
    /// Branches with no safe resolution.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            SubCase::RemoveDirIsFile
                | SubCase::RemoveFileMissing
                | SubCase::NewDirIsFile
                | SubCase::NewFileMismatch
                | SubCase::ForceDirIsFile
                | SubCase::ForceFileUnreadable
                | SubCase::ForceFileBackupConflict
                | SubCase::PatchOldMismatch
                | SubCase::PatchDestMissing
        )
    }
}

impl fmt::Display for SubCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpStart {
    pub id: u32,
    pub sub_case: SubCase,
    pub dest_existed_before: bool,
    pub backup_path: Option<PathBuf>,
    pub staging_path: Option<PathBuf>,
    pub dest_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    SessionStart {
        resumed: bool,
        patch_id: Option<String>,
    },
    SessionEnd,
    OpStart(OpStart),
    OpFinish { id: u32 },
    OpFailed { id: u32 },
    Revert { id: u32 },
}

impl JournalRecord {
    pub fn action_code(&self) -> u8 {
        match self {
            JournalRecord::SessionStart { .. } => 0,
            JournalRecord::SessionEnd => 1,
            JournalRecord::OpStart(_) => 2,
            JournalRecord::OpFinish { .. } => 3,
            JournalRecord::OpFailed { .. } => 4,
            JournalRecord::Revert { .. } => 5,
        }
    }

    /// The record as one line, without the terminator.
    pub fn encode(&self) -> Result<String> {
        let code = self.action_code();
        Ok(match self {
            JournalRecord::SessionStart { resumed, patch_id } => format!(
                "{code} {} {}",
                if *resumed { "resume" } else { "fresh" },
                quote_str(patch_id.as_deref().unwrap_or(""))
            ),
            JournalRecord::SessionEnd => code.to_string(),
            JournalRecord::OpStart(start) => format!(
                "{code} {} {} {} {} {} {}",
                start.id,
                start.sub_case,
                u8::from(start.dest_existed_before),
                quote(start.backup_path.as_deref())?,
                quote(start.staging_path.as_deref())?,
                quote(Some(&start.dest_path))?,
            ),
            JournalRecord::OpFinish { id }
            | JournalRecord::OpFailed { id }
            | JournalRecord::Revert { id } => format!("{code} {id}"),
        })
    }

    /// Parse one line. `None` for anything that does not match the grammar.
    pub fn decode(line: &str) -> Option<Self> {
        let mut fields = Fields::new(line);
        let code: u8 = fields.word()?.parse().ok()?;
        let record = match code {
            0 => {
                let resumed = match fields.word()? {
                    "fresh" => false,
                    "resume" => true,
                    _ => return None,
                };
                let patch_id = if fields.at_end() {
                    None
                } else {
                    fields.quoted()?
                };
                JournalRecord::SessionStart { resumed, patch_id }
            }
            1 => JournalRecord::SessionEnd,
            2 => {
                let id = fields.word()?.parse().ok()?;
                let sub_case = fields.word()?.parse().ok()?;
                let dest_existed_before = match fields.word()? {
                    "0" => false,
                    "1" => true,
                    _ => return None,
                };
                let backup_path = fields.quoted()?.map(PathBuf::from);
                let staging_path = fields.quoted()?.map(PathBuf::from);
                let dest_path = PathBuf::from(fields.quoted()??);
                JournalRecord::OpStart(OpStart {
                    id,
                    sub_case,
                    dest_existed_before,
                    backup_path,
                    staging_path,
                    dest_path,
                })
            }
            3 => JournalRecord::OpFinish {
                id: fields.word()?.parse().ok()?,
            },
            4 => JournalRecord::OpFailed {
                id: fields.word()?.parse().ok()?,
            },
            5 => JournalRecord::Revert {
                id: fields.word()?.parse().ok()?,
            },
            _ => return None,
        };
        Some(record)
    }
}

fn quote(path: Option<&Path>) -> Result<String> {
    Ok(quote_str(match path {
        Some(path) => path_to_str(path)?,
        None => "",
    }))
}

fn quote_str(value: &str) -> String {
    let mut out = String::from("\"");
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Space-separated tokenizer over one record line.
struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn word(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start_matches(' ');
        if trimmed.is_empty() || trimmed.starts_with('"') {
            return None;
        }
        let end = trimmed.find(' ').unwrap_or(trimmed.len());
        self.rest = &trimmed[end..];
        Some(&trimmed[..end])
    }

    fn at_end(&self) -> bool {
        self.rest.trim_start_matches(' ').is_empty()
    }

    /// `Some(None)` for `""`, `None` when the field is missing or malformed.
    fn quoted(&mut self) -> Option<Option<String>> {
        let trimmed = self.rest.trim_start_matches(' ');
        let mut chars = trimmed.char_indices();
        if chars.next()?.1 != '"' {
            return None;
        }
        let mut value = String::new();
        let mut escaped = false;
        for (i, c) in chars {
            if escaped {
                if c != '"' && c != '\\' {
                    return None;
                }
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.rest = &trimmed[i + 1..];
                return Some((!value.is_empty()).then_some(value));
            } else {
                value.push(c);
            }
        }
        None
    }
}

/// Read every well-formed record. A missing journal reads as empty.
pub fn read_records(path: &Path) -> Result<Vec<JournalRecord>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path, e)),
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut records = Vec::new();
    let mut rest: &str = &text;
    while !rest.is_empty() {
        let Some(end) = rest.find('\n') else {
            tracing::warn!(journal = %path.display(), line = rest, "skipping unterminated journal record");
            break;
        };
        let line = rest[..end].trim_end_matches('\r');
        rest = &rest[end + 1..];
        if line.is_empty() {
            continue;
        }
        match JournalRecord::decode(line) {
            Some(record) => records.push(record),
            None => {
                tracing::warn!(journal = %path.display(), line, "skipping malformed journal record")
            }
        }
    }
    Ok(records)
}

/// Appends records, syncing each one to disk before returning.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
}

impl JournalWriter {
    /// Open for append, creating the file. If the last line was cut short by a
    /// crash, it is terminated first so new records start on a fresh line.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        let len = file.metadata().map_err(|e| io_err(path, e))?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).map_err(|e| io_err(path, e))?;
            file.read_exact(&mut last).map_err(|e| io_err(path, e))?;
            if last[0] != b'\n' {
                file.write_all(b"\n").map_err(|e| io_err(path, e))?;
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = record.encode()?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        self.file.sync_data().map_err(|e| io_err(&self.path, e))
    }
}

/// Where an operation stands in the live (not reverted) part of the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OpHistory {
    /// First start since the last revert; its `dest_existed_before` describes
    /// the tree before this patch touched the path.
    pub first: OpStart,
    pub latest: OpStart,
    pub status: OpStatus,
    /// Last `OpFinish`/`OpFailed` seen; a later restart does not clear it.
    pub last_terminal: Option<OpStatus>,
}

/// What the journal says about the session, ignoring reverted operations.
#[derive(Debug, Clone, Default)]
pub struct JournalState {
    pub ended: bool,
    /// Patch named by the most recent session start.
    pub patch_id: Option<String>,
    pub ops: BTreeMap<u32, OpHistory>,
    /// Terminal records seen without a matching start (start line lost).
    orphan_terminals: BTreeMap<u32, OpStatus>,
}

impl JournalState {
    pub fn from_records(records: &[JournalRecord]) -> Self {
        let mut state = JournalState::default();
        for record in records {
            match record {
                JournalRecord::SessionStart { patch_id, .. } => {
                    if patch_id.is_some() {
                        state.patch_id = patch_id.clone();
                    }
                }
                JournalRecord::SessionEnd => {}
                JournalRecord::OpStart(start) => {
                    let orphan = state.orphan_terminals.remove(&start.id);
                    state
                        .ops
                        .entry(start.id)
                        .and_modify(|h| {
                            h.latest = start.clone();
                            h.status = OpStatus::Started;
                        })
                        .or_insert_with(|| OpHistory {
                            first: start.clone(),
                            latest: start.clone(),
                            status: OpStatus::Started,
                            last_terminal: orphan,
                        });
                }
                JournalRecord::OpFinish { id } => state.terminate(*id, OpStatus::Finished),
                JournalRecord::OpFailed { id } => state.terminate(*id, OpStatus::Failed),
                JournalRecord::Revert { id } => {
                    state.ops.remove(id);
                    state.orphan_terminals.remove(id);
                }
            }
        }
        state.ended = matches!(records.last(), Some(JournalRecord::SessionEnd));
        state
    }

    fn terminate(&mut self, id: u32, status: OpStatus) {
        match self.ops.get_mut(&id) {
            Some(history) => {
                history.status = status;
                history.last_terminal = Some(status);
            }
            None => {
                self.orphan_terminals.insert(id, status);
            }
        }
    }

    fn terminal_statuses(&self) -> impl Iterator<Item = (u32, OpStatus)> + '_ {
        self.ops
            .iter()
            .filter_map(|(id, h)| h.last_terminal.map(|s| (*id, s)))
            .chain(self.orphan_terminals.iter().map(|(id, s)| (*id, *s)))
    }

    /// One past the highest operation id with a terminal record.
    pub fn resume_from(&self) -> u32 {
        self.terminal_statuses()
            .map(|(id, _)| id)
            .max()
            .map_or(1, |id| id + 1)
    }

    /// Operations below [`JournalState::resume_from`] that must run again:
    /// those whose latest terminal record is a failure, and those started
    /// again without a terminal record since (a redo that was interrupted).
    pub fn redo_set(&self) -> BTreeSet<u32> {
        let resume_from = self.resume_from();
        let failed = self
            .terminal_statuses()
            .filter(|(_, s)| *s == OpStatus::Failed)
            .map(|(id, _)| id);
        let unfinished = self
            .ops
            .iter()
            .filter(|(id, h)| **id < resume_from && h.status != OpStatus::Finished)
            .map(|(id, _)| *id);
        failed.chain(unfinished).collect()
    }

    /// Whether any non-reverted operation record exists.
    pub fn has_live_ops(&self) -> bool {
        !self.ops.is_empty() || !self.orphan_terminals.is_empty()
    }

    /// Every non-reverted operation id, ascending.
    pub fn live_ids(&self) -> Vec<u32> {
        self.ops
            .keys()
            .chain(self.orphan_terminals.keys())
            .copied()
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect()
    }
}

pub fn load_state(path: &Path) -> Result<JournalState> {
    Ok(JournalState::from_records(&read_records(path)?))
}
