//! Journaled application of a manifest to a live directory tree.
//!
//! Every operation is resolved through a decision table (see [`SubCase`])
//! against the current state of its destination, its backup slot and its
//! staging slot, so a session interrupted at any point can simply be run
//! again. New content is always produced into `work/<id>.new` first and the
//! displaced original is kept as `work/<id>.old` until the caller discards it,
//! which is what makes [`Patcher::revert`] possible.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::binary_diff;
use crate::binary_patch;
use crate::error::{io_err, PatchError, Result};
use crate::interrupt::{self, Interrupter};
use crate::journal::{self, JournalRecord, JournalWriter, OpHistory, OpStart, SubCase};
use crate::patch_format::{
    ApplySummary, FileRef, FileType, Operation, OperationKind, PatchManifest, ValidationFile,
};
use crate::progress::{self, ProgressSink};
use crate::util::{self, path_to_str};

/// An operation whose final install step could not complete. Its staging and
/// backup files are left in place; the next session retries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRecord {
    pub operation_kind: OperationKind,
    pub sub_case: SubCase,
    pub dest_path: PathBuf,
    pub staging_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Empty means the patch is fully applied and validated.
    pub replacements: Vec<ReplacementRecord>,
    pub summary: ApplySummary,
    /// The journal already recorded a completed session; nothing was done.
    pub already_complete: bool,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.replacements.is_empty()
    }
}

/// Private area holding staging and backup files for one journal.
pub fn work_dir(journal_path: &Path) -> PathBuf {
    let mut name = journal_path.as_os_str().to_owned();
    name.push(".work");
    PathBuf::from(name)
}

/// Forward-only reader over the concatenated operation payloads.
struct PayloadCursor<'a> {
    reader: &'a mut dyn Read,
    position: u64,
}

impl<'a> PayloadCursor<'a> {
    fn new(reader: &'a mut dyn Read) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    fn skip_to(&mut self, offset: u64, interrupter: &Interrupter) -> Result<()> {
        if offset < self.position {
            return Err(PatchError::format(format!(
                "payload offset {offset} is behind the stream position {}",
                self.position
            )));
        }
        let gap = offset - self.position;
        self.read_into(gap, &mut io::sink(), Path::new("<skipped>"), interrupter)
    }

    fn read_into<W: Write + ?Sized>(
        &mut self,
        len: u64,
        out: &mut W,
        dest: &Path,
        interrupter: &Interrupter,
    ) -> Result<()> {
        interrupt::copy_exact(&mut *self.reader, out, len, interrupter, Path::new("<payload>"), dest)?;
        self.position += len;
        Ok(())
    }
}

/// Paths for one operation, threaded through every step that touches it.
struct OpContext<'a> {
    op: &'a Operation,
    dest: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
}

impl<'a> OpContext<'a> {
    fn new(op: &'a Operation, target: &Path, work: &Path) -> Self {
        Self {
            op,
            dest: target.join(&op.dest_path),
            staging: work.join(format!("{}.new", op.id)),
            backup: work.join(format!("{}.old", op.id)),
        }
    }

    /// Slots this operation may use, as recorded in the journal.
    fn slots(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        match (self.op.kind, self.op.file_type) {
            (OperationKind::Remove, _) => (Some(self.backup.clone()), None),
            (_, FileType::Directory) => (None, None),
            (_, FileType::File) => (Some(self.backup.clone()), Some(self.staging.clone())),
        }
    }

    fn new_ref(&self) -> Result<&FileRef> {
        self.op.new_ref.as_ref().ok_or_else(|| {
            PatchError::format(format!("operation {} has no new file reference", self.op.id))
        })
    }

    fn old_ref(&self) -> Result<&FileRef> {
        self.op.old_ref.as_ref().ok_or_else(|| {
            PatchError::format(format!("operation {} has no old file reference", self.op.id))
        })
    }

    fn integrity(&self, sub_case: Option<SubCase>, message: impl Into<String>) -> PatchError {
        PatchError::StateIntegrity {
            id: self.op.id,
            path: self.op.dest_path.clone(),
            sub_case,
            message: message.into(),
        }
    }
}

enum OpResult {
    Done(SubCase),
    Replacement(ReplacementRecord),
}

/// Outcome of an install rename that may be blocked by a locked destination.
enum Install {
    Done,
    Blocked,
}

fn rename_or_block(from: &Path, to: &Path) -> Install {
    match fs::rename(from, to) {
        Ok(()) => Install::Done,
        Err(e) => {
            tracing::warn!(from = %from.display(), to = %to.display(), error = %e, "install rename failed");
            Install::Blocked
        }
    }
}

/// Hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    length: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            length: 0,
        }
    }

    fn finish(self) -> (W, FileRef) {
        let file_ref = FileRef {
            checksum: self.hasher.finalize().to_hex().to_string(),
            length: self.length,
        };
        (self.inner, file_ref)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Applies and reverts patches. Holds no per-session state, so one instance
/// can run any number of sessions.
#[derive(Debug, Clone, Default)]
pub struct Patcher {
    interrupter: Interrupter,
}

impl Patcher {
    pub fn new(interrupter: Interrupter) -> Self {
        Self { interrupter }
    }

    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    /// Apply `manifest` to `target_root`, reading payloads from `payload` and
    /// journaling progress to `journal_path`.
    ///
    /// Returns the replacements that could not be installed; an empty list
    /// means the tree was fully patched and validated. Fatal errors leave
    /// completed operations in place for a retry or a [`Patcher::revert`].
    pub fn apply(
        &self,
        manifest: &PatchManifest,
        payload: &mut dyn Read,
        journal_path: &Path,
        target_root: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<ApplyReport> {
        manifest.check()?;

        let state = journal::load_state(journal_path)?;
        if let Some(recorded) = &state.patch_id {
            if *recorded != manifest.id && (state.ended || state.has_live_ops()) {
                return Err(PatchError::JournalMismatch {
                    journal: journal_path.to_path_buf(),
                    recorded: recorded.clone(),
                    patch: manifest.id.clone(),
                });
            }
        }
        if state.ended {
            tracing::info!(journal = %journal_path.display(), "patch already applied");
            return Ok(ApplyReport {
                already_complete: true,
                ..ApplyReport::default()
            });
        }

        let target = target_root
            .canonicalize()
            .map_err(|e| io_err(target_root, e))?;
        let work = work_dir(journal_path);
        fs::create_dir_all(&work).map_err(|e| io_err(&work, e))?;
        let work = work.canonicalize().map_err(|e| io_err(&work, e))?;
        // Journal paths must be valid UTF-8.
        path_to_str(&target)?;
        path_to_str(&work)?;

        let resume_from = state.resume_from();
        let redo: BTreeSet<u32> = state.redo_set();
        let resumed = state.has_live_ops();

        let mut journal = JournalWriter::open(journal_path)?;
        journal.append(&JournalRecord::SessionStart {
            resumed,
            patch_id: Some(manifest.id.clone()),
        })?;
        tracing::info!(
            patch = %manifest.id,
            target = %target.display(),
            resumed,
            resume_from,
            redo = redo.len(),
            "apply session started"
        );

        progress.cancel_enabled(true);
        let mut cursor = PayloadCursor::new(payload);
        let mut report = ApplyReport::default();
        let total = manifest.operations.len();

        for (index, op) in manifest.operations.iter().enumerate() {
            if let Some(range) = op.payload {
                cursor.skip_to(range.offset, &self.interrupter)?;
            }
            if op.id < resume_from && !redo.contains(&op.id) {
                continue;
            }
            self.interrupter.checkpoint()?;
            progress.progress(
                progress::percent(index, total),
                &format!("{} {}", op.kind, op.dest_path),
            );

            let ctx = OpContext::new(op, &target, &work);
            match self.run_operation(&ctx, &mut cursor, &mut journal, progress)? {
                OpResult::Done(sub_case) => count(&mut report.summary, op.kind, sub_case),
                OpResult::Replacement(record) => report.replacements.push(record),
            }
        }

        if report.replacements.is_empty() {
            progress.progress(100, "validating");
            self.validate(manifest, &target)?;
            journal.append(&JournalRecord::SessionEnd)?;
            tracing::info!(patch = %manifest.id, "patch applied");
        } else {
            tracing::warn!(
                patch = %manifest.id,
                pending = report.replacements.len(),
                "patch applied with pending replacements"
            );
        }
        progress.progress(100, "done");
        Ok(report)
    }

    fn run_operation(
        &self,
        ctx: &OpContext<'_>,
        cursor: &mut PayloadCursor<'_>,
        journal: &mut JournalWriter,
        progress: &dyn ProgressSink,
    ) -> Result<OpResult> {
        let id = ctx.op.id;
        let dest_existed_before = util::exists(&ctx.dest);
        let sub_case = self.decide(ctx)?;
        tracing::debug!(id, path = %ctx.op.dest_path, %sub_case, "operation");

        let (backup_path, staging_path) = ctx.slots();
        journal.append(&JournalRecord::OpStart(OpStart {
            id,
            sub_case,
            dest_existed_before,
            backup_path,
            staging_path,
            dest_path: ctx.dest.clone(),
        }))?;

        if sub_case.is_fatal() {
            journal.append(&JournalRecord::OpFailed { id })?;
            return Err(ctx.integrity(Some(sub_case), fatal_reason(sub_case)));
        }

        match self.execute(ctx, sub_case, cursor, progress) {
            Ok(Install::Done) => {
                journal.append(&JournalRecord::OpFinish { id })?;
                Ok(OpResult::Done(sub_case))
            }
            Ok(Install::Blocked) => {
                journal.append(&JournalRecord::OpFailed { id })?;
                let (backup_path, staging_path) = ctx.slots();
                Ok(OpResult::Replacement(ReplacementRecord {
                    operation_kind: ctx.op.kind,
                    sub_case,
                    dest_path: ctx.dest.clone(),
                    staging_path,
                    backup_path,
                }))
            }
            Err(PatchError::Cancelled) => Err(PatchError::Cancelled),
            Err(e) => {
                journal.append(&JournalRecord::OpFailed { id })?;
                Err(e)
            }
        }
    }

    /// Pick the decision-table row for the destination's current state.
    fn decide(&self, ctx: &OpContext<'_>) -> Result<SubCase> {
        let meta = fs::symlink_metadata(&ctx.dest).ok();
        let backup_exists = util::exists(&ctx.backup);
        let op = ctx.op;

        let sub_case = match (op.kind, op.file_type) {
            (OperationKind::Remove, FileType::Directory) => match meta {
                None => SubCase::RemoveDirAbsent,
                Some(m) if !m.is_dir() => SubCase::RemoveDirIsFile,
                Some(_) if util::dir_is_empty(&ctx.dest)? => SubCase::RemoveDirEmpty,
                Some(_) => SubCase::RemoveDirNotEmpty,
            },
            (OperationKind::Remove, FileType::File) => match meta {
                Some(_) => SubCase::RemoveFile,
                None if backup_exists => SubCase::RemoveFileAlreadyRemoved,
                None => SubCase::RemoveFileMissing,
            },
            (OperationKind::New, FileType::Directory) => match meta {
                None => SubCase::NewDirCreate,
                Some(m) if m.is_dir() => SubCase::NewDirExists,
                Some(_) => SubCase::NewDirIsFile,
            },
            (OperationKind::Force, FileType::Directory) => match meta {
                None => SubCase::ForceDirCreate,
                Some(m) if m.is_dir() => SubCase::ForceDirExists,
                Some(_) => SubCase::ForceDirIsFile,
            },
            (OperationKind::New, FileType::File) => match meta {
                None => SubCase::NewFileCreate,
                Some(m) if m.is_file() && self.matches(&ctx.dest, ctx.new_ref()?)? => {
                    SubCase::NewFileMatches
                }
                Some(_) => SubCase::NewFileMismatch,
            },
            (OperationKind::Force, FileType::File) => match meta {
                None => SubCase::ForceFileCreate,
                Some(_) => match util::file_matches(&ctx.dest, ctx.new_ref()?, &self.interrupter) {
                    Err(PatchError::Cancelled) => return Err(PatchError::Cancelled),
                    Err(e) => {
                        tracing::debug!(path = %ctx.dest.display(), error = %e, "checksum unreadable");
                        SubCase::ForceFileUnreadable
                    }
                    Ok(true) => SubCase::ForceFileMatches,
                    Ok(false) if backup_exists => SubCase::ForceFileBackupConflict,
                    Ok(false) => SubCase::ForceFileReplace,
                },
            },
            (OperationKind::Patch | OperationKind::Replace, FileType::File) => match meta {
                Some(_) if backup_exists => SubCase::PatchAlreadyInstalled,
                Some(m) if m.is_file() && self.matches(&ctx.dest, ctx.old_ref()?)? => {
                    SubCase::PatchApply
                }
                Some(_) => SubCase::PatchOldMismatch,
                None if backup_exists && util::exists(&ctx.staging) => SubCase::PatchResumeInstall,
                None => SubCase::PatchDestMissing,
            },
            (OperationKind::Patch | OperationKind::Replace, FileType::Directory) => {
                return Err(PatchError::format(format!(
                    "operation {} ({}) cannot target a directory",
                    op.id, op.kind
                )))
            }
        };
        Ok(sub_case)
    }

    fn matches(&self, path: &Path, expected: &FileRef) -> Result<bool> {
        util::file_matches(path, expected, &self.interrupter)
    }

    fn execute(
        &self,
        ctx: &OpContext<'_>,
        sub_case: SubCase,
        cursor: &mut PayloadCursor<'_>,
        progress: &dyn ProgressSink,
    ) -> Result<Install> {
        match sub_case {
            SubCase::RemoveDirEmpty | SubCase::RemoveFile => {
                Ok(self.guarded(progress, || rename_or_block(&ctx.dest, &ctx.backup)))
            }
            SubCase::NewDirCreate | SubCase::ForceDirCreate => {
                fs::create_dir(&ctx.dest).map_err(|e| io_err(&ctx.dest, e))?;
                Ok(Install::Done)
            }
            SubCase::NewFileCreate | SubCase::ForceFileCreate => {
                self.materialize(ctx, cursor)?;
                Ok(self.guarded(progress, || rename_or_block(&ctx.staging, &ctx.dest)))
            }
            SubCase::ForceFileReplace | SubCase::PatchApply => {
                self.materialize(ctx, cursor)?;
                Ok(self.guarded(progress, || match rename_or_block(&ctx.dest, &ctx.backup) {
                    Install::Done => rename_or_block(&ctx.staging, &ctx.dest),
                    Install::Blocked => Install::Blocked,
                }))
            }
            SubCase::PatchResumeInstall => {
                Ok(self.guarded(progress, || rename_or_block(&ctx.staging, &ctx.dest)))
            }
            SubCase::RemoveDirNotEmpty
            | SubCase::RemoveDirAbsent
            | SubCase::RemoveFileAlreadyRemoved
            | SubCase::NewDirExists
            | SubCase::ForceDirExists
            | SubCase::NewFileMatches
            | SubCase::ForceFileMatches
            | SubCase::PatchAlreadyInstalled => Ok(Install::Done),
            fatal => Err(ctx.integrity(Some(fatal), fatal_reason(fatal))),
        }
    }

    /// Run install renames with cancellation disabled.
    fn guarded(&self, progress: &dyn ProgressSink, install: impl FnOnce() -> Install) -> Install {
        progress.cancel_enabled(false);
        let result = install();
        progress.cancel_enabled(true);
        result
    }

    /// Produce the operation's new content in its staging slot and verify it
    /// against `newRef`.
    fn materialize(&self, ctx: &OpContext<'_>, cursor: &mut PayloadCursor<'_>) -> Result<()> {
        let expected = ctx.new_ref()?.clone();
        let length = ctx.op.payload_length();
        let staging = ctx.staging.clone();

        let _cleanup = {
            let staging = staging.clone();
            self.interrupter.on_cancel(move || {
                let _ = fs::remove_file(&staging);
            })
        };

        let file = File::create(&staging).map_err(|e| io_err(&staging, e))?;
        let mut out = HashingWriter::new(BufWriter::new(file));

        if ctx.op.kind == OperationKind::Patch {
            // Grown as bytes arrive; `length` comes from the manifest.
            let mut delta = Vec::new();
            cursor.read_into(length, &mut delta, &staging, &self.interrupter)?;
            let chunks = binary_diff::decode_delta(&delta)?;
            let produces = binary_patch::output_len(&chunks);
            if produces != expected.length {
                let _ = fs::remove_file(&staging);
                return Err(ctx.integrity(
                    None,
                    format!("delta produces {produces} bytes, expected {}", expected.length),
                ));
            }
            // The map must be gone before the destination is renamed.
            let old = util::map_file(&ctx.dest)?;
            binary_patch::apply_diff(&old, &chunks, &mut out, &self.interrupter, &staging)?;
        } else {
            cursor.read_into(length, &mut out, &staging, &self.interrupter)?;
        }

        let (buffered, produced) = out.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| io_err(&staging, e.into_error()))?;
        file.sync_all().map_err(|e| io_err(&staging, e))?;
        drop(file);

        if produced != expected {
            let _ = fs::remove_file(&staging);
            return Err(ctx.integrity(
                None,
                format!(
                    "produced content {} ({} bytes) does not match expected {} ({} bytes)",
                    produced.checksum, produced.length, expected.checksum, expected.length
                ),
            ));
        }
        Ok(())
    }

    /// Check every validation entry against the live tree.
    pub fn validate(&self, manifest: &PatchManifest, target: &Path) -> Result<()> {
        for entry in &manifest.validations {
            self.validate_entry(entry, target)?;
        }
        Ok(())
    }

    fn validate_entry(&self, entry: &ValidationFile, target: &Path) -> Result<()> {
        let path = target.join(&entry.path);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Err(PatchError::validation(&entry.path, "missing")),
        };
        if entry.is_directory() {
            if !meta.is_dir() {
                return Err(PatchError::validation(&entry.path, "expected a directory"));
            }
            return Ok(());
        }
        if !meta.is_file() {
            return Err(PatchError::validation(&entry.path, "expected a file"));
        }
        if meta.len() as i64 != entry.length {
            return Err(PatchError::validation(
                &entry.path,
                format!("length {} != expected {}", meta.len(), entry.length),
            ));
        }
        let actual = util::hash_file(&path, &self.interrupter)?;
        if actual.checksum != entry.checksum {
            return Err(PatchError::validation(
                &entry.path,
                format!("checksum {} != expected {}", actual.checksum, entry.checksum),
            ));
        }
        Ok(())
    }

    /// Undo every operation the journal records as started, newest first, and
    /// journal a `Revert` for each. Driven purely by the journal and the
    /// on-disk state, so calling it again (or after a crash) is safe.
    /// Returns the number of operations reverted.
    pub fn revert(&self, journal_path: &Path) -> Result<usize> {
        let state = journal::load_state(journal_path)?;
        let ids = state.live_ids();
        if ids.is_empty() {
            tracing::info!(journal = %journal_path.display(), "nothing to revert");
            return Ok(0);
        }

        let mut journal = JournalWriter::open(journal_path)?;
        for id in ids.iter().rev() {
            self.interrupter.checkpoint()?;
            if let Some(history) = state.ops.get(id) {
                revert_operation(*id, history)?;
            }
            journal.append(&JournalRecord::Revert { id: *id })?;
        }
        tracing::info!(journal = %journal_path.display(), reverted = ids.len(), "revert finished");
        Ok(ids.len())
    }

    /// Delete backups, staging files and the journal of a completed session.
    /// After this the session can no longer be reverted.
    pub fn discard_backups(&self, journal_path: &Path) -> Result<()> {
        let state = journal::load_state(journal_path)?;
        if !state.ended {
            return Err(PatchError::SessionIncomplete(journal_path.to_path_buf()));
        }
        let work = work_dir(journal_path);
        match fs::remove_dir_all(&work) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&work, e)),
        }
        fs::remove_file(journal_path).map_err(|e| io_err(journal_path, e))?;
        tracing::info!(journal = %journal_path.display(), "backups discarded");
        Ok(())
    }
}

fn fatal_reason(sub_case: SubCase) -> &'static str {
    match sub_case {
        SubCase::RemoveDirIsFile => "expected a directory to remove, found a file",
        SubCase::RemoveFileMissing => "file to remove is missing and no backup exists",
        SubCase::NewDirIsFile | SubCase::ForceDirIsFile => {
            "expected a directory, found a file"
        }
        SubCase::NewFileMismatch => "destination exists with unexpected content",
        SubCase::ForceFileUnreadable => "cannot read destination checksum",
        SubCase::ForceFileBackupConflict => {
            "destination differs from the new content but a backup already exists"
        }
        SubCase::PatchOldMismatch => "destination does not match the expected original",
        SubCase::PatchDestMissing => "destination is missing and cannot be resumed",
        _ => "unexpected state",
    }
}

fn count(summary: &mut ApplySummary, kind: OperationKind, sub_case: SubCase) {
    match sub_case {
        SubCase::NewDirCreate | SubCase::ForceDirCreate => summary.dirs_created += 1,
        SubCase::NewFileCreate => summary.files_added += 1,
        SubCase::ForceFileCreate | SubCase::ForceFileReplace => summary.files_forced += 1,
        SubCase::PatchApply | SubCase::PatchResumeInstall => match kind {
            OperationKind::Replace => summary.files_replaced += 1,
            _ => summary.files_patched += 1,
        },
        SubCase::RemoveFile => summary.files_removed += 1,
        SubCase::RemoveDirEmpty => summary.dirs_removed += 1,
        _ => summary.unchanged += 1,
    }
}

/// Move post-patch content out of the way, into the staging slot if the
/// operation has one.
fn park(dest: &Path, staging: Option<&Path>) -> Result<()> {
    match staging {
        Some(staging) => {
            if util::exists(staging) {
                fs::remove_file(staging).map_err(|e| io_err(staging, e))?;
            }
            fs::rename(dest, staging).map_err(|e| io_err(dest, e))
        }
        None => fs::remove_file(dest).map_err(|e| io_err(dest, e)),
    }
}

fn revert_operation(id: u32, history: &OpHistory) -> Result<()> {
    let start = &history.latest;
    let dest = start.dest_path.as_path();
    let backup = start.backup_path.as_deref().filter(|b| util::exists(b));
    let created = !history.first.dest_existed_before;

    match start.sub_case.file_type() {
        FileType::Directory => {
            if let Some(backup) = backup {
                if util::exists(dest) {
                    if !dest.is_dir() || !util::dir_is_empty(dest)? {
                        return Err(PatchError::StateIntegrity {
                            id,
                            path: dest.display().to_string(),
                            sub_case: Some(start.sub_case),
                            message: "cannot restore directory over existing content".into(),
                        });
                    }
                    fs::remove_dir(dest).map_err(|e| io_err(dest, e))?;
                }
                fs::rename(backup, dest).map_err(|e| io_err(backup, e))?;
            } else if created && dest.is_dir() && util::dir_is_empty(dest)? {
                fs::remove_dir(dest).map_err(|e| io_err(dest, e))?;
            }
        }
        FileType::File => {
            if let Some(backup) = backup {
                if util::exists(dest) {
                    park(dest, start.staging_path.as_deref())?;
                }
                fs::rename(backup, dest).map_err(|e| io_err(backup, e))?;
            } else if created && util::exists(dest) {
                park(dest, start.staging_path.as_deref())?;
            }
        }
    }
    tracing::debug!(id, path = %dest.display(), sub_case = %start.sub_case, "reverted");
    Ok(())
}
