use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dirpatch::{
    create_patch, load_catalog, open_container, resolve_chain, ApplySummary, BuildOptions,
    Compression, Interrupter, LogProgress, Patcher, PatchKind, Version, VersionFrom, VersionRange,
};

#[derive(Parser)]
#[command(
    name = "dirpatch",
    about = "Journaled, resumable binary patches for installed directory trees"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory; omit to build a full patch
        #[arg(long)]
        old: Option<PathBuf>,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Patch identifier (defaults to the target version)
        #[arg(long)]
        id: Option<String>,
        /// Exact version the patch applies to
        #[arg(long, conflicts_with = "from_subsequent")]
        from: Option<Version>,
        /// Lowest version the patch applies to (full patches)
        #[arg(long)]
        from_subsequent: Option<Version>,
        /// Version the patch installs
        #[arg(long)]
        to: Version,
        #[arg(long, value_enum, env = "DIRPATCH_COMPRESSION", default_value_t = Compression::Zstd)]
        compression: Compression,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Recovery journal (defaults to `<target>.<patch id>.journal`)
        #[arg(long, env = "DIRPATCH_JOURNAL")]
        journal: Option<PathBuf>,
        /// Refuse the patch unless it accepts this installed version
        #[arg(long)]
        installed: Option<Version>,
        /// Delete backups and the journal once the patch is fully applied
        #[arg(long)]
        discard_backups: bool,
    },
    /// Undo every operation recorded in a journal
    Revert {
        #[arg(long, env = "DIRPATCH_JOURNAL")]
        journal: PathBuf,
    },
    /// Choose the patches that lead to the newest version
    Resolve {
        /// JSON array of catalog edges
        #[arg(long)]
        catalog: PathBuf,
        /// Currently installed version
        #[arg(long)]
        current: Version,
        /// Only consider full patches
        #[arg(long)]
        full_only: bool,
        /// Print the chain as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a patch's manifest
    Inspect {
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Check a directory against a patch's expected final state
    Verify {
        #[arg(long)]
        target: PathBuf,
        #[arg(long, short)]
        patch: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let interrupter = Interrupter::new();
    let mut worker = {
        let interrupter = interrupter.clone();
        tokio::task::spawn_blocking(move || run(cli.command, &interrupter))
    };

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, cancelling");
            interrupter.cancel();
            worker.await
        }
    };
    joined.context("worker thread panicked")?
}

fn run(command: Commands, interrupter: &Interrupter) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Create {
            old,
            new,
            output,
            id,
            from,
            from_subsequent,
            to,
            compression,
        } => {
            let from = match (from, from_subsequent) {
                (Some(v), None) => VersionFrom::Exact(v),
                (None, Some(v)) => VersionFrom::Subsequent(v),
                _ => bail!("pass exactly one of --from and --from-subsequent"),
            };
            let options = BuildOptions {
                id: id.unwrap_or_else(|| to.to_string()),
                versions: VersionRange { from, to },
                encryption: None,
            };

            println!("Creating patch...");
            println!("  Old: {}", old.as_deref().map_or("<none>".into(), |p| p.display().to_string()));
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let manifest = create_patch(
                old.as_deref(),
                &new,
                &output,
                &options,
                compression,
                None,
                interrupter,
            )
            .with_context(|| format!("creating {}", output.display()))?;

            println!("\nPatch created successfully!");
            print_summary(&ApplySummary::planned(&manifest));
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply {
            target,
            patch,
            journal,
            installed,
            discard_backups,
        } => {
            let mut reader = open_container(&patch, None)
                .with_context(|| format!("opening {}", patch.display()))?;
            let journal =
                journal.unwrap_or_else(|| default_journal(&target, &reader.manifest.id));
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());
            println!("  Journal: {}", journal.display());
            if let Some(installed) = installed {
                if !reader.manifest.versions.accepts(&installed) {
                    bail!(
                        "patch {} does not apply to installed version {installed}",
                        reader.manifest.id
                    );
                }
            }

            let start = Instant::now();
            let patcher = Patcher::new(interrupter.clone());
            let report = match patcher.apply(
                &reader.manifest,
                &mut reader.payload,
                &journal,
                &target,
                &LogProgress::default(),
            ) {
                Ok(report) => report,
                Err(e) => {
                    if e.is_abort() {
                        eprintln!(
                            "Patch aborted. Completed operations can be undone with: dirpatch revert --journal {}",
                            journal.display()
                        );
                    }
                    return Err(e).with_context(|| format!("applying {}", patch.display()));
                }
            };

            if report.already_complete {
                println!("\nPatch already applied.");
            } else if !report.is_complete() {
                println!(
                    "\nPatch applied with {} pending replacement(s):",
                    report.replacements.len()
                );
                for record in &report.replacements {
                    println!(
                        "  {} {} ({})",
                        record.operation_kind,
                        record.dest_path.display(),
                        record.sub_case
                    );
                }
                println!("Run apply again once the files are no longer in use.");
                return Ok(ExitCode::from(2));
            } else {
                println!("\nPatch applied successfully!");
                print_summary(&report.summary);
            }
            if discard_backups {
                patcher.discard_backups(&journal)?;
                println!("  Backups discarded");
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Revert { journal } => {
            let patcher = Patcher::new(interrupter.clone());
            let reverted = patcher
                .revert(&journal)
                .with_context(|| format!("reverting {}", journal.display()))?;
            println!("Reverted {reverted} operation(s).");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resolve {
            catalog,
            current,
            full_only,
            json,
        } => {
            let edges = load_catalog(&catalog)?;
            let chain = resolve_chain(&edges, &current, full_only);
            if json {
                println!("{}", serde_json::to_string_pretty(&chain)?);
            } else if chain.is_empty() {
                println!("No update available for {current}.");
            } else {
                let total: u64 = chain.iter().map(|e| e.download_length).sum();
                for edge in &chain {
                    println!("{}\t-> {}\t{} bytes", edge.id, edge.version_to, edge.download_length);
                }
                println!("Total download: {total} bytes");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inspect { patch } => {
            let reader = open_container(&patch, None)
                .with_context(|| format!("opening {}", patch.display()))?;
            let manifest = &reader.manifest;
            let kind = match manifest.kind {
                PatchKind::Full => "full",
                PatchKind::Incremental => "incremental",
            };
            let from = match &manifest.versions.from {
                VersionFrom::Exact(v) => v.to_string(),
                VersionFrom::Subsequent(v) => format!(">= {v}"),
            };
            println!("Patch {} ({kind}, {:?})", manifest.id, reader.compression);
            println!("  Versions: {from} -> {}", manifest.versions.to);
            println!("  Payload: {} bytes", manifest.payload_length());
            println!("  Validated entries: {}", manifest.validations.len());
            print_summary(&ApplySummary::planned(manifest));
            for op in &manifest.operations {
                println!(
                    "{:>6} {:<8} {:<9} {} ({} bytes)",
                    op.id,
                    op.kind.to_string(),
                    format!("{:?}", op.file_type),
                    op.dest_path,
                    op.payload_length()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { target, patch } => {
            let reader = open_container(&patch, None)
                .with_context(|| format!("opening {}", patch.display()))?;
            Patcher::new(interrupter.clone())
                .validate(&reader.manifest, &target)
                .with_context(|| format!("verifying {}", target.display()))?;
            println!("{} matches patch {}", target.display(), reader.manifest.id);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `<target>.<patch id>.journal`: one journal per patch, beside the target.
fn default_journal(target: &Path, patch_id: &str) -> PathBuf {
    let id: String = patch_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let mut name = target.components().as_path().as_os_str().to_owned();
    name.push(format!(".{id}.journal"));
    PathBuf::from(name)
}

fn print_summary(summary: &ApplySummary) {
    println!("  Directories created: {}", summary.dirs_created);
    println!("  Files added: {}", summary.files_added);
    println!("  Files patched: {}", summary.files_patched);
    println!("  Files replaced: {}", summary.files_replaced);
    println!("  Files forced: {}", summary.files_forced);
    println!("  Files removed: {}", summary.files_removed);
    println!("  Directories removed: {}", summary.dirs_removed);
    if summary.unchanged > 0 {
        println!("  Unchanged: {}", summary.unchanged);
    }
}
