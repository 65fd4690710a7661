use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn dirpatch_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dirpatch"))
}

fn run(args: &[&str]) -> Output {
    Command::new(dirpatch_exe())
        .args(args)
        .env_remove("DIRPATCH_JOURNAL")
        .env_remove("DIRPATCH_COMPRESSION")
        .output()
        .expect("Failed to run dirpatch")
}

fn assert_success(output: &Output, what: &str) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "dirpatch {what} failed:\nstdout: {stdout}\nstderr: {stderr}"
    );
    stdout
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(root).unwrap();
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");

        if path.is_dir() {
            // Directories are recorded with a trailing slash so empty ones count.
            entries.push((format!("{rel}/"), Vec::new()));
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((rel, content));
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            fs::copy(&src_path, &dst_path).unwrap();
        }
    }
}

struct Trees {
    temp: tempfile::TempDir,
    old: PathBuf,
    new: PathBuf,
    target: PathBuf,
    patch: PathBuf,
}

/// An installed v1 tree, the v2 tree, and a target copy of v1.
fn trees() -> Trees {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    let target = temp.path().join("target");
    let patch = temp.path().join("update.patch");

    create_dir_tree(
        &old,
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &vec![0xAA; 8192]),
            ("data/old_file.txt", b"This file will be deleted"),
            ("obsolete/remove_me.txt", b"Going away"),
        ],
    );

    let mut modified_bin = vec![0xAA; 4096];
    modified_bin.extend_from_slice(&[0xBB; 4096]);
    create_dir_tree(
        &new,
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            ("config/settings.json", b"{\"version\": 2, \"debug\": true, \"newField\": 42}"),
            ("data/records.bin", &modified_bin),
            ("data/new_file.txt", b"Brand new file in version 2"),
            ("extras/bonus.dat", &vec![0xFF; 1024]),
        ],
    );
    copy_dir_recursive(&old, &target);

    Trees {
        temp,
        old,
        new,
        target,
        patch,
    }
}

fn create_incremental(t: &Trees) {
    let output = run(&[
        "create", "--old", s(&t.old), "--new", s(&t.new), "--output", s(&t.patch),
        "--from", "1.0", "--to", "2.0",
    ]);
    assert_success(&output, "create");
    assert!(fs::metadata(&t.patch).unwrap().len() > 6);
    assert_eq!(&fs::read(&t.patch).unwrap()[..5], b"PATCH");
}

#[test]
fn test_end_to_end_apply_verify_revert() {
    let t = trees();
    let journal = t.temp.path().join("target.2.0.journal");
    create_incremental(&t);

    let stdout = assert_success(&run(&["inspect", "--patch", s(&t.patch)]), "inspect");
    assert!(stdout.contains("Patch 2.0 (incremental, Zstd)"), "{stdout}");
    assert!(stdout.contains("obsolete/remove_me.txt"), "{stdout}");

    let output = run(&["apply", "--target", s(&t.target), "--patch", s(&t.patch)]);
    let stdout = assert_success(&output, "apply");
    assert!(stdout.contains("Patch applied successfully!"), "{stdout}");
    assert!(journal.exists(), "default journal sits next to the target");
    assert_eq!(collect_dir_tree(&t.target), collect_dir_tree(&t.new));
    assert!(!t.target.join("obsolete").exists());

    assert_success(
        &run(&["verify", "--target", s(&t.target), "--patch", s(&t.patch)]),
        "verify",
    );

    let again = run(&["apply", "--target", s(&t.target), "--patch", s(&t.patch)]);
    assert!(assert_success(&again, "apply").contains("already applied"));

    assert_success(&run(&["revert", "--journal", s(&journal)]), "revert");
    assert_eq!(collect_dir_tree(&t.target), collect_dir_tree(&t.old));

    let verify = run(&["verify", "--target", s(&t.target), "--patch", s(&t.patch)]);
    assert_eq!(verify.status.code(), Some(1));
}

#[test]
fn test_chained_patches_keep_separate_journals() {
    let t = trees();
    create_incremental(&t);

    let newer = t.temp.path().join("newer");
    create_dir_tree(
        &newer,
        &[
            ("readme.txt", b"Hello, World! This is version 3."),
            ("config/settings.json", b"{\"version\": 3}"),
            ("data/new_file.txt", b"Brand new file in version 2"),
        ],
    );
    let second = t.temp.path().join("second.patch");
    assert_success(
        &run(&[
            "create", "--old", s(&t.new), "--new", s(&newer), "--output", s(&second),
            "--from", "2.0", "--to", "3.0",
        ]),
        "create",
    );

    assert_success(&run(&["apply", "--target", s(&t.target), "--patch", s(&t.patch)]), "apply");
    let stdout = assert_success(
        &run(&["apply", "--target", s(&t.target), "--patch", s(&second)]),
        "apply",
    );
    assert!(stdout.contains("Patch applied successfully!"), "{stdout}");
    assert_eq!(collect_dir_tree(&t.target), collect_dir_tree(&newer));
    assert!(t.temp.path().join("target.2.0.journal").exists());
    assert!(t.temp.path().join("target.3.0.journal").exists());

    // One journal cannot be reused for a different patch.
    let journal = t.temp.path().join("target.2.0.journal");
    let output = run(&[
        "apply", "--target", s(&t.target), "--patch", s(&second), "--journal", s(&journal),
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_apply_with_discard_backups() {
    let t = trees();
    let journal = t.temp.path().join("custom").join("state.journal");
    create_incremental(&t);

    let output = Command::new(dirpatch_exe())
        .args(["apply", "--target", s(&t.target), "--patch", s(&t.patch), "--discard-backups"])
        .env("DIRPATCH_JOURNAL", &journal)
        .output()
        .unwrap();
    assert_success(&output, "apply");
    assert_eq!(collect_dir_tree(&t.target), collect_dir_tree(&t.new));
    assert!(!journal.exists());
    assert!(!t.temp.path().join("custom").join("state.journal.work").exists());
}

#[test]
fn test_locally_modified_target_aborts() {
    let t = trees();
    create_incremental(&t);
    fs::write(t.target.join("readme.txt"), b"edited by hand").unwrap();

    let output = run(&["apply", "--target", s(&t.target), "--patch", s(&t.patch)]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dirpatch revert"), "{stderr}");
}

#[test]
fn test_installed_version_is_checked() {
    let t = trees();
    create_incremental(&t);
    let output = run(&[
        "apply", "--target", s(&t.target), "--patch", s(&t.patch), "--installed", "1.5",
    ]);
    assert!(!output.status.success());
    assert_eq!(collect_dir_tree(&t.target), collect_dir_tree(&t.old));
}

#[test]
fn test_full_patch_onto_empty_target() {
    let t = trees();
    let empty = t.temp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();

    let output = Command::new(dirpatch_exe())
        .args([
            "create", "--new", s(&t.new), "--output", s(&t.patch),
            "--from-subsequent", "0", "--to", "2.0",
        ])
        .env("DIRPATCH_COMPRESSION", "gzip")
        .output()
        .unwrap();
    assert_success(&output, "create");
    assert_eq!(fs::read(&t.patch).unwrap()[5], 0, "gzip method code");

    let stdout = assert_success(&run(&["inspect", "--patch", s(&t.patch)]), "inspect");
    assert!(stdout.contains("(full, Gzip)"), "{stdout}");

    assert_success(
        &run(&["apply", "--target", s(&empty), "--patch", s(&t.patch)]),
        "apply",
    );
    assert_eq!(collect_dir_tree(&empty), collect_dir_tree(&t.new));
}

#[test]
fn test_create_requires_a_source_version() {
    let t = trees();
    let output = run(&[
        "create", "--old", s(&t.old), "--new", s(&t.new), "--output", s(&t.patch), "--to", "2.0",
    ]);
    assert!(!output.status.success());
    assert!(!t.patch.exists());
}

#[test]
fn test_resolve_picks_cheapest_chain() {
    let temp = tempfile::tempdir().unwrap();
    let catalog = temp.path().join("catalog.json");
    fs::write(
        &catalog,
        r#"[
            {"id": "A", "version_from": "1.0", "version_to": "1.1", "download_length": 10485760},
            {"id": "B", "version_from": "1.0", "version_to": "1.2", "download_length": 15728640},
            {"id": "C", "version_from": "1.1", "version_to": "1.2", "download_length": 4194304}
        ]"#,
    )
    .unwrap();

    let output = run(&["resolve", "--catalog", s(&catalog), "--current", "1.0", "--json"]);
    let stdout = assert_success(&output, "resolve");
    let chain: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    let ids: Vec<&str> = chain.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["A", "C"]);

    let output = run(&["resolve", "--catalog", s(&catalog), "--current", "1.2"]);
    assert!(assert_success(&output, "resolve").contains("No update available"));
}
