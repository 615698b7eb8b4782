//! Source resolution: archive extraction, worktree checkout, patch
//! application, and the `--update-tarball` fetch.
//!
//! Resolution is idempotent per instance: a rerun first removes that
//! instance's previously resolved tree and nothing else.

use super::error::{Error, Result};
use super::types::{InstanceSpec, SourceDescriptor};
use crate::exec::Exec;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Upstream repository used by `--update-tarball`.
pub const UPSTREAM_REPO: &str = "https://github.com/postgres/postgres.git";

/// Serializes every mutation of the shared base clone. Pipeline threads
/// resolving concurrently would otherwise race on `git clone` into the same
/// directory and on git's own lock files during fetch and worktree add.
static REPO_LOCK: Mutex<()> = Mutex::new(());

/// Produce a buildable source tree for one instance: extract or check out,
/// then apply patches in lexicographic order.
pub fn resolve(spec: &InstanceSpec, repo_dir: &Path) -> Result<PathBuf> {
    let tree = match &spec.source {
        SourceDescriptor::Archive(archive) => resolve_archive(spec, archive)?,
        SourceDescriptor::Repository { url, git_ref } => {
            let _guard = REPO_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            ensure_base_clone(spec, url, repo_dir)?;
            checkout_worktree(spec, repo_dir, &git_ref.remote_ref())?
        }
    };
    apply_patches(spec, &tree)?;
    Ok(tree)
}

fn source_err(spec: &InstanceSpec, message: impl Into<String>) -> Error {
    Error::Source {
        role: spec.role,
        message: message.into(),
    }
}

/// Remove a directory tree if present and recreate it empty.
pub(crate) fn recreate_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}

// ============================================================================
// Archive mode
// ============================================================================

fn resolve_archive(spec: &InstanceSpec, archive: &Path) -> Result<PathBuf> {
    if !archive.is_file() {
        return Err(source_err(
            spec,
            format!("source tarball not found: {}", archive.display()),
        ));
    }
    recreate_dir(&spec.source_dir)
        .map_err(|e| source_err(spec, format!("cannot reset {}: {}", spec.source_dir.display(), e)))?;

    info!("extracting {} to {}", archive.display(), spec.source_dir.display());
    let file = std::fs::File::open(archive)
        .map_err(|e| source_err(spec, format!("cannot open {}: {}", archive.display(), e)))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(&spec.source_dir)
        .map_err(|e| source_err(spec, format!("extraction failed: {}", e)))?;

    extracted_root(&spec.source_dir)
        .ok_or_else(|| source_err(spec, "extraction produced no source directory"))
}

/// The single top-level directory an archive unpacks to.
fn extracted_root(target: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(target).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
}

// ============================================================================
// Repository mode
// ============================================================================

/// Clone the shared base repository if absent, otherwise refresh it.
fn ensure_base_clone(spec: &InstanceSpec, url: &str, repo_dir: &Path) -> Result<()> {
    let run = |exec: Exec| -> Result<()> {
        let out = exec
            .capture(spec.capture_output)
            .run()
            .map_err(|e| source_err(spec, format!("git: {}", e)))?;
        if out.success() {
            Ok(())
        } else {
            Err(source_err(spec, out.error_detail()))
        }
    };

    if repo_dir.join(".git").exists() {
        run(Exec::new("git")
            .args(["fetch", "origin", "--tags", "--prune"])
            .cwd(repo_dir))
    } else {
        if let Some(parent) = repo_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run(Exec::new("git")
            .arg("clone")
            .arg(url)
            .arg(repo_dir.display().to_string()))
    }
}

/// Create (or recreate) the per-role worktree at the requested remote ref.
fn checkout_worktree(spec: &InstanceSpec, repo_dir: &Path, remote_ref: &str) -> Result<PathBuf> {
    let dir = &spec.source_dir;

    // Drop any prior worktree for this role only.
    if dir.exists() {
        let _ = Exec::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(dir.display().to_string())
            .cwd(repo_dir)
            .capture(true)
            .run();
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        let _ = Exec::new("git")
            .args(["worktree", "prune"])
            .cwd(repo_dir)
            .capture(true)
            .run();
    }
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("checking out {} into {}", remote_ref, dir.display());
    let out = Exec::new("git")
        .args(["worktree", "add", "--detach"])
        .arg(dir.display().to_string())
        .arg(remote_ref)
        .cwd(repo_dir)
        .capture(spec.capture_output)
        .run()
        .map_err(|e| source_err(spec, format!("git: {}", e)))?;
    if !out.success() {
        return Err(source_err(
            spec,
            format!("worktree add {} failed: {}", remote_ref, out.error_detail()),
        ));
    }
    Ok(dir.clone())
}

// ============================================================================
// Patches
// ============================================================================

/// Glob-match patch files and return them in lexicographic apply order.
pub(crate) fn collect_patch_files(pattern: &str) -> std::result::Result<Vec<PathBuf>, String> {
    let paths = glob::glob(pattern).map_err(|e| format!("bad patch glob: {}", e))?;
    let mut files: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
    files.sort();
    Ok(files)
}

/// Apply patches in order. The first failure aborts with the failing file
/// named; earlier patches remain applied (no rollback).
pub fn apply_patches(spec: &InstanceSpec, tree: &Path) -> Result<()> {
    let Some(ref pattern) = spec.patch_glob else {
        return Ok(());
    };

    let files = collect_patch_files(pattern).map_err(|e| source_err(spec, e))?;
    if files.is_empty() {
        return Err(source_err(spec, format!("no patch files matched: {}", pattern)));
    }

    // git am preserves authorship for git checkouts; plain trees get patch(1).
    let use_git = tree.join(".git").exists();

    for file in files {
        info!("applying patch: {}", file.display());
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.display().to_string());
        let patch_err = |message: String| Error::Patch {
            role: spec.role,
            file: name.clone(),
            message,
        };

        let exec = if use_git {
            Exec::new("git").arg("am").arg(file.display().to_string())
        } else {
            Exec::new("patch")
                .args(["-p1", "-i"])
                .arg(file.display().to_string())
        };
        let out = exec
            .cwd(tree)
            .capture(spec.capture_output)
            .run()
            .map_err(|e| patch_err(e.to_string()))?;
        if !out.success() {
            return Err(patch_err(out.error_detail()));
        }
    }
    Ok(())
}

// ============================================================================
// --update-tarball
// ============================================================================

/// Clone the latest upstream source and write it as a gzipped tarball with a
/// top-level `postgres/` directory. Touches no instance.
pub fn update_tarball(dest: &Path) -> Result<()> {
    let tmp = tempfile::tempdir().map_err(|e| Error::Tarball(e.to_string()))?;
    let clone_dir = tmp.path().join("postgres");

    info!("cloning latest PostgreSQL from {}", UPSTREAM_REPO);
    let out = Exec::new("git")
        .arg("clone")
        .arg(UPSTREAM_REPO)
        .arg(clone_dir.display().to_string())
        .run()
        .map_err(|e| Error::Tarball(format!("git: {}", e)))?;
    if !out.success() {
        return Err(Error::Tarball(format!("clone failed: {}", out.error_detail())));
    }

    write_tarball(&clone_dir, dest).map_err(|e| Error::Tarball(e.to_string()))?;
    info!("tarball written to {}", dest.display());
    Ok(())
}

fn write_tarball(src_dir: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(dest)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all("postgres", src_dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BuildSystem, GitRef, InstanceRole};

    fn archive_spec(dir: &Path, archive: &Path) -> InstanceSpec {
        InstanceSpec {
            role: InstanceRole::Primary,
            source: SourceDescriptor::Archive(archive.to_path_buf()),
            patch_glob: None,
            build_system: BuildSystem::Meson,
            build_flags: vec![],
            port: 5432,
            install_dir: dir.join("pghome_primary"),
            source_dir: dir.join("source/src_primary"),
            data_dir: dir.join("pgdata/primary"),
            activate_script: dir.join("activate_primary.sh"),
            capture_output: true,
        }
    }

    fn make_tarball(dir: &Path, top: &str) -> PathBuf {
        let src = dir.join(top);
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("configure"), "#!/bin/sh\n").unwrap();
        let dest = dir.join("src.tar.gz");
        write_tarball(&src, &dest).unwrap();
        dest
    }

    #[test]
    fn test_resolve_archive_returns_extracted_root() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path(), "postgres");
        let spec = archive_spec(dir.path(), &tarball);

        let tree = resolve(&spec, &dir.path().join("repo")).unwrap();
        assert_eq!(tree, spec.source_dir.join("postgres"));
        assert!(tree.join("configure").is_file());
    }

    #[test]
    fn test_resolve_archive_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path(), "postgres");
        let spec = archive_spec(dir.path(), &tarball);

        let first = resolve(&spec, &dir.path().join("repo")).unwrap();
        // A stale file from a previous run must not survive the rerun.
        std::fs::write(spec.source_dir.join("stale.o"), "junk").unwrap();
        let second = resolve(&spec, &dir.path().join("repo")).unwrap();
        assert_eq!(first, second);
        assert!(!spec.source_dir.join("stale.o").exists());
    }

    #[test]
    fn test_resolve_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let spec = archive_spec(dir.path(), &dir.path().join("nope.tar.gz"));
        let err = resolve(&spec, &dir.path().join("repo")).unwrap_err();
        assert!(matches!(err, Error::Source { role: InstanceRole::Primary, .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_collect_patch_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["010-z.patch", "001-a.patch", "002-b.patch"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let pattern = format!("{}/*.patch", dir.path().display());
        let files = collect_patch_files(&pattern).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["001-a.patch", "002-b.patch", "010-z.patch"]);
    }

    #[test]
    fn test_apply_patches_empty_match_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path(), "postgres");
        let mut spec = archive_spec(dir.path(), &tarball);
        spec.patch_glob = Some(format!("{}/missing-*.patch", dir.path().display()));
        let err = resolve(&spec, &dir.path().join("repo")).unwrap_err();
        assert!(matches!(err, Error::Source { .. }));
        assert!(err.to_string().contains("no patch files matched"));
    }

    #[test]
    fn test_failing_patch_names_file_and_leaves_earlier_applied() {
        if Exec::new("patch").arg("--version").capture(true).run().is_err() {
            return; // patch(1) unavailable in this environment
        }

        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("notes.txt"), "one\n").unwrap();

        let patches = dir.path().join("patches");
        std::fs::create_dir_all(&patches).unwrap();
        std::fs::write(
            patches.join("001-ok.patch"),
            "--- a/notes.txt\n+++ b/notes.txt\n@@ -1 +1,2 @@\n one\n+two\n",
        )
        .unwrap();
        std::fs::write(patches.join("003-bad.patch"), "this is not a patch\n").unwrap();

        let mut spec = archive_spec(dir.path(), &dir.path().join("unused.tar.gz"));
        spec.patch_glob = Some(format!("{}/*.patch", patches.display()));

        let err = apply_patches(&spec, &tree).unwrap_err();
        match err {
            Error::Patch { ref file, .. } => assert_eq!(file, "003-bad.patch"),
            other => panic!("expected patch error, got {:?}", other),
        }
        // 001 stays applied; no rollback.
        let content = std::fs::read_to_string(tree.join("notes.txt")).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    fn git_available() -> bool {
        Exec::new("git").arg("--version").capture(true).run().is_ok()
    }

    fn git(dir: &Path, args: &[&str]) {
        let out = Exec::new("git")
            .args(args.iter().copied())
            .cwd(dir)
            .capture(true)
            .run()
            .unwrap();
        assert!(out.success(), "git {:?}: {}", args, out.error_detail());
    }

    /// A local origin repository with one commit on branch `trunk`.
    fn make_origin(dir: &Path) -> PathBuf {
        let origin = dir.join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["checkout", "-q", "-b", "trunk"]);
        std::fs::write(origin.join("configure"), "#!/bin/sh\n").unwrap();
        git(&origin, &["add", "."]);
        git(
            &origin,
            &[
                "-c", "user.email=dev@localhost",
                "-c", "user.name=dev",
                "commit", "-q", "-m", "initial",
            ],
        );
        origin
    }

    fn repo_spec(dir: &Path, role: InstanceRole, url: &str) -> InstanceSpec {
        InstanceSpec {
            role,
            source: SourceDescriptor::Repository {
                url: url.to_string(),
                git_ref: GitRef::Branch("trunk".to_string()),
            },
            patch_glob: None,
            build_system: BuildSystem::Meson,
            build_flags: vec![],
            port: 5432,
            install_dir: dir.join(format!("pghome_{}", role)),
            source_dir: dir.join("worktrees").join(role.as_str()),
            data_dir: dir.join("pgdata").join(role.as_str()),
            activate_script: dir.join(format!("activate_{}.sh", role)),
            capture_output: true,
        }
    }

    #[test]
    fn test_repository_resolve_reuses_clone_and_recreates_worktree() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = make_origin(dir.path());
        let repo = dir.path().join("repo");
        let spec = repo_spec(dir.path(), InstanceRole::Primary, &origin.display().to_string());

        let first = resolve(&spec, &repo).unwrap();
        assert_eq!(first, spec.source_dir);
        assert!(first.join("configure").is_file());
        assert!(repo.join(".git").exists());

        // Rerun fetches the existing clone and recreates the worktree; build
        // leftovers from the previous run must not survive.
        std::fs::write(first.join("stale.o"), "junk").unwrap();
        let second = resolve(&spec, &repo).unwrap();
        assert_eq!(first, second);
        assert!(second.join("configure").is_file());
        assert!(!second.join("stale.o").exists());
    }

    #[test]
    fn test_concurrent_multi_role_resolve_shares_base_clone() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = make_origin(dir.path());
        let url = origin.display().to_string();
        let repo = dir.path().join("repo");
        let primary = repo_spec(dir.path(), InstanceRole::Primary, &url);
        let fdw = repo_spec(dir.path(), InstanceRole::Fdw, &url);

        // Two pipelines resolving at once must not race on the shared clone.
        let (a, b) = std::thread::scope(|scope| {
            let h1 = scope.spawn(|| resolve(&primary, &repo));
            let h2 = scope.spawn(|| resolve(&fdw, &repo));
            (h1.join().unwrap(), h2.join().unwrap())
        });
        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a, b);
        assert!(a.join("configure").is_file());
        assert!(b.join("configure").is_file());
    }

    #[test]
    fn test_recreate_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("scratch");
        std::fs::create_dir_all(target.join("sub")).unwrap();
        std::fs::write(target.join("sub/file"), "x").unwrap();
        recreate_dir(&target).unwrap();
        assert!(target.exists());
        assert!(!target.join("sub").exists());
    }

    #[test]
    fn test_tarball_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("work");
        std::fs::create_dir_all(src.join("src")).unwrap();
        std::fs::write(src.join("src/main.c"), "int main(void) { return 0; }\n").unwrap();
        let dest = dir.path().join("out.tar.gz");
        write_tarball(&src, &dest).unwrap();

        let out = dir.path().join("unpacked");
        std::fs::create_dir_all(&out).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(std::fs::File::open(&dest).unwrap()));
        tar.unpack(&out).unwrap();
        assert!(out.join("postgres/src/main.c").is_file());
    }
}
