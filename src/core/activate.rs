//! Shell activation artifacts: one `activate_<role>.sh` per instance,
//! exporting the environment and helper functions for working against that
//! role's installation and data directory.

use super::types::InstanceSpec;
use std::path::{Path, PathBuf};

/// Render the activation script for one instance. `indent_dir` is the
/// directory holding `pg_bsd_indent` from the build tree, when found.
pub fn render(spec: &InstanceSpec, indent_dir: Option<&Path>) -> String {
    let home = spec.install_dir.display();
    let data = spec.data_dir.display();
    let path_extra = match indent_dir {
        Some(dir) => format!("{}/bin:{}", home, dir.display()),
        None => format!("{}/bin", home),
    };

    let mut lines = vec![
        format!("export PGHOME={}", home),
        format!("export PATH={}:$PATH", path_extra),
        format!("export LD_LIBRARY_PATH={}/lib", home),
        format!("export PGDATA={}", data),
        "export PGUSER=postgres".to_string(),
        "export PGDATABASE=postgres".to_string(),
        format!("export PGPORT={}", spec.port),
        format!("alias PG_START=\"pg_ctl -D {} start\"", data),
        format!("alias PG_STOP=\"pg_ctl -D {} stop\"", data),
        String::new(),
        "# Build/test helper functions".to_string(),
    ];
    lines.extend(HELPERS.lines().map(str::to_string));
    lines.join("\n") + "\n"
}

const HELPERS: &str = r#"function pg_check_extension() {
    meson test -q --print-errorlogs --suite setup --suite $1
}

function pg_check_world() {
    meson test -q --print-errorlogs
}

function pg_build_docs() {
    ninja docs
}

function pg_list_tests() {
    meson test --list
}

function pg_run_suite() {
    meson test -v -C . --suite "$1"
}"#;

/// Write the activation script to the spec's configured path.
pub fn write_script(spec: &InstanceSpec, indent_dir: Option<&Path>) -> std::io::Result<()> {
    std::fs::write(&spec.activate_script, render(spec, indent_dir))
}

/// Locate the directory containing the `pg_bsd_indent` binary anywhere under
/// the build tree. Best-effort; the activation script just omits the PATH
/// entry when it is missing.
pub fn find_pg_bsd_indent(build_root: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(build_root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if let Some(found) = find_pg_bsd_indent(&path) {
                return Some(found);
            }
        } else if path.file_name().is_some_and(|n| n == "pg_bsd_indent") && is_executable(&path) {
            return path.parent().map(Path::to_path_buf);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BuildSystem, InstanceRole, SourceDescriptor};

    fn spec(dir: &Path) -> InstanceSpec {
        InstanceSpec {
            role: InstanceRole::Primary,
            source: SourceDescriptor::Archive(dir.join("src.tar.gz")),
            patch_glob: None,
            build_system: BuildSystem::Meson,
            build_flags: vec![],
            port: 5432,
            install_dir: dir.join("pghome_primary"),
            source_dir: dir.join("source/src_primary"),
            data_dir: dir.join("pgdata/primary"),
            activate_script: dir.join("activate_primary.sh"),
            capture_output: false,
        }
    }

    #[test]
    fn test_render_exports() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec(dir.path());
        let script = render(&s, None);
        assert!(script.contains(&format!("export PGHOME={}", s.install_dir.display())));
        assert!(script.contains(&format!("export PGDATA={}", s.data_dir.display())));
        assert!(script.contains("export PGPORT=5432"));
        assert!(script.contains("export PGUSER=postgres"));
        assert!(script.contains("alias PG_START="));
        assert!(script.contains("alias PG_STOP="));
        assert!(script.contains("function pg_check_world()"));
    }

    #[test]
    fn test_render_includes_indent_dir_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec(dir.path());
        let script = render(&s, Some(Path::new("/b/src/tools/pg_bsd_indent")));
        assert!(script.contains("/b/src/tools/pg_bsd_indent:$PATH"));
    }

    #[test]
    fn test_write_script() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec(dir.path());
        write_script(&s, None).unwrap();
        let content = std::fs::read_to_string(&s.activate_script).unwrap();
        assert!(content.ends_with("\n"));
        assert!(content.contains("PGPORT"));
    }

    #[test]
    fn test_find_pg_bsd_indent_nested() {
        let dir = tempfile::tempdir().unwrap();
        let tool_dir = dir.path().join("build/src/tools/pg_bsd_indent");
        std::fs::create_dir_all(&tool_dir).unwrap();
        let bin = tool_dir.join("pg_bsd_indent");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let found = find_pg_bsd_indent(dir.path()).unwrap();
        assert_eq!(found, tool_dir);
    }

    #[test]
    fn test_find_pg_bsd_indent_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        assert!(find_pg_bsd_indent(dir.path()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_pg_bsd_indent_ignores_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pg_bsd_indent"), "not a binary").unwrap();
        assert!(find_pg_bsd_indent(dir.path()).is_none());
    }
}
