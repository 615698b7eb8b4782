//! Build backends: compile a resolved source tree into an isolated
//! installation prefix with meson or make.
//!
//! Stages run strictly in order and are never retried; the first nonzero exit
//! is terminal for that instance's pipeline.

use super::error::{Error, Result};
use super::types::{BuildArtifact, BuildSystem, InstanceSpec};
use crate::exec::Exec;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Compile and install `source_tree` into the spec's installation prefix.
pub fn build(spec: &InstanceSpec, source_tree: &Path) -> Result<BuildArtifact> {
    info!(
        "building {} with {} into {}",
        source_tree.display(),
        spec.build_system,
        spec.install_dir.display()
    );

    let log_path = build_log_path(source_tree);
    if spec.capture_output {
        // Fresh log per build.
        let _ = std::fs::remove_file(&log_path);
    }

    for (stage, exec) in stages(spec, source_tree) {
        run_stage(spec, &stage, exec, &log_path)?;
    }

    let mut artifact = BuildArtifact::from_install_dir(&spec.install_dir);
    if spec.capture_output {
        artifact.build_log = Some(log_path);
    }
    Ok(artifact)
}

fn build_log_path(source_tree: &Path) -> PathBuf {
    source_tree.join("build.log")
}

/// The ordered external-tool invocations for the selected backend.
fn stages(spec: &InstanceSpec, source_tree: &Path) -> Vec<(String, Exec)> {
    let prefix_flag = format!("--prefix={}", spec.install_dir.display());
    match spec.build_system {
        BuildSystem::Meson => {
            let build_dir = source_tree.join("build");
            vec![
                (
                    "meson setup".to_string(),
                    Exec::new("meson")
                        .args(["setup", "build"])
                        .arg(prefix_flag)
                        .args(spec.build_flags.iter().cloned())
                        .cwd(source_tree),
                ),
                ("ninja".to_string(), Exec::new("ninja").cwd(&build_dir)),
                (
                    "ninja install".to_string(),
                    Exec::new("ninja").arg("install").cwd(&build_dir),
                ),
            ]
        }
        BuildSystem::Make => vec![
            (
                "configure".to_string(),
                Exec::new("./configure")
                    .arg(prefix_flag)
                    .args(spec.build_flags.iter().cloned())
                    .cwd(source_tree),
            ),
            ("make".to_string(), Exec::new("make").cwd(source_tree)),
            (
                "make install".to_string(),
                Exec::new("make").arg("install").cwd(source_tree),
            ),
        ],
    }
}

fn run_stage(spec: &InstanceSpec, stage: &str, exec: Exec, log_path: &Path) -> Result<()> {
    let build_err = |message: String| Error::Build {
        role: spec.role,
        stage: stage.to_string(),
        message,
    };

    let out = exec
        .capture(spec.capture_output)
        .run()
        .map_err(|e| build_err(e.to_string()))?;

    if spec.capture_output {
        let _ = append_log(log_path, stage, &out.stdout, &out.stderr);
    }

    if out.success() {
        Ok(())
    } else {
        Err(build_err(format!(
            "exit code {}: {}",
            out.exit_code,
            tail(&out.error_detail(), 30)
        )))
    }
}

fn append_log(path: &Path, stage: &str, stdout: &str, stderr: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "==== {} ====", stage)?;
    if !stdout.is_empty() {
        file.write_all(stdout.as_bytes())?;
    }
    if !stderr.is_empty() {
        file.write_all(stderr.as_bytes())?;
    }
    Ok(())
}

/// Last `n` lines of a blob of tool output.
fn tail(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
