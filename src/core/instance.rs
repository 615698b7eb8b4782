//! Per-instance lifecycle: data directory initialization, process start/stop,
//! port reclamation, and teardown.
//!
//! An [`Instance`] owns one cluster's state machine. No instance ever
//! transitions on behalf of another; the replication coordinator and the
//! orchestrator go through these methods.

use super::error::{Error, Result};
use super::source::recreate_dir;
use super::types::{BuildArtifact, InstanceRole, InstanceSpec, InstanceState};
use crate::exec::Exec;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub struct Instance {
    spec: InstanceSpec,
    state: InstanceState,
    artifact: Option<BuildArtifact>,
}

impl Instance {
    pub fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            state: InstanceState::Uninitialized,
            artifact: None,
        }
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn artifact(&self) -> Option<&BuildArtifact> {
        self.artifact.as_ref()
    }

    pub fn set_failed(&mut self) {
        self.state = InstanceState::Failed;
    }

    fn lifecycle_err(&self, stage: &str, message: impl Into<String>) -> Error {
        Error::Lifecycle {
            role: self.spec.role,
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    fn require_artifact(&self, stage: &str) -> Result<BuildArtifact> {
        self.artifact
            .clone()
            .ok_or_else(|| self.lifecycle_err(stage, "no build artifact for this instance"))
    }

    /// Record a completed build. `Uninitialized -> Built`.
    pub fn mark_built(&mut self, artifact: BuildArtifact) {
        self.artifact = Some(artifact);
        self.state = InstanceState::Built;
    }

    /// Adopt a previously installed prefix without rebuilding (`--skip-build`).
    pub fn adopt_existing(&mut self) -> Result<()> {
        let artifact = BuildArtifact::from_install_dir(&self.spec.install_dir);
        if !artifact.exists() {
            return Err(self.lifecycle_err(
                "adopt",
                format!("installation not found at {}", self.spec.install_dir.display()),
            ));
        }
        self.mark_built(artifact);
        Ok(())
    }

    /// Initialize the data directory with initdb and set the cluster port.
    /// `Built -> DataDirReady`. Replicas are never initdb-initialized; they
    /// are seeded by base backup instead.
    pub fn init_data_dir(&mut self) -> Result<()> {
        if self.spec.role == InstanceRole::Replica {
            return Err(self.lifecycle_err("initdb", "replicas are seeded by base backup"));
        }
        if self.state != InstanceState::Built {
            return Err(self
                .lifecycle_err("initdb", format!("cannot initdb from state {}", self.state)));
        }
        let artifact = self.require_artifact("initdb")?;

        let out = Exec::new(artifact.initdb.display().to_string())
            .arg("-D")
            .arg(self.spec.data_dir.display().to_string())
            .args(["-U", "postgres"])
            .envs(&artifact.exec_env())
            .capture(self.spec.capture_output)
            .run()
            .map_err(|e| self.fail_with("initdb", e.to_string()))?;
        if !out.success() {
            return Err(self.fail_with("initdb", out.error_detail()));
        }

        set_conf_parameter(&self.spec.data_dir, "logging_collector", "'on'")
            .map_err(|e| self.fail_with("initdb", e.to_string()))?;
        set_conf_parameter(&self.spec.data_dir, "port", &self.spec.port.to_string())
            .map_err(|e| self.fail_with("initdb", e.to_string()))?;

        self.state = InstanceState::DataDirReady;
        Ok(())
    }

    /// Finish a replica seed: fix permissions on the copied data directory and
    /// point the cluster at its own port. `Built -> DataDirReady`.
    pub fn complete_seed(&mut self) -> Result<()> {
        if self.spec.role != InstanceRole::Replica {
            return Err(self.lifecycle_err("seed", "only replicas are seeded"));
        }
        if self.state != InstanceState::Built {
            return Err(self.lifecycle_err("seed", format!("cannot seed from state {}", self.state)));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.spec.data_dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| self.fail_with("seed", e.to_string()))?;
        }
        set_conf_parameter(&self.spec.data_dir, "port", &self.spec.port.to_string())
            .map_err(|e| self.fail_with("seed", e.to_string()))?;

        self.state = InstanceState::DataDirReady;
        Ok(())
    }

    /// Start the server. Clears any process already bound to the target port
    /// first, so reruns against a persistent prefix never collide with an
    /// orphaned server. `DataDirReady|Stopped -> Running`.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, InstanceState::DataDirReady | InstanceState::Stopped) {
            return Err(self
                .lifecycle_err("start", format!("cannot start from state {}", self.state)));
        }
        let artifact = self.require_artifact("start")?;

        match release_port(self.spec.port) {
            Ok(true) => info!("[{}] cleared process on port {}", self.spec.role, self.spec.port),
            Ok(false) => {}
            Err(e) => warn!("[{}] port check failed: {}", self.spec.role, e),
        }

        let logfile = self.spec.data_dir.join("logfile");
        let out = Exec::new(artifact.pg_ctl.display().to_string())
            .arg("-D")
            .arg(self.spec.data_dir.display().to_string())
            .arg("-l")
            .arg(logfile.display().to_string())
            .arg("start")
            .envs(&artifact.exec_env())
            .capture(self.spec.capture_output)
            .run()
            .map_err(|e| self.fail_with("start", e.to_string()))?;
        if !out.success() {
            return Err(self.fail_with(
                "start",
                format!("pg_ctl start exited {}: {}", out.exit_code, out.error_detail()),
            ));
        }

        self.state = InstanceState::Running;
        Ok(())
    }

    /// Stop the server. Idempotent: stopping an instance that is not running
    /// (including leftover on-disk clusters from earlier runs) is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let pg_ctl = match &self.artifact {
            Some(a) => a.pg_ctl.clone(),
            None => BuildArtifact::from_install_dir(&self.spec.install_dir).pg_ctl,
        };
        if !self.spec.data_dir.exists() || !pg_ctl.is_file() {
            return Ok(());
        }

        info!("[{}] stopping cluster at {}", self.spec.role, self.spec.data_dir.display());
        let result = Exec::new(pg_ctl.display().to_string())
            .arg("-D")
            .arg(self.spec.data_dir.display().to_string())
            .args(["stop", "-m", "fast"])
            .capture(true)
            .run();

        match result {
            Ok(out) if out.success() => {
                if self.state == InstanceState::Running {
                    self.state = InstanceState::Stopped;
                }
                Ok(())
            }
            Ok(out) if self.state == InstanceState::Running => {
                Err(self.fail_with("stop", out.error_detail()))
            }
            Ok(_) | Err(_) => {
                // Not running, or no cluster there at all.
                warn!("[{}] could not stop cluster (probably not running)", self.spec.role);
                Ok(())
            }
        }
    }

    /// Destroy this instance's on-disk state and return to `Uninitialized`.
    /// Always stops first. With `keep_install` the installation prefix
    /// survives and only the data directory is reset (`--skip-build`).
    pub fn teardown(&mut self, keep_install: bool) -> Result<()> {
        self.stop()?;

        recreate_dir(&self.spec.data_dir)
            .map_err(|e| self.lifecycle_err("teardown", e.to_string()))?;
        if !keep_install {
            recreate_dir(&self.spec.install_dir)
                .map_err(|e| self.lifecycle_err("teardown", e.to_string()))?;
            self.artifact = None;
        }

        self.state = InstanceState::Uninitialized;
        Ok(())
    }

    fn fail_with(&mut self, stage: &str, message: String) -> Error {
        self.state = InstanceState::Failed;
        Error::Lifecycle {
            role: self.spec.role,
            stage: stage.to_string(),
            message,
        }
    }
}

// ============================================================================
// Port reclamation
// ============================================================================

/// Best-effort: find and terminate whatever listens on `port`. Returns whether
/// an owning process was found. A missing process-inspection tool degrades to
/// "not found" rather than failing the start.
pub fn release_port(port: u16) -> std::io::Result<bool> {
    let list = |port: u16| {
        Exec::new("lsof")
            .args(["-t", "-i"])
            .arg(format!("tcp:{}", port))
            .capture(true)
            .run()
    };

    let out = match list(port) {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    // lsof exits nonzero when nothing matches.
    if !out.success() || out.stdout.trim().is_empty() {
        return Ok(false);
    }

    for pid in out.stdout.split_whitespace() {
        warn!("terminating pid {} bound to port {}", pid, port);
        let _ = Exec::new("kill").arg(pid).capture(true).run();
    }
    std::thread::sleep(Duration::from_millis(300));

    // Stragglers get SIGKILL.
    if let Ok(again) = list(port) {
        if again.success() {
            for pid in again.stdout.split_whitespace() {
                let _ = Exec::new("kill").args(["-9", pid]).capture(true).run();
            }
        }
    }
    Ok(true)
}

// ============================================================================
// postgresql.conf editing
// ============================================================================

/// Set `parameter = value` in the cluster's postgresql.conf, replacing an
/// existing assignment or appending a new one.
pub fn set_conf_parameter(data_dir: &Path, parameter: &str, value: &str) -> std::io::Result<()> {
    let conf_path = data_dir.join("postgresql.conf");
    let content = if conf_path.exists() {
        std::fs::read_to_string(&conf_path)?
    } else {
        String::new()
    };

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut found = false;
    for line in lines.iter_mut() {
        if line.trim_start().starts_with(parameter) {
            *line = format!("{} = {}", parameter, value);
            found = true;
            break;
        }
    }
    if !found {
        lines.push(format!("{} = {}", parameter, value));
    }
    std::fs::write(&conf_path, lines.join("\n") + "\n")
}
