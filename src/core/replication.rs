//! Streaming replication bootstrap: seed a replica from a running primary via
//! physical base backup and start it in recovery mode.

use super::error::{Error, Result};
use super::instance::Instance;
use super::source::recreate_dir;
use super::types::InstanceState;
use crate::exec::Exec;
use std::time::Duration;
use tracing::info;

/// Bounded readiness poll against the primary. Fixed interval, no infinite
/// retry; exhaustion fails the replica pipeline and leaves the primary alone.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// Establish streaming replication: wait for the primary to accept
/// connections, seed the replica's data directory with `pg_basebackup -R`,
/// then bring the replica up through its own lifecycle manager.
pub fn establish(primary_port: u16, replica: &mut Instance, probe: &ReadinessProbe) -> Result<()> {
    let role = replica.spec().role;
    let repl_err = |message: String| Error::Replication { role, message };

    if replica.state() != InstanceState::Built {
        return Err(repl_err(format!(
            "cannot seed replica from state {}",
            replica.state()
        )));
    }
    let artifact = replica
        .artifact()
        .cloned()
        .ok_or_else(|| repl_err("no build artifact for replica".to_string()))?;

    // Precondition: the primary must actually be accepting connections.
    let mut ready = false;
    for attempt in 1..=probe.attempts {
        let out = Exec::new(artifact.pg_isready.display().to_string())
            .args(["-h", "localhost", "-p"])
            .arg(primary_port.to_string())
            .envs(&artifact.exec_env())
            .capture(true)
            .run();
        if matches!(out, Ok(ref o) if o.success()) {
            ready = true;
            break;
        }
        info!("waiting for primary on port {} (attempt {}/{})", primary_port, attempt, probe.attempts);
        std::thread::sleep(probe.interval);
    }
    if !ready {
        return Err(repl_err(format!(
            "primary on port {} not accepting connections after {} attempts",
            primary_port, probe.attempts
        )));
    }

    // Seed: physical base backup with WAL streaming into a fresh data dir.
    recreate_dir(&replica.spec().data_dir).map_err(|e| repl_err(e.to_string()))?;
    let mut backup = Exec::new(artifact.pg_basebackup.display().to_string())
        .arg("-D")
        .arg(replica.spec().data_dir.display().to_string())
        .args(["-R", "-X", "stream", "-c", "fast", "-U", "postgres", "-h", "localhost", "-p"])
        .arg(primary_port.to_string());
    if !replica.spec().capture_output {
        backup = backup.arg("-P");
    }
    let out = backup
        .envs(&artifact.exec_env())
        .capture(replica.spec().capture_output)
        .run();
    match out {
        Ok(o) if o.success() => {}
        Ok(o) => {
            replica.set_failed();
            return Err(repl_err(format!("pg_basebackup failed: {}", o.error_detail())));
        }
        Err(e) => {
            replica.set_failed();
            return Err(repl_err(format!("pg_basebackup: {}", e)));
        }
    }

    // pg_basebackup -R already wrote standby.signal and primary_conninfo;
    // the lifecycle manager fixes permissions and the replica's own port.
    replica.complete_seed()?;
    replica.start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BuildSystem, InstanceRole, InstanceSpec, SourceDescriptor};
    use std::path::{Path, PathBuf};

    fn replica_spec(dir: &Path) -> InstanceSpec {
        InstanceSpec {
            role: InstanceRole::Replica,
            source: SourceDescriptor::Archive(dir.join("src.tar.gz")),
            patch_glob: None,
            build_system: BuildSystem::Meson,
            build_flags: vec![],
            port: 54020,
            install_dir: dir.join("pghome_replica"),
            source_dir: dir.join("source/src_replica"),
            data_dir: dir.join("pgdata/replica"),
            activate_script: dir.join("activate_replica.sh"),
            capture_output: true,
        }
    }

    fn stub_bin(install_dir: &Path, name: &str, body: &str) -> PathBuf {
        let bin = install_dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn stub_install(install_dir: &Path) {
        for name in ["pg_ctl", "initdb", "pg_basebackup", "pg_isready"] {
            stub_bin(install_dir, name, "#!/bin/sh\nexit 0\n");
        }
    }

    fn fast_probe() -> ReadinessProbe {
        ReadinessProbe {
            attempts: 2,
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_establish_brings_replica_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let spec = replica_spec(dir.path());
        stub_install(&spec.install_dir);

        let mut replica = Instance::new(spec);
        replica.adopt_existing().unwrap();
        establish(54000, &mut replica, &fast_probe()).unwrap();

        assert_eq!(replica.state(), InstanceState::Running);
        let conf =
            std::fs::read_to_string(replica.spec().data_dir.join("postgresql.conf")).unwrap();
        assert!(conf.contains("port = 54020"));
    }

    #[test]
    fn test_primary_not_ready_exhausts_probe() {
        let dir = tempfile::tempdir().unwrap();
        let spec = replica_spec(dir.path());
        stub_install(&spec.install_dir);
        stub_bin(&spec.install_dir, "pg_isready", "#!/bin/sh\nexit 2\n");

        let mut replica = Instance::new(spec);
        replica.adopt_existing().unwrap();
        let err = establish(54000, &mut replica, &fast_probe()).unwrap_err();
        assert!(matches!(err, Error::Replication { role: InstanceRole::Replica, .. }));
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[test]
    fn test_seed_failure_marks_replica_failed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = replica_spec(dir.path());
        stub_install(&spec.install_dir);
        stub_bin(
            &spec.install_dir,
            "pg_basebackup",
            "#!/bin/sh\necho 'connection refused' >&2\nexit 1\n",
        );

        let mut replica = Instance::new(spec);
        replica.adopt_existing().unwrap();
        let err = establish(54000, &mut replica, &fast_probe()).unwrap_err();
        assert!(err.to_string().contains("pg_basebackup failed"));
        assert_eq!(replica.state(), InstanceState::Failed);
    }

    #[test]
    fn test_establish_requires_built_replica() {
        let dir = tempfile::tempdir().unwrap();
        let mut replica = Instance::new(replica_spec(dir.path()));
        let err = establish(54000, &mut replica, &fast_probe()).unwrap_err();
        assert!(err.to_string().contains("cannot seed replica"));
    }
}
