//! Error taxonomy for the provisioning pipeline.
//!
//! Errors are instance-scoped: every variant that can occur inside a pipeline
//! carries the owning role so a failure report always names the instance.
//! `Config` is global and raised before any filesystem mutation.

use super::types::InstanceRole;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory flags, detected before anything is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// Archive, clone, or worktree failure while resolving source.
    #[error("[{role}] source error: {message}")]
    Source { role: InstanceRole, message: String },

    /// A named patch file failed to apply. Earlier patches stay applied.
    #[error("[{role}] patch {file} failed to apply: {message}")]
    Patch {
        role: InstanceRole,
        file: String,
        message: String,
    },

    /// A build stage exited nonzero.
    #[error("[{role}] build stage '{stage}' failed: {message}")]
    Build {
        role: InstanceRole,
        stage: String,
        message: String,
    },

    /// initdb/start/stop failure, including a port that stayed busy.
    #[error("[{role}] {stage} failed: {message}")]
    Lifecycle {
        role: InstanceRole,
        stage: String,
        message: String,
    },

    /// Primary never became ready, or the base backup failed.
    #[error("[{role}] replication error: {message}")]
    Replication { role: InstanceRole, message: String },

    /// `--update-tarball` fetch or archive-write failure.
    #[error("tarball update failed: {0}")]
    Tarball(String),

    /// Aggregate run outcome when one or more instance pipelines failed.
    #[error("{0} instance pipeline(s) failed")]
    Pipelines(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The role this error is scoped to, if any.
    pub fn role(&self) -> Option<InstanceRole> {
        match self {
            Self::Source { role, .. }
            | Self::Patch { role, .. }
            | Self::Build { role, .. }
            | Self::Lifecycle { role, .. }
            | Self::Replication { role, .. } => Some(*role),
            _ => None,
        }
    }
}
