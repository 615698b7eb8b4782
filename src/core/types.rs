//! Instance roles, specs, filesystem layout, build artifacts, and the
//! per-instance state enum.
//!
//! Everything here is computed once by the orchestrator and immutable
//! afterwards; runtime state lives in `core::instance`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Roles
// ============================================================================

/// Which cluster an instance is: the writable primary, a standalone peer for
/// foreign-data-wrapper testing, or a streaming replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Primary,
    Fdw,
    Replica,
}

impl InstanceRole {
    /// Fixed port offset from the base port: primary 0, fdw +10, replica +20.
    pub fn port_offset(&self) -> u16 {
        match self {
            Self::Primary => 0,
            Self::Fdw => 10,
            Self::Replica => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fdw => "fdw",
            Self::Replica => "replica",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Source descriptors
// ============================================================================

/// A branch or tag to check out; exactly one per repository-mode instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// The ref as fetched from the remote: `origin/<branch>` or `tags/<tag>`.
    pub fn remote_ref(&self) -> String {
        match self {
            Self::Branch(b) => format!("origin/{}", b),
            Self::Tag(t) => format!("tags/{}", t),
        }
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(b) => write!(f, "branch {}", b),
            Self::Tag(t) => write!(f, "tag {}", t),
        }
    }
}

/// Where an instance's source tree comes from.
#[derive(Debug, Clone)]
pub enum SourceDescriptor {
    /// A local `.tar.gz` source archive.
    Archive(PathBuf),
    /// A git repository plus the ref to check out in a per-role worktree.
    Repository { url: String, git_ref: GitRef },
}

// ============================================================================
// Build system
// ============================================================================

/// Which build backend compiles the source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildSystem {
    #[default]
    Meson,
    Make,
}

impl std::str::FromStr for BuildSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meson" => Ok(Self::Meson),
            "make" => Ok(Self::Make),
            other => Err(format!("unknown build system '{}' (expected meson|make)", other)),
        }
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meson => f.write_str("meson"),
            Self::Make => f.write_str("make"),
        }
    }
}

// ============================================================================
// Layout
// ============================================================================

/// Filesystem layout under the `--prefix` directory.
///
/// Every per-role path is derived here and nowhere else, so no two roles can
/// ever share an install prefix, source tree, or data directory.
#[derive(Debug, Clone)]
pub struct Layout {
    prefix: PathBuf,
}

impl Layout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Installation prefix for a role: `<prefix>/pghome_<role>`.
    pub fn install_dir(&self, role: InstanceRole) -> PathBuf {
        self.prefix.join(format!("pghome_{}", role))
    }

    /// Extracted-archive source tree for a role: `<prefix>/source/src_<role>`.
    pub fn source_dir(&self, role: InstanceRole) -> PathBuf {
        self.prefix.join("source").join(format!("src_{}", role))
    }

    /// Worktree checkout for a role: `<prefix>/worktrees/<role>`.
    pub fn worktree_dir(&self, role: InstanceRole) -> PathBuf {
        self.prefix.join("worktrees").join(role.as_str())
    }

    /// Shared base clone backing all worktrees: `<prefix>/repo`.
    pub fn repo_dir(&self) -> PathBuf {
        self.prefix.join("repo")
    }

    /// Data directory for a role: `<prefix>/pgdata/<role>`.
    pub fn data_dir(&self, role: InstanceRole) -> PathBuf {
        self.prefix.join("pgdata").join(role.as_str())
    }

    /// Activation artifact for a role: `<prefix>/activate_<role>.sh`.
    pub fn activate_script(&self, role: InstanceRole) -> PathBuf {
        self.prefix.join(format!("activate_{}.sh", role))
    }

    /// JSONL run event log shared by all pipelines in a run.
    pub fn events_path(&self) -> PathBuf {
        self.prefix.join("events.jsonl")
    }
}

// ============================================================================
// Instance spec
// ============================================================================

/// Per-instance configuration, derived once from the global request plus
/// role-specific overrides.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub role: InstanceRole,
    pub source: SourceDescriptor,
    pub patch_glob: Option<String>,
    pub build_system: BuildSystem,
    pub build_flags: Vec<String>,
    pub port: u16,
    pub install_dir: PathBuf,
    pub source_dir: PathBuf,
    pub data_dir: PathBuf,
    pub activate_script: PathBuf,
    /// Buffer subprocess output and surface it only on failure.
    pub capture_output: bool,
}

// ============================================================================
// Build artifact
// ============================================================================

/// Result of a successful build: the installed prefix and the binaries the
/// lifecycle manager and replication coordinator invoke. Owned by exactly one
/// instance; never shared across roles.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub install_dir: PathBuf,
    pub pg_ctl: PathBuf,
    pub initdb: PathBuf,
    pub pg_basebackup: PathBuf,
    pub pg_isready: PathBuf,
    pub build_log: Option<PathBuf>,
}

impl BuildArtifact {
    /// Derive binary locations from an installed prefix.
    pub fn from_install_dir(install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        let bin = install_dir.join("bin");
        Self {
            pg_ctl: bin.join("pg_ctl"),
            initdb: bin.join("initdb"),
            pg_basebackup: bin.join("pg_basebackup"),
            pg_isready: bin.join("pg_isready"),
            install_dir,
            build_log: None,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.install_dir.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.install_dir.join("lib")
    }

    /// Whether the installed binaries are actually present (used by
    /// `--skip-build` to adopt an existing installation).
    pub fn exists(&self) -> bool {
        self.pg_ctl.is_file() && self.initdb.is_file()
    }

    /// Environment prepends for invoking this installation's binaries:
    /// `PATH=<bin>:…` and `LD_LIBRARY_PATH=<lib>:…`.
    pub fn exec_env(&self) -> Vec<(String, String)> {
        let path = match std::env::var("PATH") {
            Ok(cur) => format!("{}:{}", self.bin_dir().display(), cur),
            Err(_) => self.bin_dir().display().to_string(),
        };
        let ld = match std::env::var("LD_LIBRARY_PATH") {
            Ok(cur) => format!("{}:{}", self.lib_dir().display(), cur),
            Err(_) => self.lib_dir().display().to_string(),
        };
        vec![("PATH".to_string(), path), ("LD_LIBRARY_PATH".to_string(), ld)]
    }
}

// ============================================================================
// Instance state
// ============================================================================

/// Runtime state machine per instance. Transitions are driven only by the
/// owning `core::instance::Instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Uninitialized,
    Built,
    DataDirReady,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Built => "built",
            Self::DataDirReady => "data-dir-ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
