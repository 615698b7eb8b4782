//! Command-line surface: flag parsing, request assembly, and the
//! `--update-tarball` maintenance mode.

use crate::core::error::{Error, Result};
use crate::core::orchestrator::{self, Request, RoleRefs, SourceSelection};
use crate::core::replication::ReadinessProbe;
use crate::core::source;
use crate::core::types::BuildSystem;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

const DEFAULT_PORT: u16 = 5432;

#[derive(Parser, Debug)]
#[command(
    name = "pgforge",
    version,
    about = "Build PostgreSQL from source and provision primary, FDW, and replica clusters"
)]
pub struct Args {
    /// Top-level directory for installations, source trees, and data dirs
    #[arg(long)]
    pub prefix: Option<PathBuf>,

    /// Gzipped source tarball to build from (default: postgres.tar.gz)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Git repository URL to build from instead of a tarball
    #[arg(long)]
    pub repo_url: Option<String>,

    /// Branch to check out (repository mode, all instances)
    #[arg(long)]
    pub branch: Option<String>,

    /// Tag to check out (repository mode, all instances)
    #[arg(long)]
    pub tag: Option<String>,

    /// Branch override for the primary instance
    #[arg(long)]
    pub primary_branch: Option<String>,

    /// Tag override for the primary instance
    #[arg(long)]
    pub primary_tag: Option<String>,

    /// Branch override for the FDW instance
    #[arg(long)]
    pub fdw_branch: Option<String>,

    /// Tag override for the FDW instance
    #[arg(long)]
    pub fdw_tag: Option<String>,

    /// Branch override for the replica instance
    #[arg(long)]
    pub replica_branch: Option<String>,

    /// Tag override for the replica instance
    #[arg(long)]
    pub replica_tag: Option<String>,

    /// Glob of patch files to apply in lexicographic order
    #[arg(long)]
    pub patch: Option<String>,

    /// Build backend: meson or make
    #[arg(long, default_value = "meson")]
    pub build_system: BuildSystem,

    /// Extra flags passed to meson setup / configure, whitespace-separated
    #[arg(long, allow_hyphen_values = true)]
    pub meson_flags: Option<String>,

    /// Base port for the primary; FDW gets +10 and replica +20
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Provision a second standalone instance for FDW testing
    #[arg(long)]
    pub create_fdw: bool,

    /// Provision a streaming replica seeded from the primary
    #[arg(long)]
    pub create_replica: bool,

    /// Reuse existing installations; reset and restart data dirs only
    #[arg(long)]
    pub skip_build: bool,

    /// Buffer subprocess output and show it only on failure
    #[arg(long)]
    pub capture_output: bool,

    /// Fetch the latest upstream source and write it as a tarball, then exit
    #[arg(long, value_name = "DEST")]
    pub update_tarball: Option<PathBuf>,
}

impl Args {
    /// Whether any provisioning flag was given besides the defaults; used to
    /// reject combining them with `--update-tarball`.
    fn has_provisioning_flags(&self) -> bool {
        self.prefix.is_some()
            || self.source.is_some()
            || self.repo_url.is_some()
            || self.branch.is_some()
            || self.tag.is_some()
            || self.primary_branch.is_some()
            || self.primary_tag.is_some()
            || self.fdw_branch.is_some()
            || self.fdw_tag.is_some()
            || self.replica_branch.is_some()
            || self.replica_tag.is_some()
            || self.patch.is_some()
            || self.meson_flags.is_some()
            || self.build_system != BuildSystem::Meson
            || self.port != DEFAULT_PORT
            || self.create_fdw
            || self.create_replica
            || self.skip_build
            || self.capture_output
    }

    fn to_request(&self) -> Result<Request> {
        let source = match (&self.repo_url, &self.source) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "--source and --repo-url are mutually exclusive".to_string(),
                ));
            }
            (Some(url), None) => SourceSelection::Repository(url.clone()),
            (None, tarball) => SourceSelection::Archive(
                tarball.clone().unwrap_or_else(|| PathBuf::from("postgres.tar.gz")),
            ),
        };

        Ok(Request {
            prefix: self.prefix.clone().unwrap_or_else(default_prefix),
            source,
            global_refs: RoleRefs {
                branch: self.branch.clone(),
                tag: self.tag.clone(),
            },
            primary_refs: RoleRefs {
                branch: self.primary_branch.clone(),
                tag: self.primary_tag.clone(),
            },
            fdw_refs: RoleRefs {
                branch: self.fdw_branch.clone(),
                tag: self.fdw_tag.clone(),
            },
            replica_refs: RoleRefs {
                branch: self.replica_branch.clone(),
                tag: self.replica_tag.clone(),
            },
            patch_glob: self.patch.clone(),
            build_system: self.build_system,
            build_flags: self
                .meson_flags
                .as_deref()
                .map(|f| f.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            base_port: self.port,
            create_fdw: self.create_fdw,
            create_replica: self.create_replica,
            skip_build: self.skip_build,
            capture_output: self.capture_output,
            probe: ReadinessProbe::default(),
        })
    }
}

/// Default `--prefix`: `~/pgdev/installations`, under `~/Documents` on macOS.
fn default_prefix() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if cfg!(target_os = "macos") {
        home.join("Documents/pgdev/installations")
    } else {
        home.join("pgdev/installations")
    }
}

pub fn dispatch(args: Args) -> Result<()> {
    if let Some(dest) = &args.update_tarball {
        if args.has_provisioning_flags() {
            return Err(Error::Config(
                "--update-tarball cannot be combined with provisioning flags".to_string(),
            ));
        }
        return source::update_tarball(dest);
    }

    let request = args.to_request()?;
    let report = orchestrator::run(&request)?;

    for (role, result) in &report.results {
        match result {
            Ok(()) => info!("[{}] ready on port {}", role, request.port_for(*role)),
            Err(e) => error!("{}", e),
        }
    }

    match report.failed() {
        0 => Ok(()),
        n => Err(Error::Pipelines(n)),
    }
}
