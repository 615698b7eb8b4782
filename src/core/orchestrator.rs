//! Run orchestration: expand a request into per-role instance specs, validate
//! configuration up front, then drive one provisioning pipeline per instance
//! on its own thread.
//!
//! Failure isolation is per pipeline. A failed sibling never aborts the
//! others, with one deliberate exception: the replica waits on the primary's
//! readiness signal and fails if the primary never becomes ready.

use super::activate;
use super::build;
use super::error::{Error, Result};
use super::instance::Instance;
use super::replication::{self, ReadinessProbe};
use super::source;
use super::types::{
    BuildSystem, GitRef, InstanceRole, InstanceSpec, InstanceState, Layout, SourceDescriptor,
};
use crate::events::{self, RunEvent};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::info;

// ============================================================================
// Request
// ============================================================================

/// Branch/tag selection, either global or as a per-role override.
#[derive(Debug, Clone, Default)]
pub struct RoleRefs {
    pub branch: Option<String>,
    pub tag: Option<String>,
}

/// Where every instance in this run builds from.
#[derive(Debug, Clone)]
pub enum SourceSelection {
    /// A local `.tar.gz` archive, shared by all roles.
    Archive(PathBuf),
    /// A git repository URL; each role checks out its own worktree.
    Repository(String),
}

/// One provisioning run as assembled from the command line.
#[derive(Debug, Clone)]
pub struct Request {
    pub prefix: PathBuf,
    pub source: SourceSelection,
    pub global_refs: RoleRefs,
    pub primary_refs: RoleRefs,
    pub fdw_refs: RoleRefs,
    pub replica_refs: RoleRefs,
    pub patch_glob: Option<String>,
    pub build_system: BuildSystem,
    pub build_flags: Vec<String>,
    pub base_port: u16,
    pub create_fdw: bool,
    pub create_replica: bool,
    pub skip_build: bool,
    pub capture_output: bool,
    pub probe: ReadinessProbe,
}

impl Request {
    pub fn layout(&self) -> Layout {
        Layout::new(&self.prefix)
    }

    /// Requested roles, primary always first.
    pub fn roles(&self) -> Vec<InstanceRole> {
        let mut roles = vec![InstanceRole::Primary];
        if self.create_fdw {
            roles.push(InstanceRole::Fdw);
        }
        if self.create_replica {
            roles.push(InstanceRole::Replica);
        }
        roles
    }

    pub fn port_for(&self, role: InstanceRole) -> u16 {
        self.base_port + role.port_offset()
    }

    fn refs_for(&self, role: InstanceRole) -> &RoleRefs {
        match role {
            InstanceRole::Primary => &self.primary_refs,
            InstanceRole::Fdw => &self.fdw_refs,
            InstanceRole::Replica => &self.replica_refs,
        }
    }

    /// Resolve the ref for one role. A role override wins field-wise over the
    /// global selection; a role ending up with both a branch and a tag is a
    /// configuration error.
    fn effective_ref(&self, role: InstanceRole) -> Result<Option<GitRef>> {
        let over = self.refs_for(role);
        let branch = over.branch.as_ref().or(self.global_refs.branch.as_ref());
        let tag = over.tag.as_ref().or(self.global_refs.tag.as_ref());
        match (branch, tag) {
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "{}: both a branch and a tag are selected; pick one",
                role
            ))),
            (Some(b), None) => Ok(Some(GitRef::Branch(b.clone()))),
            (None, Some(t)) => Ok(Some(GitRef::Tag(t.clone()))),
            (None, None) => Ok(None),
        }
    }

    /// Reject inconsistent configuration before anything touches the disk.
    pub fn validate(&self) -> Result<()> {
        for role in self.roles() {
            match (&self.source, self.effective_ref(role)?) {
                (SourceSelection::Archive(_), Some(git_ref)) => {
                    return Err(Error::Config(format!(
                        "{}: {} requires --repo-url",
                        role, git_ref
                    )));
                }
                (SourceSelection::Repository(_), None) => {
                    return Err(Error::Config(format!(
                        "{}: repository mode needs a --branch or --tag",
                        role
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Expand this request into the spec for one role.
    pub fn instance_spec(&self, role: InstanceRole) -> Result<InstanceSpec> {
        let layout = self.layout();
        let (source, source_dir) = match &self.source {
            SourceSelection::Archive(path) => {
                (SourceDescriptor::Archive(path.clone()), layout.source_dir(role))
            }
            SourceSelection::Repository(url) => {
                let git_ref = self.effective_ref(role)?.ok_or_else(|| {
                    Error::Config(format!("{}: repository mode needs a --branch or --tag", role))
                })?;
                (
                    SourceDescriptor::Repository { url: url.clone(), git_ref },
                    layout.worktree_dir(role),
                )
            }
        };

        Ok(InstanceSpec {
            role,
            source,
            patch_glob: self.patch_glob.clone(),
            build_system: self.build_system,
            build_flags: self.build_flags.clone(),
            port: self.port_for(role),
            install_dir: layout.install_dir(role),
            source_dir,
            data_dir: layout.data_dir(role),
            activate_script: layout.activate_script(role),
            capture_output: self.capture_output,
        })
    }
}

// ============================================================================
// Run report
// ============================================================================

type PipelineResult = std::result::Result<(), Error>;

/// Per-role outcome of one run.
pub struct RunReport {
    pub run_id: String,
    pub results: Vec<(InstanceRole, PipelineResult)>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

// ============================================================================
// Run
// ============================================================================

/// Run every requested pipeline to completion and report per-role outcomes.
pub fn run(req: &Request) -> Result<RunReport> {
    req.validate()?;

    let layout = req.layout();
    std::fs::create_dir_all(layout.prefix())?;
    let events_path = layout.events_path();

    let run_id = events::generate_run_id();
    let _ = events::append_event(
        &events_path,
        RunEvent::RunStarted {
            run_id: run_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let mut specs = Vec::new();
    for role in req.roles() {
        specs.push(req.instance_spec(role)?);
    }

    // The replica blocks on this channel until the primary reports readiness.
    let (ready_tx, ready_rx) = mpsc::channel::<bool>();
    let mut ready_tx = Some(ready_tx);
    let mut ready_rx = Some(ready_rx);

    let results: Vec<(InstanceRole, PipelineResult)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for spec in specs {
            let role = spec.role;
            let tx = if role == InstanceRole::Primary && req.create_replica {
                ready_tx.take()
            } else {
                None
            };
            let rx = if role == InstanceRole::Replica {
                ready_rx.take()
            } else {
                None
            };
            let events_path = &events_path;
            let handle = scope.spawn(move || run_pipeline(req, events_path, spec, tx, rx));
            handles.push((role, handle));
        }

        handles
            .into_iter()
            .map(|(role, handle)| {
                let outcome = handle.join().unwrap_or_else(|_| {
                    Err(Error::Lifecycle {
                        role,
                        stage: "pipeline".to_string(),
                        message: "pipeline thread panicked".to_string(),
                    })
                });
                (role, outcome)
            })
            .collect()
    });

    let report = RunReport { run_id, results };
    let _ = events::append_event(
        &events_path,
        RunEvent::RunCompleted {
            run_id: report.run_id.clone(),
            failed: report.failed() as u32,
        },
    );
    Ok(report)
}

/// One instance's pipeline, start to finish. Emits lifecycle events and, for
/// the primary, signals the replica exactly once.
fn run_pipeline(
    req: &Request,
    events_path: &Path,
    spec: InstanceSpec,
    ready_tx: Option<mpsc::Sender<bool>>,
    ready_rx: Option<mpsc::Receiver<bool>>,
) -> PipelineResult {
    let role = spec.role;
    info!("[{}] pipeline started (port {})", role, spec.port);
    let _ = events::append_event(events_path, RunEvent::PipelineStarted { role });

    let mut instance = Instance::new(spec);
    let result = provision(req, events_path, &mut instance, ready_rx);

    match &result {
        Ok(()) => {
            info!("[{}] running on port {}", role, instance.spec().port);
            if let Some(tx) = &ready_tx {
                let _ = tx.send(true);
            }
        }
        Err(e) => {
            instance.set_failed();
            let _ = events::append_event(
                events_path,
                RunEvent::PipelineFailed { role, error: e.to_string() },
            );
            // Unblock the replica rather than leaving it waiting on a
            // disconnect timeout.
            if let Some(tx) = &ready_tx {
                let _ = tx.send(false);
            }
        }
    }
    result
}

fn provision(
    req: &Request,
    events_path: &Path,
    instance: &mut Instance,
    ready_rx: Option<mpsc::Receiver<bool>>,
) -> PipelineResult {
    let role = instance.spec().role;
    let layout = req.layout();
    let mut last = instance.state();

    // Previous state for this role is gone before anything new is built.
    instance.teardown(req.skip_build)?;
    record_transition(events_path, instance, &mut last);

    if req.skip_build {
        instance.adopt_existing()?;
    } else {
        let tree = source::resolve(instance.spec(), &layout.repo_dir())?;
        let artifact = build::build(instance.spec(), &tree)?;
        instance.mark_built(artifact);
    }
    record_transition(events_path, instance, &mut last);

    let indent_dir = activate::find_pg_bsd_indent(&instance.spec().source_dir);
    if role == InstanceRole::Replica {
        let rx = ready_rx.ok_or_else(|| Error::Replication {
            role,
            message: "no readiness channel for replica".to_string(),
        })?;
        match rx.recv() {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                return Err(Error::Replication {
                    role,
                    message: "primary never reached running state".to_string(),
                });
            }
        }
        replication::establish(req.base_port, instance, &req.probe)?;
        record_transition(events_path, instance, &mut last);

        activate::write_script(instance.spec(), indent_dir.as_deref())
            .map_err(|e| activation_err(role, e))?;
    } else {
        instance.init_data_dir()?;
        record_transition(events_path, instance, &mut last);

        activate::write_script(instance.spec(), indent_dir.as_deref())
            .map_err(|e| activation_err(role, e))?;

        instance.start()?;
        record_transition(events_path, instance, &mut last);
    }
    Ok(())
}

fn activation_err(role: InstanceRole, e: std::io::Error) -> Error {
    Error::Lifecycle {
        role,
        stage: "activate".to_string(),
        message: e.to_string(),
    }
}

fn record_transition(events_path: &Path, instance: &Instance, last: &mut InstanceState) {
    let now = instance.state();
    if now != *last {
        let _ = events::append_event(
            events_path,
            RunEvent::StateChanged {
                role: instance.spec().role,
                from: *last,
                to: now,
            },
        );
        *last = now;
    }
}
