//! Core provisioning logic — types, source resolution, build, lifecycle,
//! replication, and run orchestration.

pub mod activate;
pub mod build;
pub mod error;
pub mod instance;
pub mod orchestrator;
pub mod replication;
pub mod source;
pub mod types;
