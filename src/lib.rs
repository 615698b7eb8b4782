//! pgforge — multi-instance PostgreSQL build and provisioning.
//!
//! Builds PostgreSQL from a tarball or git checkout and brings up isolated
//! primary, FDW, and streaming-replica clusters under one prefix.

pub mod cli;
pub mod core;
pub mod events;
pub mod exec;
