//! Shared plumbing for the Beacon binaries

pub mod common;
