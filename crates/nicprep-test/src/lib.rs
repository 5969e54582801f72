//! Test infrastructure for nicprep.
//!
//! Provides:
//! - [`FakeHost`], an in-memory [`ResourceStore`](nicprep_common::ResourceStore)
//!   with failure injection
//! - Fixtures for common host topologies
//! - Snapshot and verification helpers for host state

pub mod fake_host;
pub mod fixtures;
mod verification;

pub use fake_host::FakeHost;
pub use fixtures::*;
pub use verification::*;
