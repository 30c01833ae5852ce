//! Fleet administration library
//!
//! Change-stream cache, conflict-safe stop-list mutations, bulk guardian
//! provisioning and reference exports for a school transport fleet.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
