//! Builders to construct spools from configuration.

pub mod spool_builder;

pub use spool_builder::{build_thread_spools, SpoolBuilder};
