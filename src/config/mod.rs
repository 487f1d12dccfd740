//! Configuration models for spools.

pub mod spool;

pub use spool::{SpoolConfig, SpoolsConfig};
