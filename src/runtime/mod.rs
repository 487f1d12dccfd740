//! Runtime helpers for task-backed spools.

pub mod local;

pub use local::LocalRuntime;
