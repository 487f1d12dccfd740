//! Collaborators built on top of spools.

pub mod trash;

pub use trash::Trash;
