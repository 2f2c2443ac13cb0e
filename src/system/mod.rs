//! The capabilities the core calls through to touch the host: writing configuration
//! artifacts and running external programs.
//!
//! Drivers never use `std::fs` or `std::process` directly. Tests substitute
//! [`MemoryArtifacts`] and a scripted [`CommandRunner`] so no real daemon or system path is
//! involved.

pub mod artifacts;
pub mod command;

pub use artifacts::{ArtifactStore, DynArtifacts, FsArtifacts, MemoryArtifacts};
pub use command::{CommandOutput, CommandRunner, CommandSpec, DynRunner, SystemRunner};
