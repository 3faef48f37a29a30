//! # Utility Functions (`utils`)
//!
//! Checkpoint serialization and seeded parameter initialization.

pub mod init;
pub mod serialization;

pub use serialization::{load_checkpoint, save_checkpoint, Checkpoint, SerializationError};
