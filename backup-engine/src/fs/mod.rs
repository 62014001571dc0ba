//! Local filesystem helpers: tree walking and content fingerprints.

pub mod fingerprint;
pub mod walker;

pub use fingerprint::{copy_with_fingerprint, fingerprint_bytes, fingerprint_file};
pub use walker::{walk_directory, FileInfo, WalkOptions};
