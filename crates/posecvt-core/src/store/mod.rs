//! On-disk artifact storage.
//!
//! The same [`ArtifactStore`] type backs both the published asset directory
//! consumed by the downstream app and the scratch area holding a run's
//! intermediates.

mod artifact_store;
mod atomic;

pub use artifact_store::{validate_name, ArtifactStore, StoreLock};
pub use atomic::{
    atomic_copy_file, atomic_read_json, atomic_replace_dir, atomic_write_bytes, atomic_write_json,
};
