//! Best-effort removal of intermediates and superseded assets.
//!
//! Nothing here fails a run. Every error is logged at warn level and
//! skipped.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::artifact::Representation;
use crate::pipeline::PipelineRun;
use crate::store::ArtifactStore;

pub struct CleanupCoordinator<'a> {
    assets: &'a ArtifactStore,
}

impl<'a> CleanupCoordinator<'a> {
    pub fn new(assets: &'a ArtifactStore) -> Self {
        Self { assets }
    }

    /// Tidy up after a published run.
    ///
    /// Removes every intermediate the run produced plus any asset-store copy
    /// of a representation upstream of the published one. The published
    /// artifact itself is never touched.
    pub fn after_publish(&self, run: &PipelineRun, scratch_dir: &Path) -> Vec<PathBuf> {
        let mut removed = self.remove_intermediates(run, scratch_dir);

        for representation in Representation::ALL {
            if !representation.is_upstream_of(run.publish_target) {
                continue;
            }
            let path = self.assets.path_for(representation, &run.model_name);
            if self.is_published(run, &path) {
                continue;
            }
            match self.assets.remove(representation, &run.model_name) {
                Ok(true) => {
                    debug!("Removed superseded {} asset {}", representation, path.display());
                    removed.push(path);
                }
                Ok(false) => {}
                Err(e) => warn!("Could not remove superseded {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// Tidy up after a failed run. The asset store is left untouched.
    pub fn after_failure(&self, run: &PipelineRun, scratch_dir: &Path) -> Vec<PathBuf> {
        self.remove_intermediates(run, scratch_dir)
    }

    fn remove_intermediates(&self, run: &PipelineRun, scratch_dir: &Path) -> Vec<PathBuf> {
        let mut removed = Vec::new();

        for intermediate in &run.intermediates {
            let Some(path) = intermediate.path.as_deref() else {
                continue;
            };
            if self.is_published(run, path) {
                continue;
            }
            if remove_path(path, intermediate.representation.is_directory()) {
                removed.push(path.to_path_buf());
            }
        }

        // Attempt directories and anything a converter left behind.
        if scratch_dir.exists() && !self.is_published_below(run, scratch_dir) {
            if let Err(e) = std::fs::remove_dir_all(scratch_dir) {
                warn!("Could not remove scratch dir {}: {}", scratch_dir.display(), e);
            }
        }
        removed
    }

    fn is_published(&self, run: &PipelineRun, path: &Path) -> bool {
        run.published_path.as_deref() == Some(path)
    }

    fn is_published_below(&self, run: &PipelineRun, dir: &Path) -> bool {
        run.published_path
            .as_deref()
            .is_some_and(|published| published.starts_with(dir))
    }
}

fn remove_path(path: &Path, is_dir: bool) -> bool {
    let result = if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            debug!("Removed intermediate {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Intermediate {} already gone", path.display());
            false
        }
        Err(e) => {
            warn!("Could not remove intermediate {}: {}", path.display(), e);
            false
        }
    }
}
