//! Stage pipelines. Each stage discovers its inputs in the working
//! directory, builds independent groups, and reports one outcome per group.

pub mod attenuation;
pub mod averaging;
pub mod combine;
pub mod driver;
pub mod postprocess;
pub mod preflight;
pub mod quantify;
pub mod runs;

use crate::common::PipelineConfig;
use crate::domain::ExecutionMode;
use crate::modules::external::{ExternalOperations, operations_for};
use crate::modules::guard::IdempotencyGuard;
use crate::modules::storage::{RawVolumeStore, VolumeStore};
use std::path::{Path, PathBuf};

/// Everything a stage needs besides its own arguments.
pub struct PipelineContext {
    dir: PathBuf,
    config: PipelineConfig,
    store: Box<dyn VolumeStore>,
    operations: Box<dyn ExternalOperations>,
    guard: IdempotencyGuard,
    mode: ExecutionMode,
    require_fresh: bool,
}

impl PipelineContext {
    pub fn new(dir: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        let operations = operations_for(&config.tools);
        Self {
            dir: dir.into(),
            guard: IdempotencyGuard::new(config.exclusive_claims),
            mode: ExecutionMode::from_workers(config.workers),
            store: Box::new(RawVolumeStore),
            operations,
            config,
            require_fresh: false,
        }
    }

    pub fn with_operations(mut self, operations: Box<dyn ExternalOperations>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Existing outputs become an `OutputCollision` instead of a skip.
    pub fn with_require_fresh(mut self, require_fresh: bool) -> Self {
        self.require_fresh = require_fresh;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn VolumeStore {
        self.store.as_ref()
    }

    pub fn operations(&self) -> &dyn ExternalOperations {
        self.operations.as_ref()
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn require_fresh(&self) -> bool {
        self.require_fresh
    }

    /// In fresh-run mode, fails before any group work when an output exists.
    pub(crate) fn check_fresh<'a, I>(&self, outputs: I) -> crate::domain::PipelineResult<()>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        if self.require_fresh {
            self.guard.ensure_fresh(outputs)
        } else {
            Ok(())
        }
    }
}
