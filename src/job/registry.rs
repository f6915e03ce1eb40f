use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crate::job::types::{JobStatus, Stage};


/// What the runner writes back to the block registry after a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockUpdate {
    pub status: JobStatus,
    pub progress: f32,
    pub stage: Stage,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
}


/// Persistence layer owning block records. The runner only reads source
/// locations from it and reports transitions back.
pub trait BlockRegistry: Send + Sync {
    /// Directory holding the trainer's output for this block, if recorded.
    fn splat_output_dir(&self, block_id: &str) -> Option<PathBuf>;

    /// Directory the conversion writes its manifest and tiles into.
    fn output_dir(&self, block_id: &str) -> PathBuf;

    fn record(&self, block_id: &str, update: &BlockUpdate);

    /// Blocks recorded as running by a previous process.
    fn interrupted_blocks(&self) -> Vec<String> {
        Vec::new()
    }
}


#[derive(Debug, Clone, Default)]
pub struct BlockRecord {
    pub splat_output_dir: Option<PathBuf>,
    pub updates: Vec<BlockUpdate>,
}

impl BlockRecord {
    pub fn last_update(&self) -> Option<&BlockUpdate> {
        self.updates.last()
    }
}


/// Registry kept in memory, with block outputs under one root directory.
#[derive(Debug)]
pub struct InMemoryBlockRegistry {
    root: PathBuf,
    blocks: Mutex<HashMap<String, BlockRecord>>,
}

impl InMemoryBlockRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn register(&self, block_id: &str, splat_output_dir: impl Into<PathBuf>) {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(block_id.to_string())
            .or_default()
            .splat_output_dir = Some(splat_output_dir.into());
    }

    pub fn record_of(&self, block_id: &str) -> Option<BlockRecord> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(block_id)
            .cloned()
    }

    pub fn last_update(&self, block_id: &str) -> Option<BlockUpdate> {
        self.record_of(block_id)
            .and_then(|record| record.last_update().cloned())
    }
}

impl BlockRegistry for InMemoryBlockRegistry {
    fn splat_output_dir(&self, block_id: &str) -> Option<PathBuf> {
        self.record_of(block_id)
            .and_then(|record| record.splat_output_dir)
    }

    fn output_dir(&self, block_id: &str) -> PathBuf {
        self.root.join(block_id)
    }

    fn record(&self, block_id: &str, update: &BlockUpdate) {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(block_id.to_string())
            .or_default()
            .updates
            .push(update.clone());
    }

    fn interrupted_blocks(&self) -> Vec<String> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);

        let mut interrupted: Vec<String> = blocks
            .iter()
            .filter(|(_, record)| {
                record
                    .last_update()
                    .is_some_and(|update| update.status == JobStatus::Running)
            })
            .map(|(block_id, _)| block_id.clone())
            .collect();
        interrupted.sort();
        interrupted
    }
}
