use std::path::PathBuf;

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}


/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Queued,
    Parsing,
    Compressing,
    Slicing,
    Packaging,
    Manifest,
    Done,
}

impl Stage {
    /// Progress reached when the stage begins. Stage weights are parse 10,
    /// slice 30, package 50, manifest 10; compression shares the parse slot.
    pub fn start_progress(&self) -> f32 {
        match self {
            Self::Queued | Self::Parsing => 0.0,
            Self::Compressing => 5.0,
            Self::Slicing => 10.0,
            Self::Packaging => 40.0,
            Self::Manifest => 90.0,
            Self::Done => 100.0,
        }
    }

    pub fn end_progress(&self) -> f32 {
        match self {
            Self::Queued => 0.0,
            Self::Parsing => 5.0,
            Self::Compressing => 10.0,
            Self::Slicing => 40.0,
            Self::Packaging => 90.0,
            Self::Manifest | Self::Done => 100.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Parsing => "parsing",
            Self::Compressing => "compressing",
            Self::Slicing => "slicing",
            Self::Packaging => "packaging",
            Self::Manifest => "manifest",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}


/// Point-in-time view of one block's conversion, without its log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub block_id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub current_stage: Stage,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl JobSnapshot {
    pub fn not_started(block_id: &str) -> Self {
        Self {
            block_id: block_id.to_string(),
            ..Default::default()
        }
    }
}


/// Files of a completed conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilesetArtifact {
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub containers: Vec<PathBuf>,
    pub splat_count: u32,
    pub tile_count: usize,
}

impl TilesetArtifact {
    pub fn total_bytes(&self) -> u64 {
        std::iter::once(&self.manifest_path)
            .chain(self.containers.iter())
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|metadata| metadata.len())
            .sum()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_progress_is_ordered() {
        let stages = [
            Stage::Queued,
            Stage::Parsing,
            Stage::Compressing,
            Stage::Slicing,
            Stage::Packaging,
            Stage::Manifest,
            Stage::Done,
        ];

        for pair in stages.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].start_progress() <= pair[1].start_progress());
            assert!(pair[0].end_progress() <= pair[1].end_progress());
        }
        assert_eq!(Stage::Packaging.end_progress() - Stage::Packaging.start_progress(), 50.0);
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(serde_json::to_string(&JobStatus::NotStarted).unwrap(), "\"NOT_STARTED\"");
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
