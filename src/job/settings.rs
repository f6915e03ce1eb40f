use std::path::PathBuf;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::stream::container::ContainerFormat;


pub const DEFAULT_MAX_SPLATS_PER_TILE: usize = 20_000;
pub const DEFAULT_CODEC_TIMEOUT_SECS: u64 = 300;


/// Command line of the external compression tool; the verb and the two
/// paths are appended per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCodecCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExternalCodecCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "spz_bridge".to_string()],
        }
    }
}


#[derive(Resource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub max_splats_per_tile: usize,

    /// Fraction of an internal node's splats kept as its coarse representative.
    pub lod_sample_ratio: f32,
    pub lod_seed: u64,

    pub log_capacity: usize,

    pub container_format: ContainerFormat,
    pub tiles_dir_name: String,
    pub manifest_name: String,
    pub intermediate_name: String,

    pub codec_timeout_secs: u64,
    pub external_codec: ExternalCodecCommand,
    pub prefer_external_codec: bool,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            max_splats_per_tile: DEFAULT_MAX_SPLATS_PER_TILE,

            lod_sample_ratio: 0.25,
            lod_seed: 0x5EED_71E5,

            log_capacity: 500,

            container_format: ContainerFormat::Binary,
            tiles_dir_name: "tiles".to_string(),
            manifest_name: "tileset.json".to_string(),
            intermediate_name: "intermediate.spz".to_string(),

            codec_timeout_secs: DEFAULT_CODEC_TIMEOUT_SECS,
            external_codec: ExternalCodecCommand::default(),
            prefer_external_codec: false,
        }
    }
}


/// Per-request conversion parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionParams {
    /// Training iteration whose output is converted. Highest present when unset.
    pub iteration: Option<u32>,

    /// Explicit source file, bypassing registry lookup.
    pub source_path: Option<PathBuf>,

    /// Overrides `ConversionSettings::max_splats_per_tile`.
    pub max_splats_per_tile: Option<usize>,

    pub generate_lod: bool,
    pub use_compressed_intermediate: bool,

    /// Overrides `ConversionSettings::container_format`.
    pub container_format: Option<ContainerFormat>,
}

impl ConversionParams {
    pub fn from_source(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: Some(source_path.into()),
            ..default()
        }
    }

    pub fn max_splats_per_tile(&self, settings: &ConversionSettings) -> usize {
        self.max_splats_per_tile
            .unwrap_or(settings.max_splats_per_tile)
            .max(1)
    }

    pub fn container_format(&self, settings: &ConversionSettings) -> ContainerFormat {
        self.container_format.unwrap_or(settings.container_format)
    }
}
