use std::path::PathBuf;

use bevy::prelude::*;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::{
    job::settings::{ConversionParams, ConversionSettings, DEFAULT_CODEC_TIMEOUT_SECS, DEFAULT_MAX_SPLATS_PER_TILE},
    stream::container::ContainerFormat,
};


#[derive(
    Debug,
    Clone,
    Resource,
    Serialize,
    Deserialize,
    Parser,
)]
#[command(about = "convert a gaussian splat ply into a 3d tileset", version, long_about = None)]
pub struct TilingArgs {
    /// source ply file
    pub input_file: PathBuf,

    #[arg(long, short)]
    pub output: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_SPLATS_PER_TILE)]
    pub max_splats_per_tile: usize,

    /// store a downsampled representative in every internal tile
    #[arg(long, default_value = "false")]
    pub lod: bool,

    #[arg(long, default_value = "0.25")]
    pub lod_sample_ratio: f32,

    /// round trip through the packed codec before slicing
    #[arg(long, default_value = "false")]
    pub compressed: bool,

    /// write base64 `.gltf` tiles instead of binary containers
    #[arg(long, default_value = "false")]
    pub embedded_json: bool,

    #[arg(long, default_value_t = DEFAULT_CODEC_TIMEOUT_SECS)]
    pub codec_timeout_secs: u64,

    #[arg(long, default_value = "false")]
    pub prefer_external_codec: bool,
}

impl Default for TilingArgs {
    fn default() -> TilingArgs {
        TilingArgs {
            input_file: PathBuf::new(),
            output: PathBuf::from("tiles_out"),
            max_splats_per_tile: DEFAULT_MAX_SPLATS_PER_TILE,
            lod: false,
            lod_sample_ratio: 0.25,
            compressed: false,
            embedded_json: false,
            codec_timeout_secs: DEFAULT_CODEC_TIMEOUT_SECS,
            prefer_external_codec: false,
        }
    }
}

impl TilingArgs {
    pub fn settings(&self) -> ConversionSettings {
        ConversionSettings {
            max_splats_per_tile: self.max_splats_per_tile,
            lod_sample_ratio: self.lod_sample_ratio,
            container_format: self.container_format(),
            codec_timeout_secs: self.codec_timeout_secs,
            prefer_external_codec: self.prefer_external_codec,
            ..default()
        }
    }

    pub fn params(&self) -> ConversionParams {
        ConversionParams {
            source_path: Some(self.input_file.clone()),
            max_splats_per_tile: Some(self.max_splats_per_tile),
            generate_lod: self.lod,
            use_compressed_intermediate: self.compressed,
            container_format: Some(self.container_format()),
            ..default()
        }
    }

    fn container_format(&self) -> ContainerFormat {
        if self.embedded_json {
            ContainerFormat::JsonEmbedded
        } else {
            ContainerFormat::Binary
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_params() {
        let args = TilingArgs::parse_from([
            "ply_to_tiles",
            "scene.ply",
            "--output",
            "out",
            "--max-splats-per-tile",
            "64",
            "--lod",
            "--embedded-json",
        ]);

        let params = args.params();
        assert_eq!(params.source_path.as_deref(), Some(std::path::Path::new("scene.ply")));
        assert_eq!(params.max_splats_per_tile, Some(64));
        assert!(params.generate_lod);
        assert!(!params.use_compressed_intermediate);
        assert_eq!(params.container_format, Some(ContainerFormat::JsonEmbedded));
        assert_eq!(args.settings().max_splats_per_tile, 64);
    }
}
