use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "package_rayon")]
use rayon::prelude::*;

use crate::{
    error::{TilingError, TilingResult},
    gaussian::splat_set::SplatSet,
    io::codec::SplatCodec,
    job::{
        settings::{ConversionParams, ConversionSettings},
        types::{Stage, TilesetArtifact},
    },
    stream::{
        container::{ContainerFormat, TileBatch, TileContainer, build_tile},
        slice::{SliceSettings, Tile, slice},
        tileset::Tileset,
    },
};


const POINT_CLOUD_DIR: &str = "point_cloud";
const ITERATION_PREFIX: &str = "iteration_";
const POINT_CLOUD_FILE: &str = "point_cloud.ply";


/// Receives stage transitions from a running pipeline.
pub trait StageReporter: Sync {
    fn enter(&self, stage: Stage);

    /// Progress within the current stage, in overall percent.
    fn advance(&self, progress: f32);

    fn log(&self, line: String);

    fn is_cancelled(&self) -> bool;
}


/// Everything one pipeline run needs, resolved before it starts.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub block_id: String,
    pub params: ConversionParams,
    pub settings: ConversionSettings,
    pub codec: SplatCodec,
    pub splat_output_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
}


/// Runs parse, slice, package and manifest in order, checking for
/// cancellation only between stages.
pub fn run(request: &ConversionRequest, reporter: &dyn StageReporter) -> TilingResult<TilesetArtifact> {
    checkpoint(reporter)?;
    reporter.enter(Stage::Parsing);

    let source = resolve_source(&request.params, request.splat_output_dir.as_deref())?;
    ensure_outside_output(&source, &request.output_dir)?;
    let mut splats = request.codec.parse(&source)?;
    prepare_output_dir(&request.output_dir, &request.settings)?;
    reporter.log(format!(
        "parsed {} splats of sh degree {} from {}",
        splats.count(),
        splats.sh_degree(),
        source.display(),
    ));
    reporter.advance(Stage::Parsing.end_progress());

    if request.params.use_compressed_intermediate {
        checkpoint(reporter)?;
        reporter.enter(Stage::Compressing);
        splats = compressed_round_trip(request, splats, reporter)?;
        reporter.advance(Stage::Compressing.end_progress());
    }

    checkpoint(reporter)?;
    reporter.enter(Stage::Slicing);

    let slice_settings = SliceSettings {
        max_splats_per_tile: request.params.max_splats_per_tile(&request.settings),
        generate_lod: request.params.generate_lod,
        lod_sample_ratio: request.settings.lod_sample_ratio,
        lod_seed: request.settings.lod_seed,
    };
    let root = slice(&splats, &slice_settings);
    reporter.log(format!(
        "sliced into {} tiles ({} leaves, depth {}) with at most {} splats per tile",
        root.tile_count(),
        root.leaves().count(),
        root.depth(),
        slice_settings.max_splats_per_tile,
    ));
    reporter.advance(Stage::Slicing.end_progress());

    checkpoint(reporter)?;
    reporter.enter(Stage::Packaging);

    let format = request.params.container_format(&request.settings);
    let containers = package(request, &splats, &root, format, reporter)?;
    reporter.log(format!("packaged {} tile containers", containers.len()));
    reporter.advance(Stage::Packaging.end_progress());

    checkpoint(reporter)?;
    reporter.enter(Stage::Manifest);

    let relative: HashMap<u32, PathBuf> = containers
        .iter()
        .map(|(id, container)| {
            let path = container
                .path
                .strip_prefix(&request.output_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| container.path.clone());
            (*id, path)
        })
        .collect();

    let tileset = Tileset::build(&root, |tile| relative.get(&tile.id).cloned(), slice_settings.generate_lod)?;
    let manifest_path = request.output_dir.join(&request.settings.manifest_name);
    tileset.write(&manifest_path)?;
    reporter.log(format!("wrote manifest {}", manifest_path.display()));
    reporter.advance(Stage::Manifest.end_progress());

    Ok(TilesetArtifact {
        output_dir: request.output_dir.clone(),
        manifest_path,
        containers: containers.into_iter().map(|(_, container)| container.path).collect(),
        splat_count: splats.count(),
        tile_count: root.content_count(),
    })
}


/// Explicit source path first, otherwise the trainer's
/// `point_cloud/iteration_<N>/point_cloud.ply`, highest `N` unless one is requested.
pub fn resolve_source(params: &ConversionParams, splat_output_dir: Option<&Path>) -> TilingResult<PathBuf> {
    if let Some(source) = &params.source_path {
        if source.is_file() {
            return Ok(source.clone());
        }
        return Err(TilingError::MissingSource(format!(
            "{} does not exist",
            source.display(),
        )));
    }

    let splat_output_dir = splat_output_dir.ok_or_else(|| {
        TilingError::MissingSource("block has no recorded splat output".to_string())
    })?;
    let point_cloud_dir = splat_output_dir.join(POINT_CLOUD_DIR);

    let iteration = match params.iteration {
        Some(iteration) => iteration,
        None => latest_iteration(&point_cloud_dir).ok_or_else(|| {
            TilingError::MissingSource(format!(
                "no iteration output under {}",
                point_cloud_dir.display(),
            ))
        })?,
    };

    let source = point_cloud_dir
        .join(format!("{ITERATION_PREFIX}{iteration}"))
        .join(POINT_CLOUD_FILE);
    if !source.is_file() {
        return Err(TilingError::MissingSource(format!(
            "{} does not exist",
            source.display(),
        )));
    }

    Ok(source)
}

fn latest_iteration(point_cloud_dir: &Path) -> Option<u32> {
    std::fs::read_dir(point_cloud_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let iteration = name.to_str()?.strip_prefix(ITERATION_PREFIX)?.parse::<u32>().ok()?;
            entry.path().join(POINT_CLOUD_FILE).is_file().then_some(iteration)
        })
        .max()
}


fn checkpoint(reporter: &dyn StageReporter) -> TilingResult<()> {
    if reporter.is_cancelled() {
        return Err(TilingError::Cancelled);
    }

    Ok(())
}

/// Sources inside the output directory would be shadowed or removed by the
/// artifacts written there.
fn ensure_outside_output(source: &Path, output_dir: &Path) -> TilingResult<()> {
    let source = source.canonicalize().map_err(|err| TilingError::file(source, err))?;
    let Ok(output_dir) = output_dir.canonicalize() else {
        return Ok(());
    };

    if source.starts_with(&output_dir) {
        return Err(TilingError::MissingSource(format!(
            "{} lies inside the output directory {}",
            source.display(),
            output_dir.display(),
        )));
    }

    Ok(())
}

/// Paths a conversion writes under its output directory. Nothing else there
/// is ever touched.
pub fn artifact_paths(output_dir: &Path, settings: &ConversionSettings) -> [PathBuf; 3] {
    [
        output_dir.join(&settings.tiles_dir_name),
        output_dir.join(&settings.manifest_name),
        output_dir.join(&settings.intermediate_name),
    ]
}

/// Removes this pipeline's artifacts, then the directory itself if that
/// leaves it empty.
pub fn discard_artifacts(output_dir: &Path, settings: &ConversionSettings) -> TilingResult<()> {
    for path in artifact_paths(output_dir, settings) {
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        removed.map_err(|err| TilingError::file(&path, err))?;
    }

    // fails harmlessly when unrelated files remain
    let _ = std::fs::remove_dir(output_dir);

    Ok(())
}

/// Clears artifacts of a previous run so stale tiles are never referenced.
fn prepare_output_dir(output_dir: &Path, settings: &ConversionSettings) -> TilingResult<()> {
    discard_artifacts(output_dir, settings)?;
    std::fs::create_dir_all(output_dir).map_err(|err| TilingError::file(output_dir, err))?;

    Ok(())
}

fn compressed_round_trip(
    request: &ConversionRequest,
    splats: SplatSet,
    reporter: &dyn StageReporter,
) -> TilingResult<SplatSet> {
    let intermediate = request.output_dir.join(&request.settings.intermediate_name);

    request.codec.compress(&splats, &intermediate)?;
    let bytes = std::fs::metadata(&intermediate).map(|metadata| metadata.len()).unwrap_or(0);
    reporter.log(format!(
        "compressed intermediate {} ({bytes} bytes) via {}",
        intermediate.display(),
        request.codec.backend_name().unwrap_or("none"),
    ));

    let restored = request.codec.decompress(&intermediate)?;
    if restored.count() != splats.count() || restored.sh_degree() != splats.sh_degree() {
        return Err(TilingError::malformed(format!(
            "compressed intermediate holds {} splats of degree {}, expected {} of degree {}",
            restored.count(),
            restored.sh_degree(),
            splats.count(),
            splats.sh_degree(),
        )));
    }

    Ok(restored)
}

fn package(
    request: &ConversionRequest,
    splats: &SplatSet,
    root: &Tile,
    format: ContainerFormat,
    reporter: &dyn StageReporter,
) -> TilingResult<Vec<(u32, TileContainer)>> {
    let tiles_dir = request.output_dir.join(&request.settings.tiles_dir_name);
    std::fs::create_dir_all(&tiles_dir).map_err(|err| TilingError::file(&tiles_dir, err))?;

    let tiles: Vec<&Tile> = root.iter().filter(|tile| tile.has_content()).collect();
    let total = tiles.len();
    let done = AtomicUsize::new(0);

    let package_tile = |tile: &&Tile| -> TilingResult<(u32, TileContainer)> {
        let path = tiles_dir.join(format!("tile_{}.{}", tile.id, format.extension()));
        let container = build_tile(
            &splats.view(&tile.splat_indices),
            &path,
            format,
            TileBatch {
                tile_id: tile.id,
                level: tile.level,
            },
        )?;

        let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
        let span = Stage::Packaging.end_progress() - Stage::Packaging.start_progress();
        reporter.advance(Stage::Packaging.start_progress() + span * finished as f32 / total as f32);

        Ok((tile.id, container))
    };

    #[cfg(feature = "package_rayon")]
    let containers = tiles.par_iter().map(package_tile).collect();

    #[cfg(not(feature = "package_rayon"))]
    let containers = tiles.iter().map(package_tile).collect();

    containers
}
