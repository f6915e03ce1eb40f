use std::sync::Arc;

use bevy::prelude::*;
use static_assertions::assert_cfg;

pub use error::{TilingError, TilingResult};
pub use gaussian::{
    Splat,
    SplatParts,
    SplatSet,
    SplatSetView,
};
pub use io::codec::{CodecBackend, SplatCodec};
pub use job::{
    BlockRegistry,
    ConversionParams,
    ConversionRunner,
    ConversionSettings,
    InMemoryBlockRegistry,
    JobSnapshot,
    JobStatus,
    Stage,
    TilesetArtifact,
};
pub use stream::{
    ContainerFormat,
    Tile,
    TileContainer,
    Tileset,
};

pub mod error;
pub mod gaussian;
pub mod io;
pub mod job;
pub mod stream;
pub mod utils;


// container buffers are cast straight from f32 slices
assert_cfg!(target_endian = "little", "tile containers require a little-endian target");


/// Inserts a `ConversionRunner` resource backed by the given registry, using
/// the app's `ConversionSettings` when present.
pub struct GaussianTilingPlugin {
    pub registry: Arc<dyn BlockRegistry>,
}

impl GaussianTilingPlugin {
    pub fn new(registry: Arc<dyn BlockRegistry>) -> Self {
        Self { registry }
    }
}

impl Plugin for GaussianTilingPlugin {
    fn build(&self, app: &mut App) {
        let settings = app
            .world()
            .get_resource::<ConversionSettings>()
            .cloned()
            .unwrap_or_default();

        let runner = ConversionRunner::with_probed_codec(settings.clone(), Arc::clone(&self.registry));
        let recovered = runner.recover_interrupted();
        if !recovered.is_empty() {
            warn!(blocks = ?recovered, "failed conversions interrupted by a previous run");
        }

        app.insert_resource(settings);
        app.insert_resource(runner);
    }
}
