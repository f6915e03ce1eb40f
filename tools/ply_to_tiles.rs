use std::{
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use bevy::{
    app::TaskPoolPlugin,
    log::LogPlugin,
    prelude::*,
};
use byte_unit::{Byte, UnitType};
use clap::Parser;

use bevy_gaussian_tiles::{
    BlockRegistry,
    ConversionRunner,
    GaussianTilingPlugin,
    JobStatus,
    job::BlockUpdate,
    utils::TilingArgs,
};


const BLOCK_ID: &str = "cli";


/// Writes straight into the requested output directory.
struct OutputDirRegistry {
    output: PathBuf,
}

impl BlockRegistry for OutputDirRegistry {
    fn splat_output_dir(&self, _block_id: &str) -> Option<PathBuf> {
        None
    }

    fn output_dir(&self, _block_id: &str) -> PathBuf {
        self.output.clone()
    }

    fn record(&self, block_id: &str, update: &BlockUpdate) {
        debug!(block_id, stage = %update.stage, progress = update.progress, "block update");
    }
}


fn main() -> ExitCode {
    let args = TilingArgs::parse();

    let mut app = App::new();
    app.add_plugins((
        LogPlugin::default(),
        TaskPoolPlugin::default(),
    ));
    app.insert_resource(args.settings());
    app.add_plugins(GaussianTilingPlugin::new(Arc::new(OutputDirRegistry {
        output: args.output.clone(),
    })));

    let runner = app.world().resource::<ConversionRunner>().clone();
    info!(
        input = %args.input_file.display(),
        output = %args.output.display(),
        codec = runner.codec().backend_name().unwrap_or("none"),
        "converting splats to tiles"
    );

    if let Err(err) = runner.start_conversion(BLOCK_ID, args.params()) {
        error!("failed to start conversion: {err}");
        return ExitCode::FAILURE;
    }

    let mut last_progress = -1.0;
    let snapshot = loop {
        let snapshot = runner.status(BLOCK_ID);
        if snapshot.progress > last_progress {
            last_progress = snapshot.progress;
            info!(stage = %snapshot.current_stage, "{:.0}%", snapshot.progress);
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    if snapshot.status != JobStatus::Completed {
        for line in runner.get_log_tail(BLOCK_ID, 20) {
            warn!("{line}");
        }
        error!(
            status = ?snapshot.status,
            "conversion did not complete: {}",
            snapshot.error_message.unwrap_or_default()
        );
        return ExitCode::FAILURE;
    }

    if let Some(artifact) = runner.download(BLOCK_ID) {
        let bytes = Byte::from_u64(artifact.total_bytes());
        info!(
            tiles = artifact.tile_count,
            splats = artifact.splat_count,
            manifest = %artifact.manifest_path.display(),
            "output size: {}",
            bytes.get_appropriate_unit(UnitType::Decimal)
        );
    }

    ExitCode::SUCCESS
}
