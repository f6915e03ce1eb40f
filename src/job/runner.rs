use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bevy::{
    log::{error, info, warn},
    prelude::*,
    tasks::{AsyncComputeTaskPool, TaskPool},
};

use crate::{
    error::{TilingError, TilingResult},
    io::codec::SplatCodec,
    job::{
        log::JobLog,
        pipeline::{self, ConversionRequest, StageReporter},
        registry::{BlockRegistry, BlockUpdate},
        settings::{ConversionParams, ConversionSettings},
        types::{JobSnapshot, JobStatus, Stage, TilesetArtifact},
    },
};


/// Cooperative cancellation flag shared between a caller and one job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}


/// One pipeline run for one block.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub block_id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub current_stage: Stage,
    pub output_path: Option<std::path::PathBuf>,
    pub error_message: Option<String>,
    pub log: JobLog,
    pub artifact: Option<TilesetArtifact>,
}

impl ConversionJob {
    fn new(block_id: &str, log_capacity: usize) -> Self {
        Self {
            block_id: block_id.to_string(),
            status: JobStatus::NotStarted,
            progress: 0.0,
            current_stage: Stage::Queued,
            output_path: None,
            error_message: None,
            log: JobLog::new(log_capacity),
            artifact: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            block_id: self.block_id.clone(),
            status: self.status,
            progress: self.progress,
            current_stage: self.current_stage,
            output_path: self.output_path.clone(),
            error_message: self.error_message.clone(),
        }
    }

    fn update(&self) -> BlockUpdate {
        BlockUpdate {
            status: self.status,
            progress: self.progress,
            stage: self.current_stage,
            output_path: self.output_path.clone(),
            error_message: self.error_message.clone(),
        }
    }

    fn push_log(&mut self, line: String) {
        info!(block_id = %self.block_id, "{line}");
        self.log.push(line);
    }
}


struct JobSlot {
    job: ConversionJob,
    cancel: CancellationToken,
}

struct RunnerShared {
    settings: ConversionSettings,
    codec: SplatCodec,
    registry: Arc<dyn BlockRegistry>,
    jobs: Mutex<HashMap<String, JobSlot>>,
}

impl RunnerShared {
    /// The job table lock guards transitions only, never stage work.
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobSlot>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


/// Owns the job table and drives one conversion per block on the async
/// compute task pool.
#[derive(Resource, Clone)]
pub struct ConversionRunner {
    shared: Arc<RunnerShared>,
}

impl ConversionRunner {
    pub fn new(settings: ConversionSettings, codec: SplatCodec, registry: Arc<dyn BlockRegistry>) -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                settings,
                codec,
                registry,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Probes for a codec backend using the settings' external command.
    pub fn with_probed_codec(settings: ConversionSettings, registry: Arc<dyn BlockRegistry>) -> Self {
        let codec = SplatCodec::probe(
            &settings.external_codec,
            settings.codec_timeout_secs,
            settings.prefer_external_codec,
        );
        Self::new(settings, codec, registry)
    }

    pub fn settings(&self) -> &ConversionSettings {
        &self.shared.settings
    }

    pub fn codec(&self) -> &SplatCodec {
        &self.shared.codec
    }

    /// Begins a conversion in the background. A block with a running job
    /// is rejected without touching its state.
    pub fn start_conversion(&self, block_id: &str, params: ConversionParams) -> TilingResult<JobSnapshot> {
        let shared = &self.shared;
        let output_dir = shared.registry.output_dir(block_id);
        let cancel = CancellationToken::default();

        let (snapshot, update) = {
            let mut jobs = shared.jobs();
            if jobs
                .get(block_id)
                .is_some_and(|slot| slot.job.status == JobStatus::Running)
            {
                return Err(TilingError::AlreadyRunning {
                    block_id: block_id.to_string(),
                });
            }

            let mut job = ConversionJob::new(block_id, shared.settings.log_capacity);
            job.status = JobStatus::Running;
            job.output_path = Some(output_dir.clone());
            job.push_log(format!("conversion started, output {}", output_dir.display()));

            let snapshot = job.snapshot();
            let update = job.update();
            jobs.insert(
                block_id.to_string(),
                JobSlot {
                    job,
                    cancel: cancel.clone(),
                },
            );
            (snapshot, update)
        };
        shared.registry.record(block_id, &update);

        let request = ConversionRequest {
            block_id: block_id.to_string(),
            params,
            settings: shared.settings.clone(),
            codec: shared.codec.clone(),
            splat_output_dir: None,
            output_dir,
        };

        let shared = Arc::clone(shared);
        AsyncComputeTaskPool::get_or_init(TaskPool::default)
            .spawn(async move {
                execute(shared, request, cancel);
            })
            .detach();

        Ok(snapshot)
    }

    /// Signals the block's running job to stop at its next stage boundary.
    /// Returns whether a running job was signalled.
    pub fn cancel_conversion(&self, block_id: &str) -> bool {
        let mut jobs = self.shared.jobs();
        let Some(slot) = jobs.get_mut(block_id) else {
            return false;
        };
        if slot.job.status != JobStatus::Running {
            return false;
        }

        slot.cancel.cancel();
        slot.job.push_log(format!("cancellation requested during {}", slot.job.current_stage));
        true
    }

    pub fn status(&self, block_id: &str) -> JobSnapshot {
        self.shared
            .jobs()
            .get(block_id)
            .map(|slot| slot.job.snapshot())
            .unwrap_or_else(|| JobSnapshot::not_started(block_id))
    }

    pub fn get_log_tail(&self, block_id: &str, n: usize) -> Vec<String> {
        self.shared
            .jobs()
            .get(block_id)
            .map(|slot| slot.job.log.tail(n))
            .unwrap_or_default()
    }

    /// Manifest and container paths of a completed conversion.
    pub fn download(&self, block_id: &str) -> Option<TilesetArtifact> {
        self.shared
            .jobs()
            .get(block_id)
            .filter(|slot| slot.job.status == JobStatus::Completed)
            .and_then(|slot| slot.job.artifact.clone())
    }

    pub fn is_running(&self, block_id: &str) -> bool {
        self.status(block_id).status == JobStatus::Running
    }

    /// Marks blocks the registry still records as running, from a previous
    /// process, as failed. Returns the recovered block ids.
    pub fn recover_interrupted(&self) -> Vec<String> {
        let shared = &self.shared;
        let mut recovered = Vec::new();

        for block_id in shared.registry.interrupted_blocks() {
            let update = {
                let mut jobs = shared.jobs();
                if jobs
                    .get(&block_id)
                    .is_some_and(|slot| slot.job.status == JobStatus::Running)
                {
                    continue;
                }

                let mut job = ConversionJob::new(&block_id, shared.settings.log_capacity);
                job.status = JobStatus::Failed;
                job.output_path = Some(shared.registry.output_dir(&block_id));
                job.error_message = Some("conversion interrupted by a process restart".to_string());
                job.push_log("marked failed after an interrupted run".to_string());

                let update = job.update();
                jobs.insert(
                    block_id.clone(),
                    JobSlot {
                        job,
                        cancel: CancellationToken::default(),
                    },
                );
                update
            };

            warn!(block_id = %block_id, "recovered interrupted conversion");
            shared.registry.record(&block_id, &update);
            recovered.push(block_id);
        }

        recovered
    }
}


/// Reports one job's stage transitions into the shared table.
struct JobReporter {
    shared: Arc<RunnerShared>,
    block_id: String,
    cancel: CancellationToken,
}

impl JobReporter {
    fn with_job<R>(&self, f: impl FnOnce(&mut ConversionJob) -> R) -> Option<R> {
        self.shared
            .jobs()
            .get_mut(&self.block_id)
            .map(|slot| f(&mut slot.job))
    }
}

impl StageReporter for JobReporter {
    fn enter(&self, stage: Stage) {
        let update = self.with_job(|job| {
            job.current_stage = stage;
            job.progress = job.progress.max(stage.start_progress());
            job.push_log(format!("stage {stage} started"));
            job.update()
        });

        if let Some(update) = update {
            self.shared.registry.record(&self.block_id, &update);
        }
    }

    fn advance(&self, progress: f32) {
        self.with_job(|job| {
            job.progress = job.progress.max(progress.clamp(0.0, 100.0));
        });
    }

    fn log(&self, line: String) {
        self.with_job(|job| job.push_log(line));
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}


fn execute(shared: Arc<RunnerShared>, mut request: ConversionRequest, cancel: CancellationToken) {
    let block_id = request.block_id.clone();
    request.splat_output_dir = shared.registry.splat_output_dir(&block_id);

    let reporter = JobReporter {
        shared: Arc::clone(&shared),
        block_id: block_id.clone(),
        cancel,
    };

    let result = catch_unwind(AssertUnwindSafe(|| pipeline::run(&request, &reporter)))
        .unwrap_or_else(|_| {
            Err(TilingError::ProgramInvariant("conversion panicked".to_string()))
        });

    if matches!(result, Err(TilingError::Cancelled)) {
        if let Err(err) = pipeline::discard_artifacts(&request.output_dir, &request.settings) {
            warn!(block_id = %block_id, "failed to discard cancelled output: {err}");
        }
    }

    let update = {
        let mut jobs = shared.jobs();
        let Some(slot) = jobs.get_mut(&block_id) else {
            return;
        };
        let job = &mut slot.job;

        match result {
            Ok(artifact) => {
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.current_stage = Stage::Done;
                job.push_log(format!(
                    "conversion completed: {} splats in {} tiles",
                    artifact.splat_count, artifact.tile_count,
                ));
                job.artifact = Some(artifact);
            }
            Err(TilingError::Cancelled) => {
                job.status = JobStatus::Cancelled;
                job.push_log(format!("conversion cancelled at {}, output discarded", job.current_stage));
            }
            Err(err) => {
                error!(block_id = %block_id, stage = %job.current_stage, "conversion failed: {err}");
                job.status = JobStatus::Failed;
                job.error_message = Some(err.to_string());
                job.push_log(format!("conversion failed during {}: {err}", job.current_stage));
            }
        }

        job.update()
    };

    shared.registry.record(&block_id, &update);
}
