pub mod log;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod settings;
pub mod types;

pub use registry::{BlockRegistry, BlockUpdate, InMemoryBlockRegistry};
pub use runner::{CancellationToken, ConversionJob, ConversionRunner};
pub use settings::{ConversionParams, ConversionSettings, ExternalCodecCommand};
pub use types::{JobSnapshot, JobStatus, Stage, TilesetArtifact};
