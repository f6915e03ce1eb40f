use std::{
    path::Path,
    sync::Arc,
};

use bevy::log::{debug, info, warn};

use crate::{
    error::{TilingError, TilingResult},
    gaussian::{
        spherical_harmonics::flip_sh_rest_yz,
        splat_set::SplatSet,
    },
    io::ply::parse_ply_file,
    job::settings::ExternalCodecCommand,
};


/// A compressor/decompressor for the packed splat representation. Backends
/// store and load data in the packed (RUB) coordinate convention.
pub trait CodecBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, splats: &SplatSet, dest: &Path) -> TilingResult<()>;

    fn decompress(&self, source: &Path) -> TilingResult<SplatSet>;
}


#[cfg(feature = "io_spz")]
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessBackend;

#[cfg(feature = "io_spz")]
impl CodecBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn compress(&self, splats: &SplatSet, dest: &Path) -> TilingResult<()> {
        crate::io::spz::write_packed_file(splats, dest)
    }

    fn decompress(&self, source: &Path) -> TilingResult<SplatSet> {
        crate::io::spz::read_packed_file(source)
    }
}


/// Which backend `SplatCodec::probe` settled on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecBackendKind {
    InProcess,
    ExternalProcess,
    Unavailable,
}


/// Codec-agnostic entry point: parses sources and bridges to whichever
/// compression backend was found at startup.
#[derive(Clone)]
pub struct SplatCodec {
    backend: Option<Arc<dyn CodecBackend>>,
}

impl Default for SplatCodec {
    fn default() -> Self {
        Self::unavailable()
    }
}

impl std::fmt::Debug for SplatCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplatCodec")
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl SplatCodec {
    pub fn with_backend(backend: Arc<dyn CodecBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    /// Prefers the in-process backend, then an external executable found on
    /// the search path. `prefer_external` swaps that order.
    pub fn probe(external: &ExternalCodecCommand, timeout_secs: u64, prefer_external: bool) -> Self {
        let backend = if prefer_external {
            external_backend(external, timeout_secs).or_else(in_process_backend)
        } else {
            in_process_backend().or_else(|| external_backend(external, timeout_secs))
        };

        match &backend {
            Some(backend) => info!(backend = backend.name(), "splat codec backend selected"),
            None => warn!("no splat codec backend available, compressed intermediates disabled"),
        }

        Self { backend }
    }

    pub fn kind(&self) -> CodecBackendKind {
        match self.backend_name() {
            None => CodecBackendKind::Unavailable,
            Some("in_process") => CodecBackendKind::InProcess,
            Some(_) => CodecBackendKind::ExternalProcess,
        }
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|backend| backend.name())
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn parse(&self, source: &Path) -> TilingResult<SplatSet> {
        let splats = parse_ply_file(source)?;
        debug!(
            source = %source.display(),
            count = splats.count(),
            sh_degree = splats.sh_degree(),
            "parsed splat source"
        );

        Ok(splats)
    }

    pub fn compress(&self, splats: &SplatSet, dest: &Path) -> TilingResult<()> {
        let backend = self.backend.as_ref().ok_or(TilingError::CodecUnavailable)?;

        let packed = convert_rdf_rub(splats.clone())?;
        backend.compress(&packed, dest)
    }

    /// Loads a packed file and converts it back into the parse convention.
    pub fn decompress(&self, source: &Path) -> TilingResult<SplatSet> {
        let backend = self.backend.as_ref().ok_or(TilingError::CodecUnavailable)?;

        let packed = backend.decompress(source)?;
        convert_rdf_rub(packed)
    }
}


#[cfg(feature = "io_spz")]
fn in_process_backend() -> Option<Arc<dyn CodecBackend>> {
    Some(Arc::new(InProcessBackend))
}

#[cfg(not(feature = "io_spz"))]
fn in_process_backend() -> Option<Arc<dyn CodecBackend>> {
    None
}

#[cfg(feature = "codec_external")]
fn external_backend(external: &ExternalCodecCommand, timeout_secs: u64) -> Option<Arc<dyn CodecBackend>> {
    crate::io::external::ExternalProcessBackend::locate(external, timeout_secs)
        .map(|backend| Arc::new(backend) as Arc<dyn CodecBackend>)
}

#[cfg(not(feature = "codec_external"))]
fn external_backend(_external: &ExternalCodecCommand, _timeout_secs: u64) -> Option<Arc<dyn CodecBackend>> {
    None
}


/// Converts between right-down-front (parsed ply) and right-up-back (packed)
/// coordinates. A 180 degree rotation about x, so it is its own inverse.
pub fn convert_rdf_rub(splats: SplatSet) -> TilingResult<SplatSet> {
    let mut parts = splats.into_parts();

    for position in &mut parts.positions {
        position[1] = -position[1];
        position[2] = -position[2];
    }

    // conjugating by a 180 degree x rotation negates the y and z components
    for rotation in &mut parts.rotations {
        rotation[1] = -rotation[1];
        rotation[2] = -rotation[2];
    }

    if let Some(rest) = parts.sh_rest.as_mut() {
        let count = parts.positions.len();
        if count > 0 {
            let stride = rest.len() / count;
            for splat_rest in rest.chunks_exact_mut(stride) {
                flip_sh_rest_yz(splat_rest);
            }
        }
    }

    SplatSet::from_parts(parts)
}
