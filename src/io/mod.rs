pub mod codec;
pub mod ply;

#[cfg(feature = "codec_external")]
pub mod external;

#[cfg(feature = "io_spz")]
pub mod spz;
