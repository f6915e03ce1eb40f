pub mod bounds;
pub mod rand;
pub mod spherical_harmonics;
pub mod splat_set;

pub use splat_set::{
    Splat,
    SplatParts,
    SplatSet,
    SplatSetView,
};
