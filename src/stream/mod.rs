pub mod container;
pub mod slice;
pub mod tileset;

pub use container::{ContainerFormat, TileContainer};
pub use slice::{SliceSettings, Tile, slice};
pub use tileset::Tileset;
