use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Component, Path, PathBuf},
};

use bevy::{
    log::debug,
    math::{Vec3A, bounding::Aabb3d},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{TilingError, TilingResult},
    gaussian::bounds::tileset_box,
    stream::slice::Tile,
};


pub const TILESET_VERSION: &str = "1.1";


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Refine {
    Replace,
    Add,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tileset {
    pub asset: TilesetAsset,
    pub geometric_error: f64,
    pub root: TilesetNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetAsset {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetNode {
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine: Option<Refine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<TileContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TilesetNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    #[serde(rename = "box")]
    pub bounding_box: [f64; 12],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileContent {
    pub uri: String,
}


impl Tileset {
    /// Walks the tile tree depth-first, emitting one node per non-empty
    /// subtree. `container_path` maps a tile with content to its container,
    /// relative to the manifest.
    pub fn build<F>(root: &Tile, container_path: F, generate_lod: bool) -> TilingResult<Self>
    where
        F: Fn(&Tile) -> Option<PathBuf>,
    {
        let mut node = node(root, &container_path)?;
        node.refine = Some(if generate_lod && !root.is_leaf() {
            Refine::Add
        } else {
            Refine::Replace
        });

        let tileset = Self {
            asset: TilesetAsset {
                version: TILESET_VERSION.to_string(),
                generator: Some(env!("CARGO_PKG_NAME").to_string()),
            },
            geometric_error: node.geometric_error,
            root: node,
        };
        tileset.validate()?;

        Ok(tileset)
    }

    /// Every node's geometric error must not exceed its parent's.
    pub fn validate(&self) -> TilingResult<()> {
        if self.root.geometric_error > self.geometric_error {
            return Err(TilingError::ProgramInvariant(format!(
                "root geometric error {} exceeds tileset error {}",
                self.root.geometric_error, self.geometric_error,
            )));
        }

        validate_node(&self.root)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TilesetNode> {
        let mut stack = vec![&self.root];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    pub fn content_uris(&self) -> Vec<&str> {
        self.nodes()
            .filter_map(|node| node.content.as_ref())
            .map(|content| content.uri.as_str())
            .collect()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &TilesetNode> {
        self.nodes().filter(|node| node.children.is_empty())
    }

    pub fn write(&self, path: &Path) -> TilingResult<()> {
        self.validate()?;

        let file = File::create(path).map_err(|err| TilingError::file(path, err))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(|err| TilingError::file(path, err))?;

        debug!(path = %path.display(), nodes = self.nodes().count(), "wrote tileset manifest");

        Ok(())
    }

    pub fn read(path: &Path) -> TilingResult<Self> {
        let file = File::open(path).map_err(|err| TilingError::file(path, err))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}


fn node<F>(tile: &Tile, container_path: &F) -> TilingResult<TilesetNode>
where
    F: Fn(&Tile) -> Option<PathBuf>,
{
    let content = if tile.has_content() {
        let path = container_path(tile).ok_or_else(|| {
            TilingError::ProgramInvariant(format!("tile {} has splats but no container", tile.id))
        })?;
        Some(TileContent { uri: uri(&path) })
    } else {
        None
    };

    let children = tile
        .children
        .iter()
        .filter(|child| !child.is_empty())
        .map(|child| node(child, container_path))
        .collect::<TilingResult<Vec<_>>>()?;

    let bounding_volume = tile.bounding_volume.unwrap_or(Aabb3d {
        min: Vec3A::ZERO,
        max: Vec3A::ZERO,
    });

    Ok(TilesetNode {
        bounding_volume: BoundingVolume {
            bounding_box: tileset_box(&bounding_volume),
        },
        geometric_error: tile.geometric_error as f64,
        refine: None,
        content,
        children,
    })
}

fn validate_node(node: &TilesetNode) -> TilingResult<()> {
    for child in &node.children {
        if child.geometric_error > node.geometric_error {
            return Err(TilingError::ProgramInvariant(format!(
                "child geometric error {} exceeds parent error {}",
                child.geometric_error, node.geometric_error,
            )));
        }
        validate_node(child)?;
    }

    Ok(())
}

/// Relative uri with forward slashes regardless of platform.
fn uri(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
