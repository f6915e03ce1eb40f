use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bevy::{
    log::debug,
    math::{Vec3A, bounding::Aabb3d},
};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;

use crate::{
    error::{TilingError, TilingResult},
    gaussian::{
        bounds::{positions_aabb, splat_aabb},
        spherical_harmonics::SH_CHANNELS,
        splat_set::SplatSetView,
    },
};


pub const CONTAINER_MAGIC: [u8; 4] = *b"b3dm";
pub const CONTAINER_VERSION: u32 = 1;
pub const GLB_MAGIC: [u8; 4] = *b"glTF";
pub const GLB_VERSION: u32 = 2;
const GLB_CHUNK_JSON: u32 = 0x4E4F_534A;
const GLB_CHUNK_BIN: u32 = 0x004E_4942;

pub const SPLAT_EXTENSION: &str = "KHR_gaussian_splatting";

/// position 3, rotation 4, scale 3, color 3, opacity 1
const CORE_FLOATS: usize = 14;
const MAX_BYTE_STRIDE: usize = 252;

const COMPONENT_FLOAT: u32 = 5126;
const MODE_POINTS: u32 = 0;
const TARGET_ARRAY_BUFFER: u32 = 34962;


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// `.gltf` with the buffer base64-encoded inline, for small debug tiles
    JsonEmbedded,
    #[default]
    Binary,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::JsonEmbedded => "gltf",
            Self::Binary => "b3dm",
        }
    }
}


/// Batch identifiers recorded in the container's batch table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileBatch {
    pub tile_id: u32,
    pub level: u32,
}


/// A packaged tile on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContainer {
    pub path: PathBuf,
    pub format: ContainerFormat,
    pub splat_count: u32,
    pub sh_degree: i32,
    pub byte_length: u64,
    pub bounding_volume: Aabb3d,
}


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ContainerHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub byte_length: u32,
    pub feature_table_json_byte_length: u32,
    pub feature_table_binary_byte_length: u32,
    pub batch_table_json_byte_length: u32,
    pub batch_table_binary_byte_length: u32,
}

assert_eq_size!(ContainerHeader, [u8; 28]);

impl ContainerHeader {
    pub fn parse(bytes: &[u8]) -> TilingResult<Self> {
        let size = std::mem::size_of::<Self>();
        if bytes.len() < size {
            return Err(TilingError::malformed("tile container shorter than its header"));
        }

        let header: Self = bytemuck::pod_read_unaligned(&bytes[..size]);
        if header.magic != CONTAINER_MAGIC {
            return Err(TilingError::malformed("tile container magic mismatch"));
        }

        Ok(header)
    }

    pub fn payload_offset(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.feature_table_json_byte_length as usize
            + self.feature_table_binary_byte_length as usize
            + self.batch_table_json_byte_length as usize
            + self.batch_table_binary_byte_length as usize
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FeatureTable {
    pub splat_count: u32,
    pub batch_length: u32,
    pub bounding_box: [f32; 6],
    pub sh_degree: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTable {
    pub tile_id: Vec<u32>,
    pub level: Vec<u32>,
}


/// Packages a non-empty subset into a standalone tile file.
pub fn build(view: &SplatSetView, out_path: &Path, format: ContainerFormat) -> TilingResult<TileContainer> {
    build_tile(view, out_path, format, TileBatch::default())
}

pub fn build_tile(
    view: &SplatSetView,
    out_path: &Path,
    format: ContainerFormat,
    batch: TileBatch,
) -> TilingResult<TileContainer> {
    if view.is_empty() {
        return Err(TilingError::EmptySubset);
    }

    let layout = BufferLayout::new(view.len(), view.sh_rest_len());
    check_buffer_size(layout.byte_length())?;

    let bounding_volume = splat_aabb(view).unwrap_or(Aabb3d {
        min: Vec3A::ZERO,
        max: Vec3A::ZERO,
    });
    let buffer = layout.write(view);
    let mut document = GltfDocument::new(view, &layout, buffer.len());

    let bytes = match format {
        ContainerFormat::Binary => {
            let glb = glb_bytes(&document, &buffer)?;
            container_bytes(view, &bounding_volume, batch, &glb)?
        }
        ContainerFormat::JsonEmbedded => {
            document.buffers[0].uri = Some(format!(
                "data:application/octet-stream;base64,{}",
                BASE64.encode(&buffer),
            ));
            document.extras = Some(TileExtras {
                tile_id: batch.tile_id,
                level: batch.level,
                splat_count: view.len() as u32,
                bounding_box: bounding_box(&bounding_volume),
            });
            serde_json::to_vec_pretty(&document)?
        }
    };

    let file = File::create(out_path).map_err(|err| TilingError::file(out_path, err))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&bytes)
        .and_then(|_| writer.flush())
        .map_err(|err| TilingError::file(out_path, err))?;

    debug!(
        path = %out_path.display(),
        splats = view.len(),
        bytes = bytes.len(),
        "wrote tile container"
    );

    Ok(TileContainer {
        path: out_path.to_path_buf(),
        format,
        splat_count: view.len() as u32,
        sh_degree: view.sh_degree(),
        byte_length: bytes.len() as u64,
        bounding_volume,
    })
}

/// Rejects sizes that cannot be addressed by the container's 32-bit offsets.
pub fn check_buffer_size(bytes: u64) -> TilingResult<u64> {
    if bytes > u32::MAX as u64 {
        return Err(TilingError::BufferOverflow { bytes });
    }

    Ok(bytes)
}


/// Per-splat floats are interleaved into one vertex stream. Higher-order
/// terms join the stream while the stride stays within gltf's limit,
/// otherwise they follow it coefficient by coefficient.
#[derive(Debug, Clone, Copy)]
struct BufferLayout {
    count: usize,
    rest_len: usize,
    interleave_sh: bool,
}

impl BufferLayout {
    fn new(count: usize, rest_len: usize) -> Self {
        Self {
            count,
            rest_len,
            interleave_sh: (CORE_FLOATS + rest_len) * 4 <= MAX_BYTE_STRIDE,
        }
    }

    fn vertex_stride(&self) -> usize {
        let floats = if self.interleave_sh {
            CORE_FLOATS + self.rest_len
        } else {
            CORE_FLOATS
        };
        floats * 4
    }

    fn vertex_bytes(&self) -> usize {
        self.count * self.vertex_stride()
    }

    fn byte_length(&self) -> u64 {
        self.count as u64 * (CORE_FLOATS + self.rest_len) as u64 * 4
    }

    fn write(&self, view: &SplatSetView) -> Vec<u8> {
        let mut floats: Vec<f32> = Vec::with_capacity(self.count * (CORE_FLOATS + self.rest_len));

        for (index, splat) in view.iter() {
            floats.extend_from_slice(&splat.position);
            floats.extend_from_slice(&splat.rotation);
            floats.extend_from_slice(&splat.scale);
            floats.extend_from_slice(&splat.color);
            floats.push(splat.opacity);
            if self.interleave_sh {
                floats.extend_from_slice(view.set.sh_rest_of(index));
            }
        }

        if !self.interleave_sh {
            for coefficient in 0..self.rest_len / SH_CHANNELS {
                let range = coefficient * SH_CHANNELS..(coefficient + 1) * SH_CHANNELS;
                for &index in view.indices {
                    floats.extend_from_slice(&view.set.sh_rest_of(index as usize)[range.clone()]);
                }
            }
        }

        bytemuck::cast_slice(&floats).to_vec()
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GltfDocument {
    pub asset: GltfAsset,
    pub scene: u32,
    pub scenes: Vec<GltfScene>,
    pub nodes: Vec<GltfNode>,
    pub meshes: Vec<GltfMesh>,
    pub accessors: Vec<GltfAccessor>,
    pub buffer_views: Vec<GltfBufferView>,
    pub buffers: Vec<GltfBuffer>,
    pub extensions_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<TileExtras>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GltfAsset {
    pub version: String,
    pub generator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GltfScene {
    pub nodes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GltfNode {
    pub mesh: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GltfMesh {
    pub primitives: Vec<GltfPrimitive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GltfPrimitive {
    pub attributes: BTreeMap<String, u32>,
    pub mode: u32,
    pub extensions: BTreeMap<String, SplatExtension>,
}

/// Marks the primitive as gaussian splats and describes how to read them
/// from the shared buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplatExtension {
    pub splat_count: u32,
    pub sh_degree: i32,
    pub buffer_view: u32,
    pub rotation_order: String,
    pub scale_space: String,
    pub opacity_space: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GltfAccessor {
    pub buffer_view: u32,
    pub byte_offset: u32,
    pub component_type: u32,
    pub count: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<[f32; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GltfBufferView {
    pub buffer: u32,
    pub byte_offset: u32,
    pub byte_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_stride: Option<u32>,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GltfBuffer {
    pub byte_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Batch metadata carried by json-embedded tiles, which have no tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileExtras {
    pub tile_id: u32,
    pub level: u32,
    pub splat_count: u32,
    pub bounding_box: [f32; 6],
}

impl GltfDocument {
    fn new(view: &SplatSetView, layout: &BufferLayout, buffer_len: usize) -> Self {
        let count = view.len() as u32;
        let stride = layout.vertex_stride() as u32;

        let mut buffer_views = vec![GltfBufferView {
            buffer: 0,
            byte_offset: 0,
            byte_length: layout.vertex_bytes() as u32,
            byte_stride: Some(stride),
            target: TARGET_ARRAY_BUFFER,
        }];

        let centers = positions_aabb(view.positions());
        let mut accessors = Vec::new();
        let mut attributes = BTreeMap::new();
        let mut push = |name: String, view_index: u32, offset: usize, kind: &str, bounds: Option<&Aabb3d>| {
            attributes.insert(name, accessors.len() as u32);
            accessors.push(GltfAccessor {
                buffer_view: view_index,
                byte_offset: offset as u32,
                component_type: COMPONENT_FLOAT,
                count,
                kind: kind.to_string(),
                min: bounds.map(|aabb| aabb.min.to_array()),
                max: bounds.map(|aabb| aabb.max.to_array()),
            });
        };

        push("POSITION".to_string(), 0, 0, "VEC3", centers.as_ref());
        push(format!("{SPLAT_EXTENSION}:ROTATION"), 0, 12, "VEC4", None);
        push(format!("{SPLAT_EXTENSION}:SCALE"), 0, 28, "VEC3", None);
        push(sh_attribute(0, 0), 0, 40, "VEC3", None);
        push(format!("{SPLAT_EXTENSION}:OPACITY"), 0, 52, "SCALAR", None);

        let coefficients = layout.rest_len / SH_CHANNELS;
        if coefficients > 0 {
            let sh_view = if layout.interleave_sh {
                0
            } else {
                buffer_views.push(GltfBufferView {
                    buffer: 0,
                    byte_offset: layout.vertex_bytes() as u32,
                    byte_length: (buffer_len - layout.vertex_bytes()) as u32,
                    byte_stride: None,
                    target: TARGET_ARRAY_BUFFER,
                });
                1
            };

            for coefficient in 0..coefficients {
                let offset = if layout.interleave_sh {
                    CORE_FLOATS * 4 + coefficient * SH_CHANNELS * 4
                } else {
                    coefficient * layout.count * SH_CHANNELS * 4
                };

                // rest coefficients start at band 1
                let flat = coefficient + 1;
                let degree = (flat as f32).sqrt().floor() as usize;
                push(sh_attribute(degree, flat - degree * degree), sh_view, offset, "VEC3", None);
            }
        }

        let mut extensions = BTreeMap::new();
        extensions.insert(
            SPLAT_EXTENSION.to_string(),
            SplatExtension {
                splat_count: count,
                sh_degree: view.sh_degree(),
                buffer_view: 0,
                rotation_order: "xyzw".to_string(),
                scale_space: "linear".to_string(),
                opacity_space: "linear".to_string(),
            },
        );

        Self {
            asset: GltfAsset {
                version: "2.0".to_string(),
                generator: env!("CARGO_PKG_NAME").to_string(),
            },
            scene: 0,
            scenes: vec![GltfScene { nodes: vec![0] }],
            nodes: vec![GltfNode { mesh: 0 }],
            meshes: vec![GltfMesh {
                primitives: vec![GltfPrimitive {
                    attributes,
                    mode: MODE_POINTS,
                    extensions,
                }],
            }],
            accessors,
            buffer_views,
            buffers: vec![GltfBuffer {
                byte_length: buffer_len as u32,
                uri: None,
            }],
            extensions_used: vec![SPLAT_EXTENSION.to_string()],
            extras: None,
        }
    }
}

fn sh_attribute(degree: usize, coefficient: usize) -> String {
    format!("{SPLAT_EXTENSION}:SH_DEGREE_{degree}_COEF_{coefficient}")
}

fn bounding_box(aabb: &Aabb3d) -> [f32; 6] {
    [
        aabb.min.x, aabb.min.y, aabb.min.z,
        aabb.max.x, aabb.max.y, aabb.max.z,
    ]
}

fn padded(len: usize, alignment: usize) -> usize {
    len.div_ceil(alignment) * alignment
}


fn glb_bytes(document: &GltfDocument, buffer: &[u8]) -> TilingResult<Vec<u8>> {
    let json = serde_json::to_vec(document)?;
    let json_length = padded(json.len(), 4);
    let bin_length = padded(buffer.len(), 4);

    let total = 12 + 8 + json_length as u64 + 8 + bin_length as u64;
    let total = check_buffer_size(total)? as usize;

    let mut output = Vec::with_capacity(total);
    output.extend_from_slice(&GLB_MAGIC);
    output.extend_from_slice(&GLB_VERSION.to_le_bytes());
    output.extend_from_slice(&(total as u32).to_le_bytes());

    output.extend_from_slice(&(json_length as u32).to_le_bytes());
    output.extend_from_slice(&GLB_CHUNK_JSON.to_le_bytes());
    output.extend_from_slice(&json);
    output.resize(output.len() + json_length - json.len(), b' ');

    output.extend_from_slice(&(bin_length as u32).to_le_bytes());
    output.extend_from_slice(&GLB_CHUNK_BIN.to_le_bytes());
    output.extend_from_slice(buffer);
    output.resize(output.len() + bin_length - buffer.len(), 0);

    Ok(output)
}

fn container_bytes(
    view: &SplatSetView,
    bounding_volume: &Aabb3d,
    batch: TileBatch,
    glb: &[u8],
) -> TilingResult<Vec<u8>> {
    let header_size = std::mem::size_of::<ContainerHeader>();

    let feature_table = serde_json::to_vec(&FeatureTable {
        splat_count: view.len() as u32,
        batch_length: 1,
        bounding_box: bounding_box(bounding_volume),
        sh_degree: view.sh_degree(),
    })?;
    let batch_table = serde_json::to_vec(&BatchTable {
        tile_id: vec![batch.tile_id],
        level: vec![batch.level],
    })?;

    // tables are space padded so the payload starts 8-byte aligned
    let feature_table_length = padded(header_size + feature_table.len(), 8) - header_size;
    let batch_table_length = padded(batch_table.len(), 8);

    let total = header_size as u64 + feature_table_length as u64 + batch_table_length as u64 + glb.len() as u64;
    let total = check_buffer_size(total)?;

    let header = ContainerHeader {
        magic: CONTAINER_MAGIC,
        version: CONTAINER_VERSION,
        byte_length: total as u32,
        feature_table_json_byte_length: feature_table_length as u32,
        feature_table_binary_byte_length: 0,
        batch_table_json_byte_length: batch_table_length as u32,
        batch_table_binary_byte_length: 0,
    };

    let mut output = Vec::with_capacity(total as usize);
    output.extend_from_slice(bytemuck::bytes_of(&header));
    output.extend_from_slice(&feature_table);
    output.resize(header_size + feature_table_length, b' ');
    output.extend_from_slice(&batch_table);
    output.resize(header_size + feature_table_length + batch_table_length, b' ');
    output.extend_from_slice(glb);

    Ok(output)
}


/// Splits a binary container into its tables and the gltf json of its payload.
pub fn read_container(bytes: &[u8]) -> TilingResult<(ContainerHeader, FeatureTable, BatchTable, GltfDocument)> {
    let header = ContainerHeader::parse(bytes)?;
    if header.byte_length as usize != bytes.len() {
        return Err(TilingError::malformed("tile container length mismatch"));
    }

    let header_size = std::mem::size_of::<ContainerHeader>();
    let feature_json = section(bytes, header_size, header.feature_table_json_byte_length, "feature table")?;
    let batch_start = header_size
        + header.feature_table_json_byte_length as usize
        + header.feature_table_binary_byte_length as usize;
    let batch_json = section(bytes, batch_start, header.batch_table_json_byte_length, "batch table")?;

    let feature_table: FeatureTable = serde_json::from_slice(trim_padding(feature_json))?;
    let batch_table: BatchTable = serde_json::from_slice(trim_padding(batch_json))?;

    let glb = bytes
        .get(header.payload_offset()..)
        .ok_or_else(|| TilingError::malformed("tile container tables run past the payload"))?;
    if glb.len() < 20 || glb[..4] != GLB_MAGIC {
        return Err(TilingError::malformed("tile payload is not a glb document"));
    }
    let json_length = u32::from_le_bytes([glb[12], glb[13], glb[14], glb[15]]) as usize;
    let json = glb
        .get(20..20 + json_length)
        .ok_or_else(|| TilingError::malformed("glb json chunk truncated"))?;
    let document: GltfDocument = serde_json::from_slice(trim_padding(json))?;

    Ok((header, feature_table, batch_table, document))
}

fn section<'a>(bytes: &'a [u8], start: usize, length: u32, name: &str) -> TilingResult<&'a [u8]> {
    start
        .checked_add(length as usize)
        .and_then(|end| bytes.get(start..end))
        .ok_or_else(|| TilingError::malformed(format!("tile container {name} runs past the end of the tile")))
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&byte| byte != b' ')
        .map_or(0, |position| position + 1);
    &bytes[..end]
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::{rand::random_splats, splat_set::SplatSet};

    fn all_indices(set: &SplatSet) -> Vec<u32> {
        (0..set.count()).collect()
    }

    #[test]
    fn empty_subset_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let set = random_splats(4, 0, 1);
        let path = dir.path().join("tile.b3dm");

        let result = build(&set.view(&[]), &path, ContainerFormat::Binary);

        assert!(matches!(result, Err(TilingError::EmptySubset)));
        assert!(!path.exists());
    }

    #[test]
    fn binary_container_is_self_describing() {
        let dir = tempfile::tempdir().unwrap();
        let set = random_splats(20, 3, 2);
        let indices = all_indices(&set);
        let path = dir.path().join("tile.b3dm");

        let container = build_tile(
            &set.view(&indices),
            &path,
            ContainerFormat::Binary,
            TileBatch { tile_id: 7, level: 2 },
        )
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(container.byte_length, bytes.len() as u64);
        assert_eq!(container.splat_count, 20);

        let (header, feature_table, batch_table, document) = read_container(&bytes).unwrap();
        assert_eq!(header.version, CONTAINER_VERSION);
        assert_eq!(header.payload_offset() % 8, 0);
        assert_eq!(feature_table.splat_count, 20);
        assert_eq!(feature_table.sh_degree, 3);
        assert_eq!(batch_table.tile_id, vec![7]);
        assert_eq!(batch_table.level, vec![2]);

        assert_eq!(document.extensions_used, vec![SPLAT_EXTENSION.to_string()]);
        let primitive = &document.meshes[0].primitives[0];
        assert_eq!(primitive.mode, MODE_POINTS);
        assert!(primitive.extensions.contains_key(SPLAT_EXTENSION));
        // 5 core attributes plus 15 rest coefficients
        assert_eq!(primitive.attributes.len(), 20);
        assert_eq!(document.buffer_views.len(), 1);
        assert_eq!(document.buffer_views[0].byte_stride, Some((CORE_FLOATS as u32 + 45) * 4));
    }

    #[test]
    fn corrupt_table_lengths_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let set = random_splats(6, 0, 4);
        let indices = all_indices(&set);
        let path = dir.path().join("tile.b3dm");
        build_tile(&set.view(&indices), &path, ContainerFormat::Binary, TileBatch::default()).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        // feature table json, feature table binary, batch table json
        for (offset, name) in [(12, "feature table"), (16, "batch table"), (20, "batch table")] {
            let mut corrupt = bytes.clone();
            corrupt[offset..offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());

            let err = read_container(&corrupt).unwrap_err();
            assert!(
                matches!(&err, TilingError::MalformedInput(msg) if msg.contains(name)),
                "offset {offset}: {err}"
            );
        }

        let mut corrupt = bytes.clone();
        corrupt[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(read_container(&corrupt), Err(TilingError::MalformedInput(_))));
    }

    #[test]
    fn buffer_holds_interleaved_little_endian_floats() {
        let dir = tempfile::tempdir().unwrap();
        let set = random_splats(3, 0, 5);
        let indices = vec![2, 0];
        let path = dir.path().join("tile.b3dm");

        build(&set.view(&indices), &path, ContainerFormat::Binary).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (header, _, _, _) = read_container(&bytes).unwrap();
        let glb = &bytes[header.payload_offset()..];
        let json_length = u32::from_le_bytes(glb[12..16].try_into().unwrap()) as usize;
        let bin = &glb[20 + json_length + 8..];

        let second_vertex = CORE_FLOATS * 4;
        let x = f32::from_le_bytes(bin[second_vertex..second_vertex + 4].try_into().unwrap());
        let opacity_offset = 13 * 4;
        let opacity = f32::from_le_bytes(bin[opacity_offset..opacity_offset + 4].try_into().unwrap());

        assert_eq!(x, set.positions()[0][0]);
        assert_eq!(opacity, set.opacities()[2]);
    }

    #[test]
    fn high_degree_sh_moves_to_its_own_view() {
        let layout = BufferLayout::new(10, 72);

        assert!(!layout.interleave_sh);
        assert_eq!(layout.vertex_stride(), CORE_FLOATS * 4);
        assert_eq!(layout.byte_length(), 10 * (14 + 72) * 4);
    }

    #[test]
    fn json_embedded_inlines_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let set = random_splats(5, 1, 3);
        let indices = all_indices(&set);
        let path = dir.path().join("tile.gltf");

        build_tile(
            &set.view(&indices),
            &path,
            ContainerFormat::JsonEmbedded,
            TileBatch { tile_id: 3, level: 1 },
        )
        .unwrap();

        let document: GltfDocument = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let uri = document.buffers[0].uri.as_deref().unwrap();
        let encoded = uri.strip_prefix("data:application/octet-stream;base64,").unwrap();
        let decoded = BASE64.decode(encoded).unwrap();

        assert_eq!(decoded.len() as u32, document.buffers[0].byte_length);
        assert_eq!(decoded.len(), 5 * (CORE_FLOATS + 9) * 4);
        assert_eq!(document.extras.unwrap().tile_id, 3);
    }

    #[test]
    fn oversized_buffers_are_rejected() {
        let bytes = u32::MAX as u64 + 1;

        assert!(matches!(
            check_buffer_size(bytes),
            Err(TilingError::BufferOverflow { bytes: reported }) if reported == bytes,
        ));
        assert!(check_buffer_size(u32::MAX as u64).is_ok());
    }
}
