use bevy::{
    log::debug,
    math::{Vec3, bounding::Aabb3d},
};
use rand::{SeedableRng, rngs::StdRng, seq::index::sample};
use serde::{Deserialize, Serialize};

use crate::gaussian::{
    bounds::{aabb_diagonal, aabb_extent, positions_aabb, splat_aabb},
    splat_set::SplatSet,
};


/// Geometric error of a child never exceeds this fraction of its parent's.
pub const CHILD_ERROR_FACTOR: f32 = 0.5;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceSettings {
    pub max_splats_per_tile: usize,
    pub generate_lod: bool,
    pub lod_sample_ratio: f32,
    pub lod_seed: u64,
}

impl Default for SliceSettings {
    fn default() -> Self {
        Self {
            max_splats_per_tile: crate::job::settings::DEFAULT_MAX_SPLATS_PER_TILE,
            generate_lod: false,
            lod_sample_ratio: 0.25,
            lod_seed: 0,
        }
    }
}

impl SliceSettings {
    pub fn new(max_splats_per_tile: usize, generate_lod: bool) -> Self {
        Self {
            max_splats_per_tile,
            generate_lod,
            ..Default::default()
        }
    }
}


/// One spatial cell. Leaves partition the source set; internal nodes carry
/// a downsampled representative subset only when lod generation is on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tile {
    /// depth-first preorder index, root is 0
    pub id: u32,
    pub level: u32,
    /// splat bounds of the whole subtree, `None` for an empty root
    pub bounding_volume: Option<Aabb3d>,
    pub geometric_error: f32,
    pub splat_indices: Vec<u32>,
    pub children: Vec<Tile>,
}

impl Tile {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn has_content(&self) -> bool {
        !self.splat_indices.is_empty()
    }

    /// True when neither this tile nor any descendant holds a splat.
    pub fn is_empty(&self) -> bool {
        !self.has_content() && self.children.iter().all(Tile::is_empty)
    }

    /// Depth-first preorder traversal.
    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let tile = stack.pop()?;
            stack.extend(tile.children.iter().rev());
            Some(tile)
        })
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Tile> {
        self.iter().filter(|tile| tile.is_leaf())
    }

    pub fn tile_count(&self) -> usize {
        self.iter().count()
    }

    pub fn content_count(&self) -> usize {
        self.iter().filter(|tile| tile.has_content()).count()
    }

    pub fn depth(&self) -> u32 {
        self.iter().map(|tile| tile.level).max().unwrap_or(0)
    }
}


/// Partitions the set into a tree of cells holding at most
/// `max_splats_per_tile` splats each.
///
/// Cells are split along the longest axis of their splat centers, with the
/// split point chosen in whole multiples of the budget so a cell of `n`
/// splats ends in exactly `ceil(n / max)` leaves. A cell whose centers all
/// coincide cannot be divided and becomes an over-budget leaf.
pub fn slice(set: &SplatSet, settings: &SliceSettings) -> Tile {
    if set.is_empty() {
        return Tile::default();
    }

    let mut slicer = Slicer {
        set,
        settings,
        max: settings.max_splats_per_tile.max(1),
        next_id: 0,
    };

    let indices = (0..set.count()).collect();
    let root = slicer.cell(indices, 0, None);

    debug!(
        tiles = root.tile_count(),
        leaves = root.leaves().count(),
        depth = root.depth(),
        "sliced splat set"
    );

    root
}


struct Slicer<'a> {
    set: &'a SplatSet,
    settings: &'a SliceSettings,
    max: usize,
    next_id: u32,
}

impl Slicer<'_> {
    fn cell(&mut self, mut indices: Vec<u32>, level: u32, parent_error: Option<f32>) -> Tile {
        let id = self.next_id;
        self.next_id += 1;

        let view = self.set.view(&indices);
        let bounding_volume = splat_aabb(&view);
        let centers = positions_aabb(view.positions());

        let extent = centers.as_ref().map(aabb_extent).unwrap_or_default();
        let mut geometric_error = centers.as_ref().map(aabb_diagonal).unwrap_or(0.0);
        if let Some(parent_error) = parent_error {
            geometric_error = geometric_error.min(parent_error * CHILD_ERROR_FACTOR);
        }

        let splittable = indices.len() > self.max && extent.max_element() > 0.0;
        if !splittable {
            return Tile {
                id,
                level,
                bounding_volume,
                geometric_error,
                splat_indices: indices,
                children: Vec::new(),
            };
        }

        let axis = longest_axis(extent);
        let positions = self.set.positions();
        indices.sort_unstable_by(|&a, &b| {
            positions[a as usize][axis]
                .total_cmp(&positions[b as usize][axis])
                .then(a.cmp(&b))
        });

        let leaves = indices.len().div_ceil(self.max);
        let split = leaves.div_ceil(2) * self.max;

        let representatives = if self.settings.generate_lod {
            self.representatives(&indices, id)
        } else {
            Vec::new()
        };

        let right = indices.split_off(split);
        let left = indices;

        let children = vec![
            self.cell(left, level + 1, Some(geometric_error)),
            self.cell(right, level + 1, Some(geometric_error)),
        ];

        Tile {
            id,
            level,
            bounding_volume,
            geometric_error,
            splat_indices: representatives,
            children,
        }
    }

    /// Seeded uniform sample without replacement, capped at the tile budget.
    fn representatives(&self, indices: &[u32], id: u32) -> Vec<u32> {
        let ratio = self.settings.lod_sample_ratio.clamp(0.0, 1.0);
        let wanted = ((indices.len() as f64) * ratio as f64).ceil() as usize;
        let amount = wanted.clamp(1, self.max.min(indices.len()));

        let seed = self.settings.lod_seed ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut picked: Vec<u32> = sample(&mut rng, indices.len(), amount)
            .into_iter()
            .map(|position| indices[position])
            .collect();
        picked.sort_unstable();
        picked
    }
}


fn longest_axis(extent: Vec3) -> usize {
    if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    }
}
