use bevy::math::{Vec3, Vec3A, bounding::Aabb3d};

use crate::gaussian::splat_set::SplatSetView;


/// Gaussian extent in standard deviations covered by a splat's bounds.
pub const SPLAT_EXTENT_SIGMA: f32 = 3.0;


pub fn positions_aabb(positions: impl IntoIterator<Item = Vec3>) -> Option<Aabb3d> {
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    let mut any = false;

    for position in positions {
        if !position.is_finite() {
            continue;
        }
        min = min.min(position);
        max = max.max(position);
        any = true;
    }

    any.then(|| Aabb3d { min: min.into(), max: max.into() })
}

/// Tight bounds of the splat centers, grown by each splat's largest axis.
pub fn splat_aabb(view: &SplatSetView) -> Option<Aabb3d> {
    let mut min = Vec3A::splat(f32::INFINITY);
    let mut max = Vec3A::splat(f32::NEG_INFINITY);
    let mut any = false;

    for (_, splat) in view.iter() {
        let position = Vec3A::from(splat.position);
        if !position.is_finite() {
            continue;
        }

        let radius = Vec3A::from(splat.scale).max_element().abs() * SPLAT_EXTENT_SIGMA;
        let radius = if radius.is_finite() { radius } else { 0.0 };

        min = min.min(position - Vec3A::splat(radius));
        max = max.max(position + Vec3A::splat(radius));
        any = true;
    }

    any.then_some(Aabb3d { min, max })
}

pub fn aabb_extent(aabb: &Aabb3d) -> Vec3 {
    Vec3::from(aabb.max - aabb.min)
}

pub fn aabb_center(aabb: &Aabb3d) -> Vec3 {
    Vec3::from((aabb.min + aabb.max) * 0.5)
}

pub fn aabb_diagonal(aabb: &Aabb3d) -> f32 {
    aabb_extent(aabb).length()
}

pub fn aabb_merge(a: &Aabb3d, b: &Aabb3d) -> Aabb3d {
    Aabb3d {
        min: a.min.min(b.min),
        max: a.max.max(b.max),
    }
}

/// 3d tiles `box` bounding volume: center followed by the three half-axes.
pub fn tileset_box(aabb: &Aabb3d) -> [f64; 12] {
    let center = aabb_center(aabb);
    let half = aabb_extent(aabb) * 0.5;

    [
        center.x as f64, center.y as f64, center.z as f64,
        half.x as f64, 0.0, 0.0,
        0.0, half.y as f64, 0.0,
        0.0, 0.0, half.z as f64,
    ]
}
