use bevy::math::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::{
    error::{TilingError, TilingResult},
    gaussian::spherical_harmonics::{SH_CHANNELS, sh_rest_stride},
};


pub const QUATERNION_NORM_TOLERANCE: f32 = 1e-3;


/// One splat without its higher-order color terms.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Serialize,
    Deserialize,
)]
pub struct Splat {
    pub position: [f32; 3],
    /// xyzw unit quaternion
    pub rotation: [f32; 4],
    /// linear axis scales
    pub scale: [f32; 3],
    /// zeroth-order sh coefficients
    pub color: [f32; 3],
    /// activated opacity in [0, 1]
    pub opacity: f32,
}


/// Loose per-splat arrays, validated into a `SplatSet` by `SplatSet::from_parts`.
#[derive(Clone, Debug, Default)]
pub struct SplatParts {
    pub positions: Vec<[f32; 3]>,
    pub rotations: Vec<[f32; 4]>,
    pub scales: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 3]>,
    pub opacities: Vec<f32>,
    pub sh_rest: Option<Vec<f32>>,
    pub sh_degree: i32,
}

impl SplatParts {
    pub fn with_capacity(count: usize, sh_degree: i32, sh_rest_len: usize) -> Self {
        Self {
            positions: Vec::with_capacity(count),
            rotations: Vec::with_capacity(count),
            scales: Vec::with_capacity(count),
            colors: Vec::with_capacity(count),
            opacities: Vec::with_capacity(count),
            sh_rest: (sh_rest_len > 0).then(|| Vec::with_capacity(count * sh_rest_len)),
            sh_degree,
        }
    }

    pub fn push(&mut self, splat: Splat) {
        self.positions.push(splat.position);
        self.rotations.push(splat.rotation);
        self.scales.push(splat.scale);
        self.colors.push(splat.color);
        self.opacities.push(splat.opacity);
    }
}


/// The canonical in-memory splat dataset. Immutable once constructed.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Serialize,
    Deserialize,
)]
pub struct SplatSet {
    positions: Vec<[f32; 3]>,
    rotations: Vec<[f32; 4]>,
    scales: Vec<[f32; 3]>,
    colors: Vec<[f32; 3]>,
    opacities: Vec<f32>,
    sh_rest: Option<Vec<f32>>,
    sh_degree: i32,
}

impl SplatSet {
    pub fn empty(sh_degree: i32) -> Self {
        Self {
            sh_degree,
            ..Default::default()
        }
    }

    /// Validates array lengths and renormalizes rotations.
    pub fn from_parts(mut parts: SplatParts) -> TilingResult<Self> {
        let count = parts.positions.len();

        let lengths = [
            ("rotations", parts.rotations.len()),
            ("scales", parts.scales.len()),
            ("colors", parts.colors.len()),
            ("opacities", parts.opacities.len()),
        ];
        for (name, len) in lengths {
            if len != count {
                return Err(TilingError::malformed(format!(
                    "{name} holds {len} entries, expected {count}",
                )));
            }
        }

        let sh_rest = match parts.sh_rest.take() {
            Some(rest) if rest.is_empty() && count == 0 => None,
            Some(rest) if rest.is_empty() && parts.sh_degree <= 0 => None,
            Some(rest) => {
                let stride = sh_rest_stride(parts.sh_degree, rest.len(), count);
                if stride == 0 || stride % SH_CHANNELS != 0 || rest.len() != stride * count {
                    return Err(TilingError::malformed(format!(
                        "sh rest holds {} values, not a multiple of {count} splats for degree {}",
                        rest.len(),
                        parts.sh_degree,
                    )));
                }
                Some(rest)
            }
            None if parts.sh_degree > 0 && count > 0 => {
                return Err(TilingError::malformed(format!(
                    "sh degree {} declared without higher-order coefficients",
                    parts.sh_degree,
                )));
            }
            None => None,
        };

        for rotation in &mut parts.rotations {
            *rotation = normalize_rotation(*rotation);
        }

        Ok(Self {
            positions: parts.positions,
            rotations: parts.rotations,
            scales: parts.scales,
            colors: parts.colors,
            opacities: parts.opacities,
            sh_rest,
            sh_degree: parts.sh_degree.max(0),
        })
    }

    pub fn into_parts(self) -> SplatParts {
        SplatParts {
            positions: self.positions,
            rotations: self.rotations,
            scales: self.scales,
            colors: self.colors,
            opacities: self.opacities,
            sh_rest: self.sh_rest,
            sh_degree: self.sh_degree,
        }
    }

    pub fn count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn sh_degree(&self) -> i32 {
        self.sh_degree
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn rotations(&self) -> &[[f32; 4]] {
        &self.rotations
    }

    pub fn scales(&self) -> &[[f32; 3]] {
        &self.scales
    }

    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    pub fn opacities(&self) -> &[f32] {
        &self.opacities
    }

    pub fn sh_rest(&self) -> Option<&[f32]> {
        self.sh_rest.as_deref()
    }

    /// Floats of higher-order sh per splat, 0 when only base color is stored.
    pub fn sh_rest_len(&self) -> usize {
        match &self.sh_rest {
            Some(rest) if !self.is_empty() => rest.len() / self.len(),
            _ => 0,
        }
    }

    pub fn sh_rest_of(&self, index: usize) -> &[f32] {
        let stride = self.sh_rest_len();
        match &self.sh_rest {
            Some(rest) => &rest[index * stride..(index + 1) * stride],
            None => &[],
        }
    }

    /// Base color followed by the higher-order terms, `[color(3), sh_rest(M)]`.
    pub fn sh_coefficients(&self, index: usize) -> Vec<f32> {
        let mut coefficients = Vec::with_capacity(SH_CHANNELS + self.sh_rest_len());
        coefficients.extend_from_slice(&self.colors[index]);
        coefficients.extend_from_slice(self.sh_rest_of(index));
        coefficients
    }

    pub fn splat(&self, index: usize) -> Splat {
        Splat {
            position: self.positions[index],
            rotation: self.rotations[index],
            scale: self.scales[index],
            color: self.colors[index],
            opacity: self.opacities[index],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Splat> + '_ {
        (0..self.len()).map(|index| self.splat(index))
    }

    pub fn view<'a>(&'a self, indices: &'a [u32]) -> SplatSetView<'a> {
        SplatSetView {
            set: self,
            indices,
        }
    }

    /// Copies the selected splats into a new set.
    pub fn select(&self, indices: &[u32]) -> SplatSet {
        let stride = self.sh_rest_len();
        let mut parts = SplatParts::with_capacity(indices.len(), self.sh_degree, stride);

        for &index in indices {
            let index = index as usize;
            parts.push(self.splat(index));
            if let Some(rest) = parts.sh_rest.as_mut() {
                rest.extend_from_slice(self.sh_rest_of(index));
            }
        }

        SplatSet {
            positions: parts.positions,
            rotations: parts.rotations,
            scales: parts.scales,
            colors: parts.colors,
            opacities: parts.opacities,
            sh_rest: if indices.is_empty() { None } else { parts.sh_rest },
            sh_degree: self.sh_degree,
        }
    }

    pub fn max_rotation_norm_error(&self) -> f32 {
        self.rotations
            .iter()
            .map(|r| (Quat::from_array(*r).length() - 1.0).abs())
            .fold(0.0, f32::max)
    }
}


/// Borrowed subset of a `SplatSet`, addressed by index.
#[derive(Clone, Copy, Debug)]
pub struct SplatSetView<'a> {
    pub set: &'a SplatSet,
    pub indices: &'a [u32],
}

impl<'a> SplatSetView<'a> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn sh_degree(&self) -> i32 {
        self.set.sh_degree()
    }

    pub fn sh_rest_len(&self) -> usize {
        self.set.sh_rest_len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Splat)> + 'a {
        let set = self.set;
        self.indices.iter().map(move |&index| {
            let index = index as usize;
            (index, set.splat(index))
        })
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + 'a {
        let set = self.set;
        self.indices
            .iter()
            .map(move |&index| Vec3::from(set.positions()[index as usize]))
    }
}


pub fn normalize_rotation(rotation: [f32; 4]) -> [f32; 4] {
    let quat = Quat::from_array(rotation);
    let norm = quat.length();

    if !norm.is_finite() || norm <= f32::EPSILON {
        return Quat::IDENTITY.to_array();
    }

    (quat / norm).to_array()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn parts(count: usize) -> SplatParts {
        let mut parts = SplatParts::with_capacity(count, 0, 0);
        for i in 0..count {
            parts.push(Splat {
                position: [i as f32, 0.0, 0.0],
                rotation: [0.0, 0.0, 0.0, 2.0],
                scale: [0.1; 3],
                color: [0.5; 3],
                opacity: 0.5,
            });
        }
        parts
    }

    #[test]
    fn from_parts_renormalizes_rotations() {
        let set = SplatSet::from_parts(parts(4)).unwrap();

        assert_eq!(set.count(), 4);
        assert!(set.max_rotation_norm_error() < QUATERNION_NORM_TOLERANCE);
        assert_eq!(set.rotations()[0], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn from_parts_rejects_mismatched_lengths() {
        let mut parts = parts(3);
        parts.opacities.pop();

        let err = SplatSet::from_parts(parts).unwrap_err();
        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("opacities")));
    }

    #[test]
    fn from_parts_requires_rest_for_positive_degree() {
        let mut parts = parts(2);
        parts.sh_degree = 1;

        assert!(SplatSet::from_parts(parts).is_err());
    }

    #[test]
    fn sh_coefficients_concatenate_color_and_rest() {
        let mut parts = parts(2);
        parts.sh_degree = 1;
        parts.sh_rest = Some((0..18).map(|i| i as f32).collect());

        let set = SplatSet::from_parts(parts).unwrap();
        let coefficients = set.sh_coefficients(1);

        assert_eq!(set.sh_rest_len(), 9);
        assert_eq!(coefficients.len(), 12);
        assert_eq!(&coefficients[..3], &[0.5, 0.5, 0.5]);
        assert_eq!(coefficients[3], 9.0);
    }

    #[test]
    fn select_copies_subset() {
        let set = SplatSet::from_parts(parts(5)).unwrap();
        let subset = set.select(&[4, 1]);

        assert_eq!(subset.count(), 2);
        assert_eq!(subset.positions()[0], [4.0, 0.0, 0.0]);
        assert_eq!(subset.positions()[1], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn zero_quaternion_becomes_identity() {
        assert_eq!(normalize_rotation([0.0; 4]), [0.0, 0.0, 0.0, 1.0]);
    }
}
