use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use bevy::math::Quat;
use bytemuck::{Pod, Zeroable};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use static_assertions::assert_eq_size;

use crate::{
    error::{TilingError, TilingResult},
    gaussian::{
        spherical_harmonics::sh_rest_stride,
        splat_set::{Splat, SplatParts, SplatSet},
    },
};


pub const MAGIC: u32 = 0x5053474E; // 'NGSP'
pub const VERSION: u32 = 2;
pub const FRACTIONAL_BITS: u8 = 12;
pub const FLAG_ANTIALIASED: u8 = 0x1;

const FIXED_LIMIT: i32 = 1 << 23;
const COLOR_SCALE: f32 = 0.15;
const LOG_SCALE_OFFSET: f32 = 10.0;
const LOG_SCALE_STEPS: f32 = 16.0;


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PackedHeader {
    pub magic: u32,
    pub version: u32,
    pub num_points: u32,
    pub sh_degree: u8,
    pub fractional_bits: u8,
    pub flags: u8,
    pub reserved: u8,
}

assert_eq_size!(PackedHeader, [u8; 16]);

impl PackedHeader {
    fn validate(&self) -> TilingResult<()> {
        if self.magic != MAGIC {
            return Err(TilingError::malformed(format!(
                "packed splats magic {:#010x} does not match {MAGIC:#010x}",
                self.magic,
            )));
        }
        if self.version != VERSION {
            return Err(TilingError::malformed(format!(
                "unsupported packed splats version {}",
                self.version,
            )));
        }
        if self.fractional_bits > 23 {
            return Err(TilingError::malformed(format!(
                "fractional bits {} out of range",
                self.fractional_bits,
            )));
        }

        Ok(())
    }
}


/// Quantized splat attributes, one plane per attribute.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackedSplats {
    pub header: PackedHeader,
    pub positions: Vec<u8>,
    pub alphas: Vec<u8>,
    pub colors: Vec<u8>,
    pub scales: Vec<u8>,
    pub rotations: Vec<u8>,
    pub sh: Vec<u8>,
}

impl PackedSplats {
    /// Positions use as many fractional bits as the largest coordinate
    /// allows, up to `FRACTIONAL_BITS`.
    pub fn pack(set: &SplatSet) -> TilingResult<Self> {
        let count = set.len();
        let rest_len = set.sh_rest_len();
        let fractional_bits = fractional_bits_for(set)?;
        let scale = (1u32 << fractional_bits) as f32;

        let mut packed = Self {
            header: PackedHeader {
                magic: MAGIC,
                version: VERSION,
                num_points: count as u32,
                sh_degree: set.sh_degree().max(0) as u8,
                fractional_bits,
                flags: 0,
                reserved: 0,
            },
            positions: Vec::with_capacity(count * 9),
            alphas: Vec::with_capacity(count),
            colors: Vec::with_capacity(count * 3),
            scales: Vec::with_capacity(count * 3),
            rotations: Vec::with_capacity(count * 3),
            sh: Vec::with_capacity(count * rest_len),
        };

        for (index, splat) in set.iter().enumerate() {
            for value in splat.position {
                let fixed = ((value * scale).round() as i32).clamp(-FIXED_LIMIT, FIXED_LIMIT - 1);
                packed.positions.extend_from_slice(&fixed.to_le_bytes()[..3]);
            }

            packed.alphas.push(to_u8(splat.opacity * 255.0));

            for value in splat.color {
                packed.colors.push(to_u8((value * COLOR_SCALE + 0.5) * 255.0));
            }

            for value in splat.scale {
                let log = value.max(1e-12).ln();
                packed.scales.push(to_u8((log + LOG_SCALE_OFFSET) * LOG_SCALE_STEPS));
            }

            let mut rotation = Quat::from_array(splat.rotation).normalize();
            if rotation.w < 0.0 {
                rotation = -rotation;
            }
            for value in [rotation.x, rotation.y, rotation.z] {
                packed.rotations.push(to_u8(value * 127.5 + 127.5));
            }

            for &value in set.sh_rest_of(index) {
                packed.sh.push(to_u8(value * 128.0 + 128.0));
            }
        }

        Ok(packed)
    }

    pub fn unpack(&self) -> TilingResult<SplatSet> {
        let count = self.header.num_points as usize;
        let sh_degree = self.header.sh_degree as i32;
        let rest_len = sh_rest_stride(sh_degree, self.sh.len(), count);
        let scale = 1.0 / (1u32 << self.header.fractional_bits) as f32;

        self.check_plane("positions", self.positions.len(), count * 9)?;
        self.check_plane("alphas", self.alphas.len(), count)?;
        self.check_plane("colors", self.colors.len(), count * 3)?;
        self.check_plane("scales", self.scales.len(), count * 3)?;
        self.check_plane("rotations", self.rotations.len(), count * 3)?;
        self.check_plane("sh", self.sh.len(), count * rest_len)?;

        let mut parts = SplatParts::with_capacity(count, sh_degree, rest_len);
        for i in 0..count {
            let mut position = [0.0f32; 3];
            for (axis, value) in position.iter_mut().enumerate() {
                let at = i * 9 + axis * 3;
                let bytes = &self.positions[at..at + 3];
                let mut fixed = bytes[0] as i32 | (bytes[1] as i32) << 8 | (bytes[2] as i32) << 16;
                // sign extend 24 bits
                if fixed & 0x80_0000 != 0 {
                    fixed |= !0xFF_FFFF;
                }
                *value = fixed as f32 * scale;
            }

            let mut color = [0.0f32; 3];
            for (channel, value) in color.iter_mut().enumerate() {
                *value = (self.colors[i * 3 + channel] as f32 / 255.0 - 0.5) / COLOR_SCALE;
            }

            let mut splat_scale = [0.0f32; 3];
            for (axis, value) in splat_scale.iter_mut().enumerate() {
                let log = self.scales[i * 3 + axis] as f32 / LOG_SCALE_STEPS - LOG_SCALE_OFFSET;
                *value = log.exp();
            }

            let xyz = [0, 1, 2].map(|c| self.rotations[i * 3 + c] as f32 / 127.5 - 1.0);
            let w = (1.0 - (xyz[0] * xyz[0] + xyz[1] * xyz[1] + xyz[2] * xyz[2])).max(0.0).sqrt();

            parts.push(Splat {
                position,
                rotation: [xyz[0], xyz[1], xyz[2], w],
                scale: splat_scale,
                color,
                opacity: self.alphas[i] as f32 / 255.0,
            });

            if let Some(rest) = parts.sh_rest.as_mut() {
                let at = i * rest_len;
                rest.extend(
                    self.sh[at..at + rest_len]
                        .iter()
                        .map(|&q| (q as f32 - 128.0) / 128.0),
                );
            }
        }

        SplatSet::from_parts(parts)
    }

    fn check_plane(&self, name: &str, actual: usize, expected: usize) -> TilingResult<()> {
        if actual != expected {
            return Err(TilingError::malformed(format!(
                "packed {name} plane holds {actual} bytes, expected {expected} for {} splats",
                self.header.num_points,
            )));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> TilingResult<Vec<u8>> {
        let mut output = Vec::new();

        {
            let mut gz_encoder = GzEncoder::new(&mut output, Compression::default());
            gz_encoder.write_all(bytemuck::bytes_of(&self.header))?;
            gz_encoder.write_all(&self.positions)?;
            gz_encoder.write_all(&self.alphas)?;
            gz_encoder.write_all(&self.colors)?;
            gz_encoder.write_all(&self.scales)?;
            gz_encoder.write_all(&self.rotations)?;
            gz_encoder.write_all(&self.sh)?;
            gz_encoder.finish()?;
        }

        Ok(output)
    }

    pub fn from_bytes(data: &[u8]) -> TilingResult<Self> {
        let mut decompressed = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut decompressed)
            .map_err(|err| TilingError::malformed(format!("packed splats are not gzip data: {err}")))?;

        let header = read_header_bytes(&decompressed)?;
        let count = header.num_points as usize;

        let planes = [count * 9, count, count * 3, count * 3, count * 3];
        let mut offset = std::mem::size_of::<PackedHeader>();
        let mut split = Vec::with_capacity(planes.len());
        for len in planes {
            let end = offset + len;
            if end > decompressed.len() {
                return Err(TilingError::malformed(format!(
                    "packed splats truncated for {count} splats",
                )));
            }
            split.push(decompressed[offset..end].to_vec());
            offset = end;
        }
        let sh = decompressed[offset..].to_vec();

        let mut split = split.into_iter();
        let mut next = || split.next().unwrap_or_default();
        let positions = next();
        let alphas = next();
        let colors = next();
        let scales = next();
        let rotations = next();

        Ok(Self {
            header,
            positions,
            alphas,
            colors,
            scales,
            rotations,
            sh,
        })
    }
}


fn read_header_bytes(bytes: &[u8]) -> TilingResult<PackedHeader> {
    let size = std::mem::size_of::<PackedHeader>();
    if bytes.len() < size {
        return Err(TilingError::malformed("packed splats header is truncated"));
    }

    let header: PackedHeader = bytemuck::pod_read_unaligned(&bytes[..size]);
    header.validate()?;

    Ok(header)
}

/// Reads only the header of a packed splat file.
pub fn read_header(path: &Path) -> TilingResult<PackedHeader> {
    let file = File::open(path).map_err(|err| TilingError::file(path, err))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));

    let mut bytes = [0u8; 16];
    decoder
        .read_exact(&mut bytes)
        .map_err(|err| TilingError::malformed(format!("{}: {err}", path.display())))?;

    read_header_bytes(&bytes)
}

pub fn write_packed_file(set: &SplatSet, path: &Path) -> TilingResult<()> {
    let bytes = PackedSplats::pack(set)?.to_bytes()?;

    let file = File::create(path).map_err(|err| TilingError::file(path, err))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;

    Ok(())
}

pub fn read_packed_file(path: &Path) -> TilingResult<SplatSet> {
    let bytes = std::fs::read(path).map_err(|err| TilingError::file(path, err))?;

    PackedSplats::from_bytes(&bytes)?.unpack()
}

/// Largest fixed-point precision whose 24-bit range still holds every
/// finite coordinate.
fn fractional_bits_for(set: &SplatSet) -> TilingResult<u8> {
    let max_abs = set
        .positions()
        .iter()
        .flatten()
        .filter(|value| value.is_finite())
        .fold(0.0f32, |max, value| max.max(value.abs()));

    (0..=FRACTIONAL_BITS)
        .rev()
        .find(|&bits| (max_abs * (1u32 << bits) as f32).round() <= (FIXED_LIMIT - 1) as f32)
        .ok_or_else(|| {
            TilingError::malformed(format!(
                "coordinate {max_abs} exceeds the packed 24-bit position range",
            ))
        })
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::rand::random_splats;

    #[test]
    fn pack_unpack_within_tolerance() {
        let set = random_splats(256, 1, 11);
        let unpacked = PackedSplats::pack(&set).unwrap().unpack().unwrap();

        assert_eq!(unpacked.count(), set.count());
        assert_eq!(unpacked.sh_degree(), 1);
        assert_eq!(unpacked.sh_rest_len(), set.sh_rest_len());

        for (a, b) in unpacked.positions().iter().zip(set.positions()) {
            for axis in 0..3 {
                assert!((a[axis] - b[axis]).abs() <= 1.0 / 4096.0);
            }
        }
        for (a, b) in unpacked.opacities().iter().zip(set.opacities()) {
            assert!((a - b).abs() <= 1.0 / 255.0 + 1e-6);
        }
        for (a, b) in unpacked.rotations().iter().zip(set.rotations()) {
            let dot = Quat::from_array(*a).dot(Quat::from_array(*b)).abs();
            assert!(dot > 0.98, "rotation drifted: dot {dot}");
        }
    }

    fn with_position(position: [f32; 3]) -> SplatSet {
        let mut parts = SplatParts::with_capacity(1, 0, 0);
        parts.push(Splat {
            position,
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [0.1; 3],
            color: [0.0; 3],
            opacity: 0.5,
        });
        SplatSet::from_parts(parts).unwrap()
    }

    #[test]
    fn far_coordinates_trade_precision_for_range() {
        let set = with_position([5000.0, 10.0, -3000.0]);
        let packed = PackedSplats::pack(&set).unwrap();
        let unpacked = packed.unpack().unwrap();

        assert!(packed.header.fractional_bits < FRACTIONAL_BITS);
        let step = 1.0 / (1u32 << packed.header.fractional_bits) as f32;
        for (a, b) in unpacked.positions()[0].iter().zip(set.positions()[0]) {
            assert!((a - b).abs() <= step, "{a} drifted from {b}");
        }
    }

    #[test]
    fn near_coordinates_keep_full_precision() {
        let packed = PackedSplats::pack(&with_position([1.5, -2.25, 100.0])).unwrap();

        assert_eq!(packed.header.fractional_bits, FRACTIONAL_BITS);
    }

    #[test]
    fn coordinates_beyond_24_bits_are_rejected() {
        let err = PackedSplats::pack(&with_position([1.0e8, 0.0, 0.0])).unwrap_err();

        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("24-bit")));
    }

    #[test]
    fn bytes_round_trip_through_gzip() {
        let set = random_splats(32, 0, 3);
        let packed = PackedSplats::pack(&set).unwrap();

        let decoded = PackedSplats::from_bytes(&packed.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packed);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut packed = PackedSplats::pack(&random_splats(4, 0, 1)).unwrap();
        packed.header.magic = 0xDEADBEEF;

        let err = PackedSplats::from_bytes(&packed.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("magic")));
    }

    #[test]
    fn short_planes_are_rejected() {
        let mut packed = PackedSplats::pack(&random_splats(4, 0, 1)).unwrap();
        packed.alphas.pop();

        assert!(packed.unpack().is_err());
    }
}
