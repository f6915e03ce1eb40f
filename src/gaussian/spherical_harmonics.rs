pub const SH_CHANNELS: usize = 3;

/// 1 / (2 * sqrt(pi)), maps the zeroth-order coefficient to linear color.
pub const SH_C0: f32 = 0.282_094_8;

pub const MAX_SH_DEGREE: i32 = 4;


pub const fn num_sh_coefficients(degree: usize) -> usize {
    if degree == 0 {
        1
    } else {
        2 * degree + 1 + num_sh_coefficients(degree - 1)
    }
}

/// Floats stored beyond the base color for a given degree, all channels.
pub const fn sh_rest_len(degree: usize) -> usize {
    (num_sh_coefficients(degree) - 1) * SH_CHANNELS
}

const SH_REST_TABLE: [(i32, usize); 4] = [
    (0, 0),
    (1, 9),
    (2, 24),
    (3, 45),
];


/// Per-splat sh-rest length: the fixed table for degrees 0..=3, else the
/// total coefficient length spread evenly over the splats.
pub fn sh_rest_stride(sh_degree: i32, total_sh_length: usize, count: usize) -> usize {
    if let Some(&(_, len)) = SH_REST_TABLE.iter().find(|(degree, _)| *degree == sh_degree) {
        return len;
    }

    if count == 0 {
        0
    } else {
        total_sh_length / count
    }
}

pub fn sh_degree_from_rest_len(rest_len: usize) -> Option<i32> {
    (0..=MAX_SH_DEGREE).find(|&degree| sh_rest_len(degree as usize) == rest_len)
}


/// Channel-planar source order (all red, all green, all blue) to
/// coefficient-major interleaved order (rgb per coefficient).
pub fn planar_to_interleaved_index(planar_index: usize, rest_len: usize) -> usize {
    let per_channel = rest_len / SH_CHANNELS;
    let channel = planar_index / per_channel;
    let coefficient = planar_index % per_channel;

    coefficient * SH_CHANNELS + channel
}

pub fn interleaved_to_planar_index(interleaved_index: usize, rest_len: usize) -> usize {
    let per_channel = rest_len / SH_CHANNELS;
    let coefficient = interleaved_index / SH_CHANNELS;
    let channel = interleaved_index % SH_CHANNELS;

    channel * per_channel + coefficient
}


// parity of each real sh basis function under a 180 degree rotation about x
// (y -> -y, z -> -z), bands 1..=4 in standard order
const SH_FLIP_YZ: [f32; num_sh_coefficients(MAX_SH_DEGREE as usize) - 1] = [
    -1.0, -1.0, 1.0,
    -1.0, 1.0, 1.0, -1.0, 1.0,
    -1.0, 1.0, -1.0, -1.0, 1.0, -1.0, 1.0,
    -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, 1.0, -1.0, 1.0,
];

/// Applies the y/z axis flip to one splat's interleaved sh-rest coefficients.
pub fn flip_sh_rest_yz(rest: &mut [f32]) {
    for (coefficient, rgb) in rest.chunks_exact_mut(SH_CHANNELS).enumerate() {
        let sign = SH_FLIP_YZ.get(coefficient).copied().unwrap_or(1.0);
        for value in rgb {
            *value *= sign;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_lengths_follow_degree_table() {
        assert_eq!(sh_rest_len(0), 0);
        assert_eq!(sh_rest_len(1), 9);
        assert_eq!(sh_rest_len(2), 24);
        assert_eq!(sh_rest_len(3), 45);

        assert_eq!(sh_rest_stride(2, 0, 10), 24);
        assert_eq!(sh_rest_stride(4, 720, 10), 72);
        assert_eq!(sh_rest_stride(7, 0, 0), 0);
    }

    #[test]
    fn degree_is_recovered_from_rest_len() {
        assert_eq!(sh_degree_from_rest_len(0), Some(0));
        assert_eq!(sh_degree_from_rest_len(45), Some(3));
        assert_eq!(sh_degree_from_rest_len(72), Some(4));
        assert_eq!(sh_degree_from_rest_len(10), None);
    }

    #[test]
    fn planar_interleaved_indices_invert() {
        let rest_len = sh_rest_len(3);
        for i in 0..rest_len {
            let interleaved = planar_to_interleaved_index(i, rest_len);
            assert_eq!(interleaved_to_planar_index(interleaved, rest_len), i);
        }

        // f_rest_15 is the first green coefficient for degree 3
        assert_eq!(planar_to_interleaved_index(15, rest_len), 1);
    }

    #[test]
    fn flip_signs_match_basis_parity_for_every_band() {
        // y -> -y negates sin(|m| phi) terms, z -> -z contributes (-1)^(l + |m|)
        let mut coefficient = 0;
        for band in 1..=MAX_SH_DEGREE {
            for order in -band..=band {
                let mut expected = if (band + order.abs()) % 2 == 0 { 1.0 } else { -1.0 };
                if order < 0 {
                    expected = -expected;
                }
                assert_eq!(SH_FLIP_YZ[coefficient], expected, "band {band} order {order}");
                coefficient += 1;
            }
        }
        assert_eq!(coefficient, SH_FLIP_YZ.len());
    }

    #[test]
    fn degree_four_coefficients_are_flipped() {
        let mut rest = vec![1.0f32; sh_rest_len(4)];
        flip_sh_rest_yz(&mut rest);

        // first band-4 coefficient (order -4) is odd under the flip
        assert_eq!(rest[45..48], [-1.0; 3]);
        // band-4 order 0 is even
        assert_eq!(rest[57..60], [1.0; 3]);
        assert_eq!(rest[69..72], [1.0; 3]);
    }

    #[test]
    fn flip_is_an_involution() {
        let original: Vec<f32> = (0..45).map(|i| i as f32 * 0.1 - 2.0).collect();
        let mut rest = original.clone();

        flip_sh_rest_yz(&mut rest);
        assert_ne!(rest, original);

        flip_sh_rest_yz(&mut rest);
        assert_eq!(rest, original);
    }
}
