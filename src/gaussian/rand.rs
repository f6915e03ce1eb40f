use rand::{
    Rng,
    SeedableRng,
    prelude::Distribution,
    rngs::StdRng,
};

use crate::gaussian::{
    spherical_harmonics::sh_rest_len,
    splat_set::{Splat, SplatParts, SplatSet},
};


impl Distribution<Splat> for rand::distributions::Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Splat {
        Splat {
            rotation: [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ],
            position: [
                rng.gen_range(-20.0..20.0),
                rng.gen_range(-20.0..20.0),
                rng.gen_range(-20.0..20.0),
            ],
            scale: [
                rng.gen_range(0.001..0.1),
                rng.gen_range(0.001..0.1),
                rng.gen_range(0.001..0.1),
            ],
            color: [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ],
            opacity: rng.gen_range(0.05..0.95),
        }
    }
}

pub fn random_splats(n: usize, sh_degree: i32, seed: u64) -> SplatSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let rest_len = sh_rest_len(sh_degree.max(0) as usize);
    let mut parts = SplatParts::with_capacity(n, sh_degree, rest_len);

    for _ in 0..n {
        parts.push(rng.r#gen());
        if let Some(rest) = parts.sh_rest.as_mut() {
            rest.extend((0..rest_len).map(|_| rng.gen_range(-0.5..0.5)));
        }
    }

    SplatSet::from_parts(parts).expect("generated parts are consistent")
}

/// Splats on a regular `nx * ny * nz` lattice with unit spacing, x fastest.
pub fn grid_splats(nx: usize, ny: usize, nz: usize) -> SplatSet {
    let mut parts = SplatParts::with_capacity(nx * ny * nz, 0, 0);

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                parts.push(Splat {
                    position: [x as f32, y as f32, z as f32],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                    scale: [0.05; 3],
                    color: [0.25, 0.5, 0.75],
                    opacity: 0.8,
                });
            }
        }
    }

    SplatSet::from_parts(parts).expect("grid parts are consistent")
}

/// Unit cube corners plus a duplicated origin corner.
pub fn test_model() -> SplatSet {
    let mut parts = SplatParts::with_capacity(9, 0, 0);

    for &x in [-0.5, 0.5].iter() {
        for &y in [-0.5, 0.5].iter() {
            for &z in [-0.5, 0.5].iter() {
                parts.push(Splat {
                    position: [x, y, z],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                    scale: [0.125; 3],
                    color: [x, y, z],
                    opacity: 0.5,
                });
            }
        }
    }
    let first = parts.positions[0];
    parts.push(Splat {
        position: first,
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [0.125; 3],
        color: [0.0; 3],
        opacity: 0.5,
    });

    SplatSet::from_parts(parts).expect("test model parts are consistent")
}
