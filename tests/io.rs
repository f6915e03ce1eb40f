use bevy_gaussian_tiles::{
    TilingError,
    gaussian::{
        rand::random_splats,
        splat_set::QUATERNION_NORM_TOLERANCE,
    },
    io::codec::CodecBackendKind,
};

use _harness::{in_process_codec, write_fixture};



#[test]
fn parsed_arrays_match_count() {
    let dir = tempfile::tempdir().unwrap();
    let splats = random_splats(1000, 3, 11);
    let path = write_fixture(dir.path(), "scene.ply", &splats);

    let codec = in_process_codec();
    let parsed = codec.parse(&path).unwrap();

    let count = parsed.len();
    assert_eq!(parsed.count(), 1000);
    assert_eq!(parsed.sh_degree(), 3);
    assert_eq!(parsed.positions().len(), count);
    assert_eq!(parsed.rotations().len(), count);
    assert_eq!(parsed.scales().len(), count);
    assert_eq!(parsed.colors().len(), count);
    assert_eq!(parsed.opacities().len(), count);
    assert_eq!(parsed.sh_rest().unwrap().len(), count * 45);
    assert!(parsed.max_rotation_norm_error() <= QUATERNION_NORM_TOLERANCE);
}

#[test]
fn missing_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let codec = in_process_codec();

    let result = codec.parse(&dir.path().join("missing.ply"));

    assert!(matches!(result, Err(TilingError::File { .. })));
}

#[cfg(feature = "io_spz")]
#[test]
fn compressed_round_trip_preserves_shape() {
    let dir = tempfile::tempdir().unwrap();
    let splats = random_splats(500, 2, 13);
    let path = write_fixture(dir.path(), "scene.ply", &splats);

    let codec = in_process_codec();
    assert_eq!(codec.kind(), CodecBackendKind::InProcess);

    let parsed = codec.parse(&path).unwrap();
    let packed = dir.path().join("scene.spz");
    codec.compress(&parsed, &packed).unwrap();
    let restored = codec.decompress(&packed).unwrap();

    assert_eq!(restored.count(), parsed.count());
    assert_eq!(restored.sh_degree(), parsed.sh_degree());
    assert_eq!(restored.sh_rest_len(), parsed.sh_rest_len());
    assert!(restored.max_rotation_norm_error() <= QUATERNION_NORM_TOLERANCE);

    for (restored, parsed) in restored.positions().iter().zip(parsed.positions()) {
        for axis in 0..3 {
            assert!(
                (restored[axis] - parsed[axis]).abs() < 1e-2,
                "position drifted from {parsed:?} to {restored:?}",
            );
        }
    }
    for (restored, parsed) in restored.opacities().iter().zip(parsed.opacities()) {
        assert!((restored - parsed).abs() < 1.0 / 128.0);
    }
}
