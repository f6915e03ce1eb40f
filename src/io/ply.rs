use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use bevy::log::debug;
use ply_rs::{
    parser::Parser,
    ply::{DefaultElement, ElementDef, Encoding, PropertyType, ScalarType},
};

use crate::{
    error::{TilingError, TilingResult},
    gaussian::{
        spherical_harmonics::{planar_to_interleaved_index, sh_degree_from_rest_len},
        splat_set::{Splat, SplatParts, SplatSet},
    },
};


pub const MAX_SIZE_VARIANCE: f32 = 4.0;

const VERTEX_ELEMENT: &str = "vertex";
/// Vertices reserved up front; a larger declared count grows as records arrive.
const PREALLOCATED_VERTICES: usize = 1 << 20;

const REQUIRED_PROPERTIES: [&str; 14] = [
    "x", "y", "z",
    "f_dc_0", "f_dc_1", "f_dc_2",
    "scale_0", "scale_1", "scale_2",
    "opacity",
    "rot_0", "rot_1", "rot_2", "rot_3",
];


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Position(usize),
    Color(usize),
    Scale(usize),
    Rotation(usize),
    Opacity,
    Rest(usize),
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        let field = match name {
            "x" => Self::Position(0),
            "y" => Self::Position(1),
            "z" => Self::Position(2),
            "f_dc_0" => Self::Color(0),
            "f_dc_1" => Self::Color(1),
            "f_dc_2" => Self::Color(2),
            "scale_0" => Self::Scale(0),
            "scale_1" => Self::Scale(1),
            "scale_2" => Self::Scale(2),
            "rot_0" => Self::Rotation(0),
            "rot_1" => Self::Rotation(1),
            "rot_2" => Self::Rotation(2),
            "rot_3" => Self::Rotation(3),
            "opacity" => Self::Opacity,
            _ => {
                let index = name.strip_prefix("f_rest_")?.parse::<usize>().ok()?;
                Self::Rest(index)
            }
        };

        Some(field)
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn from_ply(scalar: &ScalarType) -> Self {
        match scalar {
            ScalarType::Char => Self::I8,
            ScalarType::UChar => Self::U8,
            ScalarType::Short => Self::I16,
            ScalarType::UShort => Self::U16,
            ScalarType::Int => Self::I32,
            ScalarType::UInt => Self::U32,
            ScalarType::Float => Self::F32,
            ScalarType::Double => Self::F64,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    fn read(self, bytes: &[u8], little_endian: bool) -> f32 {
        macro_rules! decode {
            ($ty:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                if little_endian {
                    <$ty>::from_le_bytes(raw) as f32
                } else {
                    <$ty>::from_be_bytes(raw) as f32
                }
            }};
        }

        match self {
            Self::I8 => bytes[0] as i8 as f32,
            Self::U8 => bytes[0] as f32,
            Self::I16 => decode!(i16, 2),
            Self::U16 => decode!(u16, 2),
            Self::I32 => decode!(i32, 4),
            Self::U32 => decode!(u32, 4),
            Self::F32 => decode!(f32, 4),
            Self::F64 => decode!(f64, 8),
        }
    }
}


#[derive(Clone, Copy, Debug)]
struct PropertySlot {
    byte_offset: usize,
    token: usize,
    scalar: Scalar,
    field: Field,
}

/// Vertex property table resolved once from the header into fixed offsets.
#[derive(Debug)]
struct VertexLayout {
    count: usize,
    record_size: usize,
    token_count: usize,
    rest_len: usize,
    slots: Vec<PropertySlot>,
}

impl VertexLayout {
    fn resolve(element: &ElementDef) -> TilingResult<Self> {
        for required in REQUIRED_PROPERTIES {
            if !element.properties.contains_key(required) {
                return Err(TilingError::malformed(format!(
                    "missing required property `{required}`",
                )));
            }
        }

        let mut slots = Vec::new();
        let mut byte_offset = 0;
        let mut rest_len = 0;

        for (token, (name, property)) in element.properties.iter().enumerate() {
            let scalar = match &property.data_type {
                PropertyType::Scalar(scalar) => Scalar::from_ply(scalar),
                PropertyType::List(..) => {
                    return Err(TilingError::malformed(format!(
                        "list property `{name}` is not supported on the vertex element",
                    )));
                }
            };

            if let Some(field) = Field::from_name(name) {
                if let Field::Rest(index) = field {
                    rest_len = rest_len.max(index + 1);
                }

                slots.push(PropertySlot {
                    byte_offset,
                    token,
                    scalar,
                    field,
                });
            }

            byte_offset += scalar.size();
        }

        if sh_degree_from_rest_len(rest_len).is_none() {
            return Err(TilingError::malformed(format!(
                "{rest_len} f_rest properties do not form a complete spherical harmonic degree",
            )));
        }

        Ok(Self {
            count: element.count,
            record_size: byte_offset,
            token_count: element.properties.len(),
            rest_len,
            slots,
        })
    }

    fn sh_degree(&self) -> i32 {
        sh_degree_from_rest_len(self.rest_len).unwrap_or(0)
    }
}


/// Raw (pre-activation) values of one vertex record.
#[derive(Clone, Copy, Default)]
struct RawSplat {
    position: [f32; 3],
    color: [f32; 3],
    log_scale: [f32; 3],
    rotation_wxyz: [f32; 4],
    opacity_logit: f32,
}

impl RawSplat {
    fn assign(&mut self, field: Field, value: f32, rest: &mut [f32], rest_len: usize) {
        match field {
            Field::Position(axis) => self.position[axis] = value,
            Field::Color(channel) => self.color[channel] = value,
            Field::Scale(axis) => self.log_scale[axis] = value,
            Field::Rotation(component) => self.rotation_wxyz[component] = value,
            Field::Opacity => self.opacity_logit = value,
            Field::Rest(index) => rest[planar_to_interleaved_index(index, rest_len)] = value,
        }
    }

    fn activate(self) -> Splat {
        let mean_scale = self.log_scale.iter().sum::<f32>() / 3.0;
        let scale = self.log_scale.map(|s| {
            s.max(mean_scale - MAX_SIZE_VARIANCE)
                .min(mean_scale + MAX_SIZE_VARIANCE)
                .exp()
        });
        let [w, x, y, z] = self.rotation_wxyz;

        Splat {
            position: self.position,
            rotation: [x, y, z, w],
            scale,
            color: self.color,
            opacity: sigmoid(self.opacity_logit),
        }
    }
}


pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn inverse_sigmoid(y: f32) -> f32 {
    let y = y.clamp(1e-6, 1.0 - 1e-6);
    (y / (1.0 - y)).ln()
}


/// Reads a 3d gaussian splatting ply (header plus body) into a `SplatSet`.
pub fn parse_ply<R: BufRead>(reader: &mut R) -> TilingResult<SplatSet> {
    let parser = Parser::<DefaultElement>::new();
    let header = parser
        .read_header(reader)
        .map_err(|err| TilingError::malformed(format!("invalid ply header: {err}")))?;

    let little_endian = match header.encoding {
        Encoding::Ascii => None,
        Encoding::BinaryLittleEndian => Some(true),
        Encoding::BinaryBigEndian => Some(false),
    };

    for (_key, element) in &header.elements {
        if element.name == VERTEX_ELEMENT {
            let layout = VertexLayout::resolve(element)?;
            debug!(
                count = layout.count,
                rest_len = layout.rest_len,
                record_size = layout.record_size,
                "parsing ply vertex element"
            );

            return match little_endian {
                Some(little_endian) => read_binary_body(reader, &layout, little_endian),
                None => read_ascii_body(reader, &layout),
            };
        }

        skip_element(reader, element, little_endian.is_none())?;
    }

    Err(TilingError::malformed("ply has no vertex element"))
}

pub fn parse_ply_file(path: &Path) -> TilingResult<SplatSet> {
    let file = File::open(path).map_err(|err| TilingError::file(path, err))?;
    let mut reader = BufReader::new(file);

    parse_ply(&mut reader).map_err(|err| match err {
        TilingError::MalformedInput(message) => {
            TilingError::MalformedInput(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}


fn read_binary_body<R: Read>(
    reader: &mut R,
    layout: &VertexLayout,
    little_endian: bool,
) -> TilingResult<SplatSet> {
    let mut parts = SplatParts::with_capacity(
        layout.count.min(PREALLOCATED_VERTICES),
        layout.sh_degree(),
        layout.rest_len,
    );
    let mut record = vec![0u8; layout.record_size];
    let mut rest = vec![0.0f32; layout.rest_len];

    for index in 0..layout.count {
        reader.read_exact(&mut record).map_err(|err| truncated(err, index, layout.count))?;

        let mut raw = RawSplat::default();
        for slot in &layout.slots {
            let value = slot.scalar.read(&record[slot.byte_offset..], little_endian);
            raw.assign(slot.field, value, &mut rest, layout.rest_len);
        }

        parts.push(raw.activate());
        if let Some(sh_rest) = parts.sh_rest.as_mut() {
            sh_rest.extend_from_slice(&rest);
        }
    }

    SplatSet::from_parts(parts)
}

fn read_ascii_body<R: BufRead>(reader: &mut R, layout: &VertexLayout) -> TilingResult<SplatSet> {
    let mut parts = SplatParts::with_capacity(
        layout.count.min(PREALLOCATED_VERTICES),
        layout.sh_degree(),
        layout.rest_len,
    );
    let mut line = String::new();
    let mut tokens: Vec<f32> = Vec::with_capacity(layout.token_count);
    let mut rest = vec![0.0f32; layout.rest_len];

    for index in 0..layout.count {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(TilingError::malformed(format!(
                "ply body truncated at vertex {index} of {}",
                layout.count,
            )));
        }

        tokens.clear();
        for token in line.split_whitespace() {
            let value = token.parse::<f32>().map_err(|_| {
                TilingError::malformed(format!("invalid number `{token}` at vertex {index}"))
            })?;
            tokens.push(value);
        }
        if tokens.len() < layout.token_count {
            return Err(TilingError::malformed(format!(
                "vertex {index} has {} values, expected {}",
                tokens.len(),
                layout.token_count,
            )));
        }

        let mut raw = RawSplat::default();
        for slot in &layout.slots {
            raw.assign(slot.field, tokens[slot.token], &mut rest, layout.rest_len);
        }

        parts.push(raw.activate());
        if let Some(sh_rest) = parts.sh_rest.as_mut() {
            sh_rest.extend_from_slice(&rest);
        }
    }

    SplatSet::from_parts(parts)
}

fn skip_element<R: BufRead>(reader: &mut R, element: &ElementDef, ascii: bool) -> TilingResult<()> {
    if ascii {
        let mut line = String::new();
        for _ in 0..element.count {
            line.clear();
            reader.read_line(&mut line)?;
        }
        return Ok(());
    }

    let mut record_size = 0;
    for (name, property) in &element.properties {
        match &property.data_type {
            PropertyType::Scalar(scalar) => record_size += Scalar::from_ply(scalar).size(),
            PropertyType::List(..) => {
                return Err(TilingError::malformed(format!(
                    "cannot skip element `{}` with list property `{name}` before the vertex element",
                    element.name,
                )));
            }
        }
    }

    let skip = record_size
        .checked_mul(element.count)
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| {
            TilingError::malformed(format!(
                "element `{}` declares {} records, more than a ply body can hold",
                element.name, element.count,
            ))
        })?;
    let copied = std::io::copy(&mut reader.by_ref().take(skip), &mut std::io::sink())?;
    if copied != skip {
        return Err(TilingError::malformed(format!(
            "ply body truncated inside element `{}`",
            element.name,
        )));
    }

    Ok(())
}

fn truncated(err: std::io::Error, index: usize, count: usize) -> TilingError {
    if err.kind() == ErrorKind::UnexpectedEof {
        TilingError::malformed(format!("ply body truncated at vertex {index} of {count}"))
    } else {
        TilingError::Io(err)
    }
}


/// Writes a binary little-endian 3dgs ply, inverting the load-time activations.
pub fn write_ply<W: Write>(set: &SplatSet, writer: &mut W) -> TilingResult<()> {
    let rest_len = set.sh_rest_len();

    let mut header = String::new();
    header.push_str("ply\nformat binary_little_endian 1.0\n");
    header.push_str(&format!("element vertex {}\n", set.len()));
    for name in ["x", "y", "z", "f_dc_0", "f_dc_1", "f_dc_2"] {
        header.push_str(&format!("property float {name}\n"));
    }
    for i in 0..rest_len {
        header.push_str(&format!("property float f_rest_{i}\n"));
    }
    for name in ["opacity", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3"] {
        header.push_str(&format!("property float {name}\n"));
    }
    header.push_str("end_header\n");
    writer.write_all(header.as_bytes())?;

    let mut record: Vec<f32> = Vec::with_capacity(14 + rest_len);
    for (index, splat) in set.iter().enumerate() {
        record.clear();
        record.extend_from_slice(&splat.position);
        record.extend_from_slice(&splat.color);

        let rest = set.sh_rest_of(index);
        record.extend((0..rest_len).map(|planar| rest[planar_to_interleaved_index(planar, rest_len)]));

        record.push(inverse_sigmoid(splat.opacity));
        record.extend(splat.scale.iter().map(|s| s.max(1e-12).ln()));

        let [x, y, z, w] = splat.rotation;
        record.extend_from_slice(&[w, x, y, z]);

        for value in &record {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    writer.flush()?;
    Ok(())
}

pub fn write_ply_file(set: &SplatSet, path: &Path) -> TilingResult<()> {
    let file = File::create(path).map_err(|err| TilingError::file(path, err))?;
    let mut writer = BufWriter::new(file);

    write_ply(set, &mut writer)
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::gaussian::{rand::random_splats, splat_set::QUATERNION_NORM_TOLERANCE};

    const ASCII_PLY: &str = "ply
format ascii 1.0
comment exported for tests
element vertex 2
property float x
property float y
property float z
property float nx
property float f_dc_0
property float f_dc_1
property float f_dc_2
property float opacity
property float scale_0
property float scale_1
property float scale_2
property float rot_0
property float rot_1
property float rot_2
property float rot_3
end_header
0 1 2 0 0.1 0.2 0.3 0 -1 -1 -1 2 0 0 0
3 4 5 0 0.4 0.5 0.6 10 0 0 0 0 0 0 3
";

    #[test]
    fn parses_ascii_body_and_ignores_unknown_properties() {
        let set = parse_ply(&mut Cursor::new(ASCII_PLY.as_bytes())).unwrap();

        assert_eq!(set.count(), 2);
        assert_eq!(set.sh_degree(), 0);
        assert!(set.sh_rest().is_none());
        assert_eq!(set.positions()[1], [3.0, 4.0, 5.0]);
        assert_eq!(set.colors()[0], [0.1, 0.2, 0.3]);
        assert!((set.opacities()[0] - 0.5).abs() < 1e-6);
        assert!((set.scales()[0][0] - (-1.0f32).exp()).abs() < 1e-6);
        assert_eq!(set.rotations()[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(set.rotations()[1], [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn missing_required_property_is_named() {
        let ply = ASCII_PLY.replace("property float scale_2\n", "");
        let err = parse_ply(&mut Cursor::new(ply.as_bytes())).unwrap_err();

        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("scale_2")));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let ply = ASCII_PLY.replace("element vertex 2", "element vertex 3");
        let err = parse_ply(&mut Cursor::new(ply.as_bytes())).unwrap_err();

        assert!(matches!(err, TilingError::MalformedInput(_)));
    }

    #[test]
    fn binary_write_then_parse_preserves_shape() {
        let set = random_splats(64, 2, 7);

        let mut bytes = Vec::new();
        write_ply(&set, &mut bytes).unwrap();
        let parsed = parse_ply(&mut Cursor::new(bytes)).unwrap();

        assert_eq!(parsed.count(), set.count());
        assert_eq!(parsed.sh_degree(), 2);
        assert_eq!(parsed.sh_rest_len(), 24);
        assert_eq!(parsed.sh_rest_of(5), set.sh_rest_of(5));
        assert_eq!(parsed.positions(), set.positions());
        assert!(parsed.max_rotation_norm_error() < QUATERNION_NORM_TOLERANCE);

        for (a, b) in parsed.opacities().iter().zip(set.opacities()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn big_endian_bodies_are_decoded() {
        let mut ply = Vec::new();
        ply.extend_from_slice(b"ply\nformat binary_big_endian 1.0\nelement vertex 1\n");
        for name in REQUIRED_PROPERTIES {
            ply.extend_from_slice(format!("property float {name}\n").as_bytes());
        }
        ply.extend_from_slice(b"end_header\n");

        let values: [f32; 14] = [1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        for value in values {
            ply.extend_from_slice(&value.to_be_bytes());
        }

        let set = parse_ply(&mut Cursor::new(ply)).unwrap();
        assert_eq!(set.positions()[0], [1.0, 2.0, 3.0]);
        assert_eq!(set.scales()[0], [1.0, 1.0, 1.0]);
    }

    fn binary_header(elements_before_vertex: &str, vertex_count: &str) -> Vec<u8> {
        let mut header = String::from("ply\nformat binary_little_endian 1.0\n");
        header.push_str(elements_before_vertex);
        header.push_str(&format!("element vertex {vertex_count}\n"));
        for name in REQUIRED_PROPERTIES {
            header.push_str(&format!("property float {name}\n"));
        }
        header.push_str("end_header\n");
        header.into_bytes()
    }

    fn push_vertex(body: &mut Vec<u8>, position: [f32; 3]) {
        let [x, y, z] = position;
        let values: [f32; 14] = [x, y, z, 0.1, 0.2, 0.3, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        for value in values {
            body.extend_from_slice(&value.to_le_bytes());
        }
    }

    #[test]
    fn ascii_elements_before_vertices_are_skipped() {
        let ply = ASCII_PLY.replace(
            "element vertex 2\n",
            "element camera 2\nproperty float fx\nproperty list uchar int ids\nelement vertex 2\n",
        );
        let ply = ply.replace("end_header\n", "end_header\n500 2 7 8\n600 1 9\n");
        let set = parse_ply(&mut Cursor::new(ply.as_bytes())).unwrap();

        assert_eq!(set.count(), 2);
        assert_eq!(set.positions()[0], [0.0, 1.0, 2.0]);
        assert_eq!(set.positions()[1], [3.0, 4.0, 5.0]);
    }

    #[test]
    fn binary_elements_before_vertices_are_skipped() {
        let mut ply = binary_header(
            "element camera 2\nproperty float fx\nproperty uchar flag\n",
            "1",
        );
        for fx in [500.0f32, 600.0] {
            ply.extend_from_slice(&fx.to_le_bytes());
            ply.push(0xFF);
        }
        push_vertex(&mut ply, [7.0, 8.0, 9.0]);

        let set = parse_ply(&mut Cursor::new(ply)).unwrap();
        assert_eq!(set.count(), 1);
        assert_eq!(set.positions()[0], [7.0, 8.0, 9.0]);
    }

    #[test]
    fn binary_list_property_before_vertices_is_rejected() {
        let mut ply = binary_header("element face 1\nproperty list uchar int vertex_indices\n", "1");
        ply.push(3);
        for index in [0i32, 1, 2] {
            ply.extend_from_slice(&index.to_le_bytes());
        }
        push_vertex(&mut ply, [0.0; 3]);

        let err = parse_ply(&mut Cursor::new(ply)).unwrap_err();
        assert!(
            matches!(err, TilingError::MalformedInput(msg) if msg.contains("list property `vertex_indices`"))
        );
    }

    #[test]
    fn huge_declared_vertex_count_is_malformed() {
        let mut ply = binary_header("", &usize::MAX.to_string());
        push_vertex(&mut ply, [1.0, 2.0, 3.0]);

        let err = parse_ply(&mut Cursor::new(ply)).unwrap_err();
        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("truncated at vertex 1")));
    }

    #[test]
    fn huge_skipped_element_is_malformed() {
        let header = format!("element camera {}\nproperty float fx\n", usize::MAX);
        let mut ply = binary_header(&header, "1");
        push_vertex(&mut ply, [0.0; 3]);

        let err = parse_ply(&mut Cursor::new(ply)).unwrap_err();
        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("camera")));
    }

    #[test]
    fn incomplete_sh_bands_are_rejected() {
        let ply = ASCII_PLY.replace(
            "property float opacity\n",
            "property float f_rest_0\nproperty float opacity\n",
        );
        let err = parse_ply(&mut Cursor::new(ply.as_bytes())).unwrap_err();

        assert!(matches!(err, TilingError::MalformedInput(msg) if msg.contains("f_rest")));
    }
}
