//! Field schemas: the data that replaces hand-written per-message codecs.

use super::Fields;
use crate::cursor::{CursorError, Reader, Writer};
use crate::error::EncodeError;
use glam::{DVec3, Quat, Vec3, Vec4};
use uuid::Uuid;

/// Wire type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `u8`.
    U8,
    /// Little-endian `u16`.
    U16,
    /// Little-endian `u32`.
    U32,
    /// Little-endian `u64`.
    U64,
    /// `i8`.
    I8,
    /// Little-endian `i16`.
    I16,
    /// Little-endian `i32`.
    I32,
    /// Little-endian `i64`.
    I64,
    /// `f32`.
    F32,
    /// `f64`.
    F64,
    /// One byte, nonzero is true.
    Bool,
    /// 16 raw bytes.
    Uuid,
    /// Three `f32`s.
    Vec3,
    /// Three `f64`s.
    DVec3,
    /// Four `f32`s.
    Vec4,
    /// Unit quaternion as three `f32`s.
    Quat,
    /// Exactly `n` raw bytes.
    Fixed(usize),
    /// Blob with a 1-byte length.
    Variable1,
    /// Blob with a 2-byte length.
    Variable2,
    /// Text with a 1-byte length.
    String1,
    /// Text with a 2-byte length.
    String2,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// [`FieldKind::U8`].
    U8(u8),
    /// [`FieldKind::U16`].
    U16(u16),
    /// [`FieldKind::U32`].
    U32(u32),
    /// [`FieldKind::U64`].
    U64(u64),
    /// [`FieldKind::I8`].
    I8(i8),
    /// [`FieldKind::I16`].
    I16(i16),
    /// [`FieldKind::I32`].
    I32(i32),
    /// [`FieldKind::I64`].
    I64(i64),
    /// [`FieldKind::F32`].
    F32(f32),
    /// [`FieldKind::F64`].
    F64(f64),
    /// [`FieldKind::Bool`].
    Bool(bool),
    /// [`FieldKind::Uuid`].
    Uuid(Uuid),
    /// [`FieldKind::Vec3`].
    Vec3(Vec3),
    /// [`FieldKind::DVec3`].
    DVec3(DVec3),
    /// [`FieldKind::Vec4`].
    Vec4(Vec4),
    /// [`FieldKind::Quat`].
    Quat(Quat),
    /// [`FieldKind::Fixed`], [`FieldKind::Variable1`] or [`FieldKind::Variable2`].
    Bytes(Vec<u8>),
    /// [`FieldKind::String1`] or [`FieldKind::String2`].
    Text(String),
}

macro_rules! accessor {
    ($($name:ident => $variant:ident : $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("The value if this is `", stringify!($variant), "`.")]
            pub fn $name(&self) -> Option<$ty> {
                match self {
                    Self::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        )*
    };
}

impl FieldValue {
    accessor! {
        as_u8 => U8: u8,
        as_u16 => U16: u16,
        as_u32 => U32: u32,
        as_u64 => U64: u64,
        as_i32 => I32: i32,
        as_f32 => F32: f32,
        as_bool => Bool: bool,
        as_uuid => Uuid: Uuid,
        as_vec3 => Vec3: Vec3,
        as_quat => Quat: Quat,
    }

    /// Raw bytes of a blob field.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text of a string field.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    fn matches(&self, kind: FieldKind) -> bool {
        use FieldKind as K;
        match (self, kind) {
            (Self::U8(_), K::U8)
            | (Self::U16(_), K::U16)
            | (Self::U32(_), K::U32)
            | (Self::U64(_), K::U64)
            | (Self::I8(_), K::I8)
            | (Self::I16(_), K::I16)
            | (Self::I32(_), K::I32)
            | (Self::I64(_), K::I64)
            | (Self::F32(_), K::F32)
            | (Self::F64(_), K::F64)
            | (Self::Bool(_), K::Bool)
            | (Self::Uuid(_), K::Uuid)
            | (Self::Vec3(_), K::Vec3)
            | (Self::DVec3(_), K::DVec3)
            | (Self::Vec4(_), K::Vec4)
            | (Self::Quat(_), K::Quat)
            | (Self::Bytes(_), K::Variable1 | K::Variable2)
            | (Self::Text(_), K::String1 | K::String2) => true,
            (Self::Bytes(b), K::Fixed(n)) => b.len() == n,
            _ => false,
        }
    }
}

/// A named, typed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: &'static str,
    /// Wire type.
    pub kind: FieldKind,
}

/// How many instances of a block a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockArity {
    /// Exactly one.
    Single,
    /// Exactly `n`.
    Multiple(u8),
    /// A 1-byte count precedes the instances.
    Variable,
}

/// A named group of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    /// Block name.
    pub name: &'static str,
    /// Instance count rule.
    pub arity: BlockArity,
    /// Fields in wire order.
    pub fields: &'static [FieldSpec],
}

/// Ordered blocks of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    /// Blocks in wire order.
    pub blocks: &'static [BlockSpec],
}

/// Shorthand for schema tables.
pub(crate) const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// Shorthand for schema tables.
pub(crate) const fn block(
    name: &'static str,
    arity: BlockArity,
    fields: &'static [FieldSpec],
) -> BlockSpec {
    BlockSpec {
        name,
        arity,
        fields,
    }
}

impl Schema {
    /// Decode every block from `reader`.
    pub fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<Vec<Fields>>, CursorError> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for spec in self.blocks {
            let count = match spec.arity {
                BlockArity::Single => 1,
                BlockArity::Multiple(n) => usize::from(n),
                BlockArity::Variable => usize::from(reader.read_u8()?),
            };
            let mut instances = Vec::with_capacity(count);
            for _ in 0..count {
                let fields = spec
                    .fields
                    .iter()
                    .map(|f| read_field(reader, f.kind))
                    .collect::<Result<Fields, _>>()?;
                instances.push(fields);
            }
            blocks.push(instances);
        }
        Ok(blocks)
    }

    /// Encode `blocks`, checking their shape against the schema first.
    pub fn encode(
        &self,
        message: &'static str,
        blocks: &[Vec<Fields>],
        writer: &mut Writer<'_>,
    ) -> Result<(), EncodeError> {
        let mismatch = |detail: String| EncodeError::SchemaMismatch { message, detail };

        if blocks.len() != self.blocks.len() {
            return Err(mismatch(format!(
                "expected {} blocks, got {}",
                self.blocks.len(),
                blocks.len()
            )));
        }

        for (spec, instances) in self.blocks.iter().zip(blocks) {
            match spec.arity {
                BlockArity::Single if instances.len() != 1 => {
                    return Err(mismatch(format!("block {} must appear once", spec.name)));
                }
                BlockArity::Multiple(n) if instances.len() != usize::from(n) => {
                    return Err(mismatch(format!(
                        "block {} must appear {n} times",
                        spec.name
                    )));
                }
                BlockArity::Variable => {
                    let count = u8::try_from(instances.len()).map_err(|_| {
                        mismatch(format!("block {} has more than 255 instances", spec.name))
                    })?;
                    writer.write_u8(count)?;
                }
                _ => {}
            }

            for fields in instances {
                if fields.len() != spec.fields.len() {
                    return Err(mismatch(format!(
                        "block {} expects {} fields, got {}",
                        spec.name,
                        spec.fields.len(),
                        fields.len()
                    )));
                }
                for (field_spec, value) in spec.fields.iter().zip(fields) {
                    if !value.matches(field_spec.kind) {
                        return Err(mismatch(format!(
                            "field {}.{} is not {:?}",
                            spec.name, field_spec.name, field_spec.kind
                        )));
                    }
                    write_field(writer, field_spec.kind, value)?;
                }
            }
        }
        Ok(())
    }

    /// Find a block index and field index by name.
    pub fn locate(&self, block: &str, field: &str) -> Option<(usize, usize)> {
        let b = self.blocks.iter().position(|s| s.name == block)?;
        let f = self.blocks[b].fields.iter().position(|s| s.name == field)?;
        Some((b, f))
    }
}

fn read_field(r: &mut Reader<'_>, kind: FieldKind) -> Result<FieldValue, CursorError> {
    Ok(match kind {
        FieldKind::U8 => FieldValue::U8(r.read_u8()?),
        FieldKind::U16 => FieldValue::U16(r.read_u16()?),
        FieldKind::U32 => FieldValue::U32(r.read_u32()?),
        FieldKind::U64 => FieldValue::U64(r.read_u64()?),
        FieldKind::I8 => FieldValue::I8(r.read_i8()?),
        FieldKind::I16 => FieldValue::I16(r.read_i16()?),
        FieldKind::I32 => FieldValue::I32(r.read_i32()?),
        FieldKind::I64 => FieldValue::I64(r.read_i64()?),
        FieldKind::F32 => FieldValue::F32(r.read_f32()?),
        FieldKind::F64 => FieldValue::F64(r.read_f64()?),
        FieldKind::Bool => FieldValue::Bool(r.read_bool()?),
        FieldKind::Uuid => FieldValue::Uuid(r.read_uuid()?),
        FieldKind::Vec3 => FieldValue::Vec3(r.read_vec3()?),
        FieldKind::DVec3 => FieldValue::DVec3(r.read_dvec3()?),
        FieldKind::Vec4 => FieldValue::Vec4(r.read_vec4()?),
        FieldKind::Quat => FieldValue::Quat(r.read_quat()?),
        FieldKind::Fixed(n) => FieldValue::Bytes(r.take(n)?.to_vec()),
        FieldKind::Variable1 => FieldValue::Bytes(r.read_blob1()?.to_vec()),
        FieldKind::Variable2 => FieldValue::Bytes(r.read_blob2()?.to_vec()),
        FieldKind::String1 => FieldValue::Text(r.read_string1()?),
        FieldKind::String2 => FieldValue::Text(r.read_string2()?),
    })
}

fn write_field(w: &mut Writer<'_>, kind: FieldKind, value: &FieldValue) -> Result<(), CursorError> {
    match (kind, value) {
        (_, FieldValue::U8(v)) => w.write_u8(*v),
        (_, FieldValue::U16(v)) => w.write_u16(*v),
        (_, FieldValue::U32(v)) => w.write_u32(*v),
        (_, FieldValue::U64(v)) => w.write_u64(*v),
        (_, FieldValue::I8(v)) => w.write_i8(*v),
        (_, FieldValue::I16(v)) => w.write_i16(*v),
        (_, FieldValue::I32(v)) => w.write_i32(*v),
        (_, FieldValue::I64(v)) => w.write_i64(*v),
        (_, FieldValue::F32(v)) => w.write_f32(*v),
        (_, FieldValue::F64(v)) => w.write_f64(*v),
        (_, FieldValue::Bool(v)) => w.write_bool(*v),
        (_, FieldValue::Uuid(v)) => w.write_uuid(v),
        (_, FieldValue::Vec3(v)) => w.write_vec3(*v),
        (_, FieldValue::DVec3(v)) => w.write_dvec3(*v),
        (_, FieldValue::Vec4(v)) => w.write_vec4(*v),
        (_, FieldValue::Quat(v)) => w.write_quat(*v),
        (FieldKind::Variable1, FieldValue::Bytes(b)) => w.write_blob1(b),
        (FieldKind::Variable2, FieldValue::Bytes(b)) => w.write_blob2(b),
        (_, FieldValue::Bytes(b)) => w.put(b),
        (FieldKind::String2, FieldValue::Text(t)) => w.write_string2(t),
        (_, FieldValue::Text(t)) => w.write_string1(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: Schema = Schema {
        blocks: &[
            block(
                "Header",
                BlockArity::Single,
                &[field("Id", FieldKind::U32), field("Name", FieldKind::String1)],
            ),
            block("Pair", BlockArity::Multiple(2), &[field("V", FieldKind::U8)]),
            block(
                "Items",
                BlockArity::Variable,
                &[field("Tag", FieldKind::Fixed(2))],
            ),
        ],
    };

    fn sample_blocks() -> Vec<Vec<Fields>> {
        vec![
            vec![vec![FieldValue::U32(7), FieldValue::Text("box".into())]],
            vec![vec![FieldValue::U8(1)], vec![FieldValue::U8(2)]],
            vec![
                vec![FieldValue::Bytes(vec![9, 9])],
                vec![FieldValue::Bytes(vec![8, 8])],
                vec![FieldValue::Bytes(vec![7, 7])],
            ],
        ]
    }

    #[test]
    fn schema_round_trip() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        SAMPLE.encode("Sample", &sample_blocks(), &mut w).unwrap();
        let len = w.position();
        // u32 + (1 + 3 + NUL) + 2 + count + 3 * 2
        assert_eq!(len, 4 + 5 + 2 + 1 + 6);

        let mut r = Reader::new(&buf[..len]);
        assert_eq!(SAMPLE.decode(&mut r).unwrap(), sample_blocks());
        assert!(r.is_empty());
    }

    #[test]
    fn wrong_instance_count_is_rejected() {
        let mut blocks = sample_blocks();
        blocks[1].pop();
        let mut buf = [0u8; 64];
        let err = SAMPLE
            .encode("Sample", &blocks, &mut Writer::new(&mut buf))
            .unwrap_err();
        assert!(matches!(err, EncodeError::SchemaMismatch { .. }));
    }

    #[test]
    fn wrong_field_kind_is_rejected() {
        let mut blocks = sample_blocks();
        blocks[0][0][0] = FieldValue::U16(7);
        let mut buf = [0u8; 64];
        assert!(SAMPLE
            .encode("Sample", &blocks, &mut Writer::new(&mut buf))
            .is_err());
    }

    #[test]
    fn fixed_field_length_must_match() {
        let mut blocks = sample_blocks();
        blocks[2][0][0] = FieldValue::Bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 64];
        assert!(SAMPLE
            .encode("Sample", &blocks, &mut Writer::new(&mut buf))
            .is_err());
    }

    #[test]
    fn truncated_body_underruns() {
        let mut r = Reader::new(&[7, 0, 0]);
        assert!(matches!(
            SAMPLE.decode(&mut r),
            Err(CursorError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn locate_by_name() {
        assert_eq!(SAMPLE.locate("Items", "Tag"), Some((2, 0)));
        assert_eq!(SAMPLE.locate("Header", "Missing"), None);
    }
}
