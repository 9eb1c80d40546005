//! Dynamic field values and their bit-level encoding

use super::plan::{Behavior, FieldPlan};
use super::{DecodeError, EncodeError};
use crate::net::bits::{BitReader, BitWriter};
use crate::util::color::Color;
use crate::util::vec2::Vec2;

/// Field value in transit between a typed record and the bit stream
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Vec2(Vec2),
    Color(Color),
    Enum(i64),
    Array(Vec<WireValue>),
    Optional(Option<Box<WireValue>>),
    Record(Vec<WireValue>),
}

impl WireValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) | WireValue::UInt(_) => "integer",
            WireValue::F32(_) => "f32",
            WireValue::F64(_) => "f64",
            WireValue::Str(_) => "string",
            WireValue::Vec2(_) => "vec2",
            WireValue::Color(_) => "color",
            WireValue::Enum(_) => "enum",
            WireValue::Array(_) => "array",
            WireValue::Optional(_) => "optional",
            WireValue::Record(_) => "record",
        }
    }
}

pub(crate) fn encode_fields(
    plan: &FieldPlan,
    values: &[WireValue],
    writer: &mut BitWriter,
) -> Result<(), EncodeError> {
    if values.len() != plan.fields.len() {
        return Err(EncodeError::FieldCountMismatch {
            record: plan.record,
            expected: plan.fields.len(),
            found: values.len(),
        });
    }
    for (field, value) in plan.fields.iter().zip(values) {
        write_value(&field.behavior, value, writer, field.name)?;
    }
    Ok(())
}

pub(crate) fn decode_fields(
    plan: &FieldPlan,
    reader: &mut BitReader<'_>,
) -> Result<Vec<WireValue>, DecodeError> {
    plan.fields
        .iter()
        .map(|field| read_value(&field.behavior, reader, field.name))
        .collect()
}

fn mismatch(behavior: &Behavior, value: &WireValue, field: &'static str) -> EncodeError {
    EncodeError::TypeMismatch {
        field,
        expected: behavior.name(),
        found: value.kind_name(),
    }
}

/// Linear map of `value` in `[min, max]` onto `[0, 2^bits - 1]`
pub fn quantize(value: f32, min: f32, max: f32, bits: u32) -> u64 {
    let steps = (1u64 << bits) - 1;
    if max <= min || value.is_nan() {
        return 0;
    }
    let t = ((value - min) / (max - min)).clamp(0.0, 1.0) as f64;
    (t * steps as f64).round() as u64
}

pub fn dequantize(raw: u64, min: f32, max: f32, bits: u32) -> f32 {
    let steps = (1u64 << bits) - 1;
    let t = raw.min(steps) as f64 / steps as f64;
    (min as f64 + t * (max as f64 - min as f64)) as f32
}

fn write_value(
    behavior: &Behavior,
    value: &WireValue,
    writer: &mut BitWriter,
    field: &'static str,
) -> Result<(), EncodeError> {
    match (behavior, value) {
        (Behavior::Bool, WireValue::Bool(b)) => writer.write_bit(*b),

        (Behavior::Fixed { bits, .. }, WireValue::Int(v)) => writer.write_bits(*v as u64, *bits),
        (Behavior::Fixed { bits, .. }, WireValue::UInt(v)) => writer.write_bits(*v, *bits),

        (Behavior::RangedInt { min, max, bits }, WireValue::Int(_) | WireValue::UInt(_)) => {
            let wide = match value {
                WireValue::Int(v) => *v as i128,
                WireValue::UInt(v) => *v as i128,
                _ => return Err(mismatch(behavior, value, field)),
            };
            let clamped = wide.clamp(*min as i128, *max as i128);
            writer.write_bits((clamped - *min as i128) as u64, *bits);
        }

        (Behavior::F32, WireValue::F32(f)) => writer.write_bits(f.to_bits() as u64, 32),
        (Behavior::F64, WireValue::F64(f)) => writer.write_bits(f.to_bits(), 64),
        (Behavior::RangedFloat { min, max, bits }, WireValue::F32(f)) => {
            writer.write_bits(quantize(*f, *min, *max, *bits), *bits);
        }

        (Behavior::Str, WireValue::Str(s)) => {
            writer.write_varint(s.len() as u64);
            writer.write_bytes(s.as_bytes());
        }

        (Behavior::Vec2(component), WireValue::Vec2(v)) => {
            write_value(component, &WireValue::F32(v.x), writer, field)?;
            write_value(component, &WireValue::F32(v.y), writer, field)?;
        }

        (Behavior::Color { alpha }, WireValue::Color(c)) => {
            writer.write_u8(c.r);
            writer.write_u8(c.g);
            writer.write_u8(c.b);
            if *alpha {
                writer.write_u8(c.a);
            }
        }

        (Behavior::Enum { values, min, bits, .. }, WireValue::Enum(tag)) => {
            if !values.contains(tag) {
                return Err(EncodeError::UnknownEnumValue { field, value: *tag });
            }
            writer.write_bits(tag.abs_diff(*min), *bits);
        }

        (Behavior::Array { max_len, len_bits, element }, WireValue::Array(items)) => {
            if items.len() > *max_len as usize {
                return Err(EncodeError::ArrayTooLong {
                    field,
                    len: items.len(),
                    max: *max_len,
                });
            }
            writer.write_bits(items.len() as u64, *len_bits);
            for item in items {
                write_value(element, item, writer, field)?;
            }
        }

        (Behavior::Optional(inner), WireValue::Optional(maybe)) => {
            writer.write_bit(maybe.is_some());
            if let Some(inner_value) = maybe {
                write_value(inner, inner_value, writer, field)?;
            }
        }

        (Behavior::Record(plan), WireValue::Record(values)) => {
            encode_fields(plan, values, writer)?;
        }

        _ => return Err(mismatch(behavior, value, field)),
    }
    Ok(())
}

fn read_value(
    behavior: &Behavior,
    reader: &mut BitReader<'_>,
    field: &'static str,
) -> Result<WireValue, DecodeError> {
    let value = match behavior {
        Behavior::Bool => WireValue::Bool(reader.read_bit()?),

        Behavior::Fixed { bits, signed: false } => WireValue::UInt(reader.read_bits(*bits)?),
        Behavior::Fixed { bits, signed: true } => {
            let raw = reader.read_bits(*bits)?;
            let shift = 64 - *bits;
            WireValue::Int(((raw << shift) as i64) >> shift)
        }

        Behavior::RangedInt { min, max, bits } => {
            let raw = reader.read_bits(*bits)?;
            if raw > max.abs_diff(*min) {
                return Err(DecodeError::OutOfRange {
                    field,
                    raw,
                    min: *min,
                    max: *max,
                });
            }
            WireValue::Int((*min as i128 + raw as i128) as i64)
        }

        Behavior::F32 => WireValue::F32(f32::from_bits(reader.read_bits(32)? as u32)),
        Behavior::F64 => WireValue::F64(f64::from_bits(reader.read_bits(64)?)),
        Behavior::RangedFloat { min, max, bits } => {
            let raw = reader.read_bits(*bits)?;
            WireValue::F32(dequantize(raw, *min, *max, *bits))
        }

        Behavior::Str => {
            let len = reader
                .read_varint()?
                .ok_or(DecodeError::MalformedLength { field })?;
            if len > (reader.remaining_bits() / 8) as u64 {
                return Err(DecodeError::MalformedLength { field });
            }
            let bytes = reader.read_bytes(len as usize)?;
            WireValue::Str(String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { field })?)
        }

        Behavior::Vec2(component) => {
            let x = read_f32(component, reader, field)?;
            let y = read_f32(component, reader, field)?;
            WireValue::Vec2(Vec2::new(x, y))
        }

        Behavior::Color { alpha } => {
            let (r, g, b) = (reader.read_u8()?, reader.read_u8()?, reader.read_u8()?);
            let a = if *alpha { reader.read_u8()? } else { u8::MAX };
            WireValue::Color(Color::rgba(r, g, b, a))
        }

        Behavior::Enum { values, min, bits, .. } => {
            let raw = reader.read_bits(*bits)?;
            let tag = (*min as i128 + raw as i128) as i64;
            if !values.contains(&tag) {
                return Err(DecodeError::UnknownEnumTag { field, tag });
            }
            WireValue::Enum(tag)
        }

        Behavior::Array { max_len, len_bits, element } => {
            let len = reader.read_bits(*len_bits)?;
            if len > *max_len as u64 {
                return Err(DecodeError::ArrayTooLong {
                    field,
                    len,
                    max: *max_len,
                });
            }
            // Every element takes at least one bit, except zero-width ones
            let mut items = Vec::with_capacity((len as usize).min(reader.remaining_bits()));
            for _ in 0..len {
                items.push(read_value(element, reader, field)?);
            }
            WireValue::Array(items)
        }

        Behavior::Optional(inner) => {
            if reader.read_bit()? {
                WireValue::Optional(Some(Box::new(read_value(inner, reader, field)?)))
            } else {
                WireValue::Optional(None)
            }
        }

        Behavior::Record(plan) => WireValue::Record(decode_fields(plan, reader)?),
    };
    Ok(value)
}

fn read_f32(
    component: &Behavior,
    reader: &mut BitReader<'_>,
    field: &'static str,
) -> Result<f32, DecodeError> {
    match read_value(component, reader, field)? {
        WireValue::F32(f) => Ok(f),
        other => Err(DecodeError::UnexpectedValue {
            expected: "f32",
            found: other.kind_name(),
        }),
    }
}
