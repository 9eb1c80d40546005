//! Schema-driven bit-packed record codec
//!
//! Records declare their fields with [`wire_record!`](crate::wire_record);
//! the first use of a record type resolves a [`FieldPlan`] that is cached
//! for the rest of the process. Ranged numbers are packed into just enough
//! bits for their range, so encode clamps and decode rejects out-of-range
//! values.

pub mod plan;
pub mod schema;
pub mod value;

use std::sync::Arc;

use thiserror::Error;

use crate::net::bits::{BitReader, BitWriter, OutOfBits};

pub use plan::{Behavior, FieldPlan, PlanCache, PlannedField};
pub use schema::{
    EnumInfo, FieldAttrs, FieldKind, FieldSpec, RecordRef, RecordSchema, WireRecord, WireType,
};
pub use value::WireValue;

/// Invalid field annotations, raised the first time a record type is used
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("{record}.{field}: min {min} is greater than max {max}")]
    InvertedRange {
        record: &'static str,
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{record}.{field}: range [{min}, {max}] does not fit the field type")]
    RangeExceedsType {
        record: &'static str,
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{record}.{field}: min and max must be given together")]
    IncompleteRange {
        record: &'static str,
        field: &'static str,
    },

    #[error("{record}.{field}: invalid bit budget {bits}")]
    InvalidBitBudget {
        record: &'static str,
        field: &'static str,
        bits: u32,
    },

    #[error("{record}.{field}: numeric attributes on a non-numeric field")]
    NumericAttributeOnNonNumeric {
        record: &'static str,
        field: &'static str,
    },

    #[error("record {record} contains itself")]
    RecursiveRecord { record: &'static str },

    #[error("{record}.{field}: enum {name} declares no values")]
    EmptyEnum {
        record: &'static str,
        field: &'static str,
        name: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{field}: expected {expected}, got {found}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{field}: array of {len} elements exceeds maximum {max}")]
    ArrayTooLong {
        field: &'static str,
        len: usize,
        max: u32,
    },

    #[error("{field}: {value} is not a declared enum value")]
    UnknownEnumValue { field: &'static str, value: i64 },

    #[error("{record}: expected {expected} fields, got {found}")]
    FieldCountMismatch {
        record: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Malformed or truncated input; the message should be discarded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Truncated(#[from] OutOfBits),

    #[error("{field}: raw value {raw} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        raw: u64,
        min: i64,
        max: i64,
    },

    #[error("{field}: unknown enum tag {tag}")]
    UnknownEnumTag { field: &'static str, tag: i64 },

    #[error("{field}: array length {len} exceeds maximum {max}")]
    ArrayTooLong {
        field: &'static str,
        len: u64,
        max: u32,
    },

    #[error("{field}: malformed length prefix")]
    MalformedLength { field: &'static str },

    #[error("{field}: invalid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("expected {expected} value, got {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{value} does not fit in {ty}")]
    IntegerOverflow { ty: &'static str, value: i128 },

    #[error("{record}: missing field {field}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },
}

/// Resolved plan of `T`, built on first call
pub fn describe<T: WireRecord>() -> Result<Arc<FieldPlan>, PlanError> {
    PlanCache::global().get_or_build(&RecordRef::of::<T>())
}

pub fn encode<T: WireRecord>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut writer = BitWriter::new();
    encode_into(value, &mut writer)?;
    Ok(writer.into_bytes())
}

/// Append `value` to an existing message
pub fn encode_into<T: WireRecord>(value: &T, writer: &mut BitWriter) -> Result<(), EncodeError> {
    let plan = describe::<T>()?;
    value::encode_fields(&plan, &value.to_fields(), writer)
}

pub fn decode<T: WireRecord>(bytes: &[u8]) -> Result<T, DecodeError> {
    decode_from(&mut BitReader::new(bytes))
}

pub fn decode_from<T: WireRecord>(reader: &mut BitReader<'_>) -> Result<T, DecodeError> {
    let plan = describe::<T>()?;
    T::from_fields(value::decode_fields(&plan, reader)?)
}
