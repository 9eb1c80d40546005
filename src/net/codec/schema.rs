//! Record schema declarations
//!
//! A record type describes its fields once (name, semantic kind, attributes)
//! through [`WireRecord::describe`]. The [`wire_record!`](crate::wire_record)
//! and [`wire_enum!`](crate::wire_enum) macros derive that description from
//! the field types plus optional `#[wire(...)]` attributes.

use std::any::TypeId;
use std::fmt;

use super::value::WireValue;
use super::DecodeError;
use crate::util::color::Color;
use crate::util::identifier::Identifier;
use crate::util::vec2::Vec2;

/// Semantic type of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Bool,
    U8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Str,
    Identifier,
    Vec2,
    Color,
    Enum(EnumInfo),
    Record(RecordRef),
    Array(Box<FieldKind>),
    Optional(Box<FieldKind>),
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::U8 => "u8",
            FieldKind::U16 => "u16",
            FieldKind::I16 => "i16",
            FieldKind::U32 => "u32",
            FieldKind::I32 => "i32",
            FieldKind::U64 => "u64",
            FieldKind::I64 => "i64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Str => "string",
            FieldKind::Identifier => "identifier",
            FieldKind::Vec2 => "vec2",
            FieldKind::Color => "color",
            FieldKind::Enum(info) => info.name,
            FieldKind::Record(record) => record.name,
            FieldKind::Array(_) => "array",
            FieldKind::Optional(_) => "optional",
        }
    }
}

/// Declared value set of a C-like enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumInfo {
    pub name: &'static str,
    pub values: &'static [i64],
}

/// Handle to a nested record type, resolved through the plan cache
#[derive(Clone, Copy)]
pub struct RecordRef {
    pub name: &'static str,
    pub type_id: TypeId,
    pub describe: fn() -> RecordSchema,
}

impl RecordRef {
    pub fn of<T: WireRecord>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            describe: T::describe,
        }
    }
}

impl PartialEq for RecordRef {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordRef").field(&self.name).finish()
    }
}

/// Per-field wire annotations
///
/// `min`/`max` bound numbers (and switch them to range compression),
/// `bits` sets the bit budget of a ranged number, `array_max` bounds array
/// lengths and `alpha` includes the alpha channel of a color.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldAttrs {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub bits: Option<u32>,
    pub array_max: Option<u32>,
    pub alpha: bool,
}

impl FieldAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, value: impl Into<f64>) -> Self {
        self.min = Some(value.into());
        self
    }

    pub fn max(mut self, value: impl Into<f64>) -> Self {
        self.max = Some(value.into());
        self
    }

    pub fn bits(mut self, bits: u32) -> Self {
        self.bits = Some(bits);
        self
    }

    pub fn array_max(mut self, len: u32) -> Self {
        self.array_max = Some(len);
        self
    }

    pub fn alpha(mut self, alpha: bool) -> Self {
        self.alpha = alpha;
        self
    }

    /// True when any numeric annotation is present
    pub fn has_numeric(&self) -> bool {
        self.min.is_some() || self.max.is_some() || self.bits.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub attrs: FieldAttrs,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind, attrs: FieldAttrs) -> Self {
        Self { name, kind, attrs }
    }
}

/// Ordered field list of one record type
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { name, fields }
    }
}

/// A type that can appear as a field of a wire record
pub trait WireType: Sized {
    fn kind() -> FieldKind;
    fn to_value(&self) -> WireValue;
    fn from_value(value: WireValue) -> Result<Self, DecodeError>;
}

/// A structured record with a fixed field order
pub trait WireRecord: Sized + 'static {
    fn describe() -> RecordSchema;
    fn to_fields(&self) -> Vec<WireValue>;
    fn from_fields(fields: Vec<WireValue>) -> Result<Self, DecodeError>;
}

fn unexpected(expected: &'static str, found: &WireValue) -> DecodeError {
    DecodeError::UnexpectedValue {
        expected,
        found: found.kind_name(),
    }
}

macro_rules! wire_int {
    ($ty:ty, $kind:ident, $variant:ident) => {
        impl WireType for $ty {
            fn kind() -> FieldKind {
                FieldKind::$kind
            }

            fn to_value(&self) -> WireValue {
                WireValue::$variant(*self as _)
            }

            fn from_value(value: WireValue) -> Result<Self, DecodeError> {
                let wide: i128 = match value {
                    WireValue::Int(v) => v as i128,
                    WireValue::UInt(v) => v as i128,
                    other => return Err(unexpected("integer", &other)),
                };
                <$ty>::try_from(wide).map_err(|_| DecodeError::IntegerOverflow {
                    ty: stringify!($ty),
                    value: wide,
                })
            }
        }
    };
}

wire_int!(u8, U8, UInt);
wire_int!(u16, U16, UInt);
wire_int!(u32, U32, UInt);
wire_int!(u64, U64, UInt);
wire_int!(i16, I16, Int);
wire_int!(i32, I32, Int);
wire_int!(i64, I64, Int);

impl WireType for bool {
    fn kind() -> FieldKind {
        FieldKind::Bool
    }

    fn to_value(&self) -> WireValue {
        WireValue::Bool(*self)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Bool(b) => Ok(b),
            other => Err(unexpected("bool", &other)),
        }
    }
}

impl WireType for f32 {
    fn kind() -> FieldKind {
        FieldKind::F32
    }

    fn to_value(&self) -> WireValue {
        WireValue::F32(*self)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::F32(f) => Ok(f),
            other => Err(unexpected("f32", &other)),
        }
    }
}

impl WireType for f64 {
    fn kind() -> FieldKind {
        FieldKind::F64
    }

    fn to_value(&self) -> WireValue {
        WireValue::F64(*self)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::F64(f) => Ok(f),
            other => Err(unexpected("f64", &other)),
        }
    }
}

impl WireType for String {
    fn kind() -> FieldKind {
        FieldKind::Str
    }

    fn to_value(&self) -> WireValue {
        WireValue::Str(self.clone())
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Str(s) => Ok(s),
            other => Err(unexpected("string", &other)),
        }
    }
}

impl WireType for Identifier {
    fn kind() -> FieldKind {
        FieldKind::Identifier
    }

    fn to_value(&self) -> WireValue {
        WireValue::Str(self.as_str().to_owned())
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Str(s) => Ok(Identifier::from(s)),
            other => Err(unexpected("identifier", &other)),
        }
    }
}

impl WireType for Vec2 {
    fn kind() -> FieldKind {
        FieldKind::Vec2
    }

    fn to_value(&self) -> WireValue {
        WireValue::Vec2(*self)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Vec2(v) => Ok(v),
            other => Err(unexpected("vec2", &other)),
        }
    }
}

impl WireType for Color {
    fn kind() -> FieldKind {
        FieldKind::Color
    }

    fn to_value(&self) -> WireValue {
        WireValue::Color(*self)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Color(c) => Ok(c),
            other => Err(unexpected("color", &other)),
        }
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn kind() -> FieldKind {
        FieldKind::Array(Box::new(T::kind()))
    }

    fn to_value(&self) -> WireValue {
        WireValue::Array(self.iter().map(WireType::to_value).collect())
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(unexpected("array", &other)),
        }
    }
}

impl<T: WireType> WireType for Option<T> {
    fn kind() -> FieldKind {
        FieldKind::Optional(Box::new(T::kind()))
    }

    fn to_value(&self) -> WireValue {
        WireValue::Optional(self.as_ref().map(|v| Box::new(v.to_value())))
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        match value {
            WireValue::Optional(None) => Ok(None),
            WireValue::Optional(Some(inner)) => T::from_value(*inner).map(Some),
            other => Err(unexpected("optional", &other)),
        }
    }
}

/// Declare a struct together with its wire schema.
///
/// ```
/// use abyss_replication::wire_record;
///
/// wire_record! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct NetPurchasedItem {
///         pub identifier: String,
///         #[wire(array_max = 16)]
///         pub tags: Vec<String>,
///         #[wire(min = 0, max = 8)]
///         pub amount: i32,
///     }
/// }
///
/// let item = NetPurchasedItem { identifier: "wrench".into(), tags: vec![], amount: 3 };
/// let bytes = abyss_replication::net::codec::encode(&item).unwrap();
/// let back: NetPurchasedItem = abyss_replication::net::codec::decode(&bytes).unwrap();
/// assert_eq!(back, item);
/// ```
#[macro_export]
macro_rules! wire_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[doc = $doc:literal])*
                $(#[wire($($key:ident = $val:expr),* $(,)?)])?
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[doc = $doc])*
                $fvis $field : $ty
            ),*
        }

        impl $crate::net::codec::WireRecord for $name {
            fn describe() -> $crate::net::codec::RecordSchema {
                $crate::net::codec::RecordSchema::new(
                    stringify!($name),
                    vec![$(
                        $crate::net::codec::FieldSpec::new(
                            stringify!($field),
                            <$ty as $crate::net::codec::WireType>::kind(),
                            $crate::net::codec::FieldAttrs::new() $($( .$key($val) )*)?,
                        )
                    ),*],
                )
            }

            fn to_fields(&self) -> Vec<$crate::net::codec::WireValue> {
                vec![$( $crate::net::codec::WireType::to_value(&self.$field) ),*]
            }

            fn from_fields(
                fields: Vec<$crate::net::codec::WireValue>,
            ) -> Result<Self, $crate::net::codec::DecodeError> {
                let mut fields = fields.into_iter();
                Ok(Self {
                    $(
                        $field: $crate::net::codec::WireType::from_value(fields.next().ok_or(
                            $crate::net::codec::DecodeError::MissingField {
                                record: stringify!($name),
                                field: stringify!($field),
                            },
                        )?)?,
                    )*
                })
            }
        }

        impl $crate::net::codec::WireType for $name {
            fn kind() -> $crate::net::codec::FieldKind {
                $crate::net::codec::FieldKind::Record($crate::net::codec::RecordRef::of::<$name>())
            }

            fn to_value(&self) -> $crate::net::codec::WireValue {
                $crate::net::codec::WireValue::Record(
                    <Self as $crate::net::codec::WireRecord>::to_fields(self),
                )
            }

            fn from_value(
                value: $crate::net::codec::WireValue,
            ) -> Result<Self, $crate::net::codec::DecodeError> {
                match value {
                    $crate::net::codec::WireValue::Record(fields) => {
                        <Self as $crate::net::codec::WireRecord>::from_fields(fields)
                    }
                    other => Err($crate::net::codec::DecodeError::UnexpectedValue {
                        expected: "record",
                        found: other.kind_name(),
                    }),
                }
            }
        }
    };
}

/// Declare a C-like enum whose wire form is range-encoded over its
/// declared discriminants.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[doc = $doc:literal])*
                $variant:ident = $value:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[doc = $doc])*
                $variant = $value
            ),+
        }

        impl $name {
            pub const WIRE_VALUES: &'static [i64] = &[$( $value ),+];
        }

        impl $crate::net::codec::WireType for $name {
            fn kind() -> $crate::net::codec::FieldKind {
                $crate::net::codec::FieldKind::Enum($crate::net::codec::EnumInfo {
                    name: stringify!($name),
                    values: Self::WIRE_VALUES,
                })
            }

            fn to_value(&self) -> $crate::net::codec::WireValue {
                match self {
                    $( $name::$variant => $crate::net::codec::WireValue::Enum($value), )+
                }
            }

            fn from_value(
                value: $crate::net::codec::WireValue,
            ) -> Result<Self, $crate::net::codec::DecodeError> {
                match value {
                    $crate::net::codec::WireValue::Enum(tag) => match tag {
                        $( $value => Ok($name::$variant), )+
                        other => Err($crate::net::codec::DecodeError::UnknownEnumTag {
                            field: stringify!($name),
                            tag: other,
                        }),
                    },
                    other => Err($crate::net::codec::DecodeError::UnexpectedValue {
                        expected: "enum",
                        found: other.kind_name(),
                    }),
                }
            }
        }
    };
}
