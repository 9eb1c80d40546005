//! Field plans and the process-wide plan cache

use std::any::TypeId;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::schema::{FieldAttrs, FieldKind, RecordRef, RecordSchema};
use super::PlanError;

/// Default bit budget of a ranged float
pub const DEFAULT_FLOAT_BITS: u32 = 8;
/// Default maximum array length
pub const DEFAULT_ARRAY_MAX: u32 = u16::MAX as u32;

/// Resolved encode/decode strategy of one field
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Bool,
    /// Integer at its natural width
    Fixed { bits: u32, signed: bool },
    RangedInt { min: i64, max: i64, bits: u32 },
    F32,
    F64,
    RangedFloat { min: f32, max: f32, bits: u32 },
    /// Strings and identifiers
    Str,
    Vec2(Box<Behavior>),
    Color { alpha: bool },
    Enum { name: &'static str, values: &'static [i64], min: i64, bits: u32 },
    Array { max_len: u32, len_bits: u32, element: Box<Behavior> },
    Optional(Box<Behavior>),
    Record(Arc<FieldPlan>),
}

impl Behavior {
    pub fn name(&self) -> &'static str {
        match self {
            Behavior::Bool => "bool",
            Behavior::Fixed { .. } | Behavior::RangedInt { .. } => "integer",
            Behavior::F32 | Behavior::RangedFloat { .. } => "f32",
            Behavior::F64 => "f64",
            Behavior::Str => "string",
            Behavior::Vec2(_) => "vec2",
            Behavior::Color { .. } => "color",
            Behavior::Enum { .. } => "enum",
            Behavior::Array { .. } => "array",
            Behavior::Optional(_) => "optional",
            Behavior::Record(_) => "record",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedField {
    pub name: &'static str,
    pub behavior: Behavior,
}

/// Ordered, fully resolved field behaviors of one record type
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPlan {
    pub record: &'static str,
    pub fields: Vec<PlannedField>,
}

impl FieldPlan {
    pub fn build(schema: RecordSchema, cache: &PlanCache) -> Result<Self, PlanError> {
        Self::build_nested(schema, cache, &mut Vec::new())
    }

    /// `building` holds the records whose plans are being built further up
    fn build_nested(
        schema: RecordSchema,
        cache: &PlanCache,
        building: &mut Vec<TypeId>,
    ) -> Result<Self, PlanError> {
        let mut fields = Vec::with_capacity(schema.fields.len());
        for spec in schema.fields {
            let ctx = Ctx {
                record: schema.name,
                field: spec.name,
            };
            fields.push(PlannedField {
                name: spec.name,
                behavior: resolve(&spec.kind, &spec.attrs, ctx, cache, building)?,
            });
        }
        Ok(Self {
            record: schema.name,
            fields,
        })
    }
}

#[derive(Clone, Copy)]
struct Ctx {
    record: &'static str,
    field: &'static str,
}

/// Bits needed to hold every value in `0..=span`
pub fn bits_for_span(span: u64) -> u32 {
    64 - span.leading_zeros()
}

fn resolve(
    kind: &FieldKind,
    attrs: &FieldAttrs,
    ctx: Ctx,
    cache: &PlanCache,
    building: &mut Vec<TypeId>,
) -> Result<Behavior, PlanError> {
    match kind {
        FieldKind::Array(element) => {
            let max_len = attrs.array_max.unwrap_or(DEFAULT_ARRAY_MAX);
            Ok(Behavior::Array {
                max_len,
                len_bits: bits_for_span(max_len as u64),
                element: Box::new(resolve(element, attrs, ctx, cache, building)?),
            })
        }
        FieldKind::Record(record) => {
            reject_numeric(attrs, ctx)?;
            cache.lookup_or_build(record, building).map(Behavior::Record)
        }
        FieldKind::Enum(info) => {
            reject_numeric(attrs, ctx)?;
            let (Some(&min), Some(&max)) = (info.values.iter().min(), info.values.iter().max())
            else {
                return Err(PlanError::EmptyEnum {
                    record: ctx.record,
                    field: ctx.field,
                    name: info.name,
                });
            };
            Ok(Behavior::Enum {
                name: info.name,
                values: info.values,
                min,
                bits: bits_for_span(max.abs_diff(min)),
            })
        }
        FieldKind::Optional(inner) => {
            Ok(Behavior::Optional(Box::new(resolve(inner, attrs, ctx, cache, building)?)))
        }
        FieldKind::Bool => {
            reject_numeric(attrs, ctx)?;
            Ok(Behavior::Bool)
        }
        FieldKind::U8 => int_behavior(attrs, ctx, 8, false, (0, u8::MAX as i64)),
        FieldKind::U16 => int_behavior(attrs, ctx, 16, false, (0, u16::MAX as i64)),
        FieldKind::U32 => int_behavior(attrs, ctx, 32, false, (0, u32::MAX as i64)),
        FieldKind::U64 => int_behavior(attrs, ctx, 64, false, (0, i64::MAX)),
        FieldKind::I16 => int_behavior(attrs, ctx, 16, true, (i16::MIN as i64, i16::MAX as i64)),
        FieldKind::I32 => int_behavior(attrs, ctx, 32, true, (i32::MIN as i64, i32::MAX as i64)),
        FieldKind::I64 => int_behavior(attrs, ctx, 64, true, (i64::MIN, i64::MAX)),
        FieldKind::F32 => float_behavior(attrs, ctx),
        FieldKind::F64 => {
            reject_numeric(attrs, ctx)?;
            Ok(Behavior::F64)
        }
        FieldKind::Str | FieldKind::Identifier => {
            reject_numeric(attrs, ctx)?;
            Ok(Behavior::Str)
        }
        FieldKind::Vec2 => Ok(Behavior::Vec2(Box::new(float_behavior(attrs, ctx)?))),
        FieldKind::Color => {
            reject_numeric(attrs, ctx)?;
            Ok(Behavior::Color { alpha: attrs.alpha })
        }
    }
}

fn reject_numeric(attrs: &FieldAttrs, ctx: Ctx) -> Result<(), PlanError> {
    if attrs.has_numeric() {
        return Err(PlanError::NumericAttributeOnNonNumeric {
            record: ctx.record,
            field: ctx.field,
        });
    }
    Ok(())
}

fn range(attrs: &FieldAttrs, ctx: Ctx) -> Result<Option<(f64, f64)>, PlanError> {
    match (attrs.min, attrs.max) {
        (None, None) => Ok(None),
        (Some(min), Some(max)) if min <= max => Ok(Some((min, max))),
        (Some(min), Some(max)) => Err(PlanError::InvertedRange {
            record: ctx.record,
            field: ctx.field,
            min,
            max,
        }),
        _ => Err(PlanError::IncompleteRange {
            record: ctx.record,
            field: ctx.field,
        }),
    }
}

fn int_behavior(
    attrs: &FieldAttrs,
    ctx: Ctx,
    natural_bits: u32,
    signed: bool,
    (lower, upper): (i64, i64),
) -> Result<Behavior, PlanError> {
    let Some((min, max)) = range(attrs, ctx)? else {
        if let Some(bits) = attrs.bits {
            return Err(PlanError::InvalidBitBudget {
                record: ctx.record,
                field: ctx.field,
                bits,
            });
        }
        return Ok(Behavior::Fixed {
            bits: natural_bits,
            signed,
        });
    };

    if min < lower as f64 || max > upper as f64 || min.ceil() > max.floor() {
        return Err(PlanError::RangeExceedsType {
            record: ctx.record,
            field: ctx.field,
            min,
            max,
        });
    }
    let (min, max) = (min.ceil() as i64, max.floor() as i64);

    let needed = bits_for_span(max.abs_diff(min));
    let bits = match attrs.bits {
        Some(bits) if bits < needed || bits > 64 => {
            return Err(PlanError::InvalidBitBudget {
                record: ctx.record,
                field: ctx.field,
                bits,
            })
        }
        Some(bits) => bits,
        None => needed,
    };
    Ok(Behavior::RangedInt { min, max, bits })
}

fn float_behavior(attrs: &FieldAttrs, ctx: Ctx) -> Result<Behavior, PlanError> {
    let Some((min, max)) = range(attrs, ctx)? else {
        if let Some(bits) = attrs.bits {
            return Err(PlanError::InvalidBitBudget {
                record: ctx.record,
                field: ctx.field,
                bits,
            });
        }
        return Ok(Behavior::F32);
    };

    let bits = attrs.bits.unwrap_or(DEFAULT_FLOAT_BITS);
    if bits == 0 || bits > 32 {
        return Err(PlanError::InvalidBitBudget {
            record: ctx.record,
            field: ctx.field,
            bits,
        });
    }
    Ok(Behavior::RangedFloat {
        min: min as f32,
        max: max as f32,
        bits,
    })
}

type CachedPlan = Result<Arc<FieldPlan>, PlanError>;

/// Process-wide cache of resolved field plans, keyed by record type.
///
/// Plans are built on first use of a record type and live until the process
/// exits; record schemas are static so there is nothing to invalidate.
/// A record that fails to plan keeps its error, so later uses fail the same
/// way without rebuilding. Lookups take the read lock; a miss builds the
/// plan outside any lock and inserts it only if no other thread got there
/// first, so concurrent first uses may build twice but every caller observes
/// the same result.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: RwLock<FxHashMap<TypeId, CachedPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static PlanCache {
        static CACHE: OnceLock<PlanCache> = OnceLock::new();
        CACHE.get_or_init(PlanCache::new)
    }

    pub fn get_or_build(&self, record: &RecordRef) -> Result<Arc<FieldPlan>, PlanError> {
        self.lookup_or_build(record, &mut Vec::new())
    }

    fn lookup_or_build(&self, record: &RecordRef, building: &mut Vec<TypeId>) -> CachedPlan {
        if let Some(cached) = self.plans.read().get(&record.type_id) {
            return cached.clone();
        }
        // A record reached again while its own plan is open nests itself
        if building.contains(&record.type_id) {
            return Err(PlanError::RecursiveRecord {
                record: record.name,
            });
        }

        building.push(record.type_id);
        let built = FieldPlan::build_nested((record.describe)(), self, building).map(Arc::new);
        building.pop();

        let mut plans = self.plans.write();
        plans.entry(record.type_id).or_insert(built).clone()
    }

    /// True when a usable plan for `type_id` is cached
    pub fn contains(&self, type_id: TypeId) -> bool {
        matches!(self.plans.read().get(&type_id), Some(Ok(_)))
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }
}
