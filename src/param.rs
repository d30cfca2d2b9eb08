//! The parameter registry: a keyed table of typed, independently-merged
//! slots, each with its own min/max/empty-allowed constraints and its own
//! last-error side-channel.
//!
//! Modeled after `examples/SleepingPills-bushhammer/t51core/src/registry.rs`'s
//! `Registry<K>` ("a keyed table of independently managed entries"), but
//! with `BTreeMap` in place of that file's `IndexMap`/`AnyMap` pairing: our
//! slots are a small closed set of `Value` kinds rather than arbitrary
//! `Any` payloads, and ascending-key iteration is exactly what the metadata
//! JSON needs to be byte-identical across runs.
use std::collections::BTreeMap;
use std::fmt;
use std::mem::discriminant;
use std::sync::Mutex;

use crate::value::{f32_eq, f64_eq, DurationUnit, Value};

/// Inclusive numeric bounds and the empty-allowed flag for one slot.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub empty_allowed: bool,
}

impl Constraints {
    pub fn none() -> Self {
        Constraints::default()
    }

    pub fn range(min: Value, max: Value) -> Self {
        Constraints {
            min: Some(min),
            max: Some(max),
            empty_allowed: false,
        }
    }

    pub fn min(min: Value) -> Self {
        Constraints {
            min: Some(min),
            max: None,
            empty_allowed: false,
        }
    }

    pub fn allow_empty(mut self) -> Self {
        self.empty_allowed = true;
        self
    }
}

/// Errors a `merge` call can fail with. Anything other than
/// `UnknownParameter` also leaves its message on the slot's error
/// side-map for later retrieval via `parameter_errors`.
#[derive(Debug, PartialEq)]
pub enum MergeError {
    UnknownParameter(u64),
    ConstantParameter(u64),
    TypeMismatch { id: u64 },
    OutOfRange { id: u64 },
    EmptyNotAllowed { id: u64 },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MergeError::UnknownParameter(id) => write!(f, "no parameter registered with id {id}"),
            MergeError::ConstantParameter(id) => write!(f, "parameter {id} is constant"),
            MergeError::TypeMismatch { id } => write!(f, "parameter {id}: type mismatch"),
            MergeError::OutOfRange { id } => write!(f, "parameter {id}: value out of range"),
            MergeError::EmptyNotAllowed { id } => {
                write!(f, "parameter {id}: empty value not allowed")
            }
        }
    }
}

impl std::error::Error for MergeError {}

/// One registered parameter: its current value, constraints, and display
/// metadata.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: u64,
    pub name: String,
    pub value: Value,
    pub constraints: Constraints,
    pub constant: bool,
    pub duration_unit: Option<DurationUnit>,
    pub string_interpretations: Option<BTreeMap<i64, String>>,
    pub columns: Option<Vec<crate::table::Column>>,
    error: Option<String>,
}

impl Slot {
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    discriminant(a) == discriminant(b)
}

/// Extract a numeric reading from a value for the purposes of a min/max
/// check. Non-numeric kinds (`Bool`, `Str`, `Timestamp`, `Duration`,
/// `TableBlob`) are unconstrained by range and return `None`; an absent
/// `Opt*` value also returns `None` since there's nothing to range-check.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::I8(v) => Some(*v as f64),
        Value::I16(v) => Some(*v as f64),
        Value::I32(v) => Some(*v as f64),
        Value::I64(v) => Some(*v as f64),
        Value::U8(v) => Some(*v as f64),
        Value::U16(v) => Some(*v as f64),
        Value::U32(v) => Some(*v as f64),
        Value::U64(v) => Some(*v as f64),
        Value::F32(v) => Some(*v as f64),
        Value::F64(v) => Some(*v),
        Value::OptI8(v) => v.map(|x| x as f64),
        Value::OptI16(v) => v.map(|x| x as f64),
        Value::OptI32(v) => v.map(|x| x as f64),
        Value::OptI64(v) => v.map(|x| x as f64),
        Value::OptU8(v) => v.map(|x| x as f64),
        Value::OptU16(v) => v.map(|x| x as f64),
        Value::OptU32(v) => v.map(|x| x as f64),
        Value::OptU64(v) => v.map(|x| x as f64),
        Value::OptF32(v) => v.map(|x| x as f64),
        Value::OptF64(v) => *v,
        Value::Bool(_) | Value::Str(_) | Value::Timestamp(_) | Value::Duration(_) | Value::TableBlob(_) => None,
    }
}

/// True if `value` is the "empty" representation for its kind: `None` for
/// an `Opt*`, the empty string for `Str`, or the all-zero sentinel for
/// `Timestamp`/`Duration`.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Str(s) => s.is_empty(),
        Value::Timestamp(t) => t.is_empty(),
        Value::Duration(d) => d.is_empty(),
        Value::OptI8(v) => v.is_none(),
        Value::OptI16(v) => v.is_none(),
        Value::OptI32(v) => v.is_none(),
        Value::OptI64(v) => v.is_none(),
        Value::OptU8(v) => v.is_none(),
        Value::OptU16(v) => v.is_none(),
        Value::OptU32(v) => v.is_none(),
        Value::OptU64(v) => v.is_none(),
        Value::OptF32(v) => v.is_none(),
        Value::OptF64(v) => v.is_none(),
        _ => false,
    }
}

fn in_range(value: &Value, constraints: &Constraints) -> bool {
    let reading = match numeric(value) {
        Some(n) => n,
        None => return true,
    };
    if reading.is_nan() {
        return false;
    }
    if let Some(min) = constraints.min.as_ref().and_then(numeric) {
        if reading < min {
            return false;
        }
    }
    if let Some(max) = constraints.max.as_ref().and_then(numeric) {
        if reading > max {
            return false;
        }
    }
    true
}

/// Structural equality used to decide whether a merge is a no-op, treating
/// `NaN` as unequal to everything (spec's NaN-handling resolution).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F32(x), Value::F32(y)) => f32_eq(*x, *y),
        (Value::F64(x), Value::F64(y)) => f64_eq(*x, *y),
        (Value::OptF32(Some(x)), Value::OptF32(Some(y))) => f32_eq(*x, *y),
        (Value::OptF64(Some(x)), Value::OptF64(Some(y))) => f64_eq(*x, *y),
        _ => a == b,
    }
}

/// A keyed table of parameter slots, with cached deterministic metadata.
pub struct ParamRegistry {
    slots: BTreeMap<u64, Slot>,
    metadata_cache: Mutex<Option<String>>,
}

impl Default for ParamRegistry {
    fn default() -> Self {
        ParamRegistry {
            slots: BTreeMap::new(),
            metadata_cache: Mutex::new(None),
        }
    }
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate_cache(&self) {
        *self.metadata_cache.lock().unwrap() = None;
    }

    /// Register a mutable parameter slot.
    pub fn register_parameter(
        &mut self,
        id: u64,
        name: impl Into<String>,
        initial: Value,
        constraints: Constraints,
    ) {
        self.slots.insert(
            id,
            Slot {
                id,
                name: name.into(),
                value: initial,
                constraints,
                constant: false,
                duration_unit: None,
                string_interpretations: None,
                columns: None,
                error: None,
            },
        );
        self.invalidate_cache();
    }

    /// Register a constant parameter: its value is fixed at registration
    /// time and every subsequent `merge` against it fails with
    /// `ConstantParameter`.
    pub fn register_const_parameter(&mut self, id: u64, name: impl Into<String>, value: Value) {
        self.slots.insert(
            id,
            Slot {
                id,
                name: name.into(),
                value,
                constraints: Constraints::none(),
                constant: true,
                duration_unit: None,
                string_interpretations: None,
                columns: None,
                error: None,
            },
        );
        self.invalidate_cache();
    }

    /// Attach a duration display unit to an already-registered slot.
    pub fn set_duration_unit(&mut self, id: u64, unit: DurationUnit) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.duration_unit = Some(unit);
            self.invalidate_cache();
        }
    }

    /// Attach enum-style value labels to an already-registered slot.
    pub fn set_string_interpretations(&mut self, id: u64, labels: BTreeMap<i64, String>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.string_interpretations = Some(labels);
            self.invalidate_cache();
        }
    }

    /// Attach a table's column schema to an already-registered
    /// `TableBlob`-typed slot, for the metadata's `columns` field.
    pub fn set_table_columns(&mut self, id: u64, columns: Vec<crate::table::Column>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.columns = Some(columns);
            self.invalidate_cache();
        }
    }

    pub fn get(&self, id: u64) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Apply a single, independent update to one slot.
    ///
    /// Type mismatches, constant violations, constraint violations and
    /// successful commits are each atomic with respect to every other slot:
    /// a merge never partially applies and never touches any slot other
    /// than `id`.
    pub fn merge(&mut self, id: u64, value: Value) -> Result<(), MergeError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(MergeError::UnknownParameter(id))?;

        if slot.constant {
            let msg = MergeError::ConstantParameter(id).to_string();
            slot.error = Some(msg);
            return Err(MergeError::ConstantParameter(id));
        }

        if !same_kind(&slot.value, &value) {
            let msg = MergeError::TypeMismatch { id }.to_string();
            slot.error = Some(msg);
            return Err(MergeError::TypeMismatch { id });
        }

        if values_equal(&slot.value, &value) {
            // idempotent no-op: leave any previously recorded error as-is,
            // nothing about this slot's validity changed.
            return Ok(());
        }

        if is_empty_value(&value) && !slot.constraints.empty_allowed {
            let msg = MergeError::EmptyNotAllowed { id }.to_string();
            slot.value = value;
            slot.error = Some(msg);
            return Err(MergeError::EmptyNotAllowed { id });
        }

        if !in_range(&value, &slot.constraints) {
            let msg = MergeError::OutOfRange { id }.to_string();
            slot.value = value;
            slot.error = Some(msg);
            return Err(MergeError::OutOfRange { id });
        }

        slot.value = value;
        slot.error = None;
        Ok(())
    }

    /// True iff no registered slot currently carries an error.
    pub fn all_parameters_valid(&self) -> bool {
        self.slots.values().all(|s| s.error.is_none())
    }

    /// All `(id, message)` pairs for slots currently in error.
    pub fn parameter_errors(&self) -> Vec<(u64, String)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.error.as_ref().map(|e| (*id, e.clone())))
            .collect()
    }

    /// Set a slot's value directly, bypassing the constant flag and
    /// constraint checks. Used internally for slots the application
    /// itself owns (such as the always-registered "Application state"
    /// slot) rather than ones a remote manager merges into.
    pub fn force_set(&mut self, id: u64, value: Value) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.value = value;
                slot.error = None;
                true
            }
            None => false,
        }
    }

    /// A snapshot of every slot's current value, in ascending key order.
    pub fn snapshot(&self) -> Vec<(u64, Value)> {
        self.slots
            .iter()
            .map(|(id, slot)| (*id, slot.value.clone()))
            .collect()
    }

    /// Deterministic metadata JSON describing every registered slot, split
    /// into a `mutable` and a `const` object keyed by slot id (as a
    /// string), each slot's fields in a fixed order: ascending key order
    /// within each object, cached after first computation and recomputed
    /// only when the schema changes.
    ///
    /// Hand-rolled rather than built with a generic JSON crate like
    /// `serde_json`: the wire contract promises byte-identical output
    /// across runs with the same schema, and a generic serializer's map
    /// key ordering and float formatting are not something this crate
    /// wants to depend on staying stable across its dependency's versions.
    pub fn metadata_json(&self) -> String {
        if let Some(cached) = self.metadata_cache.lock().unwrap().clone() {
            return cached;
        }
        let mut out = String::from("{\"mutable\":{");
        write_slot_group(&mut out, self.slots.values().filter(|s| !s.constant));
        out.push_str("},\"const\":{");
        write_slot_group(&mut out, self.slots.values().filter(|s| s.constant));
        out.push_str("}}");
        *self.metadata_cache.lock().unwrap() = Some(out.clone());
        out
    }
}

fn write_slot_group<'a>(out: &mut String, slots: impl Iterator<Item = &'a Slot>) {
    for (i, slot) in slots.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&slot.id.to_string());
        out.push_str("\":");
        write_slot_json(out, slot);
    }
}

fn write_slot_json(out: &mut String, slot: &Slot) {
    out.push('{');
    json_field(out, "name", &json_escape(&slot.name), true);
    out.push(',');
    json_field(out, "type", type_name(&slot.value), true);
    if let Some(min) = &slot.constraints.min {
        out.push(',');
        json_field(out, "min", &format_number(min), false);
    }
    if let Some(max) = &slot.constraints.max {
        out.push(',');
        json_field(out, "max", &format_number(max), false);
    }
    out.push(',');
    json_field(
        out,
        "canBeEmpty",
        &slot.constraints.empty_allowed.to_string(),
        false,
    );
    if let Some(unit) = slot.duration_unit {
        out.push(',');
        json_field(out, "durationType", unit.as_str(), true);
    }
    if let Some(labels) = &slot.string_interpretations {
        out.push(',');
        out.push_str("\"stringInterpretations\":{");
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            out.push_str(&k.to_string());
            out.push_str("\":\"");
            out.push_str(&json_escape(v));
            out.push('"');
        }
        out.push('}');
    }
    if let Some(columns) = &slot.columns {
        out.push(',');
        out.push_str("\"columns\":[");
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('{');
            json_field(out, "id", &col.id.to_string(), false);
            out.push(',');
            json_field(out, "name", &json_escape(&col.meta.name), true);
            out.push(',');
            json_field(out, "type", tag_name(col.tag), true);
            if let Some(labels) = &col.meta.string_interpretations {
                out.push(',');
                out.push_str("\"stringInterpretations\":{");
                for (j, (k, v)) in labels.iter().enumerate() {
                    if j > 0 {
                        out.push(',');
                    }
                    out.push('"');
                    out.push_str(&k.to_string());
                    out.push_str("\":\"");
                    out.push_str(&json_escape(v));
                    out.push('"');
                }
                out.push('}');
            }
            out.push('}');
        }
        out.push(']');
    }
    out.push('}');
}

fn tag_name(tag: crate::value::TypeTag) -> &'static str {
    use crate::value::TypeTag;
    match tag {
        TypeTag::I8 => "I8",
        TypeTag::I16 => "I16",
        TypeTag::I32 => "I32",
        TypeTag::I64 => "I64",
        TypeTag::U8 => "U8",
        TypeTag::U16 => "U16",
        TypeTag::U32 => "U32",
        TypeTag::U64 => "U64",
        TypeTag::F32 => "F32",
        TypeTag::F64 => "F64",
        TypeTag::Bool => "Bool",
        TypeTag::Str | TypeTag::StrEmpty => "Str",
        TypeTag::Timestamp => "Timestamp",
        TypeTag::Duration => "Duration",
        TypeTag::OptI8 | TypeTag::OptI8Empty => "OptI8",
        TypeTag::OptI16 | TypeTag::OptI16Empty => "OptI16",
        TypeTag::OptI32 | TypeTag::OptI32Empty => "OptI32",
        TypeTag::OptI64 | TypeTag::OptI64Empty => "OptI64",
        TypeTag::OptU8 | TypeTag::OptU8Empty => "OptU8",
        TypeTag::OptU16 | TypeTag::OptU16Empty => "OptU16",
        TypeTag::OptU32 | TypeTag::OptU32Empty => "OptU32",
        TypeTag::OptU64 | TypeTag::OptU64Empty => "OptU64",
        TypeTag::OptF32 | TypeTag::OptF32Empty => "OptF32",
        TypeTag::OptF64 | TypeTag::OptF64Empty => "OptF64",
        TypeTag::TableBlob => "TableBlob",
    }
}

fn json_field(out: &mut String, key: &str, value: &str, quoted: bool) {
    out.push('"');
    out.push_str(key);
    out.push_str("\":");
    if quoted {
        out.push('"');
        out.push_str(value);
        out.push('"');
    } else {
        out.push_str(value);
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::I8(_) => "I8",
        Value::I16(_) => "I16",
        Value::I32(_) => "I32",
        Value::I64(_) => "I64",
        Value::U8(_) => "U8",
        Value::U16(_) => "U16",
        Value::U32(_) => "U32",
        Value::U64(_) => "U64",
        Value::F32(_) => "F32",
        Value::F64(_) => "F64",
        Value::Bool(_) => "Bool",
        Value::Str(_) => "Str",
        Value::Timestamp(_) => "Timestamp",
        Value::Duration(_) => "Duration",
        Value::OptI8(_) => "OptI8",
        Value::OptI16(_) => "OptI16",
        Value::OptI32(_) => "OptI32",
        Value::OptI64(_) => "OptI64",
        Value::OptU8(_) => "OptU8",
        Value::OptU16(_) => "OptU16",
        Value::OptU32(_) => "OptU32",
        Value::OptU64(_) => "OptU64",
        Value::OptF32(_) => "OptF32",
        Value::OptF64(_) => "OptF64",
        Value::TableBlob(_) => "TableBlob",
    }
}

fn format_number(value: &Value) -> String {
    match numeric(value) {
        Some(n) => n.to_string(),
        None => "null".to_string(),
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ParamRegistry {
        let mut r = ParamRegistry::new();
        r.register_parameter(
            1,
            "gain",
            Value::F64(1.0),
            Constraints::range(Value::F64(0.0), Value::F64(10.0)),
        );
        r.register_const_parameter(2, "name", Value::Str("demo".to_string()));
        r.register_parameter(
            3,
            "offset",
            Value::OptI32(None),
            Constraints::none().allow_empty(),
        );
        r
    }

    #[test]
    fn merge_out_of_range_records_error_and_stores_the_new_value() {
        let mut r = registry();
        let result = r.merge(1, Value::F64(100.0));
        assert!(matches!(result, Err(MergeError::OutOfRange { id: 1 })));
        assert_eq!(r.get(1).unwrap().value, Value::F64(100.0));
        assert!(!r.all_parameters_valid());
        assert_eq!(r.parameter_errors().len(), 1);
    }

    #[test]
    fn merge_idempotence() {
        let mut r = registry();
        r.merge(1, Value::F64(5.0)).unwrap();
        r.merge(1, Value::F64(5.0)).unwrap();
        assert_eq!(r.get(1).unwrap().value, Value::F64(5.0));
    }

    #[test]
    fn merge_is_atomic_per_slot() {
        let mut r = registry();
        let before_offset = r.get(3).unwrap().value.clone();
        let _ = r.merge(1, Value::F64(999.0));
        assert_eq!(r.get(3).unwrap().value, before_offset);
    }

    #[test]
    fn constant_parameter_rejects_merge() {
        let mut r = registry();
        let result = r.merge(2, Value::Str("other".to_string()));
        assert!(matches!(result, Err(MergeError::ConstantParameter(2))));
    }

    #[test]
    fn metadata_json_is_stable_across_calls() {
        let r = registry();
        let a = r.metadata_json();
        let b = r.metadata_json();
        assert_eq!(a, b);
        assert!(a.starts_with("{\"mutable\":{"));
        assert!(a.contains("\"1\":{"));
        assert!(a.contains("\"const\":{\"2\":{"));
    }

    #[test]
    fn empty_not_allowed_by_default() {
        let mut r = registry();
        let result = r.merge(1, Value::F64(f64::NAN));
        assert!(result.is_err());
    }

    #[test]
    fn empty_allowed_slot_accepts_none() {
        let mut r = registry();
        r.merge(3, Value::OptI32(Some(5))).unwrap();
        r.merge(3, Value::OptI32(None)).unwrap();
        assert_eq!(r.get(3).unwrap().value, Value::OptI32(None));
    }
}
