//! Text codec for persisted payloads.
//!
//! Payloads are JSON arrays:
//!
//! ```text
//! [tables, values]                      plain content
//! [tables, values, 1]                   plain changes
//! [[tables, time], [values, time]]      mergeable content
//! [[tables, time], [values, time], 1]   mergeable changes
//! ```
//!
//! JSON has no "undefined", so deletions inside change-sets (and tombstones
//! inside mergeable content) are written as the [`UNDEFINED`] sentinel string.
//! A literal JSON `null` stays a value.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::content::{
    Changes, Content, MergeableCells, MergeableChanges, MergeableContent, MergeableRows,
    MergeableTables, Persisted, RowChanges, Stamped, StoreChanges, StoreContent, TableChanges,
    Tables, TablesChanges,
};
use crate::CodecError;

/// Sentinel standing in for an absent value (U+FFFC OBJECT REPLACEMENT CHARACTER).
pub const UNDEFINED: &str = "\u{FFFC}";

/// Trailing array element marking a payload as a change-set.
pub const CHANGES_TAG: u64 = 1;

/// A reversible text encoding for [`Persisted`] payloads.
pub trait Codec: Send + Sync {
    /// Encode a payload to text.
    fn encode(&self, payload: &Persisted) -> Result<String, CodecError>;

    /// Decode text back into a payload.
    ///
    /// Fails with [`CodecError::Malformed`] if the text is valid JSON but
    /// not a content-or-changes array.
    fn decode(&self, text: &str) -> Result<Persisted, CodecError>;
}

/// JSON codec with the [`UNDEFINED`] sentinel substitution.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    pub fn new() -> Self {
        Self
    }

    /// Convert a payload into its JSON array form.
    pub fn to_value(payload: &Persisted) -> Value {
        match payload {
            Persisted::Content(StoreContent::Plain(content)) => {
                json!([encode_tables(&content.tables), content.values])
            }
            Persisted::Changes(StoreChanges::Plain(changes)) => json!([
                encode_tables_changes(&changes.tables),
                encode_leaves(&changes.values),
                CHANGES_TAG
            ]),
            Persisted::Content(StoreContent::Mergeable(content)) => json!([
                encode_stamped(&content.tables, encode_mergeable_tables),
                encode_stamped(&content.values, encode_mergeable_cells)
            ]),
            Persisted::Changes(StoreChanges::Mergeable(changes)) => json!([
                encode_stamped(&changes.tables, encode_mergeable_tables),
                encode_stamped(&changes.values, encode_mergeable_cells),
                CHANGES_TAG
            ]),
        }
    }

    /// Interpret a JSON value as a payload.
    pub fn from_value(value: Value) -> Result<Persisted, CodecError> {
        let mut items = match value {
            Value::Array(items) => items,
            other => {
                return Err(CodecError::malformed(format!(
                    "content is not an array: {}",
                    other
                )))
            }
        };

        let is_changes = match items.len() {
            2 => false,
            3 if items[2] == json!(CHANGES_TAG) => true,
            3 => {
                return Err(CodecError::malformed(format!(
                    "unknown payload tag: {}",
                    items[2]
                )))
            }
            n => {
                return Err(CodecError::malformed(format!(
                    "expected 2 or 3 elements, got {}",
                    n
                )))
            }
        };
        items.truncate(2);
        let values = items.pop().unwrap_or(Value::Null);
        let tables = items.pop().unwrap_or(Value::Null);

        if tables.is_array() {
            let tables = decode_stamped(tables, decode_mergeable_tables)?;
            let values = decode_stamped(values, decode_mergeable_cells)?;
            Ok(if is_changes {
                MergeableChanges { tables, values }.into()
            } else {
                MergeableContent { tables, values }.into()
            })
        } else if is_changes {
            Ok(Changes {
                tables: decode_tables_changes(tables)?,
                values: decode_leaves(values)?,
            }
            .into())
        } else {
            Ok(Content {
                tables: decode_tables(tables)?,
                values: decode_present(values)?,
            }
            .into())
        }
    }
}

impl Codec for JsonCodec {
    fn encode(&self, payload: &Persisted) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&Self::to_value(payload))?)
    }

    fn decode(&self, text: &str) -> Result<Persisted, CodecError> {
        Self::from_value(serde_json::from_str(text)?)
    }
}

// ===========================================
// Encoding
// ===========================================

fn encode_map<T>(map: &BTreeMap<String, T>, f: impl Fn(&T) -> Value) -> Value {
    Value::Object(map.iter().map(|(id, item)| (id.clone(), f(item))).collect())
}

fn encode_optional<T>(item: &Option<T>, f: impl Fn(&T) -> Value) -> Value {
    match item {
        Some(item) => f(item),
        None => Value::String(UNDEFINED.to_string()),
    }
}

fn encode_stamped<T>(stamped: &Stamped<T>, f: impl Fn(&T) -> Value) -> Value {
    json!([f(&stamped.value), stamped.time])
}

fn encode_leaf(leaf: &Option<Value>) -> Value {
    encode_optional(leaf, Value::clone)
}

fn encode_leaves(leaves: &BTreeMap<String, Option<Value>>) -> Value {
    encode_map(leaves, encode_leaf)
}

fn encode_tables(tables: &Tables) -> Value {
    encode_map(tables, |table| encode_map(table, |row| json!(row)))
}

fn encode_tables_changes(tables: &TablesChanges) -> Value {
    encode_map(tables, |table| {
        encode_optional(table, |rows: &TableChanges| {
            encode_map(rows, |row| encode_optional(row, encode_leaves))
        })
    })
}

fn encode_mergeable_cells(cells: &MergeableCells) -> Value {
    encode_map(cells, |cell| encode_stamped(cell, encode_leaf))
}

fn encode_mergeable_tables(tables: &MergeableTables) -> Value {
    encode_map(tables, |table| {
        encode_stamped(table, |rows: &MergeableRows| {
            encode_map(rows, |row| encode_stamped(row, encode_mergeable_cells))
        })
    })
}

// ===========================================
// Decoding
// ===========================================

fn is_undefined(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == UNDEFINED)
}

fn decode_object(value: Value) -> Result<Map<String, Value>, CodecError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CodecError::malformed(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

fn decode_map<T>(
    value: Value,
    f: impl Fn(Value) -> Result<T, CodecError>,
) -> Result<BTreeMap<String, T>, CodecError> {
    decode_object(value)?
        .into_iter()
        .map(|(id, item)| Ok((id, f(item)?)))
        .collect()
}

fn decode_optional<T>(
    value: Value,
    f: impl Fn(Value) -> Result<T, CodecError>,
) -> Result<Option<T>, CodecError> {
    if is_undefined(&value) {
        Ok(None)
    } else {
        f(value).map(Some)
    }
}

fn decode_stamped<T>(
    value: Value,
    f: impl Fn(Value) -> Result<T, CodecError>,
) -> Result<Stamped<T>, CodecError> {
    let mut parts = match value {
        // A third element (a content hash) may follow the time; it is not used.
        Value::Array(parts) if parts.len() == 2 || parts.len() == 3 => parts,
        other => {
            return Err(CodecError::malformed(format!(
                "expected a [value, time] pair, got {}",
                other
            )))
        }
    };
    parts.truncate(2);
    let time = match parts.pop() {
        Some(Value::String(time)) => time,
        other => {
            return Err(CodecError::malformed(format!(
                "stamp time is not a string: {:?}",
                other
            )))
        }
    };
    let value = parts.pop().unwrap_or(Value::Null);
    Ok(Stamped::new(f(value)?, time))
}

fn decode_leaf(value: Value) -> Result<Option<Value>, CodecError> {
    decode_optional(value, Ok)
}

fn decode_leaves(value: Value) -> Result<BTreeMap<String, Option<Value>>, CodecError> {
    decode_map(value, decode_leaf)
}

/// Full content cannot hold absent leaves; sentinel entries are dropped.
fn decode_present(value: Value) -> Result<BTreeMap<String, Value>, CodecError> {
    Ok(decode_leaves(value)?
        .into_iter()
        .filter_map(|(id, leaf)| leaf.map(|leaf| (id, leaf)))
        .collect())
}

fn decode_tables(value: Value) -> Result<Tables, CodecError> {
    decode_map(value, |table| decode_map(table, decode_present))
}

fn decode_row_changes(value: Value) -> Result<RowChanges, CodecError> {
    decode_leaves(value)
}

fn decode_tables_changes(value: Value) -> Result<TablesChanges, CodecError> {
    decode_map(value, |table| {
        decode_optional(table, |rows| {
            decode_map(rows, |row| decode_optional(row, decode_row_changes))
        })
    })
}

fn decode_mergeable_cells(value: Value) -> Result<MergeableCells, CodecError> {
    decode_map(value, |cell| decode_stamped(cell, decode_leaf))
}

fn decode_mergeable_tables(value: Value) -> Result<MergeableTables, CodecError> {
    decode_map(value, |table| {
        decode_stamped(table, |rows| {
            decode_map(rows, |row| decode_stamped(row, decode_mergeable_cells))
        })
    })
}
