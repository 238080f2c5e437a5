//! JSON rendering of records

use serde_json::{Map, Value};
use tracewire_core::field::FieldResult;
use tracewire_core::{EventSchema, FieldValue, Record};

/// Render every field of `record` in schema order
pub fn render(schema: &EventSchema, record: &Record) -> FieldResult<Value> {
    let mut doc = Map::with_capacity(schema.len());
    for field in schema.fields() {
        let value = match field.value(record)? {
            FieldValue::String(s) => Value::String(s),
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Uint16(n) => Value::from(n),
            FieldValue::Uint32(n) => Value::from(n),
            FieldValue::Int32(n) => Value::from(n),
            FieldValue::Bytes(bytes) => bytes_to_json(bytes),
        };
        doc.insert(field.name().to_string(), value);
    }
    Ok(Value::Object(doc))
}

/// Text when the bytes are UTF-8 once trailing NULs are cut, hex otherwise
pub fn bytes_to_json(bytes: &[u8]) -> Value {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &bytes[..end];
    match std::str::from_utf8(trimmed) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(hex::encode(trimmed)),
    }
}
