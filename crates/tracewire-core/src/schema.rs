//! Event schemas
//!
//! An [`EventSchema`] is the ordered set of typed fields describing the
//! records of one stream. Fields come from the instrumentation layout
//! ([`EventSchema::declare_static`]) or from operators during attach
//! ([`EventSchema::add_field`]). Once the stream delivers its first event
//! the schema is frozen.

use crate::field::{Field, FieldKind, Slot};
use crate::record::Record;
use std::collections::HashMap;
use thiserror::Error;

/// Schema errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("field {name} already exists on stream {stream}")]
    DuplicateField { stream: String, name: String },

    #[error("cannot add field {name}: stream {stream} already started emitting")]
    SchemaFrozen { stream: String, name: String },

    #[error("required field {name} not found on stream {stream}")]
    MissingField { stream: String, name: String },

    #[error("field {name} on stream {stream} is {declared}, expected {expected}")]
    KindMismatch {
        stream: String,
        name: String,
        declared: FieldKind,
        expected: FieldKind,
    },

    #[error("invalid layout for field {name}: {reason}")]
    InvalidLayout { name: String, reason: String },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Ordered, typed field set of one event stream
#[derive(Debug)]
pub struct EventSchema {
    stream: String,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
    static_size: usize,
    dynamic_count: usize,
    frozen: bool,
}

impl EventSchema {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            fields: Vec::new(),
            index: HashMap::new(),
            static_size: 0,
            dynamic_count: 0,
            frozen: false,
        }
    }

    /// Stream identity (e.g. "exec", "dns")
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Minimum static payload length covering every static field
    pub fn static_size(&self) -> usize {
        self.static_size
    }

    pub fn get_field(&self, name: &str) -> Option<Field> {
        self.index.get(name).map(|&i| self.fields[i].clone())
    }

    /// Look up an input field an operator cannot work without
    pub fn require_field(&self, name: &str, kind: FieldKind) -> SchemaResult<Field> {
        let field = self
            .get_field(name)
            .ok_or_else(|| SchemaError::MissingField {
                stream: self.stream.clone(),
                name: name.to_string(),
            })?;
        if field.kind() != kind {
            return Err(SchemaError::KindMismatch {
                stream: self.stream.clone(),
                name: name.to_string(),
                declared: field.kind(),
                expected: kind,
            });
        }
        Ok(field)
    }

    fn check_insert(&self, name: &str) -> SchemaResult<()> {
        if self.frozen {
            return Err(SchemaError::SchemaFrozen {
                stream: self.stream.clone(),
                name: name.to_string(),
            });
        }
        if self.index.contains_key(name) {
            return Err(SchemaError::DuplicateField {
                stream: self.stream.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, field: Field) -> Field {
        self.index
            .insert(field.name().to_string(), self.fields.len());
        self.fields.push(field.clone());
        field
    }

    /// Declare a field living at a fixed region of the static payload
    pub fn declare_static(
        &mut self,
        name: &str,
        kind: FieldKind,
        offset: usize,
        size: usize,
    ) -> SchemaResult<Field> {
        self.check_insert(name)?;
        match kind.fixed_width() {
            Some(width) if width != size => {
                return Err(SchemaError::InvalidLayout {
                    name: name.to_string(),
                    reason: format!("{} needs {} bytes, got {}", kind, width, size),
                });
            }
            None if size == 0 => {
                return Err(SchemaError::InvalidLayout {
                    name: name.to_string(),
                    reason: "zero-sized region".to_string(),
                });
            }
            _ => {}
        }

        self.static_size = self.static_size.max(offset + size);
        Ok(self.insert(Field::new(
            name.to_string(),
            kind,
            Slot::Static { offset, size },
        )))
    }

    /// Append a derived field. Only allowed before the first delivery.
    pub fn add_field(&mut self, name: &str, kind: FieldKind) -> SchemaResult<Field> {
        self.check_insert(name)?;
        self.dynamic_count += 1;
        Ok(self.insert(Field::new(
            name.to_string(),
            kind,
            Slot::Dynamic {
                payload: self.dynamic_count,
            },
        )))
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Wrap a raw static payload into a record with room for every
    /// dynamic field
    pub fn new_record(&self, static_payload: Vec<u8>) -> Record {
        let mut payloads = Vec::with_capacity(1 + self.dynamic_count);
        payloads.push(static_payload);
        for field in &self.fields {
            if let Slot::Dynamic { .. } = field.slot() {
                payloads.push(vec![0; field.kind().fixed_width().unwrap_or(0)]);
            }
        }
        Record::from_payloads(payloads)
    }
}
