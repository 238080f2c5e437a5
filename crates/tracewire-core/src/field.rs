//! Typed field accessors
//!
//! A [`Field`] is a handle to one named slot inside a [`Record`]. Static
//! fields point into the buffer emitted by the instrumentation program,
//! dynamic fields (added by operators) own a separate payload.

use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Field accessor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("field {field} is {declared}, not {requested}")]
    KindMismatch {
        field: String,
        declared: FieldKind,
        requested: FieldKind,
    },

    #[error("record too short for field {field}: need {required} bytes, have {available}")]
    RecordTooShort {
        field: String,
        required: usize,
        available: usize,
    },

    #[error("value of {len} bytes does not fit field {field} ({capacity} bytes)")]
    ValueTooLarge {
        field: String,
        capacity: usize,
        len: usize,
    },
}

pub type FieldResult<T> = Result<T, FieldError>;

/// Declared kind of a field. Immutable once the field exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Bool,
    Uint16,
    Uint32,
    Int32,
    Bytes,
}

impl FieldKind {
    /// Width in bytes for scalar kinds
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            FieldKind::Bool => Some(1),
            FieldKind::Uint16 => Some(2),
            FieldKind::Uint32 | FieldKind::Int32 => Some(4),
            FieldKind::String | FieldKind::Bytes => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Bool => "bool",
            FieldKind::Uint16 => "uint16",
            FieldKind::Uint32 => "uint32",
            FieldKind::Int32 => "int32",
            FieldKind::Bytes => "bytes",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a field lives inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Fixed region of the static payload
    Static { offset: usize, size: usize },
    /// Dedicated payload (index into the record's payload list)
    Dynamic { payload: usize },
}

#[derive(Debug)]
struct FieldInner {
    name: String,
    kind: FieldKind,
    slot: Slot,
}

/// Borrowed, kind-tagged value read from a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    String(String),
    Bool(bool),
    Uint16(u16),
    Uint32(u32),
    Int32(i32),
    Bytes(&'a [u8]),
}

/// Handle to a field of an [`EventSchema`](crate::schema::EventSchema).
///
/// Cloning is cheap; handles stay valid for the lifetime of the schema.
#[derive(Debug, Clone)]
pub struct Field(Arc<FieldInner>);

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Field {}

impl Field {
    pub(crate) fn new(name: String, kind: FieldKind, slot: Slot) -> Self {
        Self(Arc::new(FieldInner { name, kind, slot }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> FieldKind {
        self.0.kind
    }

    pub(crate) fn slot(&self) -> Slot {
        self.0.slot
    }

    /// Whether the field was declared by the instrumentation layout
    pub fn is_static(&self) -> bool {
        matches!(self.0.slot, Slot::Static { .. })
    }

    fn check(&self, requested: FieldKind) -> FieldResult<()> {
        if self.0.kind != requested {
            return Err(FieldError::KindMismatch {
                field: self.0.name.clone(),
                declared: self.0.kind,
                requested,
            });
        }
        Ok(())
    }

    fn too_short(&self, required: usize, available: usize) -> FieldError {
        FieldError::RecordTooShort {
            field: self.0.name.clone(),
            required,
            available,
        }
    }

    fn region<'a>(&self, record: &'a Record) -> FieldResult<&'a [u8]> {
        match self.0.slot {
            Slot::Static { offset, size } => {
                let payload = record.static_payload();
                payload
                    .get(offset..offset + size)
                    .ok_or_else(|| self.too_short(offset + size, payload.len()))
            }
            Slot::Dynamic { payload } => {
                let data = record.payload(payload).ok_or_else(|| self.too_short(1, 0))?;
                if let Some(width) = self.0.kind.fixed_width() {
                    if data.len() < width {
                        return Err(self.too_short(width, data.len()));
                    }
                }
                Ok(data.as_slice())
            }
        }
    }

    fn write_fixed(&self, record: &mut Record, bytes: &[u8]) -> FieldResult<()> {
        match self.0.slot {
            Slot::Static { offset, .. } => {
                let payload = record.static_payload_mut();
                let available = payload.len();
                let target = payload
                    .get_mut(offset..offset + bytes.len())
                    .ok_or_else(|| self.too_short(offset + bytes.len(), available))?;
                target.copy_from_slice(bytes);
            }
            Slot::Dynamic { payload } => {
                let data = record
                    .payload_mut(payload)
                    .ok_or_else(|| self.too_short(bytes.len(), 0))?;
                data.clear();
                data.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn write_variable(&self, record: &mut Record, value: &[u8]) -> FieldResult<()> {
        match self.0.slot {
            Slot::Static { offset, size } => {
                if value.len() > size {
                    return Err(FieldError::ValueTooLarge {
                        field: self.0.name.clone(),
                        capacity: size,
                        len: value.len(),
                    });
                }
                let payload = record.static_payload_mut();
                let available = payload.len();
                let target = payload
                    .get_mut(offset..offset + size)
                    .ok_or_else(|| self.too_short(offset + size, available))?;
                target[..value.len()].copy_from_slice(value);
                target[value.len()..].fill(0);
            }
            Slot::Dynamic { payload } => {
                let data = record
                    .payload_mut(payload)
                    .ok_or_else(|| self.too_short(1, 0))?;
                data.clear();
                data.extend_from_slice(value);
            }
        }
        Ok(())
    }

    fn scalar<const N: usize>(&self, record: &Record, kind: FieldKind) -> FieldResult<[u8; N]> {
        self.check(kind)?;
        let region = self.region(record)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&region[..N]);
        Ok(out)
    }

    pub fn get_bool(&self, record: &Record) -> FieldResult<bool> {
        let [b] = self.scalar::<1>(record, FieldKind::Bool)?;
        Ok(b != 0)
    }

    pub fn put_bool(&self, record: &mut Record, value: bool) -> FieldResult<()> {
        self.check(FieldKind::Bool)?;
        self.write_fixed(record, &[u8::from(value)])
    }

    pub fn get_u16(&self, record: &Record) -> FieldResult<u16> {
        Ok(u16::from_le_bytes(self.scalar(record, FieldKind::Uint16)?))
    }

    pub fn put_u16(&self, record: &mut Record, value: u16) -> FieldResult<()> {
        self.check(FieldKind::Uint16)?;
        self.write_fixed(record, &value.to_le_bytes())
    }

    pub fn get_u32(&self, record: &Record) -> FieldResult<u32> {
        Ok(u32::from_le_bytes(self.scalar(record, FieldKind::Uint32)?))
    }

    pub fn put_u32(&self, record: &mut Record, value: u32) -> FieldResult<()> {
        self.check(FieldKind::Uint32)?;
        self.write_fixed(record, &value.to_le_bytes())
    }

    pub fn get_i32(&self, record: &Record) -> FieldResult<i32> {
        Ok(i32::from_le_bytes(self.scalar(record, FieldKind::Int32)?))
    }

    pub fn put_i32(&self, record: &mut Record, value: i32) -> FieldResult<()> {
        self.check(FieldKind::Int32)?;
        self.write_fixed(record, &value.to_le_bytes())
    }

    /// Read a string. Static strings are NUL-terminated C arrays.
    pub fn get_string(&self, record: &Record) -> FieldResult<String> {
        self.check(FieldKind::String)?;
        let region = self.region(record)?;
        let text = if self.is_static() {
            let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
            &region[..end]
        } else {
            region
        };
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    pub fn put_string(&self, record: &mut Record, value: &str) -> FieldResult<()> {
        self.check(FieldKind::String)?;
        self.write_variable(record, value.as_bytes())
    }

    /// Copy the bytes of a byte-sequence field
    pub fn get_bytes(&self, record: &Record) -> FieldResult<Vec<u8>> {
        self.bytes_ref(record).map(<[u8]>::to_vec)
    }

    /// Borrow the bytes of a byte-sequence field without copying
    pub fn bytes_ref<'a>(&self, record: &'a Record) -> FieldResult<&'a [u8]> {
        self.check(FieldKind::Bytes)?;
        self.region(record)
    }

    pub fn put_bytes(&self, record: &mut Record, value: &[u8]) -> FieldResult<()> {
        self.check(FieldKind::Bytes)?;
        self.write_variable(record, value)
    }

    /// Read the value using the field's own kind
    pub fn value<'a>(&self, record: &'a Record) -> FieldResult<FieldValue<'a>> {
        Ok(match self.0.kind {
            FieldKind::String => FieldValue::String(self.get_string(record)?),
            FieldKind::Bool => FieldValue::Bool(self.get_bool(record)?),
            FieldKind::Uint16 => FieldValue::Uint16(self.get_u16(record)?),
            FieldKind::Uint32 => FieldValue::Uint32(self.get_u32(record)?),
            FieldKind::Int32 => FieldValue::Int32(self.get_i32(record)?),
            FieldKind::Bytes => FieldValue::Bytes(self.bytes_ref(record)?),
        })
    }
}
