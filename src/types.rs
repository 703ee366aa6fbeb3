//! # The D-Bus Type System
//!
//! This module models the sixteen D-Bus types as a dynamic [`Value`] plus
//! the per-type constants the marshaller needs: type codes and alignment.
//! It is a pure component with no I/O; the codec consumes it.
//!
//! Two invariants are enforced at construction time rather than at encode
//! time, so that an invalid value simply cannot exist:
//!
//! - object paths satisfy their grammar ([`ObjectPath::parse`]);
//! - arrays carry the signature of their element type and reject elements
//!   of any other type ([`Array::push`]).

use std::fmt;

use thiserror::Error;

use crate::signature::{Signature, SignatureError};

/// The sixteen type kinds, plus UNIX_FD which rides the wire as a UINT32
/// index and participates in the signature alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array,
    Struct,
    DictEntry,
    Variant,
}

impl TypeCode {
    /// Map a signature character to its type kind. Container openers map to
    /// their container kind; closers return `None`.
    pub fn from_code(c: u8) -> Option<TypeCode> {
        Some(match c {
            b'y' => TypeCode::Byte,
            b'b' => TypeCode::Boolean,
            b'n' => TypeCode::Int16,
            b'q' => TypeCode::Uint16,
            b'i' => TypeCode::Int32,
            b'u' => TypeCode::Uint32,
            b'x' => TypeCode::Int64,
            b't' => TypeCode::Uint64,
            b'd' => TypeCode::Double,
            b's' => TypeCode::String,
            b'o' => TypeCode::ObjectPath,
            b'g' => TypeCode::Signature,
            b'h' => TypeCode::UnixFd,
            b'a' => TypeCode::Array,
            b'(' => TypeCode::Struct,
            b'{' => TypeCode::DictEntry,
            b'v' => TypeCode::Variant,
            _ => return None,
        })
    }

    /// The signature character for this kind.
    pub fn code(self) -> char {
        match self {
            TypeCode::Byte => 'y',
            TypeCode::Boolean => 'b',
            TypeCode::Int16 => 'n',
            TypeCode::Uint16 => 'q',
            TypeCode::Int32 => 'i',
            TypeCode::Uint32 => 'u',
            TypeCode::Int64 => 'x',
            TypeCode::Uint64 => 't',
            TypeCode::Double => 'd',
            TypeCode::String => 's',
            TypeCode::ObjectPath => 'o',
            TypeCode::Signature => 'g',
            TypeCode::UnixFd => 'h',
            TypeCode::Array => 'a',
            TypeCode::Struct => '(',
            TypeCode::DictEntry => '{',
            TypeCode::Variant => 'v',
        }
    }

    /// Marshalling alignment in bytes (1, 2, 4, or 8). Every value is
    /// preceded by padding to this boundary in the stream.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::Uint16 => 2,
            TypeCode::Boolean
            | TypeCode::Int32
            | TypeCode::Uint32
            | TypeCode::UnixFd
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::Uint64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// True for non-container types.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant
        )
    }
}

/// Alignment of the complete type beginning at the first character of `sig`.
pub fn alignment_of(sig: &str) -> usize {
    sig.as_bytes()
        .first()
        .and_then(|&c| TypeCode::from_code(c))
        .map(TypeCode::alignment)
        .unwrap_or(1)
}

/// Ways an object path can violate its grammar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectPathError {
    #[error("object path must not be empty")]
    Empty,
    #[error("object path must begin with '/'")]
    NoLeadingSlash,
    #[error("object path must not contain empty segments")]
    EmptySegment,
    #[error("object path must not end with '/'")]
    TrailingSlash,
    #[error("invalid character {0:?} in object path segment")]
    InvalidCharacter(char),
}

/// A validated object path such as `/org/freedesktop/DBus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// The root path `/`.
    pub fn root() -> Self {
        ObjectPath("/".to_owned())
    }

    /// Validate and wrap a path string.
    pub fn parse(s: &str) -> Result<Self, ObjectPathError> {
        if s.is_empty() {
            return Err(ObjectPathError::Empty);
        }
        if !s.starts_with('/') {
            return Err(ObjectPathError::NoLeadingSlash);
        }
        if s == "/" {
            return Ok(ObjectPath(s.to_owned()));
        }
        if s.ends_with('/') {
            return Err(ObjectPathError::TrailingSlash);
        }
        for segment in s[1..].split('/') {
            if segment.is_empty() {
                return Err(ObjectPathError::EmptySegment);
            }
            for c in segment.chars() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    return Err(ObjectPathError::InvalidCharacter(c));
                }
            }
        }
        Ok(ObjectPath(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dynamically typed D-Bus value.
///
/// The variant set mirrors the wire types one to one. Containers hold
/// further values; [`Array`] additionally remembers its element signature so
/// empty arrays stay typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(u32),
    Array(Array),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The kind of this value.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Byte(_) => TypeCode::Byte,
            Value::Boolean(_) => TypeCode::Boolean,
            Value::Int16(_) => TypeCode::Int16,
            Value::Uint16(_) => TypeCode::Uint16,
            Value::Int32(_) => TypeCode::Int32,
            Value::Uint32(_) => TypeCode::Uint32,
            Value::Int64(_) => TypeCode::Int64,
            Value::Uint64(_) => TypeCode::Uint64,
            Value::Double(_) => TypeCode::Double,
            Value::Str(_) => TypeCode::String,
            Value::ObjectPath(_) => TypeCode::ObjectPath,
            Value::Signature(_) => TypeCode::Signature,
            Value::UnixFd(_) => TypeCode::UnixFd,
            Value::Array(_) => TypeCode::Array,
            Value::Struct(_) => TypeCode::Struct,
            Value::DictEntry(_, _) => TypeCode::DictEntry,
            Value::Variant(_) => TypeCode::Variant,
        }
    }

    /// The single complete type describing this value, e.g. `a{sv}` for a
    /// string-to-variant dictionary. A bare dict entry yields `{kv}`,
    /// which is only meaningful as an array element type.
    pub fn type_signature(&self) -> Signature {
        let mut out = String::new();
        self.write_signature(&mut out);
        Signature::from_trusted(out)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Array(array) => {
                out.push('a');
                out.push_str(array.element_signature().as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            other => out.push(other.type_code().code()),
        }
    }

    /// Marshalling alignment of this value.
    pub fn alignment(&self) -> usize {
        self.type_code().alignment()
    }

    /// Borrow the inner string for string-typed values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the inner u32 for UINT32-typed values.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::ObjectPath(v)
    }
}

/// Errors raised while assembling an [`Array`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArrayError {
    #[error("array element signature must be a single complete type")]
    NotSingleComplete(#[from] NotSingleComplete),
    #[error("element of type {found} pushed into array of {expected}")]
    ElementTypeMismatch { expected: String, found: String },
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Marker error for a signature that is not exactly one complete type.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a single complete type")]
pub struct NotSingleComplete;

/// A homogeneous sequence of values with an explicit element signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element_signature: Signature,
    items: Vec<Value>,
}

impl Array {
    /// An empty array of the given element type.
    pub fn new(element_signature: Signature) -> Result<Self, ArrayError> {
        if !element_signature.is_single_complete() {
            return Err(NotSingleComplete.into());
        }
        Ok(Array {
            element_signature,
            items: Vec::new(),
        })
    }

    /// An empty array with the element type given as text.
    pub fn of_type(element_signature: &str) -> Result<Self, ArrayError> {
        Self::new(Signature::parse_array_element(element_signature)?)
    }

    /// Append an element, rejecting type mismatches.
    pub fn push(&mut self, value: Value) -> Result<(), ArrayError> {
        let found = value.type_signature();
        if found != self.element_signature {
            return Err(ArrayError::ElementTypeMismatch {
                expected: self.element_signature.as_str().to_owned(),
                found: found.as_str().to_owned(),
            });
        }
        self.items.push(value);
        Ok(())
    }

    /// Build an array from a non-empty value list, inferring the element
    /// type from the first value.
    pub fn from_values(values: Vec<Value>) -> Result<Self, ArrayError> {
        let first = values.first().ok_or(NotSingleComplete)?;
        let mut array = Array::new(first.type_signature())?;
        for value in values {
            array.push(value)?;
        }
        Ok(array)
    }

    pub fn element_signature(&self) -> &Signature {
        &self.element_signature
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Compute the signature of a value sequence, e.g. a message body.
pub fn signature_of(values: &[Value]) -> Signature {
    let mut sig = Signature::empty();
    for value in values {
        sig.push(value.type_signature().as_str());
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_table() {
        assert_eq!(TypeCode::Byte.alignment(), 1);
        assert_eq!(TypeCode::Int16.alignment(), 2);
        assert_eq!(TypeCode::Boolean.alignment(), 4);
        assert_eq!(TypeCode::String.alignment(), 4);
        assert_eq!(TypeCode::Array.alignment(), 4);
        assert_eq!(TypeCode::Int64.alignment(), 8);
        assert_eq!(TypeCode::Double.alignment(), 8);
        assert_eq!(TypeCode::Struct.alignment(), 8);
        assert_eq!(TypeCode::DictEntry.alignment(), 8);
        assert_eq!(TypeCode::Signature.alignment(), 1);
        assert_eq!(TypeCode::Variant.alignment(), 1);
    }

    #[test]
    fn object_path_grammar() {
        assert!(ObjectPath::parse("/").is_ok());
        assert!(ObjectPath::parse("/org/freedesktop/DBus").is_ok());
        assert!(ObjectPath::parse("/a_b/c1").is_ok());
        assert_eq!(ObjectPath::parse(""), Err(ObjectPathError::Empty));
        assert_eq!(
            ObjectPath::parse("org/freedesktop"),
            Err(ObjectPathError::NoLeadingSlash)
        );
        assert_eq!(
            ObjectPath::parse("/org//freedesktop"),
            Err(ObjectPathError::EmptySegment)
        );
        assert_eq!(
            ObjectPath::parse("/org/"),
            Err(ObjectPathError::TrailingSlash)
        );
        assert_eq!(
            ObjectPath::parse("/org/free-desktop"),
            Err(ObjectPathError::InvalidCharacter('-'))
        );
    }

    #[test]
    fn value_signatures() {
        assert_eq!(Value::Uint32(7).type_signature().as_str(), "u");
        let strukt = Value::Struct(vec![Value::Int32(1), Value::Str("x".into())]);
        assert_eq!(strukt.type_signature().as_str(), "(is)");
        let variant = Value::Variant(Box::new(Value::Boolean(true)));
        assert_eq!(variant.type_signature().as_str(), "v");

        let mut dict = Array::of_type("{sv}").unwrap();
        dict.push(Value::DictEntry(
            Box::new(Value::Str("key".into())),
            Box::new(Value::Variant(Box::new(Value::Uint32(1)))),
        ))
        .unwrap();
        assert_eq!(Value::Array(dict).type_signature().as_str(), "a{sv}");
    }

    #[test]
    fn empty_arrays_stay_typed() {
        let array = Array::of_type("i").unwrap();
        assert!(array.is_empty());
        assert_eq!(Value::Array(array).type_signature().as_str(), "ai");
    }

    #[test]
    fn array_rejects_mismatched_elements() {
        let mut array = Array::of_type("i").unwrap();
        array.push(Value::Int32(1)).unwrap();
        let err = array.push(Value::Str("nope".into())).unwrap_err();
        assert!(matches!(err, ArrayError::ElementTypeMismatch { .. }));
    }

    #[test]
    fn body_signature_concatenates() {
        let body = vec![
            Value::Str("hi".into()),
            Value::Uint32(4),
            Value::Struct(vec![Value::Byte(1), Value::Byte(2)]),
        ];
        assert_eq!(signature_of(&body).as_str(), "su(yy)");
    }
}
