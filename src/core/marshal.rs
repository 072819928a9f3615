//! # Marshal Codec
//!
//! Encoding and decoding of the self-describing value format carried inside
//! every frame.
//!
//! ## Wire Format
//! ```text
//! [0x7E] [shared count: u32 LE] [value]
//! value := [marker(1)] [body...]
//! ```
//! The low six bits of a marker select the type; the two high flag bits are
//! ignored. Sizes are a single byte, or `0xFF` followed by a u32 LE.
//!
//! ## Guarantees
//! - Decoding is all-or-nothing: a value is either fully built or an error is
//!   returned with the offending byte offset.
//! - Encoding is deterministic. Dictionaries keep insertion order.
//! - Nesting is limited to [`MAX_DEPTH`] levels to bound recursion on hostile input.

use crate::error::DecodeError;
use std::fmt;

/// First byte of every marshal stream
pub const STREAM_HEADER: u8 = 0x7E;

/// Maximum nesting of containers accepted by the decoder
pub const MAX_DEPTH: usize = 64;

const FLAG_MASK: u8 = 0x3F;
const EXTENDED_SIZE: u8 = 0xFF;

mod marker {
    pub const NONE: u8 = 0x01;
    pub const INT64: u8 = 0x03;
    pub const INT32: u8 = 0x04;
    pub const INT16: u8 = 0x05;
    pub const INT8: u8 = 0x06;
    pub const MINUS_ONE: u8 = 0x07;
    pub const ZERO: u8 = 0x08;
    pub const ONE: u8 = 0x09;
    pub const REAL: u8 = 0x0A;
    pub const REAL_ZERO: u8 = 0x0B;
    pub const BUFFER: u8 = 0x0D;
    pub const EMPTY_STRING: u8 = 0x0E;
    pub const CHAR_STRING: u8 = 0x0F;
    pub const STRING: u8 = 0x10;
    pub const TUPLE: u8 = 0x14;
    pub const LIST: u8 = 0x15;
    pub const DICT: u8 = 0x16;
    pub const OBJECT: u8 = 0x17;
    pub const TRUE: u8 = 0x1F;
    pub const FALSE: u8 = 0x20;
    pub const PACKED_OBJECT_1: u8 = 0x22;
    pub const PACKED_OBJECT_2: u8 = 0x23;
    pub const EMPTY_TUPLE: u8 = 0x24;
    pub const ONE_TUPLE: u8 = 0x25;
    pub const EMPTY_LIST: u8 = 0x26;
    pub const ONE_LIST: u8 = 0x27;
    pub const TWO_TUPLE: u8 = 0x2C;
    pub const PACKED_TERMINATOR: u8 = 0x2D;
    pub const UTF8: u8 = 0x2E;
}

/// A decoded marshal value. Containers own their children.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Buffer(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Dict),
    /// Named object wrapping a single argument value
    Object { type_name: String, args: Box<Value> },
    /// Packed object used for exceptions and other new-style instances
    PackedObject1(PackedObject),
    /// Packed object used for plain data wrappers such as password strings
    PackedObject2(PackedObject),
}

/// Body shared by both packed object variants
#[derive(Debug, Clone, PartialEq)]
pub struct PackedObject {
    pub class_path: String,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl PackedObject {
    pub fn new(class_path: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class_path: class_path.into(),
            args,
            kwargs: Dict::new(),
        }
    }
}

/// Insertion-ordered mapping. Encoding walks entries in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert or replace the entry for `key`, keeping its original position.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Append an entry without checking for an existing key.
    pub fn push(&mut self, key: Value, value: Value) {
        self.entries.push((key, value));
    }

    /// Look up a string key. Returns the first match.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Remove and return the first entry stored under a string key.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k.as_str() == Some(key))?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl IntoIterator for Dict {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Short type name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Object { .. } => "object",
            Value::PackedObject1(_) => "packed_object_1",
            Value::PackedObject2(_) => "packed_object_2",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Buffer(b) => write!(f, "<buffer {} bytes>", b.len()),
            Value::Tuple(items) => write!(f, "<tuple {} items>", items.len()),
            Value::List(items) => write!(f, "<list {} items>", items.len()),
            Value::Dict(d) => write!(f, "<dict {} entries>", d.len()),
            Value::Object { type_name, .. } => write!(f, "<object {type_name}>"),
            Value::PackedObject1(o) | Value::PackedObject2(o) => {
                write!(f, "<packed {}>", o.class_path)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::Dict(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::None, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a value as a complete marshal stream (header included).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(STREAM_HEADER);
    out.extend_from_slice(&0u32.to_le_bytes());
    write_value(&mut out, value);
    out
}

fn write_size(out: &mut Vec<u8>, size: usize) {
    if size < EXTENDED_SIZE as usize {
        out.push(size as u8);
    } else {
        debug_assert!(u32::try_from(size).is_ok(), "marshal size exceeds u32");
        out.push(EXTENDED_SIZE);
        out.extend_from_slice(&(size as u32).to_le_bytes());
    }
}

fn write_integer(out: &mut Vec<u8>, i: i64) {
    match i {
        -1 => out.push(marker::MINUS_ONE),
        0 => out.push(marker::ZERO),
        1 => out.push(marker::ONE),
        _ => {
            if let Ok(v) = i8::try_from(i) {
                out.push(marker::INT8);
                out.extend_from_slice(&v.to_le_bytes());
            } else if let Ok(v) = i16::try_from(i) {
                out.push(marker::INT16);
                out.extend_from_slice(&v.to_le_bytes());
            } else if let Ok(v) = i32::try_from(i) {
                out.push(marker::INT32);
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                out.push(marker::INT64);
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        out.push(marker::EMPTY_STRING);
    } else if !s.is_ascii() {
        out.push(marker::UTF8);
        write_size(out, bytes.len());
        out.extend_from_slice(bytes);
    } else if bytes.len() == 1 {
        out.push(marker::CHAR_STRING);
        out.push(bytes[0]);
    } else {
        out.push(marker::STRING);
        write_size(out, bytes.len());
        out.extend_from_slice(bytes);
    }
}

fn write_sequence(out: &mut Vec<u8>, items: &[Value], tuple: bool) {
    match (items.len(), tuple) {
        (0, true) => out.push(marker::EMPTY_TUPLE),
        (1, true) => out.push(marker::ONE_TUPLE),
        (2, true) => out.push(marker::TWO_TUPLE),
        (0, false) => out.push(marker::EMPTY_LIST),
        (1, false) => out.push(marker::ONE_LIST),
        (n, true) => {
            out.push(marker::TUPLE);
            write_size(out, n);
        }
        (n, false) => {
            out.push(marker::LIST);
            write_size(out, n);
        }
    }
    for item in items {
        write_value(out, item);
    }
}

fn write_packed(out: &mut Vec<u8>, tag: u8, object: &PackedObject) {
    out.push(tag);
    write_string(out, &object.class_path);
    write_sequence(out, &object.args, true);
    for (key, value) in object.kwargs.iter() {
        write_value(out, key);
        write_value(out, value);
    }
    out.push(marker::PACKED_TERMINATOR);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::None => out.push(marker::NONE),
        Value::Integer(i) => write_integer(out, *i),
        Value::Real(r) => {
            if r.to_bits() == 0 {
                out.push(marker::REAL_ZERO);
            } else {
                out.push(marker::REAL);
                out.extend_from_slice(&r.to_le_bytes());
            }
        }
        Value::Boolean(true) => out.push(marker::TRUE),
        Value::Boolean(false) => out.push(marker::FALSE),
        Value::String(s) => write_string(out, s),
        Value::Buffer(b) => {
            out.push(marker::BUFFER);
            write_size(out, b.len());
            out.extend_from_slice(b);
        }
        Value::Tuple(items) => write_sequence(out, items, true),
        Value::List(items) => write_sequence(out, items, false),
        Value::Dict(dict) => {
            out.push(marker::DICT);
            write_size(out, dict.len());
            // value precedes key on the wire
            for (key, value) in dict.iter() {
                write_value(out, value);
                write_value(out, key);
            }
        }
        Value::Object { type_name, args } => {
            out.push(marker::OBJECT);
            write_string(out, type_name);
            write_value(out, args);
        }
        Value::PackedObject1(object) => write_packed(out, marker::PACKED_OBJECT_1, object),
        Value::PackedObject2(object) => write_packed(out, marker::PACKED_OBJECT_2, object),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a complete marshal stream holding exactly one value.
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
    let mut reader = Reader { data, pos: 0 };

    let header = reader.u8()?;
    if header != STREAM_HEADER {
        return Err(DecodeError::BadHeader { found: header });
    }
    // shared object count; back references are not supported
    let _shared = reader.u32()?;

    let value = reader.value(0)?;

    if reader.pos != data.len() {
        return Err(DecodeError::TrailingBytes {
            offset: reader.pos,
            count: data.len() - reader.pos,
        });
    }
    Ok(value)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.data.len() - self.pos;
        if remaining < len {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len - remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn size(&mut self) -> Result<usize, DecodeError> {
        match self.u8()? {
            EXTENDED_SIZE => Ok(self.u32()? as usize),
            n => Ok(n as usize),
        }
    }

    /// Read a count of child values, bounded by the bytes left so hostile
    /// counts cannot trigger huge allocations.
    fn count(&mut self) -> Result<usize, DecodeError> {
        let count = self.size()?;
        let remaining = self.data.len() - self.pos;
        if count > remaining {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: count - remaining,
            });
        }
        Ok(count)
    }

    fn utf8(&mut self, len: usize) -> Result<String, DecodeError> {
        let offset = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    fn values(&mut self, count: usize, depth: usize) -> Result<Vec<Value>, DecodeError> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.value(depth)?);
        }
        Ok(items)
    }

    fn string_value(&mut self, depth: usize, expected: &'static str) -> Result<String, DecodeError> {
        match self.value(depth)? {
            Value::String(s) => Ok(s),
            _ => Err(DecodeError::shape(expected)),
        }
    }

    fn packed(&mut self, depth: usize) -> Result<PackedObject, DecodeError> {
        let class_path = self.string_value(depth, "packed object class path string")?;
        let args = match self.value(depth)? {
            Value::Tuple(items) => items,
            _ => return Err(DecodeError::shape("packed object argument tuple")),
        };
        let mut kwargs = Dict::new();
        loop {
            if self.data.get(self.pos) == Some(&marker::PACKED_TERMINATOR) {
                self.pos += 1;
                break;
            }
            let key = self.value(depth)?;
            let value = self.value(depth)?;
            kwargs.push(key, value);
        }
        Ok(PackedObject {
            class_path,
            args,
            kwargs,
        })
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::DepthExceeded {
                offset: self.pos,
                limit: MAX_DEPTH,
            });
        }
        let offset = self.pos;
        let tag = self.u8()? & FLAG_MASK;
        let child = depth + 1;

        let value = match tag {
            marker::NONE => Value::None,
            marker::INT64 => Value::Integer(i64::from_le_bytes(self.array()?)),
            marker::INT32 => Value::Integer(i64::from(i32::from_le_bytes(self.array()?))),
            marker::INT16 => Value::Integer(i64::from(i16::from_le_bytes(self.array()?))),
            marker::INT8 => Value::Integer(i64::from(i8::from_le_bytes(self.array()?))),
            marker::MINUS_ONE => Value::Integer(-1),
            marker::ZERO => Value::Integer(0),
            marker::ONE => Value::Integer(1),
            marker::REAL => Value::Real(f64::from_le_bytes(self.array()?)),
            marker::REAL_ZERO => Value::Real(0.0),
            marker::TRUE => Value::Boolean(true),
            marker::FALSE => Value::Boolean(false),
            marker::BUFFER => {
                let len = self.size()?;
                Value::Buffer(self.take(len)?.to_vec())
            }
            marker::EMPTY_STRING => Value::String(String::new()),
            marker::CHAR_STRING => Value::String(self.utf8(1)?),
            marker::STRING | marker::UTF8 => {
                let len = self.size()?;
                Value::String(self.utf8(len)?)
            }
            marker::EMPTY_TUPLE => Value::Tuple(Vec::new()),
            marker::ONE_TUPLE => Value::Tuple(self.values(1, child)?),
            marker::TWO_TUPLE => Value::Tuple(self.values(2, child)?),
            marker::TUPLE => {
                let count = self.count()?;
                Value::Tuple(self.values(count, child)?)
            }
            marker::EMPTY_LIST => Value::List(Vec::new()),
            marker::ONE_LIST => Value::List(self.values(1, child)?),
            marker::LIST => {
                let count = self.count()?;
                Value::List(self.values(count, child)?)
            }
            marker::DICT => {
                let count = self.count()?;
                let mut dict = Dict::with_capacity(count);
                for _ in 0..count {
                    let value = self.value(child)?;
                    let key = self.value(child)?;
                    dict.push(key, value);
                }
                Value::Dict(dict)
            }
            marker::OBJECT => {
                let type_name = self.string_value(child, "object type name string")?;
                let args = self.value(child)?;
                Value::Object {
                    type_name,
                    args: Box::new(args),
                }
            }
            marker::PACKED_OBJECT_1 => Value::PackedObject1(self.packed(child)?),
            marker::PACKED_OBJECT_2 => Value::PackedObject2(self.packed(child)?),
            _ => return Err(DecodeError::UnknownTag { offset, tag }),
        };
        Ok(value)
    }
}
