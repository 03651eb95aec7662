//! Marshalling and unmarshalling of the D-Bus type algebra.
//!
//! A [`Value`] is one tagged variant per type code; a parameter list
//! is simply a sequence of values. Containers own their contents, and
//! every value knows its own signature.

use dbus_aio_strings as strings;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use strings::{ObjectPath, ObjectPathBuf, SignatureMulti, SignatureMultiBuf, SignatureSingle, StringLike};
use thiserror::Error as ThisError;

mod istream;
mod ostream;

pub use istream::MessageIStream;
pub use ostream::{MessageOStream, MAX_UNIX_FDS};

/// Maximum marshalled size of a single array's contents (64 MiB).
pub const MAX_ARRAY_SIZE: usize = 67108864;

/// Total container nesting a message may carry.
const MAX_DEPTH: u8 = 64;

/// Failed to decode (or, for the outbound guards, encode) wire data.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ThisError)]
pub enum DemarshalError {
    #[error("not enough message data")]
    NotEnoughData,
    #[error("string is not valid")]
    InvalidString,
    #[error("signature is not valid")]
    InvalidSignature,
    #[error("boolean is not 0 or 1")]
    InvalidBoolean,
    #[error("value signature does not match its container")]
    WrongType,
    #[error("array contents exceed 64 MiB")]
    NumberTooBig,
    #[error("containers nested more than 64 times")]
    NestingTooDeep,
    #[error("more than 253 unix fds in one message")]
    TooManyFds,
    #[error("unix fd index has no matching descriptor")]
    FdIndexOutOfRange,
    #[error("unable to duplicate unix fd")]
    FdDuplication,
}

/// Request for a concrete type from a value whose runtime type differs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ThisError)]
#[error("cannot cast {got} into {wanted}")]
pub struct CastError {
    /// The requested type.
    pub wanted: &'static str,
    /// The type the value actually holds.
    pub got: &'static str,
}

/// Alignment in bytes of the type starting with `code`.
///
/// Panics: if `code` does not start a type, so only call this with
/// validated signatures.
pub fn alignment_of(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' | b'h' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => panic!("Unexpected byte in type signature: {}", code),
    }
}

/// Whether `code` is one of the basic (non-container) types.
pub fn is_basic(code: u8) -> bool {
    matches!(code, b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h')
}

/// An owned file descriptor travelling inside a message.
///
/// The wire value is an index into the message's ancillary descriptor
/// list, never the descriptor itself. Dropping the carrier closes the
/// descriptor; copies duplicate it through the OS.
#[derive(Debug)]
pub struct UnixFd(OwnedFd);

impl UnixFd {
    pub fn new(fd: OwnedFd) -> UnixFd {
        UnixFd(fd)
    }

    /// Duplicates the descriptor into an independent carrier.
    pub fn try_clone(&self) -> io::Result<UnixFd> {
        Ok(UnixFd(self.0.try_clone()?))
    }

    pub fn into_inner(self) -> OwnedFd {
        self.0
    }
}

impl AsFd for UnixFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<OwnedFd> for UnixFd {
    fn from(fd: OwnedFd) -> UnixFd {
        UnixFd(fd)
    }
}

impl From<std::fs::File> for UnixFd {
    fn from(f: std::fs::File) -> UnixFd {
        UnixFd(f.into())
    }
}

impl PartialEq for UnixFd {
    fn eq(&self, other: &UnixFd) -> bool {
        use std::os::fd::AsRawFd;
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

/// A D-Bus array: all elements share one signature, which the array
/// remembers even while empty.
#[derive(Debug, PartialEq)]
pub struct Array {
    element_sig: String,
    elements: Vec<Value>,
}

impl Array {
    /// Creates an empty array of the given element signature, e g
    /// `"s"` or `"{sv}"`.
    pub fn new(element_signature: &str) -> Result<Array, DemarshalError> {
        let full = format!("a{}", element_signature);
        strings::is_valid_signature_single(&full).map_err(|_| DemarshalError::InvalidSignature)?;
        Ok(Array { element_sig: element_signature.into(), elements: vec![] })
    }

    fn new_unchecked(element_sig: String) -> Array {
        Array { element_sig, elements: vec![] }
    }

    /// Appends a value, which must match the element signature.
    pub fn push(&mut self, v: Value) -> Result<(), DemarshalError> {
        if v.signature() != self.element_sig {
            return Err(DemarshalError::WrongType);
        }
        self.elements.push(v);
        Ok(())
    }

    pub fn element_signature(&self) -> &str {
        &self.element_sig
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.elements.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.elements.iter()
    }

    pub fn into_elements(self) -> Vec<Value> {
        self.elements
    }
}

/// A D-Bus struct: an ordered list of values of any types. Must hold
/// at least one field by the time it is marshalled.
#[derive(Debug, PartialEq, Default)]
pub struct Struct {
    fields: Vec<Value>,
}

impl Struct {
    pub fn new(fields: Vec<Value>) -> Struct {
        Struct { fields }
    }

    pub fn push(&mut self, v: Value) {
        self.fields.push(v);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.fields.get(idx)
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.fields
    }
}

/// A dict entry; only valid as the direct element of an array, with a
/// basic key.
#[derive(Debug, PartialEq)]
pub struct DictEntry {
    key: Value,
    value: Value,
}

impl DictEntry {
    pub fn new(key: Value, value: Value) -> Result<DictEntry, DemarshalError> {
        if !is_basic(key.signature().as_bytes()[0]) {
            return Err(DemarshalError::InvalidSignature);
        }
        Ok(DictEntry { key, value })
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_parts(self) -> (Value, Value) {
        (self.key, self.value)
    }
}

/// One D-Bus value of any type.
#[derive(Debug, PartialEq)]
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
    String(String),
    ObjectPath(ObjectPathBuf),
    Signature(SignatureMultiBuf),
    UnixFd(UnixFd),
    Array(Array),
    Struct(Struct),
    DictEntry(Box<DictEntry>),
    Variant(Box<Value>),
}

impl Value {
    /// The signature of this value, e g "s" or "a{sv}".
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Boolean(_) => "b".into(),
            Value::Int16(_) => "n".into(),
            Value::Uint16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::Uint32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::Uint64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::String(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::UnixFd(_) => "h".into(),
            Value::Array(a) => format!("a{}", a.element_sig),
            Value::Struct(s) => {
                let mut sig = String::from("(");
                for f in &s.fields {
                    sig += &f.signature();
                }
                sig + ")"
            }
            Value::DictEntry(e) => format!("{{{}{}}}", e.key.signature(), e.value.signature()),
            Value::Variant(_) => "v".into(),
        }
    }

    /// Human readable name of the runtime type, used in cast errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Boolean(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::DictEntry(_) => "dict entry",
            Value::Variant(_) => "variant",
        }
    }

    /// The default value for a single complete type. There is no
    /// default `unix_fd`, so that code is refused.
    pub fn create(sig: &SignatureSingle) -> Result<Value, DemarshalError> {
        Value::create_code(sig)
    }

    fn create_code(sig: &str) -> Result<Value, DemarshalError> {
        Ok(match sig.as_bytes()[0] {
            b'y' => Value::Byte(0),
            b'b' => Value::Boolean(false),
            b'n' => Value::Int16(0),
            b'q' => Value::Uint16(0),
            b'i' => Value::Int32(0),
            b'u' => Value::Uint32(0),
            b'x' => Value::Int64(0),
            b't' => Value::Uint64(0),
            b'd' => Value::Double(0.0),
            b's' => Value::String(String::new()),
            b'o' => Value::ObjectPath(ObjectPath::new_owned("/").map_err(|_| DemarshalError::InvalidSignature)?),
            b'g' => Value::Signature(SignatureMulti::new_owned("").map_err(|_| DemarshalError::InvalidSignature)?),
            b'h' => return Err(DemarshalError::FdIndexOutOfRange),
            b'a' => Value::Array(Array::new(&sig[1..])?),
            b'(' => {
                let inner = SignatureMulti::new(&sig[1..sig.len() - 1])
                    .map_err(|_| DemarshalError::InvalidSignature)?;
                let mut fields = vec![];
                for s in inner.iter() {
                    fields.push(Value::create(s)?);
                }
                Value::Struct(Struct::new(fields))
            }
            b'{' => {
                let inner = &sig[1..sig.len() - 1];
                let (key, value) = split_dict_sigs(inner)?;
                Value::DictEntry(Box::new(DictEntry::new(
                    Value::create_code(key)?,
                    Value::create_code(value)?,
                )?))
            }
            b'v' => Value::Variant(Box::new(Value::Byte(0))),
            _ => return Err(DemarshalError::InvalidSignature),
        })
    }

    /// Writes this value to the stream, padding to its alignment first.
    pub fn marshall(&self, stream: &mut MessageOStream) -> Result<(), DemarshalError> {
        match self {
            Value::Byte(v) => stream.write_byte(*v),
            Value::Boolean(v) => stream.write_boolean(*v),
            Value::Int16(v) => stream.write_i16(*v),
            Value::Uint16(v) => stream.write_u16(*v),
            Value::Int32(v) => stream.write_i32(*v),
            Value::Uint32(v) => stream.write_u32(*v),
            Value::Int64(v) => stream.write_i64(*v),
            Value::Uint64(v) => stream.write_u64(*v),
            Value::Double(v) => stream.write_double(*v),
            Value::String(v) => {
                if v.bytes().any(|b| b == 0) {
                    return Err(DemarshalError::InvalidString);
                }
                stream.write_string(v);
            }
            Value::ObjectPath(v) => stream.write_string(v),
            Value::Signature(v) => stream.write_signature(v),
            Value::UnixFd(v) => {
                let dup = v.0.try_clone().map_err(|_| DemarshalError::FdDuplication)?;
                stream.write_unix_fd(dup)?;
            }
            Value::Array(a) => {
                stream.pad(4);
                let size_pos = stream.data.len();
                stream.data.extend_from_slice(&[0; 4]);
                // Padding to the first element is not counted in the length
                stream.pad(alignment_of(a.element_sig.as_bytes()[0]));
                let start = stream.data.len();
                for elem in &a.elements {
                    if elem.signature() != a.element_sig {
                        return Err(DemarshalError::WrongType);
                    }
                    elem.marshall(stream)?;
                }
                let len = stream.data.len() - start;
                if len > MAX_ARRAY_SIZE {
                    return Err(DemarshalError::NumberTooBig);
                }
                stream.data[size_pos..size_pos + 4].copy_from_slice(&(len as u32).to_ne_bytes());
            }
            Value::Struct(s) => {
                if s.fields.is_empty() {
                    return Err(DemarshalError::InvalidSignature);
                }
                stream.pad(8);
                for f in &s.fields {
                    f.marshall(stream)?;
                }
            }
            Value::DictEntry(e) => {
                stream.pad(8);
                e.key.marshall(stream)?;
                e.value.marshall(stream)?;
            }
            Value::Variant(v) => {
                let sig = v.signature();
                if sig.len() > 255 {
                    return Err(DemarshalError::InvalidSignature);
                }
                stream.write_signature(&sig);
                v.marshall(stream)?;
            }
        }
        Ok(())
    }

    /// Reads one value of the given single complete type.
    pub fn unmarshall(stream: &mut MessageIStream, sig: &SignatureSingle) -> Result<Value, DemarshalError> {
        Value::from_stream(stream, sig, 0)
    }

    fn from_stream(stream: &mut MessageIStream, sig: &str, depth: u8) -> Result<Value, DemarshalError> {
        if depth > MAX_DEPTH {
            return Err(DemarshalError::NestingTooDeep);
        }
        Ok(match sig.as_bytes()[0] {
            b'y' => Value::Byte(stream.read_byte()?),
            b'b' => Value::Boolean(stream.read_boolean()?),
            b'n' => Value::Int16(stream.read_i16()?),
            b'q' => Value::Uint16(stream.read_u16()?),
            b'i' => Value::Int32(stream.read_i32()?),
            b'u' => Value::Uint32(stream.read_u32()?),
            b'x' => Value::Int64(stream.read_i64()?),
            b't' => Value::Uint64(stream.read_u64()?),
            b'd' => Value::Double(stream.read_double()?),
            b's' => Value::String(stream.read_string()?.to_owned()),
            b'o' => {
                let s = stream.read_string()?;
                Value::ObjectPath(ObjectPath::new_owned(s).map_err(|_| DemarshalError::InvalidString)?)
            }
            b'g' => {
                let s = stream.read_signature()?;
                Value::Signature(SignatureMulti::new_owned(s).map_err(|_| DemarshalError::InvalidSignature)?)
            }
            b'h' => Value::UnixFd(UnixFd(stream.read_unix_fd()?)),
            b'a' => {
                let len = stream.read_u32()? as usize;
                if len > MAX_ARRAY_SIZE {
                    return Err(DemarshalError::NumberTooBig);
                }
                let elem = &sig[1..];
                stream.align(alignment_of(elem.as_bytes()[0]))?;
                let mut sub = stream.sub(len)?;
                let mut array = Array::new_unchecked(elem.into());
                while !sub.empty() {
                    let v = Value::from_stream(&mut sub, elem, depth + 1)?;
                    array.elements.push(v);
                }
                Value::Array(array)
            }
            b'(' => {
                stream.align(8)?;
                let inner = SignatureMulti::new(&sig[1..sig.len() - 1])
                    .map_err(|_| DemarshalError::InvalidSignature)?;
                let mut fields = vec![];
                for s in inner.iter() {
                    fields.push(Value::from_stream(stream, s, depth + 1)?);
                }
                if fields.is_empty() {
                    return Err(DemarshalError::InvalidSignature);
                }
                Value::Struct(Struct::new(fields))
            }
            b'{' => {
                stream.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                let (key_sig, value_sig) = split_dict_sigs(inner)?;
                if !is_basic(key_sig.as_bytes()[0]) {
                    return Err(DemarshalError::InvalidSignature);
                }
                let key = Value::from_stream(stream, key_sig, depth + 1)?;
                let value = Value::from_stream(stream, value_sig, depth + 1)?;
                Value::DictEntry(Box::new(DictEntry { key, value }))
            }
            b'v' => {
                let inner = stream.read_signature()?;
                let inner = SignatureSingle::new(inner).map_err(|_| DemarshalError::InvalidSignature)?;
                Value::Variant(Box::new(Value::from_stream(stream, inner, depth + 1)?))
            }
            _ => return Err(DemarshalError::InvalidSignature),
        })
    }

    /// One level of auto-unwrap from a variant, for the casts below.
    fn inner(&self) -> &Value {
        match self {
            Value::Variant(v) => v,
            other => other,
        }
    }

    fn cast_error(&self, wanted: &'static str) -> CastError {
        CastError { wanted, got: self.inner().type_name() }
    }

    pub fn as_byte(&self) -> Result<u8, CastError> {
        match self.inner() {
            Value::Byte(v) => Ok(*v),
            _ => Err(self.cast_error("byte")),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, CastError> {
        match self.inner() {
            Value::Boolean(v) => Ok(*v),
            _ => Err(self.cast_error("boolean")),
        }
    }

    pub fn as_i16(&self) -> Result<i16, CastError> {
        match self.inner() {
            Value::Int16(v) => Ok(*v),
            _ => Err(self.cast_error("int16")),
        }
    }

    pub fn as_u16(&self) -> Result<u16, CastError> {
        match self.inner() {
            Value::Uint16(v) => Ok(*v),
            _ => Err(self.cast_error("uint16")),
        }
    }

    pub fn as_i32(&self) -> Result<i32, CastError> {
        match self.inner() {
            Value::Int32(v) => Ok(*v),
            _ => Err(self.cast_error("int32")),
        }
    }

    pub fn as_u32(&self) -> Result<u32, CastError> {
        match self.inner() {
            Value::Uint32(v) => Ok(*v),
            _ => Err(self.cast_error("uint32")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, CastError> {
        match self.inner() {
            Value::Int64(v) => Ok(*v),
            _ => Err(self.cast_error("int64")),
        }
    }

    pub fn as_u64(&self) -> Result<u64, CastError> {
        match self.inner() {
            Value::Uint64(v) => Ok(*v),
            _ => Err(self.cast_error("uint64")),
        }
    }

    pub fn as_double(&self) -> Result<f64, CastError> {
        match self.inner() {
            Value::Double(v) => Ok(*v),
            _ => Err(self.cast_error("double")),
        }
    }

    /// Any of the three string-like types reads as a str.
    pub fn as_str(&self) -> Result<&str, CastError> {
        match self.inner() {
            Value::String(v) => Ok(v),
            Value::ObjectPath(v) => Ok(v),
            Value::Signature(v) => Ok(v),
            _ => Err(self.cast_error("string")),
        }
    }

    pub fn as_object_path(&self) -> Result<&ObjectPath, CastError> {
        match self.inner() {
            Value::ObjectPath(v) => Ok(v),
            _ => Err(self.cast_error("object path")),
        }
    }

    pub fn as_signature(&self) -> Result<&SignatureMulti, CastError> {
        match self.inner() {
            Value::Signature(v) => Ok(v),
            _ => Err(self.cast_error("signature")),
        }
    }

    pub fn as_unix_fd(&self) -> Result<&UnixFd, CastError> {
        match self.inner() {
            Value::UnixFd(v) => Ok(v),
            _ => Err(self.cast_error("unix fd")),
        }
    }

    pub fn as_array(&self) -> Result<&Array, CastError> {
        match self.inner() {
            Value::Array(v) => Ok(v),
            _ => Err(self.cast_error("array")),
        }
    }

    pub fn as_struct(&self) -> Result<&Struct, CastError> {
        match self.inner() {
            Value::Struct(v) => Ok(v),
            _ => Err(self.cast_error("struct")),
        }
    }

    pub fn as_dict_entry(&self) -> Result<&DictEntry, CastError> {
        match self.inner() {
            Value::DictEntry(v) => Ok(v),
            _ => Err(self.cast_error("dict entry")),
        }
    }

    /// The value inside a variant. No auto-unwrap here.
    pub fn as_variant(&self) -> Result<&Value, CastError> {
        match self {
            Value::Variant(v) => Ok(v),
            _ => Err(CastError { wanted: "variant", got: self.type_name() }),
        }
    }
}

/// Splits "kv" of a dict entry into its two single complete types.
fn split_dict_sigs(inner: &str) -> Result<(&str, &str), DemarshalError> {
    let multi = SignatureMulti::new(inner).map_err(|_| DemarshalError::InvalidSignature)?;
    let (key, rest) = multi.single().ok_or(DemarshalError::InvalidSignature)?;
    let (value, tail) = rest.single().ok_or(DemarshalError::InvalidSignature)?;
    if !tail.is_empty() {
        return Err(DemarshalError::InvalidSignature);
    }
    Ok((key.as_ref(), value.as_ref()))
}

impl From<u8> for Value {
    fn from(v: u8) -> Value { Value::Byte(v) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Value { Value::Boolean(v) }
}
impl From<i16> for Value {
    fn from(v: i16) -> Value { Value::Int16(v) }
}
impl From<u16> for Value {
    fn from(v: u16) -> Value { Value::Uint16(v) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Value { Value::Int32(v) }
}
impl From<u32> for Value {
    fn from(v: u32) -> Value { Value::Uint32(v) }
}
impl From<i64> for Value {
    fn from(v: i64) -> Value { Value::Int64(v) }
}
impl From<u64> for Value {
    fn from(v: u64) -> Value { Value::Uint64(v) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Value { Value::Double(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value { Value::String(v.into()) }
}
impl From<String> for Value {
    fn from(v: String) -> Value { Value::String(v) }
}
impl From<ObjectPathBuf> for Value {
    fn from(v: ObjectPathBuf) -> Value { Value::ObjectPath(v) }
}
impl From<SignatureMultiBuf> for Value {
    fn from(v: SignatureMultiBuf) -> Value { Value::Signature(v) }
}
impl From<UnixFd> for Value {
    fn from(v: UnixFd) -> Value { Value::UnixFd(v) }
}
impl From<OwnedFd> for Value {
    fn from(v: OwnedFd) -> Value { Value::UnixFd(UnixFd(v)) }
}
impl From<Array> for Value {
    fn from(v: Array) -> Value { Value::Array(v) }
}
impl From<Struct> for Value {
    fn from(v: Struct) -> Value { Value::Struct(v) }
}
impl From<DictEntry> for Value {
    fn from(v: DictEntry) -> Value { Value::DictEntry(Box::new(v)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let mut out = MessageOStream::new();
        v.marshall(&mut out).unwrap();
        let sig = v.signature();
        let single = SignatureSingle::new(&sig).unwrap();
        let mut input = MessageIStream::new(&out.data, false, &out.fds);
        let parsed = Value::unmarshall(&mut input, single).unwrap();
        assert!(input.empty(), "unconsumed bytes for {}", sig);
        parsed
    }

    #[test]
    fn scalar_roundtrips() {
        for v in vec![
            Value::Byte(0xfe),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Int16(-12345),
            Value::Uint16(54321),
            Value::Int32(-7),
            Value::Uint32(0xdeadbeef),
            Value::Int64(-1234567890123),
            Value::Uint64(u64::MAX),
            Value::Double(1234.5678),
            Value::String("hello world".into()),
            Value::ObjectPath(ObjectPath::new_owned("/org/freedesktop/DBus").unwrap()),
            Value::Signature(SignatureMulti::new_owned("a{sv}i").unwrap()),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn container_roundtrips() {
        let mut a = Array::new("s").unwrap();
        a.push("one".into()).unwrap();
        a.push("two".into()).unwrap();
        let v = Value::Array(a);
        assert_eq!(roundtrip(&v), v);

        let v = Value::Struct(Struct::new(vec![
            Value::Byte(1),
            Value::String("x".into()),
            Value::Uint64(99),
        ]));
        assert_eq!(roundtrip(&v), v);

        let mut dict = Array::new("{sv}").unwrap();
        dict.push(
            DictEntry::new("Answer".into(), Value::Variant(Box::new(Value::Uint16(42))))
                .unwrap()
                .into(),
        )
        .unwrap();
        let v = Value::Array(dict);
        assert_eq!(v.signature(), "a{sv}");
        assert_eq!(roundtrip(&v), v);

        let v = Value::Variant(Box::new(Value::Struct(Struct::new(vec![Value::Int32(-1)]))));
        assert_eq!(roundtrip(&v), v);

        // Array of arrays of int64: the inner elements are 8-aligned
        // even though the outer element type only aligns to 4.
        let mut inner = Array::new("x").unwrap();
        inner.push(Value::Int64(7)).unwrap();
        let mut outer = Array::new("ax").unwrap();
        outer.push(Value::Array(inner)).unwrap();
        let v = Value::Array(outer);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn empty_array_padding_is_not_counted() {
        // An empty array of 8-aligned elements still pads to 8, but
        // its length field stays 0.
        let v = Value::Array(Array::new("t").unwrap());
        let mut out = MessageOStream::new();
        out.write_byte(0); // misalign
        v.marshall(&mut out).unwrap();
        assert_eq!(&out.data, &[0, 0, 0, 0, 0, 0, 0, 0]);
        let mut input = MessageIStream::new(&out.data, false, &[]);
        input.read_byte().unwrap();
        let parsed = Value::unmarshall(&mut input, SignatureSingle::new("at").unwrap()).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn struct_aligns_to_eight() {
        let v = Value::Struct(Struct::new(vec![Value::Byte(9)]));
        let mut out = MessageOStream::new();
        out.write_byte(1);
        v.marshall(&mut out).unwrap();
        assert_eq!(&out.data, &[1, 0, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn array_length_limit_is_enforced() {
        let data = [0xffu8, 0xff, 0xff, 0xff];
        let mut input = MessageIStream::new(&data, false, &[]);
        let r = Value::unmarshall(&mut input, SignatureSingle::new("ai").unwrap());
        assert_eq!(r, Err(DemarshalError::NumberTooBig));
    }

    #[test]
    fn boolean_must_be_zero_or_one() {
        let data = [2u8, 0, 0, 0];
        let mut input = MessageIStream::new(&data, false, &[]);
        let r = Value::unmarshall(&mut input, SignatureSingle::new("b").unwrap());
        assert_eq!(r, Err(DemarshalError::InvalidBoolean));
    }

    #[test]
    fn variant_nesting_is_capped() {
        // 70 nested variants, innermost a byte: deeper than any valid
        // message may go.
        let mut data = vec![];
        for _ in 0..70 {
            data.extend_from_slice(&[1, b'v', 0]);
        }
        data.extend_from_slice(&[1, b'y', 0, 42]);
        let mut input = MessageIStream::new(&data, false, &[]);
        let r = Value::unmarshall(&mut input, SignatureSingle::new("v").unwrap());
        assert_eq!(r, Err(DemarshalError::NestingTooDeep));
    }

    #[test]
    fn casts_unwrap_one_variant_level() {
        let v = Value::Variant(Box::new(Value::Uint32(5)));
        assert_eq!(v.as_u32(), Ok(5));
        let nested = Value::Variant(Box::new(Value::Variant(Box::new(Value::Uint32(5)))));
        assert!(nested.as_u32().is_err());
        let e = Value::String("x".into()).as_u32().unwrap_err();
        assert_eq!(e, CastError { wanted: "uint32", got: "string" });
    }

    #[test]
    fn mismatched_array_push_is_refused() {
        let mut a = Array::new("s").unwrap();
        assert_eq!(a.push(Value::Byte(0)), Err(DemarshalError::WrongType));
    }

    #[test]
    fn default_values() {
        assert_eq!(Value::create(SignatureSingle::new("i").unwrap()).unwrap(), Value::Int32(0));
        let v = Value::create(SignatureSingle::new("(sas)").unwrap()).unwrap();
        assert_eq!(v.signature(), "(sas)");
        assert!(Value::create(SignatureSingle::new("h").unwrap()).is_err());
    }
}
