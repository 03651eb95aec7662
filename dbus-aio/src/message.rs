//! Framing and header codec for D-Bus messages.
//!
//! The header is the struct `(yyyyuua(yv))`: endian flag, kind, flags,
//! protocol version, body length, serial and the byte-keyed variant
//! array of header fields. The body begins 8-aligned after the field
//! array and carries the parameters whose concatenated signature is
//! the `Signature` header field.

use crate::error::Error;
use crate::types::{self, Array, MessageIStream, MessageOStream, Struct, Value};
use dbus_aio_strings::{
    BusName, BusNameBuf, ErrorName, ErrorNameBuf, InterfaceName, InterfaceNameBuf, MemberName,
    MemberNameBuf, ObjectPath, ObjectPathBuf, SignatureMulti, SignatureMultiBuf, SignatureSingle,
    StringLike,
};
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

/// Whole-message ceiling (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 134217728;

/// The fixed part of the header: four bytes plus three u32.
pub const FIXED_HEADER_SIZE: usize = 16;

#[cfg(target_endian = "little")]
const ENDIAN: u8 = b'l';
#[cfg(target_endian = "big")]
const ENDIAN: u8 = b'B';

/// Message kind, as carried in the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_wire(b: u8) -> Option<MessageType> {
        match b {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Message flag bits (third header byte).
pub mod flags {
    /// The sender does not want a reply to this call.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Do not launch an owner for the destination name.
    pub const NO_AUTO_START: u8 = 0x02;
    /// Not supported; stripped from outgoing messages with a warning.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x04;

    pub(super) const MASK: u8 = 0x07;
}

// Header field keys.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// One D-Bus message of any kind, together with its body parameters.
#[derive(Debug)]
pub struct Message {
    msg_type: MessageType,
    msg_flags: u8,
    serial: Option<NonZeroU32>,
    path: Option<ObjectPathBuf>,
    interface: Option<InterfaceNameBuf>,
    member: Option<MemberNameBuf>,
    error_name: Option<ErrorNameBuf>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<BusNameBuf>,
    sender: Option<BusNameBuf>,
    signature: SignatureMultiBuf,
    body: Vec<Value>,
    big_endian: bool,
}

impl Message {
    fn new_internal(t: MessageType) -> Message {
        Message {
            msg_type: t,
            msg_flags: 0,
            serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: SignatureMulti::empty().to_owned(),
            body: vec![],
            big_endian: cfg!(target_endian = "big"),
        }
    }

    /// A new method call addressed to `destination`.
    pub fn method_call(
        destination: &BusName,
        path: &ObjectPath,
        interface: &InterfaceName,
        member: &MemberName,
    ) -> Message {
        let mut m = Message::new_internal(MessageType::MethodCall);
        m.destination = Some(destination.to_owned());
        m.path = Some(path.to_owned());
        m.interface = Some(interface.to_owned());
        m.member = Some(member.to_owned());
        m
    }

    /// A new broadcast signal. Use [`Message::with_destination`] to
    /// make it unicast.
    pub fn signal(path: &ObjectPath, interface: &InterfaceName, member: &MemberName) -> Message {
        let mut m = Message::new_internal(MessageType::Signal);
        m.msg_flags = flags::NO_REPLY_EXPECTED;
        m.path = Some(path.to_owned());
        m.interface = Some(interface.to_owned());
        m.member = Some(member.to_owned());
        m
    }

    /// The reply to this method call, addressed back at its sender.
    pub fn method_return(&self) -> Result<Message, Error> {
        let serial = self.serial.ok_or(Error::InvalidMessage("reply to a message without serial"))?;
        let mut m = Message::new_internal(MessageType::MethodReturn);
        m.msg_flags = flags::NO_REPLY_EXPECTED;
        m.reply_serial = Some(serial);
        m.destination = self.sender.clone();
        Ok(m)
    }

    /// An error reply to this method call.
    pub fn error(&self, name: &ErrorName, text: &str) -> Result<Message, Error> {
        let serial = self.serial.ok_or(Error::InvalidMessage("reply to a message without serial"))?;
        let mut m = Message::new_internal(MessageType::Error);
        m.msg_flags = flags::NO_REPLY_EXPECTED;
        m.reply_serial = Some(serial);
        m.destination = self.sender.clone();
        m.error_name = Some(name.to_owned());
        m.body.push(Value::String(text.into()));
        Ok(m)
    }

    /// Replaces the destination; needed for unicast signals and for
    /// replies built outside a call context.
    pub fn with_destination(mut self, destination: &BusName) -> Message {
        self.destination = Some(destination.to_owned());
        self
    }

    /// Sets the message flags. `ALLOW_INTERACTIVE_AUTHORIZATION` is
    /// not supported and is stripped here; unknown bits are dropped.
    pub fn with_flags(mut self, mut f: u8) -> Message {
        if f & flags::ALLOW_INTERACTIVE_AUTHORIZATION != 0 {
            tracing::warn!("ALLOW_INTERACTIVE_AUTHORIZATION is not supported, stripping flag");
            f &= !flags::ALLOW_INTERACTIVE_AUTHORIZATION;
        }
        self.msg_flags = f & flags::MASK;
        self
    }

    /// Appends one body parameter.
    pub fn append(&mut self, arg: impl Into<Value>) {
        self.body.push(arg.into());
    }

    /// Appends one body parameter, returning self for chaining.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Message {
        self.append(arg);
        self
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn flags(&self) -> u8 {
        self.msg_flags
    }

    /// The sender-assigned serial, present once sent or parsed.
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&InterfaceName> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&MemberName> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&ErrorName> {
        self.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&BusName> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&BusName> {
        self.sender.as_deref()
    }

    /// The body signature.
    pub fn signature(&self) -> &SignatureMulti {
        &self.signature
    }

    pub fn args(&self) -> &[Value] {
        &self.body
    }

    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.body.get(idx)
    }

    pub fn into_args(self) -> Vec<Value> {
        self.body
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Whether the peer expects a reply to this message.
    pub fn is_reply_expected(&self) -> bool {
        self.msg_type == MessageType::MethodCall && self.msg_flags & flags::NO_REPLY_EXPECTED == 0
    }

    /// "interface.member", the handler-table key for calls and signals.
    pub fn full_name(&self) -> String {
        format!(
            "{}.{}",
            self.interface.as_deref().map(|i| &**i).unwrap_or(""),
            self.member.as_deref().map(|m| &**m).unwrap_or("")
        )
    }

    /// The human-readable text of an error message (its first string
    /// parameter), if any.
    pub fn error_text(&self) -> Option<&str> {
        self.body.first().and_then(|v| v.as_str().ok())
    }

    fn header_fields(&self, unix_fds: u32) -> Result<Array, Error> {
        // Required combinations, checked before anything goes out.
        if self.msg_type != MessageType::Signal && self.destination.is_none() {
            return Err(Error::InvalidMessage("message without destination"));
        }
        match self.msg_type {
            MessageType::MethodCall | MessageType::Signal => {
                if self.path.is_none() {
                    return Err(Error::InvalidMessage("message without object path"));
                }
                if self.member.is_none() {
                    return Err(Error::InvalidMessage("message without member"));
                }
                if self.msg_type == MessageType::Signal && self.interface.is_none() {
                    return Err(Error::InvalidMessage("signal without interface"));
                }
            }
            MessageType::MethodReturn | MessageType::Error => {
                if self.reply_serial.is_none() {
                    return Err(Error::InvalidMessage("reply without reply serial"));
                }
                if self.msg_type == MessageType::Error && self.error_name.is_none() {
                    return Err(Error::InvalidMessage("error without error name"));
                }
            }
        }

        fn field(code: u8, v: Value) -> Value {
            Value::Struct(Struct::new(vec![Value::Byte(code), Value::Variant(Box::new(v))]))
        }

        let mut fields = Array::new("(yv)").map_err(Error::from)?;
        let mut add = |code: u8, v: Value| fields.push(field(code, v)).map_err(Error::from);
        if let Some(x) = &self.destination {
            add(FIELD_DESTINATION, Value::String(x.to_string()))?;
        }
        if let Some(x) = &self.path {
            add(FIELD_PATH, Value::ObjectPath(x.clone()))?;
        }
        if let Some(x) = &self.interface {
            add(FIELD_INTERFACE, Value::String(x.to_string()))?;
        }
        if let Some(x) = &self.member {
            add(FIELD_MEMBER, Value::String(x.to_string()))?;
        }
        if let Some(x) = &self.error_name {
            add(FIELD_ERROR_NAME, Value::String(x.to_string()))?;
        }
        if let Some(x) = self.reply_serial {
            add(FIELD_REPLY_SERIAL, Value::Uint32(x.get()))?;
        }
        if let Some(x) = &self.sender {
            add(FIELD_SENDER, Value::String(x.to_string()))?;
        }
        let body_sig = self.body_signature()?;
        if !body_sig.is_empty() {
            add(FIELD_SIGNATURE, Value::Signature(body_sig))?;
        }
        if unix_fds > 0 {
            add(FIELD_UNIX_FDS, Value::Uint32(unix_fds))?;
        }
        Ok(fields)
    }

    fn body_signature(&self) -> Result<SignatureMultiBuf, Error> {
        let mut sig = String::new();
        for v in &self.body {
            sig += &v.signature();
        }
        Ok(SignatureMulti::new_owned(sig)?)
    }

    /// Marshals the complete packet: header, padding to the 8-aligned
    /// body start, then the body. Descriptors collected from the body
    /// ride on the returned stream.
    pub fn marshall(&self, serial: NonZeroU32) -> Result<MessageOStream, Error> {
        let mut body = MessageOStream::new();
        for v in &self.body {
            v.marshall(&mut body)?;
        }
        if body.data.len() >= MAX_MESSAGE_SIZE {
            return Err(Error::Protocol("message body exceeds 128 MiB".into()));
        }

        let fields = self.header_fields(body.fds.len() as u32)?;

        let mut out = MessageOStream::new();
        out.write_byte(ENDIAN);
        out.write_byte(self.msg_type as u8);
        out.write_byte(self.msg_flags & flags::MASK);
        out.write_byte(1);
        out.write_u32(body.data.len() as u32);
        out.write_u32(serial.get());
        Value::Array(fields).marshall(&mut out)?;
        // The header ends after its padding to an 8 boundary.
        out.pad(8);
        if out.data.len() + body.data.len() >= MAX_MESSAGE_SIZE {
            return Err(Error::Protocol("message exceeds 128 MiB".into()));
        }
        out.append(body);
        Ok(out)
    }

    /// Decodes a complete frame. `Ok(None)` means a message of an
    /// unknown kind that should be ignored.
    pub fn parse(buf: &[u8], fds: Vec<OwnedFd>) -> Result<Option<Message>, Error> {
        let start = preparse(buf)?;
        if buf.len() < start.total_size {
            return Err(Error::Protocol("not enough message data".into()));
        }
        let msg_type = match MessageType::from_wire(buf[1]) {
            Some(t) => t,
            None => return Ok(None),
        };
        if buf[3] != 1 {
            return Err(Error::Protocol("invalid protocol version".into()));
        }

        let mut m = Message::new_internal(msg_type);
        m.big_endian = start.big_endian;
        // Unknown flag bits are ignored on receive.
        m.msg_flags = buf[2] & flags::MASK;
        let serial = read_u32_at(buf, 8, start.swap);
        m.serial =
            Some(NonZeroU32::new(serial).ok_or_else(|| Error::Protocol("serial is zero".into()))?);

        let mut hdr = MessageIStream::new_at(&buf[..start.body_start], 12, start.swap, &[]);
        let field_sig = SignatureSingle::new("a(yv)").map_err(Error::from)?;
        let fields = Value::unmarshall(&mut hdr, field_sig)?;
        fn bad_field<E>(_: E) -> Error {
            Error::Protocol("malformed header field".into())
        }
        for entry in fields.as_array().map_err(bad_field)?.iter() {
            let entry = entry.as_struct().map_err(bad_field)?;
            let code = entry.get(0).ok_or_else(|| bad_field(()))?.as_byte().map_err(bad_field)?;
            let value = entry.get(1).ok_or_else(|| bad_field(()))?;
            match code {
                FIELD_PATH => m.path = Some(value.as_object_path().map_err(bad_field)?.to_owned()),
                FIELD_INTERFACE => {
                    let s = value.as_str().map_err(bad_field)?;
                    m.interface = Some(InterfaceName::new_owned(s).map_err(bad_field)?);
                }
                FIELD_MEMBER => {
                    let s = value.as_str().map_err(bad_field)?;
                    m.member = Some(MemberName::new_owned(s).map_err(bad_field)?);
                }
                FIELD_ERROR_NAME => {
                    let s = value.as_str().map_err(bad_field)?;
                    m.error_name = Some(ErrorName::new_owned(s).map_err(bad_field)?);
                }
                FIELD_REPLY_SERIAL => {
                    let v = value.as_u32().map_err(bad_field)?;
                    m.reply_serial = Some(NonZeroU32::new(v).ok_or_else(|| bad_field(()))?);
                }
                FIELD_DESTINATION => {
                    let s = value.as_str().map_err(bad_field)?;
                    m.destination = Some(BusName::new_owned(s).map_err(bad_field)?);
                }
                FIELD_SENDER => {
                    let s = value.as_str().map_err(bad_field)?;
                    m.sender = Some(BusName::new_owned(s).map_err(bad_field)?);
                }
                FIELD_SIGNATURE => {
                    m.signature = value.as_signature().map_err(bad_field)?.to_owned();
                }
                FIELD_UNIX_FDS => {
                    value.as_u32().map_err(bad_field)?;
                }
                _ => {}
            }
        }

        let body_end = start.body_start + start.body_size;
        let mut body = MessageIStream::new(&buf[start.body_start..body_end], start.swap, &fds);
        let signature = m.signature.clone();
        for sig in signature.iter() {
            m.body.push(Value::unmarshall(&mut body, sig)?);
        }
        if !body.empty() {
            return Err(Error::Protocol("trailing bytes after message body".into()));
        }
        Ok(Some(m))
    }
}

struct MsgStart {
    body_start: usize,
    body_size: usize,
    total_size: usize,
    big_endian: bool,
    swap: bool,
}

fn read_u32_at(buf: &[u8], at: usize, swap: bool) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    let v = u32::from_ne_bytes(b);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn preparse(buf: &[u8]) -> Result<MsgStart, Error> {
    if buf.len() < FIXED_HEADER_SIZE {
        return Err(Error::Protocol("message start must be 16 bytes".into()));
    }
    let big_endian = match buf[0] {
        b'l' => false,
        b'B' => true,
        _ => return Err(Error::Protocol("invalid endian marker".into())),
    };
    let swap = big_endian != cfg!(target_endian = "big");
    let body_size = read_u32_at(buf, 4, swap) as usize;
    let fields_size = read_u32_at(buf, 12, swap) as usize;
    if fields_size > types::MAX_ARRAY_SIZE {
        return Err(Error::Protocol("maximum header size exceeded".into()));
    }
    let body_start = (FIXED_HEADER_SIZE + fields_size + 7) & !7;
    let total_size = body_start + body_size;
    if body_size >= MAX_MESSAGE_SIZE || total_size >= MAX_MESSAGE_SIZE {
        return Err(Error::Protocol("maximum message size exceeded".into()));
    }
    Ok(MsgStart { body_start, body_size, total_size, big_endian, swap })
}

/// Computes the complete frame size from the first 16 bytes, as
/// learned by the peeking reader.
pub fn total_message_size(buf: &[u8]) -> Result<usize, Error> {
    preparse(buf).map(|s| s.total_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).unwrap()
    }

    fn hello() -> Message {
        Message::method_call(
            BusName::new("org.freedesktop.DBus").unwrap(),
            ObjectPath::new("/org/freedesktop/DBus").unwrap(),
            InterfaceName::new("org.freedesktop.DBus").unwrap(),
            MemberName::new("Hello").unwrap(),
        )
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn golden_hello_header() {
        let v = hello().marshall(nz(1)).unwrap();
        assert_eq!(v.data.len() % 8, 0);
        #[rustfmt::skip]
        let expected: &[u8] = &[
            108, 1, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 110, 0, 0, 0,
            6, 1, 115, 0, 20, 0, 0, 0,
            111, 114, 103, 46, 102, 114, 101, 101, 100, 101, 115, 107, 116, 111, 112, 46, 68, 66, 117, 115, 0, 0, 0, 0,
            1, 1, 111, 0, 21, 0, 0, 0,
            47, 111, 114, 103, 47, 102, 114, 101, 101, 100, 101, 115, 107, 116, 111, 112, 47, 68, 66, 117, 115, 0, 0, 0,
            2, 1, 115, 0, 20, 0, 0, 0,
            111, 114, 103, 46, 102, 114, 101, 101, 100, 101, 115, 107, 116, 111, 112, 46, 68, 66, 117, 115, 0, 0, 0, 0,
            3, 1, 115, 0, 5, 0, 0, 0,
            72, 101, 108, 108, 111, 0, 0, 0,
        ];
        assert_eq!(&v.data[..], expected);
    }

    #[test]
    fn roundtrip_method_call() {
        let mut m = hello().with_flags(flags::NO_AUTO_START);
        m.append("one");
        m.append(7u32);
        let packet = m.marshall(nz(5)).unwrap();
        assert_eq!(total_message_size(&packet.data[..16]).unwrap(), packet.data.len());

        let parsed = Message::parse(&packet.data, vec![]).unwrap().unwrap();
        assert_eq!(parsed.msg_type(), MessageType::MethodCall);
        assert_eq!(parsed.serial(), Some(nz(5)));
        assert_eq!(parsed.flags(), flags::NO_AUTO_START);
        assert_eq!(parsed.destination().map(|d| &**d), Some("org.freedesktop.DBus"));
        assert_eq!(parsed.path().map(|p| &**p), Some("/org/freedesktop/DBus"));
        assert_eq!(parsed.full_name(), "org.freedesktop.DBus.Hello");
        assert_eq!(&**parsed.signature(), "su");
        assert_eq!(parsed.args(), &[Value::String("one".into()), Value::Uint32(7)][..]);
        assert!(parsed.is_reply_expected());
    }

    #[test]
    fn reply_and_error_construction() {
        let packet = hello().marshall(nz(9)).unwrap();
        let call = Message::parse(&packet.data, vec![]).unwrap().unwrap();

        let reply = call.method_return().unwrap();
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.reply_serial(), Some(nz(9)));
        assert!(!reply.is_reply_expected());

        let err = call
            .error(ErrorName::new("org.freedesktop.DBus.Error.Failed").unwrap(), "nope")
            .unwrap();
        assert_eq!(err.msg_type(), MessageType::Error);
        assert_eq!(err.reply_serial(), Some(nz(9)));
        assert_eq!(err.error_text(), Some("nope"));
    }

    #[test]
    fn interactive_auth_flag_is_stripped() {
        let m = hello().with_flags(flags::ALLOW_INTERACTIVE_AUTHORIZATION | flags::NO_REPLY_EXPECTED);
        assert_eq!(m.flags(), flags::NO_REPLY_EXPECTED);
    }

    #[test]
    fn destination_is_required_for_calls() {
        let m = Message::signal(
            ObjectPath::new("/").unwrap(),
            InterfaceName::new("a.b").unwrap(),
            MemberName::new("S").unwrap(),
        );
        // Broadcast signals need no destination.
        assert!(m.marshall(nz(1)).is_ok());

        let reply = Message::new_internal(MessageType::MethodReturn);
        assert!(matches!(reply.marshall(nz(2)), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn zero_serial_is_rejected() {
        let mut packet = hello().marshall(nz(1)).unwrap();
        packet.data[8..12].copy_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(Message::parse(&packet.data, vec![]), Err(Error::Protocol(_))));
    }

    #[test]
    fn endian_equivalence() {
        // The same method return (reply serial 9, body the int64 42)
        // encoded both little- and big-endian.
        #[rustfmt::skip]
        let le: &[u8] = &[
            b'l', 2, 1, 1, 8, 0, 0, 0, 3, 0, 0, 0, 15, 0, 0, 0,
            5, 1, 117, 0, 9, 0, 0, 0,
            8, 1, 103, 0, 1, 120, 0, 0,
            42, 0, 0, 0, 0, 0, 0, 0,
        ];
        #[rustfmt::skip]
        let be: &[u8] = &[
            b'B', 2, 1, 1, 0, 0, 0, 8, 0, 0, 0, 3, 0, 0, 0, 15,
            5, 1, 117, 0, 0, 0, 0, 9,
            8, 1, 103, 0, 1, 120, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 42,
        ];
        let a = Message::parse(le, vec![]).unwrap().unwrap();
        let b = Message::parse(be, vec![]).unwrap().unwrap();
        assert!(!a.is_big_endian());
        assert!(b.is_big_endian());
        assert_eq!(a.serial(), b.serial());
        assert_eq!(a.reply_serial(), Some(nz(9)));
        assert_eq!(b.reply_serial(), Some(nz(9)));
        assert_eq!(a.args(), b.args());
        assert_eq!(a.args(), &[Value::Int64(42)][..]);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let mut packet = hello().marshall(nz(1)).unwrap();
        packet.data[1] = 9;
        assert!(Message::parse(&packet.data, vec![]).unwrap().is_none());
    }

    #[test]
    fn oversize_header_is_rejected() {
        let mut first16 = [0u8; 16];
        first16[0] = b'l';
        first16[1] = 1;
        first16[3] = 1;
        first16[12..16].copy_from_slice(&(types::MAX_ARRAY_SIZE as u32 + 1).to_le_bytes());
        assert!(total_message_size(&first16).is_err());
    }
}
