//! # Messages
//!
//! The in-memory form of a D-Bus message: type, flags, serial, header
//! fields, and a typed body. Construction goes through [`MessageBuilder`],
//! which validates names eagerly and enforces the per-type required header
//! fields at [`MessageBuilder::build`] time; the decoder applies the same
//! presence rules to inbound frames.
//!
//! Required header fields by message type:
//!
//! | type          | required                         |
//! |---------------|----------------------------------|
//! | method_call   | PATH, MEMBER                     |
//! | method_return | REPLY_SERIAL                     |
//! | error         | ERROR_NAME, REPLY_SERIAL         |
//! | signal        | PATH, INTERFACE, MEMBER          |

use std::str::FromStr;

use crate::codec::Endianness;
use crate::error::{Error, Result};
use crate::names::{BusName, ErrorName, InterfaceName, MemberName};
use crate::signature::Signature;
use crate::types::{signature_of, ObjectPath, Value};

/// The protocol version this library speaks; the only one defined.
pub const PROTOCOL_VERSION: u8 = 1;

/// The four message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// May prompt a reply unless NO_REPLY_EXPECTED is set.
    MethodCall = 1,
    /// Reply carrying returned data.
    MethodReturn = 2,
    /// Reply carrying an error name and optional message.
    Error = 3,
    /// Broadcast emission; never replied to.
    Signal = 4,
}

impl MessageType {
    pub fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Message flags. Unknown bits received from the wire are dropped.
    pub struct MessageFlags: u8 {
        /// No method return or error is wanted for this call.
        const NO_REPLY_EXPECTED = 0x1;
        /// The bus must not auto-start an owner for the destination.
        const NO_AUTO_START = 0x2;
        /// The caller will wait for interactive authorization.
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// Header field codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderFieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// A complete message.
///
/// The body signature is derived from the body values; a `SIGNATURE` header
/// field is emitted only when the body is non-empty. `serial` is stamped by
/// the connection engine just before encoding and must never be zero on the
/// wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) endianness: Endianness,
    pub(crate) message_type: MessageType,
    pub(crate) flags: MessageFlags,
    pub(crate) serial: u32,
    pub(crate) path: Option<ObjectPath>,
    pub(crate) interface: Option<InterfaceName>,
    pub(crate) member: Option<MemberName>,
    pub(crate) error_name: Option<ErrorName>,
    pub(crate) reply_serial: Option<u32>,
    pub(crate) destination: Option<BusName>,
    pub(crate) sender: Option<BusName>,
    pub(crate) unix_fds: Option<u32>,
    pub(crate) body: Vec<Value>,
}

impl Message {
    /// Start a method call to `path`/`member`.
    pub fn method_call(path: &str, member: &str) -> MessageBuilder {
        let mut builder = MessageBuilder::new(MessageType::MethodCall);
        builder.set_path(path);
        builder.set_member(member);
        builder
    }

    /// Start a method return for the call with serial `reply_serial`.
    pub fn method_return(reply_serial: u32) -> MessageBuilder {
        let mut builder = MessageBuilder::new(MessageType::MethodReturn);
        builder.message.reply_serial = Some(reply_serial);
        builder
    }

    /// Start an error reply for the call with serial `reply_serial`.
    pub fn error(error_name: &str, reply_serial: u32) -> MessageBuilder {
        let mut builder = MessageBuilder::new(MessageType::Error);
        builder.set_error_name(error_name);
        builder.message.reply_serial = Some(reply_serial);
        builder
    }

    /// Start a signal emission.
    pub fn signal(path: &str, interface: &str, member: &str) -> MessageBuilder {
        let mut builder = MessageBuilder::new(MessageType::Signal);
        builder.set_path(path);
        builder.set_interface(interface);
        builder.set_member(member);
        builder
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_ref().map(InterfaceName::as_str)
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_ref().map(MemberName::as_str)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_ref().map(ErrorName::as_str)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_ref().map(BusName::as_str)
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_ref().map(BusName::as_str)
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Signature of the body values.
    pub fn body_signature(&self) -> Signature {
        signature_of(&self.body)
    }

    /// True when the sender does not want a reply to this call.
    pub fn wants_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Enforce the per-type required header fields.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(Error::MessageInvalid(format!(
                "{:?} requires the {field} header field",
                self.message_type
            )))
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return missing("PATH");
                }
                if self.member.is_none() {
                    return missing("MEMBER");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("REPLY_SERIAL");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return missing("ERROR_NAME");
                }
                if self.reply_serial.is_none() {
                    return missing("REPLY_SERIAL");
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return missing("PATH");
                }
                if self.interface.is_none() {
                    return missing("INTERFACE");
                }
                if self.member.is_none() {
                    return missing("MEMBER");
                }
            }
        }
        Ok(())
    }

    /// For an error message, the first string body argument.
    pub fn error_message_text(&self) -> &str {
        match self.body.first() {
            Some(Value::Str(s)) => s,
            _ => "",
        }
    }
}

/// Builder for [`Message`]. Name arguments are validated as they are set;
/// the first violation is reported by [`MessageBuilder::build`].
pub struct MessageBuilder {
    message: Message,
    error: Option<Error>,
}

impl MessageBuilder {
    fn new(message_type: MessageType) -> Self {
        MessageBuilder {
            message: Message {
                endianness: Endianness::default(),
                message_type,
                flags: MessageFlags::empty(),
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: None,
                reply_serial: None,
                destination: None,
                sender: None,
                unix_fds: None,
                body: Vec::new(),
            },
            error: None,
        }
    }

    fn record_err(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn set_path(&mut self, path: &str) {
        match ObjectPath::parse(path) {
            Ok(p) => self.message.path = Some(p),
            Err(e) => self.record_err(Error::MessageInvalid(format!("path {path:?}: {e}"))),
        }
    }

    fn set_member(&mut self, member: &str) {
        match MemberName::from_str(member) {
            Ok(m) => self.message.member = Some(m),
            Err(e) => self.record_err(Error::Name(format!("member {member:?}: {e}"))),
        }
    }

    fn set_interface(&mut self, interface: &str) {
        match InterfaceName::from_str(interface) {
            Ok(i) => self.message.interface = Some(i),
            Err(e) => self.record_err(Error::Name(format!("interface {interface:?}: {e}"))),
        }
    }

    fn set_error_name(&mut self, name: &str) {
        match ErrorName::from_str(name) {
            Ok(n) => self.message.error_name = Some(n),
            Err(e) => self.record_err(Error::Name(format!("error name {name:?}: {e}"))),
        }
    }

    /// Set the INTERFACE field.
    pub fn interface(mut self, interface: &str) -> Self {
        self.set_interface(interface);
        self
    }

    /// Set the DESTINATION field.
    pub fn destination(mut self, destination: &str) -> Self {
        match BusName::from_str(destination) {
            Ok(d) => self.message.destination = Some(d),
            Err(e) => self.record_err(Error::Name(format!("destination {destination:?}: {e}"))),
        }
        self
    }

    /// Set the SENDER field (normally filled in by the daemon).
    pub fn sender(mut self, sender: &str) -> Self {
        match BusName::from_str(sender) {
            Ok(s) => self.message.sender = Some(s),
            Err(e) => self.record_err(Error::Name(format!("sender {sender:?}: {e}"))),
        }
        self
    }

    /// Add a flag.
    pub fn with_flag(mut self, flag: MessageFlags) -> Self {
        self.message.flags |= flag;
        self
    }

    /// Choose the wire endianness; little-endian by default.
    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.message.endianness = endianness;
        self
    }

    /// Set the body value list.
    pub fn body(mut self, body: Vec<Value>) -> Self {
        self.message.body = body;
        self
    }

    /// Pre-assign a serial; normally left to the connection engine.
    pub fn serial(mut self, serial: u32) -> Self {
        self.message.serial = serial;
        self
    }

    /// Finish, reporting the first recorded violation if any.
    pub fn build(self) -> Result<Message> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.message.validate()?;
        Ok(self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_requires_path_and_member() {
        let msg = Message::method_call("/org/freedesktop/DBus", "Ping")
            .interface("org.freedesktop.DBus.Peer")
            .destination("org.freedesktop.DBus")
            .build()
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::MethodCall);
        assert!(msg.wants_reply());
        assert_eq!(msg.member(), Some("Ping"));

        let mut builder = MessageBuilder::new(MessageType::MethodCall);
        builder.set_member("Ping");
        assert!(matches!(builder.build(), Err(Error::MessageInvalid(_))));
    }

    #[test]
    fn error_requires_name_and_reply_serial() {
        let msg = Message::error("org.freedesktop.DBus.Error.Failed", 7)
            .body(vec![Value::Str("went sideways".into())])
            .build()
            .unwrap();
        assert_eq!(msg.reply_serial(), Some(7));
        assert_eq!(msg.error_message_text(), "went sideways");

        let mut builder = MessageBuilder::new(MessageType::Error);
        builder.message.reply_serial = Some(7);
        assert!(matches!(builder.build(), Err(Error::MessageInvalid(_))));
    }

    #[test]
    fn signal_requires_path_interface_member() {
        assert!(Message::signal("/org/example", "org.example.Iface", "Changed")
            .build()
            .is_ok());
        let mut builder = MessageBuilder::new(MessageType::Signal);
        builder.set_path("/org/example");
        builder.set_member("Changed");
        assert!(matches!(builder.build(), Err(Error::MessageInvalid(_))));
    }

    #[test]
    fn invalid_names_surface_at_build() {
        let result = Message::method_call("/ok", "Ping")
            .destination("not a bus name")
            .build();
        assert!(matches!(result, Err(Error::Name(_))));
    }

    #[test]
    fn no_reply_expected_suppresses_reply() {
        let msg = Message::method_call("/x", "Notify")
            .with_flag(MessageFlags::NO_REPLY_EXPECTED)
            .build()
            .unwrap();
        assert!(!msg.wants_reply());
    }

    #[test]
    fn body_signature_follows_values() {
        let msg = Message::method_call("/x", "M")
            .body(vec![Value::Str("a".into()), Value::Uint32(2)])
            .build()
            .unwrap();
        assert_eq!(msg.body_signature().as_str(), "su");
    }
}
