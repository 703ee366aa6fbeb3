//! # Frame Codec
//!
//! Assembles and parses complete wire frames: the 16-byte fixed header, the
//! header-field array, alignment padding, and the body. Inbound bytes are
//! accumulated in [`FrameDecoder`] across transport reads; a frame is only
//! surfaced once `16 + pad8(field_bytes) + body_bytes` are buffered.
//!
//! Size limits are enforced in both directions: no frame larger than
//! [`MAX_MESSAGE_SIZE`] is produced or accepted, and the limit is applied
//! to the *declared* lengths before waiting for more bytes, so an absurd
//! header is rejected without buffering gigabytes.

use std::str::FromStr;

use tracing::trace;

use crate::codec::{padding_for, Decoder, Encoder, Endianness};
use crate::error::{Error, Result};
use crate::message::{
    HeaderFieldCode, Message, MessageFlags, MessageType, PROTOCOL_VERSION,
};
use crate::names::{BusName, ErrorName, InterfaceName, MemberName};
use crate::signature::Signature;
use crate::types::{Array, Value};

/// Hard cap on a complete message: 2^27 bytes (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Hard cap on a single marshalled array: 2^26 bytes (64 MiB).
pub const MAX_ARRAY_LEN: usize = 1 << 26;

/// Bytes of fixed header before the header-field array elements.
pub const FIXED_HEADER_LEN: usize = 16;

/// Encode a complete message to wire bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.validate()?;
    if message.serial == 0 {
        return Err(Error::MessageInvalid("serial must be non-zero".into()));
    }

    // Body first: its length is needed in the fixed header. The body starts
    // at an 8-aligned stream offset, so encoding it from offset zero keeps
    // the padding arithmetic identical.
    let mut body_enc = Encoder::new(message.endianness);
    for value in &message.body {
        body_enc.put_value(value)?;
    }
    let body = body_enc.into_bytes();

    let fields = header_fields_value(message, !body.is_empty())?;

    let mut enc = Encoder::new(message.endianness);
    enc.put_u8(message.endianness.wire_byte());
    enc.put_u8(message.message_type as u8);
    enc.put_u8(message.flags.bits());
    enc.put_u8(PROTOCOL_VERSION);
    enc.put_u32(body.len() as u32);
    enc.put_u32(message.serial);
    enc.put_value(&fields)?;
    enc.align(8);
    enc.put_bytes(&body);

    let bytes = enc.into_bytes();
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::CodecEncode(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_SIZE}-byte maximum",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// The header-field array as a marshallable `a(yv)` value.
fn header_fields_value(message: &Message, include_signature: bool) -> Result<Value> {
    let mut fields = Array::of_type("(yv)").expect("static signature");
    let mut push = |code: HeaderFieldCode, value: Value| {
        fields
            .push(Value::Struct(vec![
                Value::Byte(code as u8),
                Value::Variant(Box::new(value)),
            ]))
            .expect("header field entries are (yv) by construction");
    };

    if let Some(path) = &message.path {
        push(HeaderFieldCode::Path, Value::ObjectPath(path.clone()));
    }
    if let Some(interface) = &message.interface {
        push(
            HeaderFieldCode::Interface,
            Value::Str(interface.as_str().to_owned()),
        );
    }
    if let Some(member) = &message.member {
        push(
            HeaderFieldCode::Member,
            Value::Str(member.as_str().to_owned()),
        );
    }
    if let Some(error_name) = &message.error_name {
        push(
            HeaderFieldCode::ErrorName,
            Value::Str(error_name.as_str().to_owned()),
        );
    }
    if let Some(reply_serial) = message.reply_serial {
        push(HeaderFieldCode::ReplySerial, Value::Uint32(reply_serial));
    }
    if let Some(destination) = &message.destination {
        push(
            HeaderFieldCode::Destination,
            Value::Str(destination.as_str().to_owned()),
        );
    }
    if let Some(sender) = &message.sender {
        push(
            HeaderFieldCode::Sender,
            Value::Str(sender.as_str().to_owned()),
        );
    }
    if include_signature {
        push(
            HeaderFieldCode::Signature,
            Value::Signature(message.body_signature()),
        );
    }
    if let Some(unix_fds) = message.unix_fds {
        push(HeaderFieldCode::UnixFds, Value::Uint32(unix_fds));
    }
    Ok(Value::Array(fields))
}

/// Streaming frame reassembler.
///
/// Feed transport reads with [`FrameDecoder::extend`] and drain complete
/// messages with [`FrameDecoder::next_frame`]. Partial frames stay buffered;
/// a decode error poisons the stream and the connection must be torn down.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame. `Ok(None)` means more bytes
    /// are needed.
    pub fn next_frame(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        let endianness = Endianness::from_wire_byte(self.buf[0]).ok_or_else(|| {
            Error::CodecDecode(format!("invalid endianness byte 0x{:02x}", self.buf[0]))
        })?;
        let message_type = MessageType::from_wire(self.buf[1])
            .ok_or_else(|| Error::CodecDecode(format!("unknown message type {}", self.buf[1])))?;
        let flags = MessageFlags::from_bits_truncate(self.buf[2]);
        if self.buf[3] != PROTOCOL_VERSION {
            return Err(Error::CodecDecode(format!(
                "unsupported protocol version {}",
                self.buf[3]
            )));
        }

        let mut fixed = Decoder::with_offset(&self.buf[4..FIXED_HEADER_LEN], endianness, 4);
        let body_len = fixed.get_u32()? as usize;
        let serial = fixed.get_u32()?;
        let fields_len = fixed.get_u32()? as usize;
        if serial == 0 {
            return Err(Error::CodecDecode("message serial is zero".into()));
        }
        if fields_len > MAX_ARRAY_LEN {
            return Err(Error::CodecDecode(format!(
                "header field array of {fields_len} bytes exceeds the protocol maximum"
            )));
        }

        let fields_end = FIXED_HEADER_LEN + fields_len;
        let body_start = fields_end + padding_for(fields_end, 8);
        let total = body_start
            .checked_add(body_len)
            .ok_or_else(|| Error::CodecDecode("message length overflow".into()))?;
        // Enforce the cap on declared lengths before waiting for the bytes.
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::CodecDecode(format!(
                "message of {total} bytes exceeds the {MAX_MESSAGE_SIZE}-byte maximum"
            )));
        }
        if self.buf.len() < total {
            trace!(
                buffered = self.buf.len(),
                needed = total,
                "frame incomplete, waiting for more bytes"
            );
            return Ok(None);
        }

        let message = Self::parse_frame(
            &self.buf[..total],
            endianness,
            message_type,
            flags,
            serial,
            fields_end,
            body_start,
        )?;
        self.buf.drain(..total);
        Ok(Some(message))
    }

    fn parse_frame(
        frame: &[u8],
        endianness: Endianness,
        message_type: MessageType,
        flags: MessageFlags,
        serial: u32,
        fields_end: usize,
        body_start: usize,
    ) -> Result<Message> {
        let mut message = Message {
            endianness,
            message_type,
            flags,
            serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            unix_fds: None,
            body: Vec::new(),
        };
        let mut body_signature = Signature::empty();

        // The field array starts at offset 12 with its own length prefix;
        // decoding it as a single a(yv) value reuses all the codec checks.
        let mut fields_dec = Decoder::with_offset(&frame[12..fields_end], endianness, 12);
        let fields = fields_dec.get_value("a(yv)")?;
        if !fields_dec.is_exhausted() {
            return Err(Error::CodecDecode(
                "header field array shorter than declared".into(),
            ));
        }
        let Value::Array(entries) = fields else {
            unreachable!("a(yv) decodes to an array");
        };
        for entry in entries.items() {
            let Value::Struct(parts) = entry else {
                unreachable!("(yv) decodes to a struct");
            };
            let (Some(Value::Byte(code)), Some(Value::Variant(value))) =
                (parts.first(), parts.get(1))
            else {
                unreachable!("(yv) decodes to byte + variant");
            };
            Self::apply_field(&mut message, &mut body_signature, *code, value)?;
        }

        let mut body_dec = Decoder::with_offset(&frame[body_start..], endianness, body_start);
        message.body = body_dec.get_values(&body_signature)?;
        if !body_dec.is_exhausted() {
            return Err(Error::CodecDecode(
                "body longer than its signature describes".into(),
            ));
        }

        message.validate()?;
        Ok(message)
    }

    fn apply_field(
        message: &mut Message,
        body_signature: &mut Signature,
        code: u8,
        value: &Value,
    ) -> Result<()> {
        let type_mismatch = |code: u8, value: &Value| {
            Err(Error::MessageInvalid(format!(
                "header field {code} carries unexpected type {}",
                value.type_signature()
            )))
        };
        match code {
            1 => match value {
                Value::ObjectPath(path) => message.path = Some(path.clone()),
                other => return type_mismatch(code, other),
            },
            2 => match value {
                Value::Str(s) => {
                    message.interface = Some(
                        InterfaceName::from_str(s)
                            .map_err(|e| Error::MessageInvalid(format!("INTERFACE: {e}")))?,
                    )
                }
                other => return type_mismatch(code, other),
            },
            3 => match value {
                Value::Str(s) => {
                    message.member = Some(
                        MemberName::from_str(s)
                            .map_err(|e| Error::MessageInvalid(format!("MEMBER: {e}")))?,
                    )
                }
                other => return type_mismatch(code, other),
            },
            4 => match value {
                Value::Str(s) => {
                    message.error_name = Some(
                        ErrorName::from_str(s)
                            .map_err(|e| Error::MessageInvalid(format!("ERROR_NAME: {e}")))?,
                    )
                }
                other => return type_mismatch(code, other),
            },
            5 => match value {
                Value::Uint32(serial) => message.reply_serial = Some(*serial),
                other => return type_mismatch(code, other),
            },
            6 => match value {
                Value::Str(s) => {
                    message.destination = Some(
                        BusName::from_str(s)
                            .map_err(|e| Error::MessageInvalid(format!("DESTINATION: {e}")))?,
                    )
                }
                other => return type_mismatch(code, other),
            },
            7 => match value {
                Value::Str(s) => {
                    message.sender = Some(
                        BusName::from_str(s)
                            .map_err(|e| Error::MessageInvalid(format!("SENDER: {e}")))?,
                    )
                }
                other => return type_mismatch(code, other),
            },
            8 => match value {
                Value::Signature(sig) => *body_signature = sig.clone(),
                other => return type_mismatch(code, other),
            },
            9 => match value {
                Value::Uint32(count) => message.unix_fds = Some(*count),
                other => return type_mismatch(code, other),
            },
            // Unknown field codes must be ignored for forward compatibility.
            _ => {}
        }
        Ok(())
    }
}
