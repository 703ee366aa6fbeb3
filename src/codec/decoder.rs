use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{padding_for, Endianness};
use crate::error::{Error, Result};
use crate::signature::Signature;
use crate::types::{alignment_of, Array, ObjectPath, Value};

/// Unmarshals typed values from a byte slice.
///
/// The decoder position is a stream offset: when decoding a fragment that
/// did not start at stream offset zero (header fields, a body slice), the
/// caller supplies the base via [`Decoder::with_offset`] so alignment
/// arithmetic matches the sender's.
pub struct Decoder<'a> {
    buf: &'a [u8],
    endianness: Endianness,
    /// Stream offset of buf[0].
    base: usize,
    /// Cursor relative to buf[0].
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], endianness: Endianness) -> Self {
        Self::with_offset(buf, endianness, 0)
    }

    /// A decoder whose first byte sits at stream offset `base`.
    pub fn with_offset(buf: &'a [u8], endianness: Endianness, base: usize) -> Self {
        Decoder {
            buf,
            endianness,
            base,
            pos: 0,
        }
    }

    /// Current stream offset.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// Bytes left in the slice.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::CodecDecode(format!(
                "need {n} bytes but only {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip padding up to `align`, failing if it runs past the slice.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let pad = padding_for(self.offset(), align);
        self.take(pad).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.take(2)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u16(bytes),
            Endianness::Big => BigEndian::read_u16(bytes),
        })
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.get_u16().map(|v| v as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u32(bytes),
            Endianness::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.get_u32().map(|v| v as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.take(8)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(bytes),
            Endianness::Big => BigEndian::read_u64(bytes),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.get_u64().map(|v| v as i64)
    }

    pub fn get_double(&mut self) -> Result<f64> {
        self.get_u64().map(f64::from_bits)
    }

    /// BOOLEAN is a UINT32 restricted to 0 or 1.
    pub fn get_boolean(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::CodecDecode(format!("invalid boolean value {other}"))),
        }
    }

    /// UINT32 length, UTF-8 bytes, trailing NUL.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        let nul = self.take(1)?[0];
        if nul != 0 {
            return Err(Error::CodecDecode("string lacks trailing NUL".into()));
        }
        if bytes.contains(&0) {
            return Err(Error::CodecDecode("string contains interior NUL".into()));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::CodecDecode("string is not valid UTF-8".into()))
    }

    pub fn get_object_path(&mut self) -> Result<ObjectPath> {
        let s = self.get_string()?;
        ObjectPath::parse(&s).map_err(|e| Error::CodecDecode(format!("object path {s:?}: {e}")))
    }

    /// UINT8 length, ASCII bytes, trailing NUL.
    pub fn get_signature(&mut self) -> Result<Signature> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        let nul = self.take(1)?[0];
        if nul != 0 {
            return Err(Error::CodecDecode("signature lacks trailing NUL".into()));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::CodecDecode("signature is not ASCII".into()))?;
        Signature::parse(text).map_err(|e| Error::CodecDecode(format!("signature {text:?}: {e}")))
    }

    /// Unmarshal one value of the single complete type `sig`.
    pub fn get_value(&mut self, sig: &str) -> Result<Value> {
        let code = sig
            .as_bytes()
            .first()
            .copied()
            .ok_or_else(|| Error::CodecDecode("empty type in signature".into()))?;
        Ok(match code {
            b'y' => Value::Byte(self.get_u8()?),
            b'b' => Value::Boolean(self.get_boolean()?),
            b'n' => Value::Int16(self.get_i16()?),
            b'q' => Value::Uint16(self.get_u16()?),
            b'i' => Value::Int32(self.get_i32()?),
            b'u' => Value::Uint32(self.get_u32()?),
            b'x' => Value::Int64(self.get_i64()?),
            b't' => Value::Uint64(self.get_u64()?),
            b'd' => Value::Double(self.get_double()?),
            b's' => Value::Str(self.get_string()?),
            b'o' => Value::ObjectPath(self.get_object_path()?),
            b'g' => Value::Signature(self.get_signature()?),
            b'h' => Value::UnixFd(self.get_u32()?),
            b'a' => {
                let elem_sig = &sig[1..];
                let len = self.get_u32()? as usize;
                if len > crate::frame::MAX_ARRAY_LEN {
                    return Err(Error::CodecDecode(format!(
                        "array length {len} exceeds the protocol maximum"
                    )));
                }
                self.align(alignment_of(elem_sig))?;
                if len > self.remaining() {
                    return Err(Error::CodecDecode(format!(
                        "array claims {len} bytes but only {} remain",
                        self.remaining()
                    )));
                }
                let end = self.pos + len;
                let elem_signature = Signature::parse_array_element(elem_sig)
                    .map_err(|e| Error::CodecDecode(format!("array element type: {e}")))?;
                let mut array = Array::new(elem_signature)
                    .map_err(|e| Error::CodecDecode(e.to_string()))?;
                while self.pos < end {
                    let item = self.get_value(elem_sig)?;
                    array
                        .push(item)
                        .map_err(|e| Error::CodecDecode(e.to_string()))?;
                }
                if self.pos != end {
                    return Err(Error::CodecDecode(
                        "array elements overran the declared length".into(),
                    ));
                }
                Value::Array(array)
            }
            b'(' => {
                self.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                let inner_sig = Signature::parse(inner)
                    .map_err(|e| Error::CodecDecode(format!("struct fields: {e}")))?;
                let mut fields = Vec::new();
                for field_sig in inner_sig.iter() {
                    fields.push(self.get_value(field_sig)?);
                }
                Value::Struct(fields)
            }
            b'{' => {
                self.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                let inner_sig = Signature::parse(inner)
                    .map_err(|e| Error::CodecDecode(format!("dict entry: {e}")))?;
                let mut it = inner_sig.iter();
                let (key_sig, value_sig) = match (it.next(), it.next(), it.next()) {
                    (Some(k), Some(v), None) => (k, v),
                    _ => return Err(Error::CodecDecode("dict entry needs a key and a value".into())),
                };
                let key = self.get_value(key_sig)?;
                let value = self.get_value(value_sig)?;
                Value::DictEntry(Box::new(key), Box::new(value))
            }
            b'v' => {
                let inner_sig = self.get_signature()?;
                if !inner_sig.is_single_complete() {
                    return Err(Error::CodecDecode(format!(
                        "variant signature {inner_sig:?} is not a single complete type"
                    )));
                }
                let inner = self.get_value(inner_sig.as_str())?;
                Value::Variant(Box::new(inner))
            }
            other => {
                return Err(Error::CodecDecode(format!(
                    "unknown type code {:?}",
                    other as char
                )))
            }
        })
    }

    /// Unmarshal a whole value sequence per its signature.
    pub fn get_values(&mut self, signature: &Signature) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        for sig in signature.iter() {
            values.push(self.get_value(sig)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use crate::types::signature_of;

    fn round_trip(values: Vec<Value>, endianness: Endianness) {
        let signature = signature_of(&values);
        let mut enc = Encoder::new(endianness);
        enc.put_values(&signature, &values).unwrap();
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes, endianness);
        let decoded = dec.get_values(&signature).unwrap();
        assert_eq!(decoded, values);
        assert!(dec.is_exhausted());
    }

    #[test]
    fn round_trips_both_endiannesses() {
        let values = vec![
            Value::Byte(7),
            Value::Boolean(true),
            Value::Int16(-2),
            Value::Uint16(9),
            Value::Int32(-100),
            Value::Uint32(100),
            Value::Int64(-1_000_000),
            Value::Uint64(1_000_000),
            Value::Double(3.5),
            Value::Str("hello world".into()),
            Value::ObjectPath(ObjectPath::parse("/org/freedesktop/DBus").unwrap()),
            Value::Signature(Signature::parse("a{sv}").unwrap()),
            Value::Variant(Box::new(Value::Str("varied".into()))),
        ];
        round_trip(values.clone(), Endianness::Little);
        round_trip(values, Endianness::Big);
    }

    #[test]
    fn round_trips_nested_containers() {
        let mut dict = Array::of_type("{sv}").unwrap();
        dict.push(Value::DictEntry(
            Box::new(Value::Str("depth".into())),
            Box::new(Value::Variant(Box::new(Value::Struct(vec![
                Value::Uint32(1),
                Value::Array(Array::from_values(vec![Value::Byte(1), Value::Byte(2)]).unwrap()),
            ])))),
        ))
        .unwrap();
        round_trip(vec![Value::Array(dict)], Endianness::Little);
    }

    #[test]
    fn round_trips_empty_array() {
        round_trip(
            vec![Value::Array(Array::of_type("(ii)").unwrap())],
            Endianness::Little,
        );
    }

    #[test]
    fn rejects_bad_boolean() {
        let bytes = [2u8, 0, 0, 0];
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("b"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_string_without_nul() {
        let bytes = [1u8, 0, 0, 0, b'a', 1];
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("s"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let bytes = [1u8, 0, 0, 0, 0xFF, 0];
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("s"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_invalid_object_path() {
        let mut enc = Encoder::new(Endianness::Little);
        enc.put_string("not/rooted");
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("o"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_array_longer_than_frame() {
        // Array claims 100 bytes but the slice ends after the length.
        let bytes = [100u8, 0, 0, 0];
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("ai"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_multi_type_variant_signature() {
        let mut enc = Encoder::new(Endianness::Little);
        enc.put_signature(&Signature::parse("ii").unwrap());
        enc.put_value(&Value::Int32(1)).unwrap();
        enc.put_value(&Value::Int32(2)).unwrap();
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("v"), Err(Error::CodecDecode(_))));
    }

    #[test]
    fn rejects_truncated_scalar() {
        let bytes = [1u8, 0];
        let mut dec = Decoder::new(&bytes, Endianness::Little);
        assert!(matches!(dec.get_value("u"), Err(Error::CodecDecode(_))));
    }
}
