use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{padding_for, Endianness};
use crate::error::{Error, Result};
use crate::signature::Signature;
use crate::types::{Value, signature_of};

/// Marshals typed values into a growable byte buffer.
///
/// The encoder tracks the running stream offset (equal to the buffer length
/// when encoding starts at offset zero) and inserts alignment padding before
/// every value. An encoder can be created at a non-zero logical offset with
/// [`Encoder::with_offset`] when the produced bytes will be appended to an
/// existing stream.
pub struct Encoder {
    buf: Vec<u8>,
    endianness: Endianness,
    /// Logical stream position of buf[0]; alignment is computed against
    /// `base + buf.len()`, not the buffer length alone.
    base: usize,
}

impl Encoder {
    pub fn new(endianness: Endianness) -> Self {
        Self::with_offset(endianness, 0)
    }

    /// An encoder whose first byte lands at stream offset `base`.
    pub fn with_offset(endianness: Endianness, base: usize) -> Self {
        Encoder {
            buf: Vec::new(),
            endianness,
            base,
        }
    }

    /// Current stream offset.
    pub fn offset(&self) -> usize {
        self.base + self.buf.len()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder, yielding its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write zero bytes until the stream offset reaches `align`.
    pub fn align(&mut self, align: usize) {
        let pad = padding_for(self.offset(), align);
        self.buf.resize(self.buf.len() + pad, 0);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Raw bytes with no alignment; used for header copies and SASL bodies.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.align(2);
        let mut tmp = [0u8; 2];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u16(&mut tmp, v),
            Endianness::Big => BigEndian::write_u16(&mut tmp, v),
        }
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_u16(v as u16);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.align(4);
        let mut tmp = [0u8; 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(&mut tmp, v),
            Endianness::Big => BigEndian::write_u32(&mut tmp, v),
        }
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.align(8);
        let mut tmp = [0u8; 8];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u64(&mut tmp, v),
            Endianness::Big => BigEndian::write_u64(&mut tmp, v),
        }
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_double(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    /// UINT32 length, UTF-8 bytes, trailing NUL.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// UINT8 length, ASCII bytes, trailing NUL. Signatures are 1-aligned.
    pub fn put_signature(&mut self, sig: &Signature) {
        self.put_u8(sig.as_str().len() as u8);
        self.buf.extend_from_slice(sig.as_str().as_bytes());
        self.buf.push(0);
    }

    /// Overwrite four bytes at buffer position `pos` with `v`; used to
    /// back-patch array lengths once the element span is known.
    fn patch_u32(&mut self, pos: usize, v: u32) {
        let slot = &mut self.buf[pos..pos + 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(slot, v),
            Endianness::Big => BigEndian::write_u32(slot, v),
        }
    }

    /// Marshal one value, padding first to its alignment.
    pub fn put_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_i16(*v),
            Value::Uint16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_i32(*v),
            Value::Uint32(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_i64(*v),
            Value::Uint64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_double(*v),
            Value::Str(v) => self.put_string(v),
            Value::ObjectPath(v) => self.put_string(v.as_str()),
            Value::Signature(v) => self.put_signature(v),
            Value::UnixFd(v) => self.put_u32(*v),
            Value::Array(array) => {
                self.put_u32(0); // length placeholder, patched below
                let len_pos = self.buf.len() - 4;
                self.align(crate::types::alignment_of(array.element_signature().as_str()));
                let body_start = self.offset();
                for item in array.items() {
                    self.put_value(item)?;
                }
                let body_len = self.offset() - body_start;
                if body_len > crate::frame::MAX_ARRAY_LEN {
                    return Err(Error::CodecEncode(format!(
                        "array of {body_len} bytes exceeds the protocol maximum"
                    )));
                }
                self.patch_u32(len_pos, body_len as u32);
            }
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.put_value(field)?;
                }
            }
            Value::DictEntry(key, val) => {
                self.align(8);
                self.put_value(key)?;
                self.put_value(val)?;
            }
            Value::Variant(inner) => {
                let sig = inner.type_signature();
                self.put_signature(&sig);
                self.put_value(inner)?;
            }
        }
        Ok(())
    }

    /// Marshal a value sequence, verifying it against a declared signature.
    pub fn put_values(&mut self, signature: &Signature, values: &[Value]) -> Result<()> {
        let actual = signature_of(values);
        if &actual != signature {
            return Err(Error::CodecEncode(format!(
                "value list has signature {actual} but {signature} was declared"
            )));
        }
        for value in values {
            self.put_value(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Array;

    fn encode(value: &Value) -> Vec<u8> {
        let mut enc = Encoder::new(Endianness::Little);
        enc.put_value(value).unwrap();
        enc.into_bytes()
    }

    #[test]
    fn scalars_little_endian() {
        assert_eq!(encode(&Value::Byte(0xAB)), vec![0xAB]);
        assert_eq!(encode(&Value::Uint32(1)), vec![1, 0, 0, 0]);
        assert_eq!(encode(&Value::Boolean(true)), vec![1, 0, 0, 0]);
        assert_eq!(
            encode(&Value::Uint64(0x0102030405060708)),
            vec![8, 7, 6, 5, 4, 3, 2, 1]
        );
    }

    #[test]
    fn scalars_big_endian() {
        let mut enc = Encoder::new(Endianness::Big);
        enc.put_value(&Value::Uint32(1)).unwrap();
        assert_eq!(enc.into_bytes(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn alignment_padding_depends_on_offset() {
        let mut enc = Encoder::new(Endianness::Little);
        enc.put_value(&Value::Byte(1)).unwrap();
        enc.put_value(&Value::Uint32(2)).unwrap();
        // One byte, three pad bytes, then the u32.
        assert_eq!(enc.into_bytes(), vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn offset_zero_values_carry_no_leading_pad() {
        for value in [
            Value::Byte(1),
            Value::Uint32(1),
            Value::Uint64(1),
            Value::Struct(vec![Value::Byte(1)]),
        ] {
            let bytes = encode(&value);
            assert_ne!(bytes[0], 0, "no leading padding expected at offset 0");
        }
    }

    #[test]
    fn string_layout() {
        assert_eq!(
            encode(&Value::Str("foo".into())),
            vec![3, 0, 0, 0, b'f', b'o', b'o', 0]
        );
    }

    #[test]
    fn array_length_is_back_patched() {
        let array = Array::from_values(vec![Value::Uint32(1), Value::Uint32(2)]).unwrap();
        let bytes = encode(&Value::Array(array));
        // Length prefix counts element bytes only (8), not itself.
        assert_eq!(bytes, vec![8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn array_of_eight_aligned_elements_pads_after_length() {
        let array = Array::from_values(vec![Value::Uint64(1)]).unwrap();
        let bytes = encode(&Value::Array(array));
        // u32 length, 4 pad bytes to reach the element alignment, element.
        assert_eq!(bytes.len(), 4 + 4 + 8);
        assert_eq!(&bytes[..4], &[8, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn variant_carries_inline_signature() {
        let bytes = encode(&Value::Variant(Box::new(Value::Uint32(5))));
        // 1-byte sig length, "u", NUL, one pad byte, value.
        assert_eq!(bytes, vec![1, b'u', 0, 0, 5, 0, 0, 0]);
    }

    #[test]
    fn declared_signature_mismatch_is_rejected() {
        let mut enc = Encoder::new(Endianness::Little);
        let err = enc
            .put_values(&Signature::parse("s").unwrap(), &[Value::Uint32(1)])
            .unwrap_err();
        assert!(matches!(err, Error::CodecEncode(_)));
    }
}
