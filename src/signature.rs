//! # Signature Validation and Iteration
//!
//! A D-Bus signature is an ASCII string of type codes describing a sequence
//! of marshalled values. This module owns the grammar: validation on
//! construction and iteration over the *single complete types* a signature
//! is made of.
//!
//! The grammar enforced here:
//!
//! - only the codes `ybnqiuxtdsogavh(){}` may appear;
//! - at most 255 bytes and 32 levels of container nesting;
//! - `a` must be followed by a single complete type (no trailing `a`);
//! - structs are parenthesized, non-empty, and must be closed;
//! - dict entries `{kv}` appear only as the element of an array, hold
//!   exactly one basic key and one complete value type.

use std::fmt;

use thiserror::Error;

/// Upper bound on the byte length of a signature, from the wire format
/// (the SIGNATURE type carries a single length byte).
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum container nesting depth accepted by the validator.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Ways a signature can violate the grammar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature is longer than [`MAX_SIGNATURE_LEN`] bytes.
    #[error("signature exceeds {MAX_SIGNATURE_LEN} bytes")]
    TooLong,
    /// Containers nest deeper than [`MAX_NESTING_DEPTH`] levels.
    #[error("signature exceeds {MAX_NESTING_DEPTH} levels of nesting")]
    TooDeep,
    /// A character outside the type-code alphabet.
    #[error("unknown type code {0:?}")]
    UnknownCode(char),
    /// An `a` with no element type following it.
    #[error("array code without an element type")]
    TrailingArray,
    /// A `(` without a matching `)`.
    #[error("unterminated struct")]
    UnterminatedStruct,
    /// The empty struct `()` is not a valid type.
    #[error("empty struct")]
    EmptyStruct,
    /// A `{` not immediately preceded by `a`.
    #[error("dict entry outside of an array")]
    DictEntryOutsideArray,
    /// A dict-entry key that is not a basic type.
    #[error("dict entry key must be a basic type")]
    NonBasicDictKey,
    /// A dict entry without exactly one key and one value, or missing `}`.
    #[error("malformed dict entry")]
    MalformedDictEntry,
    /// A closing token with no open container.
    #[error("unmatched closing token {0:?}")]
    UnmatchedClose(char),
}

/// True for the type codes the grammar treats as basic (fixed scalars and
/// the three string-like types).
pub fn is_basic_code(c: u8) -> bool {
    matches!(
        c,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Consume one single complete type starting at `pos`, returning the
/// position just past it.
fn parse_single(bytes: &[u8], pos: usize, depth: usize) -> Result<usize, SignatureError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(SignatureError::TooDeep);
    }
    let Some(&c) = bytes.get(pos) else {
        return Err(SignatureError::TrailingArray);
    };
    match c {
        _ if is_basic_code(c) => Ok(pos + 1),
        b'v' => Ok(pos + 1),
        b'a' => {
            if pos + 1 >= bytes.len() {
                return Err(SignatureError::TrailingArray);
            }
            if bytes[pos + 1] == b'{' {
                parse_dict_entry(bytes, pos + 1, depth + 1)
            } else {
                parse_single(bytes, pos + 1, depth + 1)
            }
        }
        b'(' => {
            let mut at = pos + 1;
            if bytes.get(at) == Some(&b')') {
                return Err(SignatureError::EmptyStruct);
            }
            loop {
                match bytes.get(at) {
                    None => return Err(SignatureError::UnterminatedStruct),
                    Some(&b')') => return Ok(at + 1),
                    Some(_) => at = parse_single(bytes, at, depth + 1)?,
                }
            }
        }
        b'{' => Err(SignatureError::DictEntryOutsideArray),
        b')' | b'}' => Err(SignatureError::UnmatchedClose(c as char)),
        other => Err(SignatureError::UnknownCode(other as char)),
    }
}

/// Consume a `{kv}` dict entry starting at the `{`.
fn parse_dict_entry(bytes: &[u8], pos: usize, depth: usize) -> Result<usize, SignatureError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(SignatureError::TooDeep);
    }
    debug_assert_eq!(bytes[pos], b'{');
    let key_at = pos + 1;
    match bytes.get(key_at) {
        None | Some(&b'}') => return Err(SignatureError::MalformedDictEntry),
        Some(&c) if !is_basic_code(c) => return Err(SignatureError::NonBasicDictKey),
        Some(_) => {}
    }
    let value_at = key_at + 1;
    if bytes.get(value_at) == Some(&b'}') {
        return Err(SignatureError::MalformedDictEntry);
    }
    let end = parse_single(bytes, value_at, depth + 1)?;
    match bytes.get(end) {
        Some(&b'}') => Ok(end + 1),
        _ => Err(SignatureError::MalformedDictEntry),
    }
}

/// Consume one signature component: a single complete type, or a dict
/// entry. Bare dict entries are illegal in a signature but do occur as
/// array element types, which is the one place this is used instead of
/// [`parse_single`].
fn parse_component(bytes: &[u8], pos: usize, depth: usize) -> Result<usize, SignatureError> {
    if bytes.get(pos) == Some(&b'{') {
        parse_dict_entry(bytes, pos, depth)
    } else {
        parse_single(bytes, pos, depth)
    }
}

/// Validate a whole signature: a (possibly empty) sequence of single
/// complete types.
fn validate(s: &str) -> Result<(), SignatureError> {
    if s.len() > MAX_SIGNATURE_LEN {
        return Err(SignatureError::TooLong);
    }
    let bytes = s.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        pos = parse_single(bytes, pos, 0)?;
    }
    Ok(())
}

/// A validated D-Bus signature.
///
/// Construction goes through [`Signature::parse`], so every instance holds a
/// well-formed string. The empty signature is valid and denotes an empty
/// value sequence (a message body with no arguments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Signature(String::new())
    }

    /// Validate `s` and wrap it.
    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        validate(s)?;
        Ok(Signature(s.to_owned()))
    }

    /// Validate `s` as an array element type: exactly one complete type,
    /// or a dict entry (which is legal only in that position).
    pub fn parse_array_element(s: &str) -> Result<Self, SignatureError> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let bytes = s.as_bytes();
        let end = parse_component(bytes, 0, 0)?;
        if end != bytes.len() {
            return Err(SignatureError::MalformedDictEntry);
        }
        Ok(Signature(s.to_owned()))
    }

    /// Wrap a string assembled from already-validated value signatures.
    pub(crate) fn from_trusted(s: String) -> Self {
        Signature(s)
    }

    /// The signature text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when no complete types are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the single complete types of this signature.
    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter {
            bytes: self.0.as_bytes(),
            text: &self.0,
            pos: 0,
        }
    }

    /// True when the signature holds exactly one complete type, as required
    /// for the content of a VARIANT.
    pub fn is_single_complete(&self) -> bool {
        let mut it = self.iter();
        it.next().is_some() && it.next().is_none()
    }

    /// Append another signature's types to this one.
    pub(crate) fn push(&mut self, other: &str) {
        self.0.push_str(other);
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Iterator over the single complete types of a validated signature.
///
/// Yields subslices of the original text, e.g. `"a{sv}"`, `"i"`, `"(ii)"`
/// for the signature `"a{sv}i(ii)"`.
pub struct SignatureIter<'a> {
    bytes: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        // The signature was validated on construction; dict entries can
        // occur here when iterating an array element signature.
        let end = parse_component(self.bytes, self.pos, 0).expect("validated signature");
        let item = &self.text[self.pos..end];
        self.pos = end;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_basic_and_container_types() {
        for sig in [
            "", "y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "h", "v", "ai",
            "a{sv}", "(ii)", "a(ii)", "aai", "a{s(ii)}", "siisa{sv}", "(i(i(i)))",
        ] {
            assert!(Signature::parse(sig).is_ok(), "expected {sig:?} to parse");
        }
    }

    #[test]
    fn rejects_trailing_array() {
        assert_eq!(Signature::parse("a"), Err(SignatureError::TrailingArray));
        assert_eq!(Signature::parse("ia"), Err(SignatureError::TrailingArray));
        assert_eq!(Signature::parse("aa"), Err(SignatureError::TrailingArray));
    }

    #[test]
    fn rejects_malformed_structs() {
        assert_eq!(Signature::parse("()"), Err(SignatureError::EmptyStruct));
        assert_eq!(Signature::parse("(i"), Err(SignatureError::UnterminatedStruct));
        assert_eq!(Signature::parse(")"), Err(SignatureError::UnmatchedClose(')')));
    }

    #[test]
    fn rejects_misplaced_dict_entries() {
        assert_eq!(
            Signature::parse("{sv}"),
            Err(SignatureError::DictEntryOutsideArray)
        );
        assert_eq!(
            Signature::parse("a{vs}"),
            Err(SignatureError::NonBasicDictKey)
        );
        assert_eq!(
            Signature::parse("a{s}"),
            Err(SignatureError::MalformedDictEntry)
        );
        assert_eq!(
            Signature::parse("a{sss}"),
            Err(SignatureError::MalformedDictEntry)
        );
    }

    #[test]
    fn rejects_unknown_codes_and_oversize() {
        assert_eq!(Signature::parse("z"), Err(SignatureError::UnknownCode('z')));
        let long = "i".repeat(256);
        assert_eq!(Signature::parse(&long), Err(SignatureError::TooLong));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let deep = format!("{}i", "a".repeat(33));
        assert_eq!(Signature::parse(&deep), Err(SignatureError::TooDeep));
        // 32 levels are still fine.
        let ok = format!("{}i", "a".repeat(31));
        assert!(Signature::parse(&ok).is_ok());
    }

    #[test]
    fn iterates_single_complete_types() {
        let sig = Signature::parse("a{sv}i(ii)v").unwrap();
        let items: Vec<&str> = sig.iter().collect();
        assert_eq!(items, vec!["a{sv}", "i", "(ii)", "v"]);
    }

    #[test]
    fn parse_format_round_trip() {
        for text in ["", "i", "a{sv}", "a(ii)x", "siisa{s(ii)}"] {
            let sig = Signature::parse(text).unwrap();
            assert_eq!(sig.to_string(), text);
            assert_eq!(Signature::parse(&sig.to_string()).unwrap(), sig);
        }
    }

    #[test]
    fn array_element_grammar_admits_dict_entries() {
        assert!(Signature::parse_array_element("{sv}").is_ok());
        assert!(Signature::parse_array_element("i").is_ok());
        assert!(Signature::parse_array_element("(ii)").is_ok());
        // Two types, or a dict entry in a full signature, stay illegal.
        assert!(Signature::parse_array_element("ii").is_err());
        assert!(Signature::parse("{sv}").is_err());
        let dict = Signature::parse_array_element("{sv}").unwrap();
        assert!(dict.is_single_complete());
        assert_eq!(dict.iter().collect::<Vec<_>>(), vec!["{sv}"]);
    }

    #[test]
    fn single_complete_detection() {
        assert!(Signature::parse("a{sv}").unwrap().is_single_complete());
        assert!(!Signature::parse("ii").unwrap().is_single_complete());
        assert!(!Signature::empty().is_single_complete());
    }
}
