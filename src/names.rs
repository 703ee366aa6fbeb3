//! # Bus, Interface, Member, and Error Names
//!
//! Validating newtypes for the four name grammars of the protocol. Each
//! type parses via [`FromStr`] and reports the first rule it violates, so
//! misuse shows up as a precise error instead of a daemon disconnect later.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Names of every class are capped at 255 bytes.
pub const MAX_NAME_LEN: usize = 255;

fn valid_element_char(c: char, digits_ok_first: bool, first: bool) -> bool {
    if first && !digits_ok_first && c.is_ascii_digit() {
        return false;
    }
    c.is_ascii_alphanumeric() || c == '_' || (digits_ok_first && c == '-')
}

/// Errors for dot-separated names (interfaces, error names, well-known bus
/// names).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DottedNameError {
    #[error("name exceeds {MAX_NAME_LEN} bytes")]
    ExceedsMaxSize,
    #[error("name must contain at least two period-separated elements")]
    MustContainPeriod,
    #[error("name must not begin with a period")]
    MustNotBeginWithPeriod,
    #[error("name elements must not be empty")]
    ElementsMustContainChars,
    #[error("name elements must not begin with a digit")]
    ElementMustNotBeginWithDigit,
    #[error("invalid character {0:?} in name")]
    InvalidCharacter(char),
}

fn validate_dotted(s: &str, digits_ok: bool) -> Result<(), DottedNameError> {
    if s.len() > MAX_NAME_LEN {
        return Err(DottedNameError::ExceedsMaxSize);
    }
    if s.starts_with('.') {
        return Err(DottedNameError::MustNotBeginWithPeriod);
    }
    if !s.contains('.') {
        return Err(DottedNameError::MustContainPeriod);
    }
    for element in s.split('.') {
        if element.is_empty() {
            return Err(DottedNameError::ElementsMustContainChars);
        }
        let mut chars = element.chars();
        let first = chars.next().expect("non-empty element");
        if !digits_ok && first.is_ascii_digit() {
            return Err(DottedNameError::ElementMustNotBeginWithDigit);
        }
        if !valid_element_char(first, digits_ok, true) {
            return Err(DottedNameError::InvalidCharacter(first));
        }
        for c in chars {
            if !valid_element_char(c, digits_ok, false) {
                return Err(DottedNameError::InvalidCharacter(c));
            }
        }
    }
    Ok(())
}

/// An interface name such as `org.freedesktop.DBus.Peer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(pub(crate) String);

impl FromStr for InterfaceName {
    type Err = DottedNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_dotted(s, false)?;
        Ok(InterfaceName(s.to_owned()))
    }
}

impl InterfaceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error name; same grammar as an interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorName(pub(crate) String);

impl FromStr for ErrorName {
    type Err = DottedNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_dotted(s, false)?;
        Ok(ErrorName(s.to_owned()))
    }
}

impl ErrorName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors for bus names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusNameError {
    #[error(transparent)]
    Dotted(#[from] DottedNameError),
    #[error("unique name must have the form :N.M")]
    MalformedUniqueName,
}

/// A bus name: either well-known (`com.example.Service`) or unique
/// (`:1.42`, assigned by the daemon on Hello).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusName(pub(crate) String);

impl FromStr for BusName {
    type Err = BusNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(':') {
            if s.len() > MAX_NAME_LEN {
                return Err(DottedNameError::ExceedsMaxSize.into());
            }
            if !rest.contains('.')
                || rest
                    .split('.')
                    .any(|e| e.is_empty() || !e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            {
                return Err(BusNameError::MalformedUniqueName);
            }
            return Ok(BusName(s.to_owned()));
        }
        validate_dotted(s, false)?;
        Ok(BusName(s.to_owned()))
    }
}

impl BusName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for daemon-assigned `:N.M` names.
    pub fn is_unique(&self) -> bool {
        self.0.starts_with(':')
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors for member (method/signal) names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemberNameError {
    #[error("name exceeds {MAX_NAME_LEN} bytes")]
    ExceedsMaxSize,
    #[error("member name must not be empty")]
    Empty,
    #[error("member name must not contain a period")]
    MustNotContainPeriod,
    #[error("member name must not begin with a digit")]
    MustNotBeginWithDigit,
    #[error("invalid character {0:?} in member name")]
    InvalidCharacter(char),
}

/// A member name such as `Ping`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberName(pub(crate) String);

impl FromStr for MemberName {
    type Err = MemberNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_NAME_LEN {
            return Err(MemberNameError::ExceedsMaxSize);
        }
        if s.is_empty() {
            return Err(MemberNameError::Empty);
        }
        if s.contains('.') {
            return Err(MemberNameError::MustNotContainPeriod);
        }
        let mut chars = s.chars();
        let first = chars.next().expect("non-empty member");
        if first.is_ascii_digit() {
            return Err(MemberNameError::MustNotBeginWithDigit);
        }
        for c in s.chars() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                return Err(MemberNameError::InvalidCharacter(c));
            }
        }
        Ok(MemberName(s.to_owned()))
    }
}

impl MemberName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name() {
        let large = "X".repeat(256);
        assert_eq!(
            InterfaceName::from_str(&large),
            Err(DottedNameError::ExceedsMaxSize)
        );
        assert_eq!(
            InterfaceName::from_str("Elements..MissingChars"),
            Err(DottedNameError::ElementsMustContainChars)
        );
        assert_eq!(
            InterfaceName::from_str("MissingPeriod"),
            Err(DottedNameError::MustContainPeriod)
        );
        assert_eq!(
            InterfaceName::from_str(".Must.Not.Start.With.Period"),
            Err(DottedNameError::MustNotBeginWithPeriod)
        );
        assert_eq!(
            InterfaceName::from_str("Must.Not.Start.With.9Digit"),
            Err(DottedNameError::ElementMustNotBeginWithDigit)
        );
        assert_eq!(
            InterfaceName::from_str("Invalid.C|har"),
            Err(DottedNameError::InvalidCharacter('|'))
        );
        assert!(InterfaceName::from_str("org.freedesktop.DBus.Peer").is_ok());
    }

    #[test]
    fn bus_name() {
        assert!(BusName::from_str("org.freedesktop.DBus").is_ok());
        let unique = BusName::from_str(":1.42").unwrap();
        assert!(unique.is_unique());
        assert_eq!(
            BusName::from_str(":noperiod"),
            Err(BusNameError::MalformedUniqueName)
        );
        assert_eq!(
            BusName::from_str("MissingPeriod"),
            Err(BusNameError::Dotted(DottedNameError::MustContainPeriod))
        );
    }

    #[test]
    fn member_name() {
        assert!(MemberName::from_str("Ping").is_ok());
        assert_eq!(
            MemberName::from_str("Contains.Period"),
            Err(MemberNameError::MustNotContainPeriod)
        );
        assert_eq!(
            MemberName::from_str("1Leading"),
            Err(MemberNameError::MustNotBeginWithDigit)
        );
        assert_eq!(
            MemberName::from_str("Inva|id"),
            Err(MemberNameError::InvalidCharacter('|'))
        );
        assert_eq!(MemberName::from_str(""), Err(MemberNameError::Empty));
    }

    #[test]
    fn error_name() {
        assert!(ErrorName::from_str("org.freedesktop.DBus.Error.UnknownMethod").is_ok());
        assert_eq!(
            ErrorName::from_str("nodots"),
            Err(DottedNameError::MustContainPeriod)
        );
    }
}
