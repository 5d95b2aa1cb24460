//! Four-character controller identifiers
//!
//! Both register keys (`F0Tg`, `FS! `) and value type tags (`flt `, `sp78`)
//! are exactly four printable ASCII bytes. Trailing spaces are significant.

use serde::{Deserialize, Serialize};
use std::fmt;

fn validate_fourcc(s: &[u8]) -> Result<[u8; 4], String> {
    if s.len() != 4 {
        return Err(format!("expected 4 characters, got {}", s.len()));
    }
    if let Some(bad) = s.iter().find(|b| !(0x20..=0x7e).contains(*b)) {
        return Err(format!("non-printable byte 0x{:02x}", bad));
    }
    Ok([s[0], s[1], s[2], s[3]])
}

/// A 4-byte controller register key, e.g. `TC0P` or `F0Tg`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorKey([u8; 4]);

impl SensorKey {
    /// Build a key from a compile-time literal. Callers guarantee printable ASCII.
    pub const fn from_static(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }

    /// Parse and validate a key
    pub fn new(s: &str) -> Result<Self, String> {
        validate_fourcc(s.as_bytes())
            .map(Self)
            .map_err(|e| format!("invalid key {:?}: {}", s, e))
    }

    /// Key for a per-fan register, e.g. `fan(1, "Tg")` is `F1Tg`.
    /// Fan indices above 9 use the letters `A`..`Z` as the controller does.
    pub fn fan(index: usize, suffix: &str) -> Result<Self, String> {
        let digit = match index {
            0..=9 => (b'0' + index as u8) as char,
            10..=35 => (b'A' + (index - 10) as u8) as char,
            _ => return Err(format!("fan index {} out of range", index)),
        };
        Self::new(&format!("F{}{}", digit, suffix))
    }

    /// Decode a big-endian packed key as the driver reports it
    pub fn from_u32(raw: u32) -> Result<Self, String> {
        validate_fourcc(&raw.to_be_bytes()).map(Self)
    }

    /// Big-endian packed form used in driver parameter blocks
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated printable ASCII on every constructor path
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// First character, the coarse category tag (`T`, `V`, `I`, `P`, `F`)
    pub fn category_tag(&self) -> char {
        self.0[0] as char
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorKey({:?})", self.as_str())
    }
}

impl TryFrom<String> for SensorKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<SensorKey> for String {
    fn from(k: SensorKey) -> Self {
        k.as_str().to_string()
    }
}

/// A 4-byte value type tag, e.g. `flt `, `fpe2`, `ui8 `
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeTag([u8; 4]);

impl TypeTag {
    pub const FLT: TypeTag = TypeTag(*b"flt ");
    pub const FPE2: TypeTag = TypeTag(*b"fpe2");
    pub const SP78: TypeTag = TypeTag(*b"sp78");
    pub const FP88: TypeTag = TypeTag(*b"fp88");
    pub const UI8: TypeTag = TypeTag(*b"ui8 ");
    pub const UI16: TypeTag = TypeTag(*b"ui16");
    pub const UI32: TypeTag = TypeTag(*b"ui32");
    pub const SI8: TypeTag = TypeTag(*b"si8 ");
    pub const SI16: TypeTag = TypeTag(*b"si16");
    pub const SI32: TypeTag = TypeTag(*b"si32");
    pub const FLAG: TypeTag = TypeTag(*b"flag");

    pub const fn from_static(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }

    pub fn new(s: &str) -> Result<Self, String> {
        validate_fourcc(s.as_bytes())
            .map(Self)
            .map_err(|e| format!("invalid type tag {:?}: {}", s, e))
    }

    /// Type tags outside printable ASCII are reported as `????`
    pub fn from_u32(raw: u32) -> Self {
        validate_fourcc(&raw.to_be_bytes())
            .map(Self)
            .unwrap_or(Self(*b"????"))
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:?})", self.as_str())
    }
}

impl TryFrom<String> for TypeTag {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<TypeTag> for String {
    fn from(t: TypeTag) -> Self {
        t.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_keep_trailing_spaces() {
        let key = SensorKey::new("FS! ").unwrap();
        assert_eq!(key.as_str(), "FS! ");
        assert_eq!(key.category_tag(), 'F');
    }

    #[test]
    fn rejects_wrong_length_and_control_bytes() {
        assert!(SensorKey::new("F0T").is_err());
        assert!(SensorKey::new("F0Tgx").is_err());
        assert!(SensorKey::new("F0\nT").is_err());
    }

    #[test]
    fn packed_form_is_big_endian() {
        let key = SensorKey::from_static(b"#KEY");
        assert_eq!(key.as_u32(), 0x234b_4559);
        assert_eq!(SensorKey::from_u32(0x234b_4559).unwrap(), key);
    }

    #[test]
    fn fan_keys_use_letters_past_nine() {
        assert_eq!(SensorKey::fan(0, "Tg").unwrap().as_str(), "F0Tg");
        assert_eq!(SensorKey::fan(10, "Md").unwrap().as_str(), "FAMd");
        assert!(SensorKey::fan(36, "Md").is_err());
    }

    #[test]
    fn unknown_type_bytes_become_placeholder() {
        assert_eq!(TypeTag::from_u32(0x0000_0001).as_str(), "????");
        assert_eq!(TypeTag::from_u32(TypeTag::FLT.as_u32()), TypeTag::FLT);
    }

    #[test]
    fn serde_uses_plain_strings() {
        let key = SensorKey::new("TC0P").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"TC0P\"");
        let back: SensorKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<SensorKey>("\"TOOLONG\"").is_err());
    }
}
