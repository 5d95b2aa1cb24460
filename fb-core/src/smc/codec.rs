//! Binary value formats used by the controller
//!
//! Fixed-point tags are named `sp<i><f>` (signed) and `fp<i><f>` (unsigned),
//! where `<i>` and `<f>` are single hex digits giving integer and fraction
//! bits of a big-endian 16-bit word. Integers are big-endian; `flt ` is an
//! IEEE-754 single in native byte order.

use fb_protocol::TypeTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Float,
    SignedFixed { frac: u32 },
    UnsignedFixed { frac: u32 },
    Unsigned(usize),
    Signed(usize),
    Flag,
}

fn hex_digit(b: u8) -> Option<u32> {
    (b as char).to_digit(16)
}

fn format_of(tag: TypeTag) -> Option<Format> {
    let b = tag.as_str().as_bytes();
    match tag.as_str() {
        "flt " => return Some(Format::Float),
        "ui8 " => return Some(Format::Unsigned(1)),
        "ui16" => return Some(Format::Unsigned(2)),
        "ui32" => return Some(Format::Unsigned(4)),
        "si8 " => return Some(Format::Signed(1)),
        "si16" => return Some(Format::Signed(2)),
        "si32" => return Some(Format::Signed(4)),
        "flag" => return Some(Format::Flag),
        _ => {}
    }

    let int = hex_digit(b[2])?;
    let frac = hex_digit(b[3])?;
    match &b[..2] {
        // sign bit + integer + fraction fill 16 bits
        b"sp" if int + frac == 15 => Some(Format::SignedFixed { frac }),
        b"fp" if int + frac == 16 => Some(Format::UnsignedFixed { frac }),
        _ => None,
    }
}

/// Whether `decode`/`encode` understand this tag
pub fn is_supported(tag: TypeTag) -> bool {
    format_of(tag).is_some()
}

fn be_word(bytes: &[u8]) -> Option<[u8; 2]> {
    Some([*bytes.first()?, *bytes.get(1)?])
}

/// Decode raw controller bytes. Unknown tags and short buffers yield `None`.
pub fn decode(tag: TypeTag, bytes: &[u8]) -> Option<f64> {
    let value = match format_of(tag)? {
        Format::Float => {
            let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
            f32::from_ne_bytes(raw) as f64
        }
        Format::SignedFixed { frac } => {
            i16::from_be_bytes(be_word(bytes)?) as f64 / (1u32 << frac) as f64
        }
        Format::UnsignedFixed { frac } => {
            u16::from_be_bytes(be_word(bytes)?) as f64 / (1u32 << frac) as f64
        }
        Format::Unsigned(1) => *bytes.first()? as f64,
        Format::Unsigned(2) => u16::from_be_bytes(be_word(bytes)?) as f64,
        Format::Unsigned(_) => {
            u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as f64
        }
        Format::Signed(1) => *bytes.first()? as i8 as f64,
        Format::Signed(2) => i16::from_be_bytes(be_word(bytes)?) as f64,
        Format::Signed(_) => {
            i32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as f64
        }
        Format::Flag => {
            if *bytes.first()? != 0 {
                1.0
            } else {
                0.0
            }
        }
    };
    value.is_finite().then_some(value)
}

/// Encode a value, clamping to the representable range of the tag
pub fn encode(tag: TypeTag, value: f64) -> Option<Vec<u8>> {
    if value.is_nan() {
        return None;
    }
    let bytes = match format_of(tag)? {
        Format::Float => (value as f32).to_ne_bytes().to_vec(),
        Format::SignedFixed { frac } => {
            let scaled = (value * (1u32 << frac) as f64).round();
            (scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16)
                .to_be_bytes()
                .to_vec()
        }
        Format::UnsignedFixed { frac } => {
            let scaled = (value * (1u32 << frac) as f64).round();
            (scaled.clamp(0.0, u16::MAX as f64) as u16).to_be_bytes().to_vec()
        }
        Format::Unsigned(1) => vec![value.round().clamp(0.0, u8::MAX as f64) as u8],
        Format::Unsigned(2) => (value.round().clamp(0.0, u16::MAX as f64) as u16)
            .to_be_bytes()
            .to_vec(),
        Format::Unsigned(_) => (value.round().clamp(0.0, u32::MAX as f64) as u32)
            .to_be_bytes()
            .to_vec(),
        Format::Signed(1) => {
            vec![value.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8 as u8]
        }
        Format::Signed(2) => (value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
            .to_be_bytes()
            .to_vec(),
        Format::Signed(_) => (value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
            .to_be_bytes()
            .to_vec(),
        Format::Flag => vec![u8::from(value != 0.0)],
    };
    Some(bytes)
}
