//! Typed encode/decode of bus payloads.
//!
//! Monitor replies are 0-8 raw bytes. Replies for fixed-size data points may
//! carry one extra trailing byte: a signed hardware status code appended by
//! the firmware. [`unpack`] strips it and hands it back alongside the value.
//!
//! Protocol ambiguity, preserved as documented: a standalone 1-byte payload
//! for a 1-byte data point cannot be distinguished structurally from a pure
//! status reply. The firmware reserves the small negative band
//! [`HW_STATUS_FLOOR`]..=-1 for its error codes, so a single byte whose
//! signed value falls in that band is classified as a pure status (the data
//! value defaults to zero). A byte outside the band is data. Do not
//! "fix" this differently: it changes observable error classification.

use std::fmt;

use thiserror::Error;

/// Lowest signed value of the reserved hardware error-code band.
pub const HW_STATUS_FLOOR: i8 = -24;

/// Payload-decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Payload length does not match the data point's wire size.
    #[error("payload length {got} does not match expected {expected}")]
    LengthMismatch { expected: usize, got: usize },

    /// An ESN string was not 16 hexadecimal digits.
    #[error("bad ESN hex string: {0}")]
    BadHex(String),
}

/// A bus payload: up to 8 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Payload {
    bytes: [u8; 8],
    len: u8,
}

impl Payload {
    /// Build a payload from a slice. Lengths over 8 are a programming error.
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() <= 8, "bus payloads are at most 8 bytes");
        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);
        Payload {
            bytes,
            len: data.len() as u8,
        }
    }

    /// Empty payload (monitor requests carry no data).
    pub const fn empty() -> Self {
        Payload {
            bytes: [0; 8],
            len: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one byte. Panics past 8 bytes; construction-time error.
    pub fn push(&mut self, byte: u8) {
        assert!(self.len < 8, "bus payloads are at most 8 bytes");
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// A decoded monitor reply: the value plus the trailing hardware status byte
/// (0 when the reply carried none).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<T> {
    pub value: T,
    pub hw_status: i8,
}

/// A data point representable on the wire.
///
/// `SIZE` is `Some(n)` for fixed-size points (the only ones that may carry a
/// trailing status byte) and `None` for points that consume the whole
/// payload (raw bytes, free text).
pub trait WireType: Sized {
    const SIZE: Option<usize>;

    fn encode(&self) -> Payload;

    /// Decode from exactly the value bytes (status byte already stripped).
    fn decode(bytes: &[u8]) -> Self;
}

/// Decode a payload into a typed reading, stripping a trailing status byte
/// when present. Mismatched lengths fail with [`CodecError::LengthMismatch`].
pub fn unpack<T: WireType>(payload: &Payload) -> Result<Reading<T>, CodecError> {
    let bytes = payload.bytes();
    let size = match T::SIZE {
        None => {
            return Ok(Reading {
                value: T::decode(bytes),
                hw_status: 0,
            })
        }
        Some(size) => size,
    };
    if bytes.len() == size {
        if size == 1 {
            // See the module docs: single-byte replies in the reserved
            // negative band are pure status, resolved by range check.
            let code = bytes[0] as i8;
            if (HW_STATUS_FLOOR..=-1).contains(&code) {
                return Ok(Reading {
                    value: T::decode(&[0]),
                    hw_status: code,
                });
            }
        }
        Ok(Reading {
            value: T::decode(bytes),
            hw_status: 0,
        })
    } else if bytes.len() == size + 1 {
        Ok(Reading {
            value: T::decode(&bytes[..size]),
            hw_status: bytes[size] as i8,
        })
    } else {
        Err(CodecError::LengthMismatch {
            expected: size,
            got: bytes.len(),
        })
    }
}

impl WireType for u8 {
    const SIZE: Option<usize> = Some(1);

    fn encode(&self) -> Payload {
        Payload::from_slice(&[*self])
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl WireType for u16 {
    const SIZE: Option<usize> = Some(2);

    fn encode(&self) -> Payload {
        Payload::from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

impl WireType for i16 {
    const SIZE: Option<usize> = Some(2);

    fn encode(&self) -> Payload {
        Payload::from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        i16::from_be_bytes([bytes[0], bytes[1]])
    }
}

impl WireType for u32 {
    const SIZE: Option<usize> = Some(4);

    fn encode(&self) -> Payload {
        Payload::from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl WireType for f32 {
    const SIZE: Option<usize> = Some(4);

    // Wire byte order is reversed with respect to the little-endian host,
    // i.e. big-endian on the wire.
    fn encode(&self) -> Payload {
        Payload::from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Fixed 8-byte electronic serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Esn(pub [u8; 8]);

impl Esn {
    /// Parse 16 hex digits (separators ignored).
    pub fn from_hex(text: &str) -> Result<Self, CodecError> {
        let digits: Vec<u8> = text
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_digit(16).unwrap() as u8)
            .collect();
        if digits.len() != 16 {
            return Err(CodecError::BadHex(text.to_string()));
        }
        let mut bytes = [0u8; 8];
        for (i, pair) in digits.chunks(2).enumerate() {
            bytes[i] = (pair[0] << 4) | pair[1];
        }
        Ok(Esn(bytes))
    }

    /// Hex string with the byte order reversed (some modules report the ESN
    /// least-significant byte first).
    pub fn to_hex_reversed(&self) -> String {
        self.0
            .iter()
            .rev()
            .map(|b| format!("{:02X}", b))
            .collect()
    }
}

impl fmt::Display for Esn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl WireType for Esn {
    const SIZE: Option<usize> = Some(8);

    fn encode(&self) -> Payload {
        Payload::from_slice(&self.0)
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut out = [0u8; 8];
        out.copy_from_slice(&bytes[..8]);
        Esn(out)
    }
}

/// Three-byte "x.y.z" firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl WireType for Revision {
    const SIZE: Option<usize> = Some(3);

    fn encode(&self) -> Payload {
        Payload::from_slice(&[self.major, self.minor, self.patch])
    }

    fn decode(bytes: &[u8]) -> Self {
        Revision {
            major: bytes[0],
            minor: bytes[1],
            patch: bytes[2],
        }
    }
}

/// Free-text reply: every payload byte as a character.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireString(pub String);

impl WireType for WireString {
    const SIZE: Option<usize> = None;

    fn encode(&self) -> Payload {
        Payload::from_slice(&self.0.as_bytes()[..self.0.len().min(8)])
    }

    fn decode(bytes: &[u8]) -> Self {
        WireString(String::from_utf8_lossy(bytes).into_owned())
    }
}

// Raw passthrough for callers that want the untouched payload.
impl WireType for Payload {
    const SIZE: Option<usize> = None;

    fn encode(&self) -> Payload {
        *self
    }

    fn decode(bytes: &[u8]) -> Self {
        Payload::from_slice(bytes)
    }
}
