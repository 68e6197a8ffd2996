//! Content and user identifiers.
//!
//! Files are addressed by a 192-bit tree hash (TTH) and users by a
//! 192-bit client id (CID); both travel on the wire as unpadded
//! base32.

use std::fmt;
use std::str::FromStr;

use data_encoding::{Encoding, Specification};
use once_cell::sync::Lazy;
use thiserror::Error;

/// Raw length of a 192-bit digest.
pub const TTH_BYTES: usize = 24;
/// Base32 text length of a 192-bit digest.
pub const TTH_BASE32_LEN: usize = 39;

// RFC 4648 alphabet, no padding. The 39th symbol carries two unused
// bits which peers do not always zero, so trailing-bit checking is
// off.
static BASE32: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
    spec.check_trailing_bits = false;
    spec.encoding().expect("static base32 spec")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("expected {TTH_BASE32_LEN} base32 characters, got {0}")]
    Length(usize),
    #[error("invalid base32: {0}")]
    Encoding(String),
}

fn decode_192(s: &str) -> Result<[u8; TTH_BYTES], IdParseError> {
    if s.len() != TTH_BASE32_LEN {
        return Err(IdParseError::Length(s.len()));
    }
    let bytes = BASE32
        .decode(s.as_bytes())
        .map_err(|e| IdParseError::Encoding(e.to_string()))?;
    let mut out = [0u8; TTH_BYTES];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Tiger tree hash root of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tth(pub [u8; TTH_BYTES]);

impl Tth {
    pub const ZERO: Tth = Tth([0; TTH_BYTES]);

    pub fn from_base32(s: &str) -> Result<Self, IdParseError> {
        decode_192(s).map(Tth)
    }

    pub fn to_base32(&self) -> String {
        BASE32.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; TTH_BYTES] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; TTH_BYTES]
    }
}

impl fmt::Display for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tth({})", self.to_base32())
    }
}

impl FromStr for Tth {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tth::from_base32(s)
    }
}

/// Client id identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub [u8; TTH_BYTES]);

impl Cid {
    pub const ZERO: Cid = Cid([0; TTH_BYTES]);

    pub fn from_base32(s: &str) -> Result<Self, IdParseError> {
        decode_192(s).map(Cid)
    }

    pub fn to_base32(&self) -> String {
        BASE32.encode(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; TTH_BYTES]
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

impl FromStr for Cid {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::from_base32(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_round_trip() {
        let tth = Tth([0xAB; TTH_BYTES]);
        let text = tth.to_base32();
        assert_eq!(text.len(), TTH_BASE32_LEN);
        assert_eq!(Tth::from_base32(&text).unwrap(), tth);
    }

    #[test]
    fn test_zero_encodes_to_all_a() {
        assert_eq!(Tth::ZERO.to_base32(), "A".repeat(TTH_BASE32_LEN));
        assert!(Tth::ZERO.is_zero());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(Tth::from_base32("ABC"), Err(IdParseError::Length(3)));
    }

    #[test]
    fn test_rejects_bad_symbols() {
        let bad = "1".repeat(TTH_BASE32_LEN); // '1' is not in the alphabet
        assert!(matches!(
            Tth::from_base32(&bad),
            Err(IdParseError::Encoding(_))
        ));
    }

    #[test]
    fn test_lenient_trailing_bits() {
        // The last symbol carries three junk bits; decoding must not
        // reject a peer that fails to zero them. All-ones encodes with
        // a trailing 'Y' (0b11000); 'Z' (0b11001) differs only in a
        // junk bit.
        let mut text = Tth([0xFF; TTH_BYTES]).to_base32();
        assert_eq!(text.pop(), Some('Y'));
        text.push('Z');
        let decoded = Tth::from_base32(&text).unwrap();
        assert_eq!(decoded, Tth([0xFF; TTH_BYTES]));
    }

    #[test]
    fn test_from_str_and_display() {
        let tth = Tth([7; TTH_BYTES]);
        let parsed: Tth = tth.to_string().parse().unwrap();
        assert_eq!(parsed, tth);

        let cid = Cid([9; TTH_BYTES]);
        let parsed: Cid = cid.to_string().parse().unwrap();
        assert_eq!(parsed, cid);
    }
}
