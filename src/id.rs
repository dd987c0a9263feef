use crate::{Error, Result};
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Display};

/// Number of bytes in a raw object identifier.
pub const ID_LEN: usize = 20;

/// Number of characters in the hex form of an object identifier.
pub const ID_HEX_LEN: usize = 40;

/// A 20-byte object identifier.
///
/// Stored raw; the 40-char lowercase hex form is derived on demand. Ids
/// sort byte-lexicographically, which is also the order chunk indexes
/// keep their entries in.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; ID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: &[u8; ID_LEN]) -> Self {
        Self(*bytes)
    }

    /// Read an id from the front of a buffer, failing on short input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ID_LEN {
            return Err(Error::TruncatedInput {
                offset: 0,
                wanted: ID_LEN,
                got: bytes.len(),
            });
        }
        let mut raw = [0; ID_LEN];
        raw.copy_from_slice(&bytes[..ID_LEN]);
        Ok(Self(raw))
    }

    /// Consume a finished hasher to produce the id of the hashed bytes.
    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }

    /// Hash a byte buffer in one step.
    pub fn hash_of(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.as_bytes();
        if hex.len() != ID_HEX_LEN {
            return Err(Error::InvariantViolated(format!(
                "object id hex must be {ID_HEX_LEN} chars, got {}",
                hex.len()
            )));
        }
        let nibble = |c: u8| -> Result<u8> {
            match c {
                b'0'..=b'9' => Ok(c - b'0'),
                b'a'..=b'f' => Ok(c - b'a' + 10),
                _ => Err(Error::InvariantViolated(format!(
                    "invalid hex digit {:?}",
                    c as char
                ))),
            }
        };
        let mut raw = [0; ID_LEN];
        for (i, out) in raw.iter_mut().enumerate() {
            *out = (nibble(hex[2 * i])? << 4) | nibble(hex[2 * i + 1])?;
        }
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(ID_HEX_LEN);
        use std::fmt::Write;
        for byte in self.0.iter() {
            write!(hex, "{:02x}", byte).unwrap();
        }
        hex
    }

    /// The all-zero id, used as a reflog side marker for ref creation
    /// and deletion.
    pub fn zero() -> Self {
        Self([0; ID_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_LEN]
    }

    /// First byte of the raw id, the fan-out bucket it belongs to.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId<{}>", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::hash_of(b"hello world");
        let parsed = ObjectId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), ID_HEX_LEN);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex(&"g".repeat(ID_HEX_LEN)).is_err());
    }

    #[test]
    fn orders_by_raw_bytes() {
        let a = ObjectId::from_bytes(&[1; 20]);
        let b = ObjectId::from_bytes(&[2; 20]);
        assert!(a < b);
    }

    #[test]
    fn from_slice_short_input() {
        assert!(matches!(
            ObjectId::from_slice(&[0; 10]),
            Err(Error::TruncatedInput { .. })
        ));
    }
}
