//! SM9 key structures
//!
//! Every key travels as ASN.1 DER: a BIT STRING with no unused bits that
//! wraps an uncompressed curve point (`0x04 || x || y`). Points on G1 are 65
//! bytes, points on G2 are 129 bytes. Which group a key lives on depends on
//! its role:
//!
//! | key                         | group |
//! |-----------------------------|-------|
//! | sign master public key      | G2    |
//! | sign private key            | G1    |
//! | encrypt master public key   | G1    |
//! | encrypt private key         | G2    |
//!
//! Only the encoding is checked here; whether a point is actually on the
//! curve is the SM9 library's business.

use std::fmt;

use zeroize::Zeroize;

use super::KeyError;

const BIT_STRING_TAG: u8 = 0x03;
const UNCOMPRESSED_POINT: u8 = 0x04;

/// The pairing group a key's point belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointGroup {
    G1,
    G2,
}

impl PointGroup {
    /// Length of an uncompressed point in this group, prefix byte included.
    pub fn point_len(self) -> usize {
        match self {
            PointGroup::G1 => 65,
            PointGroup::G2 => 129,
        }
    }
}

/// Read a DER length (short form, or long form up to two bytes).
fn read_length(data: &[u8]) -> Result<(usize, &[u8]), KeyError> {
    let (&first, rest) = data.split_first().ok_or(KeyError::Truncated)?;
    if first < 0x80 {
        return Ok((first as usize, rest));
    }

    let count = (first & 0x7f) as usize;
    if count == 0 || count > 2 {
        return Err(KeyError::UnsupportedLength);
    }
    if rest.len() < count {
        return Err(KeyError::Truncated);
    }

    let len = rest[..count]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok((len, &rest[count..]))
}

/// Validate that `der` is a BIT STRING wrapping an uncompressed `group` point.
pub fn validate_point_der(der: &[u8], group: PointGroup) -> Result<(), KeyError> {
    let (&tag, rest) = der.split_first().ok_or(KeyError::Truncated)?;
    if tag != BIT_STRING_TAG {
        return Err(KeyError::UnexpectedTag(tag));
    }

    let (len, body) = read_length(rest)?;
    if body.len() != len {
        return Err(KeyError::LengthMismatch {
            declared: len,
            actual: body.len(),
        });
    }

    let (&unused_bits, point) = body.split_first().ok_or(KeyError::Truncated)?;
    if unused_bits != 0 {
        return Err(KeyError::UnusedBits(unused_bits));
    }

    let expected = group.point_len();
    if point.len() != expected {
        return Err(KeyError::PointLength {
            expected,
            actual: point.len(),
        });
    }
    if point[0] != UNCOMPRESSED_POINT {
        return Err(KeyError::NotUncompressed);
    }

    Ok(())
}

/// Wrap an uncompressed point in a DER BIT STRING.
pub fn encode_point_der(point: &[u8]) -> Vec<u8> {
    let content_len = point.len() + 1;
    let mut der = Vec::with_capacity(content_len + 4);
    der.push(BIT_STRING_TAG);
    if content_len < 0x80 {
        der.push(content_len as u8);
    } else if content_len <= 0xff {
        der.extend_from_slice(&[0x81, content_len as u8]);
    } else {
        der.extend_from_slice(&[0x82, (content_len >> 8) as u8, content_len as u8]);
    }
    der.push(0x00);
    der.extend_from_slice(point);
    der
}

fn decode_hex(s: &str) -> Result<Vec<u8>, KeyError> {
    hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))
}

macro_rules! der_key {
    ($(#[$meta:meta])* $name:ident, $group:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name {
            der: Vec<u8>,
        }

        impl $name {
            pub const GROUP: PointGroup = $group;

            /// Parse from DER, checking the point encoding.
            pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
                validate_point_der(der, Self::GROUP)?;
                Ok(Self { der: der.to_vec() })
            }

            /// Parse from the hex form used in configuration files.
            pub fn from_hex(s: &str) -> Result<Self, KeyError> {
                let mut der = decode_hex(s)?;
                let parsed = Self::from_der(&der);
                der.zeroize();
                parsed
            }

            pub fn as_der(&self) -> &[u8] {
                &self.der
            }

            /// Lowercase hex of the DER encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(&self.der)
            }
        }
    };
}

der_key!(
    /// System-wide master public key for signatures (G2).
    SignMasterPublicKey,
    PointGroup::G2
);

der_key!(
    /// System-wide master public key for encryption (G1).
    EncryptMasterPublicKey,
    PointGroup::G1
);

der_key!(
    /// Per-identity signing key issued by the key-generation centre (G1).
    SignPrivateKey,
    PointGroup::G1
);

der_key!(
    /// Per-identity decryption key issued by the key-generation centre (G2).
    EncryptPrivateKey,
    PointGroup::G2
);

impl fmt::Debug for SignMasterPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignMasterPublicKey").field(&self.to_hex()).finish()
    }
}

impl fmt::Debug for EncryptMasterPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncryptMasterPublicKey").field(&self.to_hex()).finish()
    }
}

impl fmt::Debug for SignPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignPrivateKey(<redacted>)")
    }
}

impl fmt::Debug for EncryptPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptPrivateKey(<redacted>)")
    }
}

impl Drop for SignPrivateKey {
    fn drop(&mut self) {
        self.der.zeroize();
    }
}

impl Drop for EncryptPrivateKey {
    fn drop(&mut self) {
        self.der.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCRYPT_MASTER_HEX: &str = "034200049174542668e8f14ab273c0945c3690c66e5dd09678b86f734c4350567ed0628354e598c6bf749a3dacc9fffedd9db6866c50457cfc7aa2a4ad65c3168ff74210";
    const SIGN_MASTER_HEX: &str = "03818200049f64080b3084f733e48aff4b41b565011ce0711c5e392cfb0ab1b6791b94c40829dba116152d1f786ce843ed24a3b573414d2177386a92dd8f14d65696ea5e3269850938abea0112b57329f447e3a0cbad3e2fdb1a77f335e89e1408d0ef1c2541e00a53dda532da1a7ce027b7a46f741006e85f5cdff0730e75c05fb4e3216d";

    #[test]
    fn test_parse_platform_master_keys() {
        let enc = EncryptMasterPublicKey::from_hex(ENCRYPT_MASTER_HEX).unwrap();
        let sign = SignMasterPublicKey::from_hex(SIGN_MASTER_HEX).unwrap();

        assert_eq!(enc.as_der().len(), 3 + 65);
        assert_eq!(sign.as_der().len(), 4 + 129);
        assert_eq!(enc.to_hex(), ENCRYPT_MASTER_HEX);
        assert_eq!(sign.to_hex(), SIGN_MASTER_HEX);
    }

    #[test]
    fn test_group_mismatch_rejected() {
        // A G1 point is not a valid sign master key.
        let err = SignMasterPublicKey::from_hex(ENCRYPT_MASTER_HEX).unwrap_err();
        assert_eq!(
            err,
            KeyError::PointLength {
                expected: 129,
                actual: 65
            }
        );
    }

    #[test]
    fn test_non_hex_rejected() {
        assert!(matches!(
            EncryptMasterPublicKey::from_hex("not-hex"),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(
            validate_point_der(&[], PointGroup::G1),
            Err(KeyError::Truncated)
        );
        assert_eq!(
            validate_point_der(&[0x04, 0x01, 0x00], PointGroup::G1),
            Err(KeyError::UnexpectedTag(0x04))
        );

        let mut der = encode_point_der(&[0x04; 65]);
        der.pop();
        assert!(matches!(
            validate_point_der(&der, PointGroup::G1),
            Err(KeyError::LengthMismatch { .. })
        ));

        let mut der = encode_point_der(&[0x04; 65]);
        der[2] = 3;
        assert_eq!(
            validate_point_der(&der, PointGroup::G1),
            Err(KeyError::UnusedBits(3))
        );

        let der = encode_point_der(&[0x02; 65]);
        assert_eq!(
            validate_point_der(&der, PointGroup::G1),
            Err(KeyError::NotUncompressed)
        );
    }

    #[test]
    fn test_encode_point_der_matches_platform_headers() {
        let g1 = encode_point_der(&[0x04; 65]);
        assert_eq!(&g1[..3], &[0x03, 0x42, 0x00]);

        let g2 = encode_point_der(&[0x04; 129]);
        assert_eq!(&g2[..4], &[0x03, 0x81, 0x82, 0x00]);

        assert!(validate_point_der(&g1, PointGroup::G1).is_ok());
        assert!(validate_point_der(&g2, PointGroup::G2).is_ok());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = SignPrivateKey::from_der(&encode_point_der(&[0x04; 65])).unwrap();
        assert_eq!(format!("{:?}", key), "SignPrivateKey(<redacted>)");
    }
}
