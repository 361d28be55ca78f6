//! ASN.1 DER ↔ raw `r ∥ s` conversion for ECDSA P-256 signatures
//!
//! ```text
//! 30 <len> 02 <rlen> <r: 1..=33 bytes> 02 <slen> <s: 1..=33 bytes>
//! ```
//! WebAuthn authenticators emit DER; verification wants 64 raw bytes.

use ss_core::{SsError, SsResult};

const COMPONENT: usize = 32;

fn invalid(msg: impl Into<String>) -> SsError {
    SsError::SignatureInvalid(msg.into())
}

/// Convert a DER `ECDSA-Sig-Value` into raw `r ∥ s`, each left-padded to 32
/// bytes after stripping sign-padding zeros.
pub fn der_to_raw(der: &[u8]) -> SsResult<[u8; 2 * COMPONENT]> {
    let (&tag, rest) = der.split_first().ok_or_else(|| invalid("empty signature"))?;
    if tag != 0x30 {
        return Err(invalid(format!("expected SEQUENCE (0x30), got 0x{tag:02x}")));
    }
    let (&len, body) = rest
        .split_first()
        .ok_or_else(|| invalid("signature truncated after SEQUENCE tag"))?;
    if len & 0x80 != 0 || usize::from(len) != body.len() {
        return Err(invalid(format!(
            "SEQUENCE length {len} does not match {} remaining bytes",
            body.len()
        )));
    }

    let (r, body) = read_integer(body)?;
    let (s, body) = read_integer(body)?;
    if !body.is_empty() {
        return Err(invalid("trailing bytes after signature"));
    }

    let mut raw = [0u8; 2 * COMPONENT];
    raw[COMPONENT - r.len()..COMPONENT].copy_from_slice(r);
    raw[2 * COMPONENT - s.len()..].copy_from_slice(s);
    Ok(raw)
}

/// Read one INTEGER, returning its magnitude with leading zeros removed.
fn read_integer(input: &[u8]) -> SsResult<(&[u8], &[u8])> {
    match input {
        [0x02, len, rest @ ..] if usize::from(*len) <= rest.len() && *len > 0 => {
            let (value, rest) = rest.split_at(usize::from(*len));
            let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
            let value = &value[start..];
            if value.len() > COMPONENT {
                return Err(invalid(format!(
                    "integer of {} bytes does not fit a P-256 scalar",
                    value.len()
                )));
            }
            Ok((value, rest))
        }
        [0x02, ..] => Err(invalid("INTEGER length out of bounds")),
        _ => Err(invalid("expected INTEGER (0x02)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};

    #[test]
    fn test_matches_library_encoding() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        for i in 0..32u8 {
            let sig: Signature = key.sign(&[i; 16]);
            let raw = der_to_raw(sig.to_der().as_bytes()).unwrap();
            assert_eq!(raw.as_slice(), sig.to_bytes().as_slice());
        }
    }

    #[test]
    fn test_strips_sign_padding_and_left_pads() {
        // r = 0x00 0x80 .. (33 bytes, high bit set), s = 0x01 (1 byte)
        let mut der = vec![0x30, 0x00, 0x02, 33, 0x00, 0x80];
        der.extend_from_slice(&[0x11; 31]);
        der.extend_from_slice(&[0x02, 0x01, 0x01]);
        der[1] = (der.len() - 2) as u8;

        let raw = der_to_raw(&der).unwrap();
        assert_eq!(raw[0], 0x80);
        assert_eq!(&raw[1..32], &[0x11; 31]);
        assert_eq!(&raw[32..63], &[0u8; 31]);
        assert_eq!(raw[63], 0x01);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(der_to_raw(&[]).is_err());
        assert!(der_to_raw(&[0x31, 0x00]).is_err());
        assert!(der_to_raw(&[0x30, 0x05, 0x02, 0x01, 0x01]).is_err());
        assert!(der_to_raw(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x02, 0x01]).is_err());
        assert!(der_to_raw(&[0x30, 0x07, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0xFF]).is_err());

        let mut oversized = vec![0x30, 0x00, 0x02, 33];
        oversized.extend_from_slice(&[0x7F; 33]);
        oversized.extend_from_slice(&[0x02, 0x01, 0x01]);
        oversized[1] = (oversized.len() - 2) as u8;
        assert!(matches!(
            der_to_raw(&oversized),
            Err(SsError::SignatureInvalid(_))
        ));
    }
}
